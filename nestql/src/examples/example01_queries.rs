use anyhow::Result;
use serde_json::{Value, json};

use crate::examples::chinook;
use crate::permissions::RequestContext;
use crate::query::QueryParams;

fn column(items: &[Value], key: &str) -> Vec<Value> {
    items.iter().map(|item| item[key].clone()).collect()
}

/// Example 01 – flat and structured filters, embeds, sorting and pagination.
pub async fn run() -> Result<()> {
    let (engine, mut store) = chinook::demo()?;
    let ctx = RequestContext::new();
    let albums = engine.resource("albums")?;

    let window = albums
        .list(&mut store, &ctx, &QueryParams::parse("album_id-lte=10&album_id-gt=8&sort=album_id"))
        .await?;
    assert_eq!(column(&window.items, "album_id"), vec![json!(9), json!(10)]);

    // A structured filter crossing into the artist.
    let params = QueryParams::new()
        .with("query", r#"{"artist": {"name": {"$like": "AC%"}}}"#)
        .with("sort", "title");
    let acdc = albums.list(&mut store, &ctx, &params).await?;
    assert_eq!(
        column(&acdc.items, "title"),
        vec![json!("For Those About To Rock We Salute You"), json!("Let There Be Rock")]
    );

    // Two tracks per album, alphabetically, plus the artist.
    let params = QueryParams::parse("album_id=1&embeds=tracks.name,artist&tracks._limit_=2&tracks._sorts_=name");
    let embedded = albums.list(&mut store, &ctx, &params).await?;
    let album = &embedded.items[0];
    assert_eq!(album["artist"]["name"], json!("AC/DC"));
    let tracks = album["tracks"].as_array().cloned().unwrap_or_default();
    assert_eq!(
        column(&tracks, "name"),
        vec![json!("For Those About To Rock (We Salute You)"), json!("Inject The Venom")]
    );

    let tracks = engine.resource("tracks")?;
    let page = tracks
        .list(&mut store, &ctx, &QueryParams::parse("limit=5&page=2&sort=track_id"))
        .await?;
    assert_eq!(page.resources_available, 23);
    assert_eq!(page.pagination.current_page, 2);
    assert_eq!(page.pagination.last_page, 5);
    assert_eq!(page.items[0]["track_id"], json!(6));

    println!("{}", serde_json::to_string_pretty(&embedded)?);
    Ok(())
}
