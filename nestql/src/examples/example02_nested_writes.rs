use anyhow::Result;
use serde_json::{Value, json};

use crate::engine::DeleteTarget;
use crate::examples::chinook;
use crate::permissions::RequestContext;
use crate::query::QueryParams;
use crate::types::Identity;

fn ids(value: &Value, key: &str) -> Vec<Value> {
    value
        .as_array()
        .map(|items| items.iter().map(|item| item[key].clone()).collect())
        .unwrap_or_default()
}

/// Example 02 – nested creates, identity references, `$op` patches, PUT
/// replacement and delete cascades.
pub async fn run() -> Result<()> {
    let (engine, mut store) = chinook::demo()?;
    let ctx = RequestContext::new();
    let albums = engine.resource("albums")?;
    let tracks = engine.resource("tracks")?;
    let none = QueryParams::new();

    // One album, two new tracks, links to an existing artist and genre.
    let created = albums
        .create(
            &mut store,
            &ctx,
            json!({
                "title": "Back In Black",
                "artist": {"artist_id": 1},
                "tracks": [
                    {"name": "Hells Bells", "milliseconds": 312_000, "unit_price": 0.99, "genre": {"genre_id": 1}},
                    {"name": "Shoot to Thrill", "milliseconds": 317_000, "unit_price": 0.99},
                ],
            }),
            &QueryParams::parse("embeds=artist,tracks&tracks._sorts_=track_id"),
        )
        .await?;
    assert_eq!(created["album_id"], json!(11));
    assert_eq!(created["artist"]["name"], json!("AC/DC"));
    assert_eq!(ids(&created["tracks"], "track_id"), vec![json!(24), json!(25)]);

    // Detach one track, adopt another.
    let album = Identity::single(11);
    let patched = albums
        .update(
            &mut store,
            &ctx,
            &album,
            json!({"tracks": [{"$op": "remove", "track_id": 25}, {"track_id": 9}]}),
            false,
            &QueryParams::parse("embeds=tracks&tracks._sorts_=track_id"),
        )
        .await?;
    assert_eq!(ids(&patched["tracks"], "track_id"), vec![json!(9), json!(24)]);
    let detached = tracks.get(&mut store, &ctx, &Identity::single(25), &none).await?;
    assert_eq!(detached["album_id"], Value::Null);

    // PUT replaces: members left out are unlinked.
    albums
        .update(
            &mut store,
            &ctx,
            &album,
            json!({"title": "Back In Black (Remastered)", "artist_id": 1, "tracks": [{"track_id": 24}]}),
            true,
            &none,
        )
        .await?;
    let members = albums.list_related(&mut store, &ctx, &album, "tracks", &none).await?;
    assert_eq!(
        members.items.iter().map(|track| track["track_id"].clone()).collect::<Vec<_>>(),
        vec![json!(24)]
    );

    let outcome = albums.delete(&mut store, &ctx, DeleteTarget::Identity(&album)).await?;
    assert_eq!(outcome.deleted, vec![album]);
    let orphan = tracks.get(&mut store, &ctx, &Identity::single(24), &none).await?;
    assert_eq!(orphan["album_id"], Value::Null);

    println!("{}", serde_json::to_string_pretty(&created)?);
    Ok(())
}
