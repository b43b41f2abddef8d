use anyhow::Result;
use serde_json::{Value, json};

use crate::examples::chinook;
use crate::permissions::{Method, RequestContext};
use crate::query::QueryParams;
use crate::router::{Request, Router};

/// Example 04 – path dispatch: collections, entities, attributes and
/// relationship sub-paths.
pub async fn run() -> Result<()> {
    let (engine, mut store) = chinook::demo()?;
    let router = Router::new(&engine);
    let ctx = RequestContext::new();

    let response = router.dispatch(&mut store, &ctx, Request::get("/albums/4")).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body["title"], json!("Let There Be Rock"));

    let response = router.dispatch(&mut store, &ctx, Request::get("/albums/4/title")).await;
    assert_eq!(response.body, json!("Let There Be Rock"));

    // Walk album → track → genre.
    let response = router
        .dispatch(&mut store, &ctx, Request::get("/albums/4/tracks/9/genre"))
        .await;
    assert_eq!(response.body["name"], json!("Rock"));

    let response = router
        .dispatch(
            &mut store,
            &ctx,
            Request::get("/artists/1/albums").with_params(QueryParams::parse("sort=-album_id")),
        )
        .await;
    let ids: Vec<Value> = response.body["items"]
        .as_array()
        .map(|items| items.iter().map(|item| item["album_id"].clone()).collect())
        .unwrap_or_default();
    assert_eq!(ids, vec![json!(4), json!(1)]);

    let response = router
        .dispatch(
            &mut store,
            &ctx,
            Request::new(Method::Post, "/playlists/4/tracks").with_body(json!({"track_id": 20})),
        )
        .await;
    assert_eq!(response.status, 201);
    assert_eq!(response.body["name"], json!("Master Of Puppets"));

    let response = router
        .dispatch(&mut store, &ctx, Request::new(Method::Put, "/albums"))
        .await;
    assert_eq!(response.status, 405);

    let response = router
        .dispatch(&mut store, &ctx, Request::new(Method::Options, "/albums/4/tracks"))
        .await;
    assert_eq!(response.allow, vec![Method::Get, Method::Post, Method::Patch, Method::Options]);

    let response = router.dispatch(&mut store, &ctx, Request::get("/albums/99")).await;
    assert_eq!(response.status, 404);
    Ok(())
}
