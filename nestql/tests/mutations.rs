//! Nested writes against the seeded Chinook store.

#[path = "chinook/support.rs"]
mod support;

use std::sync::Arc;

use nestql::{Mode, MutationProcessor, Tables};
use support::*;

#[tokio::test]
async fn unchanged_documents_commit_no_writes() {
    let (engine, mut store) = demo();
    let ctx = anonymous();
    let before = store.tables().clone();
    let outcome = MutationProcessor::new(engine.registry(), &ctx, &mut store)
        .update(
            "albums",
            &Identity::single(1),
            &json!({"title": "For Those About To Rock We Salute You", "artist": {"artist_id": 1}}),
            Mode::Patch,
        )
        .await
        .unwrap();
    assert_eq!(outcome.writes, 0);
    assert_eq!(outcome.identities, vec![Identity::single(1)]);
    assert_eq!(store.tables(), &before);
}

#[tokio::test]
async fn identity_only_references_link_existing_entities() {
    let registry = Arc::new(chinook::registry().unwrap());
    let mut tables = Tables::new();
    let artist = json!({"artist_id": 1, "name": "AC/DC"});
    tables
        .insert(&registry, "artists", artist.as_object().cloned().unwrap())
        .unwrap();
    let mut store = MemoryStore::with_tables(Arc::clone(&registry), tables);
    let engine = Engine::new(registry);
    let ctx = anonymous();

    let album = engine
        .resource("albums")
        .unwrap()
        .create(
            &mut store,
            &ctx,
            json!({"title": "X", "artist": {"artist_id": 1}}),
            &params("embeds=artist"),
        )
        .await
        .unwrap();
    assert_eq!(album["album_id"], json!(1));
    assert_eq!(album["artist_id"], json!(1));
    assert_eq!(album["artist"]["name"], json!("AC/DC"));
    assert_eq!(store.tables().get("artists", &Identity::single(1)), artist.as_object());
}

#[tokio::test]
async fn references_to_missing_entities_are_created_and_validated() {
    let (engine, mut store) = demo();
    let before = store.tables().clone();
    let result = engine
        .resource("albums")
        .unwrap()
        .create(
            &mut store,
            &anonymous(),
            json!({"title": "Ghost", "artist": {"artist_id": 99}}),
            &QueryParams::new(),
        )
        .await;
    let Err(EngineError::UnprocessableEntity(error)) = result else {
        panic!("expected a validation failure, got {result:?}");
    };
    assert!(
        error
            .issues
            .iter()
            .any(|issue| issue.field == "artist.name" && issue.code == "field.required")
    );
    assert_eq!(store.tables(), &before);
}

#[tokio::test]
async fn patch_adds_members_and_put_replaces_them() {
    let (engine, mut store) = demo();
    let ctx = anonymous();
    let albums = engine.resource("albums").unwrap();
    let tracks = engine.resource("tracks").unwrap();
    let sorted = params("embeds=tracks&tracks._sorts_=track_id");

    let patched = albums
        .update(&mut store, &ctx, &Identity::single(1), json!({"tracks": [{"track_id": 9}]}), false, &sorted)
        .await
        .unwrap();
    assert_eq!(array_ids(&patched["tracks"], "track_id"), vec![1, 6, 7, 8, 9]);

    // Album 4 now only has track 10 left.
    let replaced = albums
        .update(
            &mut store,
            &ctx,
            &Identity::single(4),
            json!({"title": "Let There Be Rock", "artist_id": 1, "tracks": [{"track_id": 9}]}),
            true,
            &sorted,
        )
        .await
        .unwrap();
    assert_eq!(array_ids(&replaced["tracks"], "track_id"), vec![9]);
    let album_one = albums
        .list_related(&mut store, &ctx, &Identity::single(1), "tracks", &params("sort=track_id"))
        .await
        .unwrap();
    assert_eq!(ids(&album_one.items, "track_id"), vec![1, 6, 7, 8]);
    let dropped = tracks.get(&mut store, &ctx, &Identity::single(10), &QueryParams::new()).await.unwrap();
    assert_eq!(dropped["album_id"], Value::Null);
}

#[tokio::test]
async fn put_requires_every_required_field() {
    let (engine, mut store) = demo();
    let result = engine
        .resource("albums")
        .unwrap()
        .update(
            &mut store,
            &anonymous(),
            &Identity::single(1),
            json!({"title": "Only A Title"}),
            true,
            &QueryParams::new(),
        )
        .await;
    let Err(EngineError::UnprocessableEntity(error)) = result else {
        panic!("expected a validation error, got {result:?}");
    };
    assert!(error.issues.iter().any(|issue| issue.field == "artist_id"));
}

#[tokio::test]
async fn remove_ops_unlink_many_to_many_members() {
    let (engine, mut store) = demo();
    let ctx = anonymous();
    let playlists = engine.resource("playlists").unwrap();
    let members = playlists
        .patch_related(
            &mut store,
            &ctx,
            &Identity::single(2),
            "tracks",
            json!([{"$op": "remove", "track_id": 15}, {"track_id": 20}]),
            &params("sort=track_id"),
        )
        .await
        .unwrap();
    assert_eq!(ids(&members.items, "track_id"), vec![16, 20, 22]);

    // The track survives and keeps its other playlists.
    let tracks = engine.resource("tracks").unwrap();
    let still_listed = tracks
        .list_related(&mut store, &ctx, &Identity::single(15), "playlists", &params("sort=playlist_id"))
        .await
        .unwrap();
    assert_eq!(ids(&still_listed.items, "playlist_id"), vec![1]);
}

#[tokio::test]
async fn validation_issues_are_aggregated_across_the_document() {
    let (engine, mut store) = demo();
    let before = store.tables().clone();
    let result = engine
        .resource("albums")
        .unwrap()
        .create(
            &mut store,
            &anonymous(),
            json!({
                "title": "",
                "artist_id": 1,
                "tracks": [
                    {"name": "Fine", "milliseconds": 1000, "unit_price": 0.99},
                    {"name": "", "milliseconds": 0, "unit_price": 500},
                ],
            }),
            &QueryParams::new(),
        )
        .await;
    let Err(EngineError::UnprocessableEntity(error)) = result else {
        panic!("expected a validation error, got {result:?}");
    };
    let fields: Vec<&str> = error.issues.iter().map(|issue| issue.field.as_str()).collect();
    for expected in ["title", "tracks.1.name", "tracks.1.milliseconds", "tracks.1.unit_price"] {
        assert!(fields.contains(&expected), "missing issue for {expected}: {fields:?}");
    }
    assert!(!fields.iter().any(|field| field.starts_with("tracks.0")));
    assert_eq!(store.tables(), &before);
}

#[tokio::test]
async fn array_bodies_create_one_entity_each() {
    let (engine, mut store) = demo();
    let created = engine
        .resource("genres")
        .unwrap()
        .create(
            &mut store,
            &anonymous(),
            json!([{"name": "Latin"}, {"name": "Reggae"}]),
            &QueryParams::new(),
        )
        .await
        .unwrap();
    assert_eq!(array_ids(&created, "genre_id"), vec![6, 7]);
}

#[tokio::test]
async fn collection_patches_create_update_and_delete() {
    let (engine, mut store) = demo();
    let ctx = anonymous();
    let genres = engine.resource("genres").unwrap();
    let touched = genres
        .patch_collection(
            &mut store,
            &ctx,
            json!([
                {"genre_id": 5, "name": "Blues & Soul"},
                {"$op": "remove", "genre_id": 2},
                {"name": "Latin"},
            ]),
            &QueryParams::new(),
        )
        .await
        .unwrap();
    assert_eq!(array_ids(&Value::Array(touched), "genre_id"), vec![5, 6]);

    let page = genres.list(&mut store, &ctx, &params("sort=genre_id")).await.unwrap();
    assert_eq!(ids(&page.items, "genre_id"), vec![1, 3, 4, 5, 6]);
}

#[tokio::test]
async fn delete_by_query_removes_every_match() {
    let (engine, mut store) = demo();
    let ctx = anonymous();
    let tracks = engine.resource("tracks").unwrap();
    let outcome = tracks
        .delete(&mut store, &ctx, DeleteTarget::Query(&params("album_id=9")))
        .await
        .unwrap();
    let mut deleted = outcome.deleted.clone();
    deleted.sort_by_key(Identity::key);
    assert_eq!(deleted, vec![Identity::single(19), Identity::single(20)]);

    // Association rows go with them.
    let playlists = engine.resource("playlists").unwrap();
    let metal = playlists
        .list_related(&mut store, &ctx, &Identity::single(3), "tracks", &QueryParams::new())
        .await
        .unwrap();
    assert_eq!(ids(&metal.items, "track_id"), vec![3]);
}

#[tokio::test]
async fn attribute_writes_coerce_and_validate() {
    let (engine, mut store) = demo();
    let ctx = anonymous();
    let tracks = engine.resource("tracks").unwrap();
    let price = tracks
        .update_field(&mut store, &ctx, &Identity::single(1), "unit_price", json!(1.29))
        .await
        .unwrap();
    assert_eq!(price, json!(1.29));
    let stored = store.tables().get("tracks", &Identity::single(1)).unwrap();
    assert_eq!(stored["UnitPrice"], json!(1.29));

    let negative = tracks
        .update_field(&mut store, &ctx, &Identity::single(1), "milliseconds", json!(-5))
        .await;
    assert!(matches!(negative, Err(EngineError::UnprocessableEntity(_))));
}
