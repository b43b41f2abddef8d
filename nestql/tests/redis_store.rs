//! Round trips through a live Redis. Skipped unless `REDIS_URL` is set.

#[path = "chinook/support.rs"]
mod support;

use std::sync::Arc;

use nestql::id::generate_entity_id;
use nestql::store::{EntityRef, FetchRequest, MutationPlan};
use nestql::{RedisStore, Store};
use serial_test::serial;
use support::*;

async fn redis_store(registry: Arc<Registry>) -> Option<RedisStore> {
    let Ok(url) = std::env::var("REDIS_URL") else {
        eprintln!("REDIS_URL not set, skipping");
        return None;
    };
    let namespace = format!("nestql-test-{}", generate_entity_id());
    let store = RedisStore::connect(registry, &url, namespace)
        .await
        .expect("redis should be reachable");
    Some(store)
}

/// A second connection onto the namespace of `store`.
async fn peer(registry: Arc<Registry>, store: &RedisStore) -> RedisStore {
    let url = std::env::var("REDIS_URL").expect("REDIS_URL should be set");
    RedisStore::connect(registry, &url, store.namespace())
        .await
        .expect("redis should be reachable")
}

#[tokio::test]
#[serial]
async fn seeded_tables_round_trip_through_redis() {
    let registry = Arc::new(chinook::registry().unwrap());
    let Some(mut store) = redis_store(Arc::clone(&registry)).await else {
        return;
    };
    let seeded = chinook::seed(&registry).unwrap();
    store.replace(&seeded).await.unwrap();
    let (loaded, version) = store.load().await.unwrap();
    assert_eq!(loaded, seeded);
    assert!(version > 0);

    let engine = Engine::new(registry);
    let ctx = anonymous();
    let albums = engine.resource("albums").unwrap();
    let page = albums
        .list(&mut store, &ctx, &params("artist.name=AC/DC&sort=-album_id&embeds=tracks&tracks._limit_=2"))
        .await
        .unwrap();
    assert_eq!(ids(&page.items, "album_id"), vec![4, 1]);
    assert_eq!(array_ids(&page.items[1]["tracks"], "track_id").len(), 2);

    let created = albums
        .create(
            &mut store,
            &ctx,
            json!({
                "title": "Back In Black",
                "artist": {"artist_id": 1},
                "tracks": [{"name": "Hells Bells", "milliseconds": 312_000, "unit_price": 0.99}],
            }),
            &params("embeds=tracks"),
        )
        .await
        .unwrap();
    assert_eq!(created["album_id"], json!(11));
    assert_eq!(array_ids(&created["tracks"], "track_id"), vec![24]);

    let (after, next_version) = store.load().await.unwrap();
    assert!(next_version > version);
    assert_eq!(after.len("albums"), 11);
    assert_eq!(after.get("tracks", &Identity::single(24)).unwrap()["UnitPrice"], json!(0.99));

    store.clear().await.unwrap();
    let (empty, _) = store.load().await.unwrap();
    assert_eq!(empty.len("albums"), 0);
}

#[tokio::test]
#[serial]
async fn many_to_many_changes_persist() {
    let registry = Arc::new(chinook::registry().unwrap());
    let Some(mut store) = redis_store(Arc::clone(&registry)).await else {
        return;
    };
    store.replace(&chinook::seed(&registry).unwrap()).await.unwrap();
    let engine = Engine::new(registry);
    let ctx = anonymous();
    let playlists = engine.resource("playlists").unwrap();
    playlists
        .patch_related(
            &mut store,
            &ctx,
            &Identity::single(3),
            "tracks",
            json!([{"$op": "remove", "track_id": 3}, {"track_id": 9}]),
            &QueryParams::new(),
        )
        .await
        .unwrap();
    let members = playlists
        .list_related(&mut store, &ctx, &Identity::single(3), "tracks", &params("sort=track_id"))
        .await
        .unwrap();
    assert_eq!(ids(&members.items, "track_id"), vec![9, 19, 20]);
    store.clear().await.unwrap();
}

#[tokio::test]
#[serial]
async fn commits_planned_against_a_stale_read_conflict() {
    let registry = Arc::new(chinook::registry().unwrap());
    let Some(mut store) = redis_store(Arc::clone(&registry)).await else {
        return;
    };
    store.replace(&chinook::seed(&registry).unwrap()).await.unwrap();
    let mut other = peer(Arc::clone(&registry), &store).await;

    store.begin();
    let rows = store.fetch(&FetchRequest::new("albums")).await.unwrap();
    assert_eq!(rows.len(), 10);

    // Another client commits while the first plan is being built.
    Engine::new(Arc::clone(&registry))
        .resource("albums")
        .unwrap()
        .update(
            &mut other,
            &anonymous(),
            &Identity::single(1),
            json!({"title": "Renamed elsewhere"}),
            false,
            &QueryParams::new(),
        )
        .await
        .unwrap();

    let mut plan = MutationPlan::new();
    let mut values = serde_json::Map::new();
    values.insert("title".into(), json!("Renamed here"));
    plan.update("albums", EntityRef::Existing(Identity::single(2)), values);
    let result = store.commit(&plan).await;
    assert!(matches!(result, Err(EngineError::Conflict { .. })), "{result:?}");

    let (tables, _) = store.load().await.unwrap();
    assert_eq!(tables.get("albums", &Identity::single(1)).unwrap()["title"], json!("Renamed elsewhere"));
    assert_eq!(tables.get("albums", &Identity::single(2)).unwrap()["title"], json!("Balls to the Wall"));

    // A fresh plan reads the new version and goes through.
    store.begin();
    store.fetch(&FetchRequest::new("albums")).await.unwrap();
    store.commit(&plan).await.unwrap();
    store.clear().await.unwrap();
}
