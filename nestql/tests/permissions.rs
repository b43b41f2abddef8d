//! Gates on reads, writes and relationship changes.

#[path = "chinook/support.rs"]
mod support;

use nestql::examples::example03_permissions::StaffGate;
use nestql::permissions::{MutationAction, MutationTarget};
use nestql::{MutationCheck, ReadOnly};
use support::*;

/// Refuses to add members through whichever relationship it guards.
struct DenyAdd;

impl PermissionGate for DenyAdd {
    fn check_mutation(&self, check: &MutationCheck<'_>, _ctx: &RequestContext) -> bool {
        check.action != MutationAction::Add
    }
}

/// Tracks longer than ten minutes may not be created.
struct NoEpics;

impl PermissionGate for NoEpics {
    fn check_mutation(&self, check: &MutationCheck<'_>, _ctx: &RequestContext) -> bool {
        let too_long = check
            .value
            .and_then(|value| value.get("milliseconds"))
            .and_then(Value::as_i64)
            .is_some_and(|milliseconds| milliseconds > 600_000);
        !(check.target == MutationTarget::Entity && check.action == MutationAction::Create && too_long)
    }
}

#[tokio::test]
async fn denied_nested_writes_leave_the_store_untouched() {
    let registry = chinook::registry_builder().gate("tracks", NoEpics).build().unwrap();
    let (engine, mut store) = demo_with(registry);
    let before = store.tables().clone();
    let result = engine
        .resource("albums")
        .unwrap()
        .create(
            &mut store,
            &anonymous(),
            json!({
                "title": "Live",
                "artist_id": 1,
                "tracks": [
                    {"name": "Intro", "milliseconds": 60_000, "unit_price": 0.99},
                    {"name": "Jam", "milliseconds": 1_200_000, "unit_price": 0.99},
                ],
            }),
            &QueryParams::new(),
        )
        .await;
    assert!(matches!(result, Err(EngineError::PermissionDenied { .. })));
    assert_eq!(store.tables(), &before);
}

#[tokio::test]
async fn relationship_changes_are_checked_from_both_ends() {
    let registry = chinook::registry_builder()
        .relationship_gate("artists", "albums", DenyAdd)
        .build()
        .unwrap();
    let (engine, mut store) = demo_with(registry);
    let ctx = anonymous();
    let before = store.tables().clone();

    // Album 2 names its new artist; the artist's side refuses the new member.
    let result = engine
        .resource("albums")
        .unwrap()
        .update(
            &mut store,
            &ctx,
            &Identity::single(2),
            json!({"artist": {"artist_id": 1}}),
            false,
            &QueryParams::new(),
        )
        .await;
    assert!(matches!(result, Err(EngineError::PermissionDenied { .. })));
    assert_eq!(store.tables(), &before);

    let direct = engine
        .resource("artists")
        .unwrap()
        .update(
            &mut store,
            &ctx,
            &Identity::single(1),
            json!({"albums": [{"album_id": 2}]}),
            false,
            &QueryParams::new(),
        )
        .await;
    assert!(matches!(direct, Err(EngineError::PermissionDenied { .. })));

    // Plain attribute writes are unaffected.
    let renamed = engine
        .resource("albums")
        .unwrap()
        .update_field(&mut store, &ctx, &Identity::single(2), "title", json!("Balls To The Wall"))
        .await
        .unwrap();
    assert_eq!(renamed, json!("Balls To The Wall"));
}

#[tokio::test]
async fn required_filters_follow_the_request_context() {
    let registry = chinook::registry_builder().gate("employees", StaffGate).build().unwrap();
    let (engine, mut store) = demo_with(registry);
    let employees = engine.resource("employees").unwrap();

    let andrew = RequestContext::new().with("user", 1);
    let page = employees.list(&mut store, &andrew, &params("sort=employee_id")).await.unwrap();
    assert_eq!(ids(&page.items, "employee_id"), vec![1, 2, 6]);

    // Nancy's reports are visible, Andrew's other report is not.
    let nancy = RequestContext::new().with("user", 2);
    let andrews_reports = employees
        .list_related(&mut store, &nancy, &Identity::single(1), "reports", &QueryParams::new())
        .await;
    assert!(matches!(andrews_reports, Err(EngineError::NotFound { .. })));
    let her_reports = employees
        .list_related(&mut store, &nancy, &Identity::single(2), "reports", &params("sort=-employee_id"))
        .await
        .unwrap();
    assert_eq!(ids(&her_reports.items, "employee_id"), vec![5, 4, 3]);
}

#[tokio::test]
async fn updates_outside_the_required_filter_are_not_found() {
    let registry = chinook::registry_builder().gate("employees", StaffGate).build().unwrap();
    let (engine, mut store) = demo_with(registry);
    let nancy = RequestContext::new().with("user", 2);
    let before = store.tables().clone();
    let result = engine
        .resource("employees")
        .unwrap()
        .update(
            &mut store,
            &nancy,
            &Identity::single(6),
            json!({"title": "CTO"}),
            false,
            &QueryParams::new(),
        )
        .await;
    assert!(matches!(result, Err(EngineError::NotFound { .. })));
    assert_eq!(store.tables(), &before);
}

#[tokio::test]
async fn hidden_identities_are_not_found_on_write() {
    let registry = chinook::registry_builder().gate("artists", HideAcDc).build().unwrap();
    let (engine, mut store) = demo_with(registry);
    let ctx = anonymous();
    let before = store.tables().clone();

    // Nested reference to AC/DC, which the gate hides.
    let nested = engine
        .resource("albums")
        .unwrap()
        .create(
            &mut store,
            &ctx,
            json!({"title": "Sneaky", "artist": {"artist_id": 1, "name": "Impostor"}}),
            &QueryParams::new(),
        )
        .await;
    assert!(matches!(nested, Err(EngineError::NotFound { .. })), "{nested:?}");

    let root = engine
        .resource("artists")
        .unwrap()
        .create(&mut store, &ctx, json!({"artist_id": 1, "name": "Impostor"}), &QueryParams::new())
        .await;
    assert!(matches!(root, Err(EngineError::NotFound { .. })), "{root:?}");
    assert_eq!(store.tables(), &before);
}

#[tokio::test]
async fn read_only_resources_refuse_every_write() {
    let registry = chinook::registry_builder().gate("genres", ReadOnly).build().unwrap();
    let (engine, mut store) = demo_with(registry);
    let ctx = anonymous();
    let genres = engine.resource("genres").unwrap();
    let created = genres
        .create(&mut store, &ctx, json!({"name": "Latin"}), &QueryParams::new())
        .await;
    assert!(matches!(created, Err(EngineError::PermissionDenied { .. })));

    // Nested creates through another resource hit the same gate.
    let nested = engine
        .resource("tracks")
        .unwrap()
        .update(
            &mut store,
            &ctx,
            &Identity::single(23),
            json!({"genre": {"name": "Lo-fi"}}),
            false,
            &QueryParams::new(),
        )
        .await;
    assert!(matches!(nested, Err(EngineError::PermissionDenied { .. })));
    assert_eq!(store.tables().len("genres"), 5);
}
