use anyhow::Result;
use serde_json::{Value, json};

use crate::engine::DeleteTarget;
use crate::errors::EngineError;
use crate::examples::chinook;
use crate::filters::FilterExpr;
use crate::permissions::{Method, MutationCheck, MutationTarget, PermissionGate, RequestContext};
use crate::query::QueryParams;
use crate::types::{Identity, ResourceDescriptor};

/// Staff see themselves and their direct reports. Nobody deletes employees
/// or rewrites an email address.
pub struct StaffGate;

impl PermissionGate for StaffGate {
    fn method_allowed(&self, _resource: &ResourceDescriptor, method: Method, _ctx: &RequestContext) -> bool {
        method != Method::Delete
    }

    fn required_filter(&self, _resource: &ResourceDescriptor, ctx: &RequestContext) -> Option<FilterExpr> {
        let Some(user) = ctx.user().and_then(Value::as_i64) else {
            return Some(FilterExpr::never());
        };
        Some(FilterExpr::or([
            FilterExpr::eq("employee_id", user),
            FilterExpr::eq("reports_to", user),
        ]))
    }

    fn check_mutation(&self, check: &MutationCheck<'_>, _ctx: &RequestContext) -> bool {
        check.target != MutationTarget::Field("email")
    }
}

/// Example 03 – gates: required filters at every level, denied methods and
/// denied field writes.
pub async fn run() -> Result<()> {
    let registry = chinook::registry_builder().gate("employees", StaffGate).build()?;
    let (engine, mut store) = chinook::demo_with(registry)?;
    let employees = engine.resource("employees")?;
    let nancy = RequestContext::new().with("user", 2);

    let visible = employees
        .list(&mut store, &nancy, &QueryParams::parse("sort=employee_id"))
        .await?;
    let ids: Vec<Value> = visible.items.iter().map(|item| item["employee_id"].clone()).collect();
    assert_eq!(ids, vec![json!(2), json!(3), json!(4), json!(5)]);

    // Her manager is outside the filter, so the embed renders empty.
    let me = employees
        .get(&mut store, &nancy, &Identity::single(2), &QueryParams::parse("embeds=manager,reports"))
        .await?;
    assert_eq!(me["manager"], Value::Null);
    assert_eq!(me["reports"].as_array().map(Vec::len), Some(3));
    assert!(me.get("notes").is_none(), "hidden fields never render");

    let anonymous = RequestContext::new();
    let nobody = employees.list(&mut store, &anonymous, &QueryParams::new()).await?;
    assert_eq!(nobody.resources_available, 0);

    let denied = employees
        .delete(&mut store, &nancy, DeleteTarget::Identity(&Identity::single(3)))
        .await;
    assert!(matches!(denied, Err(EngineError::PermissionDenied { .. })));

    let denied = employees
        .update(
            &mut store,
            &nancy,
            &Identity::single(3),
            json!({"email": "jane@example.com"}),
            false,
            &QueryParams::new(),
        )
        .await;
    assert!(matches!(denied, Err(EngineError::PermissionDenied { .. })));
    let jane = employees
        .get(&mut store, &nancy, &Identity::single(3), &QueryParams::new())
        .await?;
    assert_eq!(jane["email"], json!("jane@chinookcorp.com"));

    let promoted = employees
        .update(
            &mut store,
            &nancy,
            &Identity::single(3),
            json!({"title": "Senior Sales Support Agent"}),
            false,
            &QueryParams::new(),
        )
        .await?;
    assert_eq!(promoted["title"], json!("Senior Sales Support Agent"));
    Ok(())
}
