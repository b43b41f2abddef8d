#![allow(dead_code, unused_imports)]

pub(crate) use nestql::examples::chinook;
pub(crate) use nestql::{
    DeleteTarget, Engine, EngineError, FilterExpr, Identity, MemoryStore, Method, PermissionGate, QueryParams,
    Registry, RequestContext, ResourceDescriptor,
};
pub(crate) use serde_json::{Value, json};

/// Seeded Chinook engine and store with no gates.
pub(crate) fn demo() -> (Engine, MemoryStore) {
    chinook::demo().expect("chinook demo should build")
}

pub(crate) fn demo_with(registry: Registry) -> (Engine, MemoryStore) {
    chinook::demo_with(registry).expect("chinook demo should build")
}

pub(crate) fn params(query: &str) -> QueryParams {
    QueryParams::parse(query)
}

pub(crate) fn anonymous() -> RequestContext {
    RequestContext::new()
}

/// `key` of every object in `items`, in order.
pub(crate) fn ids(items: &[Value], key: &str) -> Vec<i64> {
    items.iter().filter_map(|item| item[key].as_i64()).collect()
}

pub(crate) fn array_ids(value: &Value, key: &str) -> Vec<i64> {
    value.as_array().map(|items| ids(items, key)).unwrap_or_default()
}

/// Hides AC/DC from every query over artists.
pub(crate) struct HideAcDc;

impl PermissionGate for HideAcDc {
    fn required_filter(&self, _resource: &ResourceDescriptor, _ctx: &RequestContext) -> Option<FilterExpr> {
        Some(FilterExpr::ne("name", "AC/DC"))
    }
}
