//! Permission gates.
//!
//! **Every check defaults to allow.** A resource registered without a gate is
//! readable and writable by anyone who can reach the engine. Register a gate
//! per resource with [`RegistryBuilder::gate`](crate::registry::RegistryBuilder::gate)
//! (and per relationship with `relationship_gate`) to restrict access.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::filters::FilterExpr;
use crate::types::{Record, RelationshipDescriptor, ResourceDescriptor};

/// Request verb the engine is asked to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "PATCH" => Some(Method::Patch),
            "DELETE" => Some(Method::Delete),
            "OPTIONS" => Some(Method::Options),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ambient values for one request (current user, roles, tenant...).
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    values: Map<String, Value>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn user(&self) -> Option<&Value> {
        self.values.get("user")
    }
}

/// What a mutation check is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationTarget<'a> {
    /// The entity as a whole (create / delete).
    Entity,
    Field(&'a str),
    Relationship(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationAction {
    Create,
    Update,
    Delete,
    /// Associate a member with a relationship.
    Add,
    /// Detach a member from a relationship.
    Remove,
}

impl MutationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationAction::Create => "create",
            MutationAction::Update => "update",
            MutationAction::Delete => "delete",
            MutationAction::Add => "add",
            MutationAction::Remove => "remove",
        }
    }
}

/// The entity a nested node hangs off, and the relationship leading to it.
#[derive(Debug, Clone, Copy)]
pub struct MutationParent<'a> {
    pub resource: &'a ResourceDescriptor,
    pub relationship: &'a RelationshipDescriptor,
    /// `None` while the parent is being created in the same request.
    pub existing: Option<&'a Record>,
}

/// Input for [`PermissionGate::check_mutation`].
#[derive(Debug, Clone, Copy)]
pub struct MutationCheck<'a> {
    pub resource: &'a ResourceDescriptor,
    pub target: MutationTarget<'a>,
    pub action: MutationAction,
    /// Prospective value: the new scalar, or the member document for relationships.
    pub value: Option<&'a Value>,
    /// Stored state of the entity being mutated; `None` for new entities.
    pub existing: Option<&'a Record>,
    pub parent: Option<MutationParent<'a>>,
}

impl MutationCheck<'_> {
    /// Human-readable action for error messages.
    pub fn describe(&self) -> String {
        match self.target {
            MutationTarget::Entity => self.action.as_str().to_string(),
            MutationTarget::Field(field) => format!("{} field `{field}`", self.action.as_str()),
            MutationTarget::Relationship(rel) => format!("{} through `{rel}`", self.action.as_str()),
        }
    }
}

/// Capability consulted by every read and write path.
///
/// All methods must be free of side effects on the store. Default
/// implementations allow everything.
pub trait PermissionGate: Send + Sync {
    /// Whether `method` may be used on `resource` at all.
    fn method_allowed(&self, _resource: &ResourceDescriptor, _method: Method, _ctx: &RequestContext) -> bool {
        true
    }

    /// Predicate ANDed into every query over `resource`, at any nesting level.
    /// Return `FilterExpr::never()` to hide every row.
    fn required_filter(&self, _resource: &ResourceDescriptor, _ctx: &RequestContext) -> Option<FilterExpr> {
        None
    }

    /// Whether a single field write, relationship change or entity create/delete may proceed.
    fn check_mutation(&self, _check: &MutationCheck<'_>, _ctx: &RequestContext) -> bool {
        true
    }
}

/// The default gate. Allows every method, adds no filters and accepts every mutation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionGate for AllowAll {}

/// Read-only access: `GET`/`OPTIONS` only, and no mutation checks pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOnly;

impl PermissionGate for ReadOnly {
    fn method_allowed(&self, _resource: &ResourceDescriptor, method: Method, _ctx: &RequestContext) -> bool {
        matches!(method, Method::Get | Method::Options)
    }

    fn check_mutation(&self, _check: &MutationCheck<'_>, _ctx: &RequestContext) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_all_allows_everything() {
        let descriptor = ResourceDescriptor::new("albums");
        let ctx = RequestContext::new();
        let gate = AllowAll;
        assert!(gate.method_allowed(&descriptor, Method::Delete, &ctx));
        assert!(gate.required_filter(&descriptor, &ctx).is_none());
        let check = MutationCheck {
            resource: &descriptor,
            target: MutationTarget::Field("title"),
            action: MutationAction::Update,
            value: None,
            existing: None,
            parent: None,
        };
        assert!(gate.check_mutation(&check, &ctx));
        assert_eq!(check.describe(), "update field `title`");
    }

    #[test]
    fn read_only_blocks_writes() {
        let descriptor = ResourceDescriptor::new("albums");
        let ctx = RequestContext::new().with("user", "ada");
        assert!(ReadOnly.method_allowed(&descriptor, Method::Get, &ctx));
        assert!(!ReadOnly.method_allowed(&descriptor, Method::Patch, &ctx));
        assert_eq!(ctx.user(), Some(&Value::from("ada")));
    }

    #[test]
    fn methods_parse_case_insensitively() {
        assert_eq!(Method::parse("patch"), Some(Method::Patch));
        assert_eq!(Method::parse("TRACE"), None);
    }
}
