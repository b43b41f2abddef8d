use regex::Regex;
use serde_json::Value;

use crate::errors::EngineError;
use crate::filters::{FilterExpr, Operator, like_regex};
use crate::permissions::RequestContext;
use crate::registry::Registry;
use crate::types::{FieldDescriptor, FieldType, Identity, RelationshipDescriptor, ResourceDescriptor};

/// Required filters may themselves cross relationships whose targets carry
/// required filters; nesting deeper than this is rejected.
const MAX_REQUIRED_FILTER_DEPTH: usize = 8;

/// Store-level predicate with paths resolved to storage keys.
#[derive(Debug, Clone)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    /// Negation of the conjunction of the children.
    Not(Vec<Predicate>),
    Compare {
        key: String,
        field_type: FieldType,
        operator: Operator,
        value: Value,
        pattern: Option<Regex>,
    },
    /// Some member of `relationship` satisfies `predicate` (evaluated on `target`).
    Related {
        relationship: String,
        target: String,
        predicate: Box<Predicate>,
    },
    /// The row is currently a member of `relationship` on the given parent.
    MemberOf {
        resource: String,
        identity: Identity,
        relationship: String,
    },
}

impl Predicate {
    pub fn always() -> Self {
        Predicate::And(Vec::new())
    }

    pub fn never() -> Self {
        Predicate::Or(Vec::new())
    }

    /// Equality on every identity column of `descriptor`.
    pub fn identity(descriptor: &ResourceDescriptor, identity: &Identity) -> Self {
        let parts = descriptor
            .identity_fields()
            .zip(identity.values())
            .map(|(field, value)| Predicate::Compare {
                key: field.storage_key().to_string(),
                field_type: field.field_type,
                operator: Operator::Eq,
                value: value.clone(),
                pattern: None,
            })
            .collect();
        Predicate::And(parts)
    }

    /// ANDs predicates, flattening nested conjunctions.
    pub fn all(parts: impl IntoIterator<Item = Predicate>) -> Self {
        let mut flat = Vec::new();
        for part in parts {
            match part {
                Predicate::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.pop().unwrap_or_else(Predicate::always)
        } else {
            Predicate::And(flat)
        }
    }

    pub fn conjoin(left: Option<Predicate>, right: Option<Predicate>) -> Option<Predicate> {
        match (left, right) {
            (None, other) | (other, None) => other,
            (Some(left), Some(right)) => Some(Predicate::all([left, right])),
        }
    }
}

/// One resolved filter/sort/field path.
#[derive(Debug, Clone)]
pub struct ResolvedPath<'r> {
    /// Relationships crossed, with the resource each one belongs to.
    pub hops: Vec<(&'r ResourceDescriptor, &'r RelationshipDescriptor)>,
    /// Resource owning the final field.
    pub resource: &'r ResourceDescriptor,
    pub field: &'r FieldDescriptor,
}

/// Resolves `a.b.field` from `root`: every segment but the last must be a
/// relationship with a registered target, the last a filterable field.
pub fn resolve_field_path<'r>(
    registry: &'r Registry,
    root: &'r ResourceDescriptor,
    path: &str,
) -> Result<ResolvedPath<'r>, EngineError> {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, crossing)) = segments.split_last() else {
        return Err(EngineError::invalid_field(path, "empty path"));
    };
    let hops = resolve_relationship_path(registry, root, crossing, path)?;
    let resource = match hops.last() {
        Some((_, relationship)) => registry
            .target_of(relationship)
            .ok_or_else(|| EngineError::invalid_field(path, "relationship has no associated resource"))?,
        None => root,
    };
    let Some(field) = resource.find_field(last) else {
        let message = if resource.find_relationship(last).is_some() {
            format!("`{last}` is a relationship, not a field")
        } else {
            format!("`{last}` is not a field of `{}`", resource.name)
        };
        return Err(EngineError::invalid_field(path, message));
    };
    if field.write_only {
        return Err(EngineError::invalid_field(path, format!("`{last}` is write-only")));
    }
    if !field.queryable {
        return Err(EngineError::invalid_field(path, format!("`{last}` is not queryable")));
    }
    Ok(ResolvedPath { hops, resource, field })
}

/// Resolves a chain of relationship names from `root`.
pub fn resolve_relationship_path<'r>(
    registry: &'r Registry,
    root: &'r ResourceDescriptor,
    segments: &[&str],
    display: &str,
) -> Result<Vec<(&'r ResourceDescriptor, &'r RelationshipDescriptor)>, EngineError> {
    let mut hops = Vec::with_capacity(segments.len());
    let mut current = root;
    for segment in segments {
        let Some(relationship) = current.find_relationship(segment) else {
            let message = if current.find_field(segment).is_some() {
                format!("`{segment}` is a field and cannot be traversed")
            } else {
                format!("`{segment}` is not a relationship of `{}`", current.name)
            };
            return Err(EngineError::invalid_field(display, message));
        };
        let target = registry.target_of(relationship).ok_or_else(|| {
            EngineError::invalid_field(display, format!("relationship `{segment}` has no associated resource"))
        })?;
        hops.push((current, relationship));
        current = target;
    }
    Ok(hops)
}

/// Turns [`FilterExpr`]s into [`Predicate`]s, injecting required filters.
pub struct FilterCompiler<'a> {
    registry: &'a Registry,
    ctx: &'a RequestContext,
}

impl<'a> FilterCompiler<'a> {
    pub fn new(registry: &'a Registry, ctx: &'a RequestContext) -> Self {
        Self { registry, ctx }
    }

    /// Compiles a user filter. Relationship-crossing leaves carry the target's
    /// required filter inside the relationship test.
    pub fn compile(&self, resource: &ResourceDescriptor, expr: &FilterExpr) -> Result<Predicate, EngineError> {
        self.compile_at(resource, expr, 0)
    }

    /// The gate's required filter for `resource`, compiled.
    pub fn required(&self, resource: &ResourceDescriptor) -> Result<Option<Predicate>, EngineError> {
        self.required_at(resource, 0)
    }

    /// `expr AND required(resource)`.
    pub fn scoped(
        &self,
        resource: &ResourceDescriptor,
        expr: Option<&FilterExpr>,
    ) -> Result<Option<Predicate>, EngineError> {
        let explicit = expr.map(|expr| self.compile(resource, expr)).transpose()?;
        Ok(Predicate::conjoin(explicit, self.required(resource)?))
    }

    fn required_at(&self, resource: &ResourceDescriptor, depth: usize) -> Result<Option<Predicate>, EngineError> {
        if depth > MAX_REQUIRED_FILTER_DEPTH {
            return Err(EngineError::QueryTooComplex {
                limit: MAX_REQUIRED_FILTER_DEPTH,
            });
        }
        let Some(required) = self.registry.gate(&resource.name).required_filter(resource, self.ctx) else {
            return Ok(None);
        };
        let resource = self.registry.require(&resource.name)?;
        self.compile_at(resource, &required, depth + 1).map(Some)
    }

    fn compile_at(&self, resource: &ResourceDescriptor, expr: &FilterExpr, depth: usize) -> Result<Predicate, EngineError> {
        match expr {
            FilterExpr::And(children) => Ok(Predicate::And(self.compile_children(resource, children, depth)?)),
            FilterExpr::Or(children) => Ok(Predicate::Or(self.compile_children(resource, children, depth)?)),
            FilterExpr::Not(children) => Ok(Predicate::Not(self.compile_children(resource, children, depth)?)),
            FilterExpr::Compare(comparison) => {
                let root = self.registry.require(&resource.name)?;
                let resolved = resolve_field_path(self.registry, root, &comparison.path)?;
                let value = resolved
                    .field
                    .field_type
                    .coerce(&comparison.value)
                    .map_err(|message| EngineError::malformed(&comparison.path, message))?;
                let pattern = if comparison.operator == Operator::Like {
                    let Some(raw) = value.as_str() else {
                        return Err(EngineError::malformed(&comparison.path, "like requires a string pattern"));
                    };
                    Some(like_regex(raw).map_err(|err| EngineError::malformed(&comparison.path, err.to_string()))?)
                } else {
                    None
                };
                let mut predicate = Predicate::Compare {
                    key: resolved.field.storage_key().to_string(),
                    field_type: resolved.field.field_type,
                    operator: comparison.operator,
                    value,
                    pattern,
                };
                for (_, relationship) in resolved.hops.iter().rev() {
                    let target = self.registry.require(&relationship.target)?;
                    let inner = Predicate::conjoin(Some(predicate), self.required_at(target, depth + 1)?)
                        .unwrap_or_else(Predicate::always);
                    predicate = Predicate::Related {
                        relationship: relationship.name.clone(),
                        target: relationship.target.clone(),
                        predicate: Box::new(inner),
                    };
                }
                Ok(predicate)
            }
        }
    }

    fn compile_children(
        &self,
        resource: &ResourceDescriptor,
        children: &[FilterExpr],
        depth: usize,
    ) -> Result<Vec<Predicate>, EngineError> {
        children
            .iter()
            .map(|child| self.compile_at(resource, child, depth))
            .collect()
    }
}
