use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::errors::EngineError;
use crate::permissions::{AllowAll, PermissionGate};
use crate::types::{Join, RelationshipDescriptor, ResourceDescriptor};

/// Name-keyed table of resource descriptors and their permission gates.
///
/// Relationships name their target by string; targets are looked up here on
/// demand, so resources may reference each other (or themselves) freely.
pub struct Registry {
    resources: BTreeMap<String, ResourceDescriptor>,
    gates: HashMap<String, Arc<dyn PermissionGate>>,
    relationship_gates: HashMap<(String, String), Arc<dyn PermissionGate>>,
    default_gate: Arc<dyn PermissionGate>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("resources", &self.resources.keys().collect::<Vec<_>>())
            .field("gated", &self.gates.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A relationship pointing at some resource, seen from the target's side.
#[derive(Debug, Clone, Copy)]
pub struct IncomingRelationship<'a> {
    pub source: &'a ResourceDescriptor,
    pub relationship: &'a RelationshipDescriptor,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&ResourceDescriptor> {
        self.resources.get(name)
    }

    /// Looks up a resource, failing with `NotFound` for unknown names.
    pub fn require(&self, name: &str) -> Result<&ResourceDescriptor, EngineError> {
        self.resources
            .get(name)
            .ok_or_else(|| EngineError::not_found(name, "resource"))
    }

    pub fn target_of(&self, relationship: &RelationshipDescriptor) -> Option<&ResourceDescriptor> {
        self.resources.get(&relationship.target)
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.resources.values()
    }

    /// Gate for a resource. Resources without a registered gate allow everything.
    pub fn gate(&self, resource: &str) -> &dyn PermissionGate {
        self.gates
            .get(resource)
            .map(Arc::as_ref)
            .unwrap_or(self.default_gate.as_ref())
    }

    /// Gate consulted for mutations through one relationship; falls back to the resource gate.
    pub fn relationship_gate(&self, resource: &str, relationship: &str) -> &dyn PermissionGate {
        self.relationship_gates
            .get(&(resource.to_string(), relationship.to_string()))
            .map(Arc::as_ref)
            .unwrap_or_else(|| self.gate(resource))
    }

    /// Every relationship whose target is `target`.
    pub fn incoming(&self, target: &str) -> Vec<IncomingRelationship<'_>> {
        let mut incoming = Vec::new();
        for source in self.resources.values() {
            for relationship in &source.relationships {
                if relationship.target == target {
                    incoming.push(IncomingRelationship { source, relationship });
                }
            }
        }
        incoming
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    resources: Vec<ResourceDescriptor>,
    gates: HashMap<String, Arc<dyn PermissionGate>>,
    relationship_gates: HashMap<(String, String), Arc<dyn PermissionGate>>,
}

impl RegistryBuilder {
    pub fn resource(mut self, descriptor: ResourceDescriptor) -> Self {
        self.resources.push(descriptor);
        self
    }

    pub fn resources<I>(mut self, descriptors: I) -> Self
    where
        I: IntoIterator<Item = ResourceDescriptor>,
    {
        self.resources.extend(descriptors);
        self
    }

    pub fn gate(mut self, resource: impl Into<String>, gate: impl PermissionGate + 'static) -> Self {
        self.gates.insert(resource.into(), Arc::new(gate));
        self
    }

    pub fn relationship_gate(
        mut self,
        resource: impl Into<String>,
        relationship: impl Into<String>,
        gate: impl PermissionGate + 'static,
    ) -> Self {
        self.relationship_gates
            .insert((resource.into(), relationship.into()), Arc::new(gate));
        self
    }

    /// Validates every descriptor against the full set and freezes the registry.
    pub fn build(self) -> Result<Registry, EngineError> {
        let mut resources = BTreeMap::new();
        for descriptor in self.resources {
            if resources.contains_key(&descriptor.name) {
                return Err(schema_error(&descriptor.name, "resource registered twice"));
            }
            resources.insert(descriptor.name.clone(), descriptor);
        }

        for descriptor in resources.values() {
            validate_descriptor(descriptor, &resources)?;
        }
        for (resource, relationship) in self.relationship_gates.keys() {
            let known = resources
                .get(resource)
                .is_some_and(|descriptor| descriptor.find_relationship(relationship).is_some());
            if !known {
                return Err(schema_error(resource, format!("gate registered for unknown relationship `{relationship}`")));
            }
        }

        Ok(Registry {
            resources,
            gates: self.gates,
            relationship_gates: self.relationship_gates,
            default_gate: Arc::new(AllowAll),
        })
    }
}

fn schema_error(resource: &str, message: impl Into<String>) -> EngineError {
    EngineError::InvalidSchema {
        resource: resource.to_string(),
        message: message.into(),
    }
}

fn validate_descriptor(
    descriptor: &ResourceDescriptor,
    resources: &BTreeMap<String, ResourceDescriptor>,
) -> Result<(), EngineError> {
    let name = descriptor.name.as_str();
    if descriptor.identity.is_empty() {
        return Err(schema_error(name, "at least one identity field is required"));
    }
    for id in &descriptor.identity {
        if descriptor.find_field(id).is_none() {
            return Err(schema_error(name, format!("identity field `{id}` is not declared")));
        }
    }
    for (index, field) in descriptor.fields.iter().enumerate() {
        if descriptor.fields[..index].iter().any(|other| other.name == field.name) {
            return Err(schema_error(name, format!("field `{}` declared twice", field.name)));
        }
        if descriptor.find_relationship(&field.name).is_some() {
            return Err(schema_error(name, format!("`{}` is both a field and a relationship", field.name)));
        }
    }

    for relationship in &descriptor.relationships {
        let Some(target) = resources.get(&relationship.target) else {
            return Err(schema_error(
                name,
                format!("relationship `{}` targets unknown resource `{}`", relationship.name, relationship.target),
            ));
        };
        let has_key = |resource: &ResourceDescriptor, key: &str| resource.find_field_by_key(key).is_some();
        match &relationship.join {
            Join::ForeignKey { local, remote } | Join::Reverse { local, remote } => {
                if local.is_empty() || local.len() != remote.len() {
                    return Err(schema_error(
                        name,
                        format!("relationship `{}` has mismatched join columns", relationship.name),
                    ));
                }
                let (holder, referenced) = match relationship.join {
                    Join::ForeignKey { .. } => ((descriptor, local), (target, remote)),
                    _ => ((target, remote), (descriptor, local)),
                };
                for key in holder.1.iter() {
                    if !has_key(holder.0, key) {
                        return Err(schema_error(
                            name,
                            format!("relationship `{}` joins on unknown column `{}.{key}`", relationship.name, holder.0.name),
                        ));
                    }
                }
                for key in referenced.1.iter() {
                    if !has_key(referenced.0, key) {
                        return Err(schema_error(
                            name,
                            format!(
                                "relationship `{}` references unknown column `{}.{key}`",
                                relationship.name, referenced.0.name
                            ),
                        ));
                    }
                }
            }
            Join::Association { table, local, remote } => {
                if table.is_empty() || local.is_empty() || remote.is_empty() || local == remote {
                    return Err(schema_error(
                        name,
                        format!("relationship `{}` has an invalid association table", relationship.name),
                    ));
                }
            }
        }
        if let Some(inverse) = &relationship.back_populates
            && target.find_relationship(inverse).is_none()
        {
            return Err(schema_error(
                name,
                format!("`{}` back-populates unknown relationship `{}.{inverse}`", relationship.name, target.name),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldDescriptor;

    fn people() -> ResourceDescriptor {
        ResourceDescriptor::new("people")
            .identity(["person_id"])
            .field(FieldDescriptor::integer("person_id").generated())
            .field(FieldDescriptor::integer("manager_id").optional())
            .relationship(
                RelationshipDescriptor::many_to_one("manager", "people", &["manager_id"], &["person_id"])
                    .back_populates("reports"),
            )
            .relationship(
                RelationshipDescriptor::one_to_many("reports", "people", &["person_id"], &["manager_id"])
                    .back_populates("manager"),
            )
    }

    #[test]
    fn self_referencing_resources_resolve_lazily() {
        let registry = Registry::builder().resource(people()).build().expect("valid schema");
        let people = registry.require("people").unwrap();
        let manager = people.find_relationship("manager").unwrap();
        assert_eq!(registry.target_of(manager).map(|d| d.name.as_str()), Some("people"));
        assert_eq!(registry.incoming("people").len(), 2);
    }

    #[test]
    fn unknown_targets_are_rejected() {
        let broken = ResourceDescriptor::new("albums")
            .identity(["album_id"])
            .field(FieldDescriptor::integer("album_id"))
            .field(FieldDescriptor::integer("artist_id"))
            .relationship(RelationshipDescriptor::many_to_one("artist", "artists", &["artist_id"], &["artist_id"]));
        let err = Registry::builder().resource(broken).build().unwrap_err();
        assert!(matches!(err, EngineError::InvalidSchema { .. }));
    }

    #[test]
    fn missing_identity_field_is_rejected() {
        let broken = ResourceDescriptor::new("genres").identity(["genre_id"]);
        assert!(Registry::builder().resource(broken).build().is_err());
    }

    #[test]
    fn unknown_resources_are_not_found() {
        let registry = Registry::builder().resource(people()).build().unwrap();
        assert!(matches!(registry.require("planets"), Err(EngineError::NotFound { .. })));
    }
}
