//! Nested mutation processing.
//!
//! A document is walked against its resource: every object node is resolved
//! to an existing or new entity, its scalars are coerced and validated, its
//! relationships are recursed into, and the permission gate is consulted
//! before each write is planned. The result is one [`MutationPlan`] handed
//! to [`Store::commit`] exactly once. Validation issues are collected across
//! the whole document and reported together; permission denials abort at
//! once. Nothing is committed unless the walk finishes cleanly.
//!
//! Nodes may carry `$op`:
//!
//! | value | meaning |
//! |---|---|
//! | `add` / `set` | associate with the parent (create first when new) |
//! | `update` | the entity must exist; update it |
//! | `remove` | unlink from the parent, or delete at the root |
//!
//! When the same entity is reached twice in one document, the later write
//! wins.

pub mod validate;

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use log::{debug, trace};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::{EngineError, ValidationError, ValidationIssue};
use crate::filters::{FilterCompiler, Predicate, compare_values};
use crate::permissions::{MutationAction, MutationCheck, MutationParent, MutationTarget, PermissionGate, RequestContext};
use crate::query::Pagination;
use crate::registry::Registry;
use crate::store::{EntityRef, FetchRequest, MutationCommand, MutationPlan, Store};
use crate::types::{FieldDescriptor, Identity, Join, Record, RelationshipDescriptor, ResourceDescriptor};

pub const OP_KEY: &str = "$op";
/// Rendered link key, ignored on input.
pub const SELF_KEY: &str = "self";

/// How unmentioned state is treated at the root of an update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    /// PUT: required fields must be present and to-many relationships in
    /// the document are replaced.
    Replace,
    #[default]
    Patch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Update,
    Remove,
}

impl Op {
    fn parse(raw: &Value) -> Result<Self, EngineError> {
        match raw.as_str() {
            Some("add" | "set") => Ok(Op::Add),
            Some("update") => Ok(Op::Update),
            Some("remove") => Ok(Op::Remove),
            Some(other) => Err(EngineError::bad_request(format!(
                "unknown `{OP_KEY}` value `{other}`; expected add, set, update or remove"
            ))),
            None => Err(EngineError::bad_request(format!("`{OP_KEY}` must be a string"))),
        }
    }
}

/// Identities affected at the root and the store's write count.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MutationOutcome {
    pub identities: Vec<Identity>,
    /// Every entity the plan created, at any depth, in creation order.
    pub created: Vec<(String, Identity)>,
    pub writes: usize,
}

impl MutationOutcome {
    /// First entity of `resource` created by the plan.
    pub fn first_created(&self, resource: &str) -> Option<&Identity> {
        self.created
            .iter()
            .find(|(created, _)| created == resource)
            .map(|(_, identity)| identity)
    }
}

/// An entity met during the walk.
#[derive(Debug, Clone)]
struct Known {
    reference: EntityRef,
    /// Stored state merged with the writes planned so far.
    record: Record,
    /// Created by this plan.
    created: bool,
}

impl Known {
    fn existing(&self) -> Option<&Record> {
        (!self.created).then_some(&self.record)
    }
}

#[derive(Clone, Copy)]
enum Root<'i> {
    Create,
    Update(&'i Identity),
    Collection,
}

#[derive(Clone, Copy)]
struct Parent<'p> {
    descriptor: &'p ResourceDescriptor,
    relationship: &'p RelationshipDescriptor,
    reference: &'p EntityRef,
    existing: Option<&'p Record>,
}

impl<'p> Parent<'p> {
    fn as_check(&self) -> MutationParent<'p> {
        MutationParent {
            resource: self.descriptor,
            relationship: self.relationship,
            existing: self.existing,
        }
    }
}

#[derive(Clone, Copy)]
enum Position<'p> {
    Root(Root<'p>),
    Nested(Parent<'p>),
}

impl<'p> Position<'p> {
    fn parent(&self) -> Option<MutationParent<'p>> {
        match self {
            Position::Root(_) => None,
            Position::Nested(parent) => Some(parent.as_check()),
        }
    }
}

struct NodeResult {
    reference: EntityRef,
    removed: bool,
}

/// (parent resource, relationship, parent key, child key)
type LinkKey = (String, String, String, String);

/// Turns documents into one committed [`MutationPlan`].
///
/// Each entry point consumes the processor and commits exactly once.
pub struct MutationProcessor<'a, S> {
    registry: &'a Registry,
    ctx: &'a RequestContext,
    store: &'a mut S,
    compiler: FilterCompiler<'a>,
    plan: MutationPlan,
    issues: Vec<ValidationIssue>,
    known: HashMap<(String, String), Known>,
    memberships: HashMap<LinkKey, bool>,
}

impl<'a, S: Store> MutationProcessor<'a, S> {
    pub fn new(registry: &'a Registry, ctx: &'a RequestContext, store: &'a mut S) -> Self {
        store.begin();
        Self {
            registry,
            ctx,
            store,
            compiler: FilterCompiler::new(registry, ctx),
            plan: MutationPlan::new(),
            issues: Vec::new(),
            known: HashMap::new(),
            memberships: HashMap::new(),
        }
    }

    /// Creates one entity from an object, or one per element of an array.
    pub async fn create(mut self, resource: &str, document: &Value) -> Result<MutationOutcome, EngineError> {
        let registry = self.registry;
        let descriptor = registry.require(resource)?;
        let mut roots = Vec::new();
        match document {
            Value::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    let path = index.to_string();
                    if let Some(node) = self.process_root(descriptor, item, &path, Root::Create).await? {
                        roots.push(node.reference);
                    }
                }
            }
            _ => {
                if let Some(node) = self.process_root(descriptor, document, "", Root::Create).await? {
                    roots.push(node.reference);
                }
            }
        }
        self.finish(roots).await
    }

    /// Updates the entity at `identity`. `Mode::Replace` applies to the root
    /// only; nested nodes are always patched.
    pub async fn update(
        mut self,
        resource: &str,
        identity: &Identity,
        document: &Value,
        mode: Mode,
    ) -> Result<MutationOutcome, EngineError> {
        let registry = self.registry;
        let descriptor = registry.require(resource)?;
        let mut roots = Vec::new();
        if let Some(node) = self
            .process_node(descriptor, document, "", Position::Root(Root::Update(identity)), mode)
            .await?
        {
            roots.push(node.reference);
        }
        self.finish(roots).await
    }

    /// Sets one attribute from a bare value.
    pub async fn update_field(
        self,
        resource: &str,
        identity: &Identity,
        field: &str,
        value: &Value,
    ) -> Result<MutationOutcome, EngineError> {
        let registry = self.registry;
        let descriptor = registry.require(resource)?;
        if descriptor.find_field(field).is_none() {
            return Err(EngineError::not_found(resource, format!("{identity}/{field}")));
        }
        let document = Value::Object(Map::from_iter([(field.to_string(), value.clone())]));
        self.update(resource, identity, &document, Mode::Patch).await
    }

    /// Applies an array of `$op`-annotated items to the collection itself:
    /// `remove` deletes, everything else creates or updates.
    pub async fn patch_collection(mut self, resource: &str, items: &Value) -> Result<MutationOutcome, EngineError> {
        let registry = self.registry;
        let descriptor = registry.require(resource)?;
        let Value::Array(items) = items else {
            return Err(EngineError::bad_request("a collection patch must be an array"));
        };
        let mut roots = Vec::new();
        for (index, item) in items.iter().enumerate() {
            let path = index.to_string();
            if let Some(node) = self.process_root(descriptor, item, &path, Root::Collection).await?
                && !node.removed
            {
                roots.push(node.reference);
            }
        }
        self.finish(roots).await
    }

    pub async fn delete(mut self, resource: &str, identity: &Identity) -> Result<MutationOutcome, EngineError> {
        let registry = self.registry;
        let descriptor = registry.require(resource)?;
        let known = self
            .lookup(descriptor, identity)
            .await?
            .ok_or_else(|| EngineError::not_found(resource, identity))?;
        self.plan_delete(descriptor, &known, None)?;
        self.finish(vec![known.reference]).await
    }

    /// Deletes every visible entity matching `predicate`.
    pub async fn delete_where(mut self, resource: &str, predicate: Option<Predicate>) -> Result<MutationOutcome, EngineError> {
        let registry = self.registry;
        let descriptor = registry.require(resource)?;
        let predicate = Predicate::conjoin(predicate, self.compiler.required(descriptor)?);
        let rows = self
            .store
            .fetch(&FetchRequest::new(&descriptor.name).with_predicate(predicate))
            .await?;
        let mut roots = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(identity) = descriptor.identity_of(&row.record) else {
                continue;
            };
            let known = Known {
                reference: EntityRef::Existing(identity),
                record: row.record,
                created: false,
            };
            self.plan_delete(descriptor, &known, None)?;
            roots.push(known.reference);
        }
        self.finish(roots).await
    }

    async fn finish(self, roots: Vec<EntityRef>) -> Result<MutationOutcome, EngineError> {
        if !self.issues.is_empty() {
            debug!("mutation rejected with {} validation issues", self.issues.len());
            return Err(ValidationError::new(self.issues).into());
        }
        debug!("committing mutation plan of {} commands", self.plan.len());
        let report = self.store.commit(&self.plan).await?;
        let created = self
            .plan
            .commands
            .iter()
            .filter_map(|command| match command {
                MutationCommand::Create(create) => report
                    .created
                    .get(create.slot)
                    .map(|identity| (create.resource.clone(), identity.clone())),
                _ => None,
            })
            .collect();
        Ok(MutationOutcome {
            identities: roots.iter().filter_map(|root| report.resolve(root)).collect(),
            created,
            writes: report.writes,
        })
    }

    async fn process_root(
        &mut self,
        descriptor: &'a ResourceDescriptor,
        value: &Value,
        path: &str,
        root: Root<'_>,
    ) -> Result<Option<NodeResult>, EngineError> {
        self.process_node(descriptor, value, path, Position::Root(root), Mode::Patch)
            .await
    }

    async fn process_node(
        &mut self,
        descriptor: &'a ResourceDescriptor,
        value: &Value,
        path: &str,
        position: Position<'_>,
        mode: Mode,
    ) -> Result<Option<NodeResult>, EngineError> {
        let registry = self.registry;
        let Some(document) = value.as_object() else {
            self.issue(path_or_root(path), "document.not_object", "expected an object");
            return Ok(None);
        };
        let op = document.get(OP_KEY).map(Op::parse).transpose()?;

        let identity = match position {
            Position::Root(Root::Update(identity)) => {
                if let Some(given) = descriptor.identity_in_document(document)
                    && given.key() != identity.key()
                {
                    self.issue(join_path(path, &descriptor.identity.join(",")), "identity.immutable", "identity cannot change");
                }
                Some(identity.clone())
            }
            _ => descriptor.identity_in_document(document),
        };
        let known = match &identity {
            Some(identity) => self.lookup(descriptor, identity).await?,
            None => None,
        };

        let must_exist =
            matches!(op, Some(Op::Update | Op::Remove)) || matches!(position, Position::Root(Root::Update(_)));
        if known.is_none() && must_exist {
            return Err(match &identity {
                Some(identity) => EngineError::not_found(&descriptor.name, identity),
                None => EngineError::bad_request(format!(
                    "`{}` at `{}` needs its identity fields to update or remove",
                    descriptor.name,
                    path_or_root(path)
                )),
            });
        }
        if known.is_some() && matches!(position, Position::Root(Root::Create)) {
            self.issue(
                join_path(path, &descriptor.identity.join(",")),
                "identity.exists",
                format!("`{}` {} already exists", descriptor.name, identity.as_ref().map(Identity::key).unwrap_or_default()),
            );
            return Ok(None);
        }
        trace!("`{}` node at `{}`: {op:?}, existing: {}", descriptor.name, path_or_root(path), known.is_some());

        if op == Some(Op::Remove)
            && let Some(known) = &known
        {
            match position {
                Position::Nested(parent) => self.unlink(parent, descriptor, known, path, value).await?,
                Position::Root(_) => self.plan_delete(descriptor, known, None)?,
            }
            return Ok(Some(NodeResult {
                reference: known.reference.clone(),
                removed: true,
            }));
        }

        let creating = known.is_none();
        let existing = known.as_ref().and_then(Known::existing).cloned();
        let action = if creating { MutationAction::Create } else { MutationAction::Update };
        let gate = registry.gate(&descriptor.name);

        let mut values = Record::new();
        let mut relationships = Vec::new();
        for (key, raw) in document {
            if key == OP_KEY || key == SELF_KEY {
                continue;
            }
            if let Some(relationship) = descriptor.find_relationship(key) {
                relationships.push((relationship, raw));
                continue;
            }
            let field_path = join_path(path, key);
            let Some(field) = descriptor.find_field(key) else {
                self.issue(field_path, "field.unknown", format!("`{key}` is not a field of `{}`", descriptor.name));
                continue;
            };
            let coerced = match validate::check_field_value(field, &field_path, raw) {
                Ok(coerced) => coerced,
                Err(issues) => {
                    self.issues.extend(issues);
                    continue;
                }
            };
            if let Some(known) = &known
                && unchanged(field, known.record.get(field.storage_key()), &coerced)
            {
                continue;
            }
            let is_identity = descriptor.is_identity(&field.name);
            if is_identity && !creating {
                self.issue(field_path, "identity.immutable", "identity cannot change");
                continue;
            }
            if field.read_only && !is_identity {
                self.issue(field_path, "field.read_only", format!("`{key}` is read-only"));
                continue;
            }
            let check = MutationCheck {
                resource: descriptor,
                target: MutationTarget::Field(&field.name),
                action,
                value: Some(&coerced),
                existing: existing.as_ref(),
                parent: position.parent(),
            };
            self.permit(gate, &check)?;
            values.insert(field.storage_key().to_string(), coerced);
        }

        if creating || mode == Mode::Replace {
            let linked_keys = link_satisfied_keys(descriptor, position, &relationships);
            for field in descriptor.fields.iter().filter(|field| field.required_on_input()) {
                if document.contains_key(&field.name) || (!creating && descriptor.is_identity(&field.name)) {
                    continue;
                }
                if creating && linked_keys.contains(field.storage_key()) {
                    continue;
                }
                self.issue(join_path(path, &field.name), "field.required", "field is required");
            }
        }

        let reference = match &known {
            None => {
                let check = MutationCheck {
                    resource: descriptor,
                    target: MutationTarget::Entity,
                    action: MutationAction::Create,
                    value: Some(value),
                    existing: None,
                    parent: position.parent(),
                };
                self.permit(gate, &check)?;
                let reference = self.plan.create(&descriptor.name, values.clone());
                if let Some(identity) = &identity {
                    self.known.insert(
                        (descriptor.name.clone(), identity.key()),
                        Known {
                            reference: reference.clone(),
                            record: values,
                            created: true,
                        },
                    );
                }
                reference
            }
            Some(known) => {
                if !values.is_empty() {
                    let check = MutationCheck {
                        resource: descriptor,
                        target: MutationTarget::Entity,
                        action: MutationAction::Update,
                        value: Some(value),
                        existing: existing.as_ref(),
                        parent: position.parent(),
                    };
                    self.permit(gate, &check)?;
                    self.plan.update(&descriptor.name, known.reference.clone(), values.clone());
                    if let Some(identity) = &identity
                        && let Some(entry) = self.known.get_mut(&(descriptor.name.clone(), identity.key()))
                    {
                        entry.record.extend(values);
                    }
                }
                known.reference.clone()
            }
        };

        if let Position::Nested(parent) = position {
            let child = Known {
                reference: reference.clone(),
                record: known.as_ref().map(|known| known.record.clone()).unwrap_or_default(),
                created: creating || known.as_ref().is_some_and(|known| known.created),
            };
            self.link(parent, descriptor, &child, op == Some(Op::Add), path, value).await?;
        }

        for (relationship, raw) in relationships {
            let relationship_path = join_path(path, &relationship.name);
            if raw.is_string() {
                continue;
            }
            if relationship.read_only {
                self.issue(relationship_path, "relationship.read_only", format!("`{}` is read-only", relationship.name));
                continue;
            }
            let target = registry.require(&relationship.target)?;
            let parent = Parent {
                descriptor,
                relationship,
                reference: &reference,
                existing: existing.as_ref(),
            };
            match raw {
                Value::Array(items) if relationship.is_many() => {
                    let mut mentioned = HashSet::new();
                    for (index, item) in items.iter().enumerate() {
                        let item_path = join_path(&relationship_path, &index.to_string());
                        let node = Box::pin(self.process_node(target, item, &item_path, Position::Nested(parent), Mode::Patch))
                            .await?;
                        if let Some(node) = node
                            && !node.removed
                        {
                            mentioned.insert(reference_key(&node.reference));
                        }
                    }
                    if mode == Mode::Replace && !creating {
                        self.unlink_absent(parent, target, &mentioned).await?;
                    }
                }
                Value::Object(_) if !relationship.is_many() => {
                    Box::pin(self.process_node(target, raw, &relationship_path, Position::Nested(parent), Mode::Patch))
                        .await?;
                }
                Value::Null if !relationship.is_many() => {
                    self.unlink_absent(parent, target, &HashSet::new()).await?;
                }
                _ => {
                    let expected = if relationship.is_many() { "an array" } else { "an object or null" };
                    self.issue(relationship_path, "relationship.shape", format!("`{}` expects {expected}", relationship.name));
                }
            }
        }

        Ok(Some(NodeResult {
            reference,
            removed: false,
        }))
    }

    /// Finds an entity by identity: entities met earlier in this request
    /// first, then the store with the required filter applied.
    async fn lookup(&mut self, descriptor: &ResourceDescriptor, identity: &Identity) -> Result<Option<Known>, EngineError> {
        let key = (descriptor.name.clone(), identity.key());
        if let Some(known) = self.known.get(&key) {
            return Ok(Some(known.clone()));
        }
        let required = self.compiler.required(descriptor)?;
        let hideable = required.is_some();
        let predicate = Predicate::conjoin(Some(Predicate::identity(descriptor, identity)), required);
        let request = FetchRequest {
            pagination: Pagination::new(0, Some(1)),
            ..FetchRequest::new(&descriptor.name).with_predicate(predicate)
        };
        let Some(row) = self.store.fetch(&request).await?.into_iter().next() else {
            // A row outside the required filter must look absent, not new.
            if hideable {
                let unfiltered = Predicate::identity(descriptor, identity);
                if self.store.count(&descriptor.name, Some(&unfiltered)).await? > 0 {
                    return Err(EngineError::not_found(&descriptor.name, identity));
                }
            }
            return Ok(None);
        };
        let known = Known {
            reference: EntityRef::Existing(descriptor.identity_of(&row.record).unwrap_or_else(|| identity.clone())),
            record: row.record,
            created: false,
        };
        self.known.insert(key, known.clone());
        Ok(Some(known))
    }

    fn plan_delete(
        &mut self,
        descriptor: &ResourceDescriptor,
        known: &Known,
        parent: Option<MutationParent<'_>>,
    ) -> Result<(), EngineError> {
        let check = MutationCheck {
            resource: descriptor,
            target: MutationTarget::Entity,
            action: MutationAction::Delete,
            value: None,
            existing: known.existing(),
            parent,
        };
        self.permit(self.registry.gate(&descriptor.name), &check)?;
        self.plan.delete(&descriptor.name, known.reference.clone());
        Ok(())
    }

    async fn link(
        &mut self,
        parent: Parent<'_>,
        target: &ResourceDescriptor,
        child: &Known,
        explicit: bool,
        path: &str,
        value: &Value,
    ) -> Result<(), EngineError> {
        if self.is_member(parent, target, &child.reference).await? {
            if explicit {
                self.issue(
                    path_or_root(path),
                    "relationship.already_member",
                    format!("already a member of `{}`", parent.relationship.name),
                );
            }
            return Ok(());
        }
        if !parent.relationship.is_many() {
            let keep = HashSet::from([reference_key(&child.reference)]);
            self.unlink_absent(parent, target, &keep).await?;
        }
        self.permit_relationship(parent, target, child.existing(), MutationAction::Add, Some(value))?;
        self.plan.link(
            &parent.descriptor.name,
            &parent.relationship.name,
            parent.reference.clone(),
            child.reference.clone(),
        );
        self.memberships.insert(link_key(parent, &child.reference), true);
        Ok(())
    }

    async fn unlink(
        &mut self,
        parent: Parent<'_>,
        target: &ResourceDescriptor,
        child: &Known,
        path: &str,
        value: &Value,
    ) -> Result<(), EngineError> {
        if !self.is_member(parent, target, &child.reference).await? {
            self.issue(
                path_or_root(path),
                "relationship.not_member",
                format!("not a member of `{}`", parent.relationship.name),
            );
            return Ok(());
        }
        self.plan_unlink(parent, target, child, Some(value))
    }

    fn plan_unlink(
        &mut self,
        parent: Parent<'_>,
        target: &ResourceDescriptor,
        child: &Known,
        value: Option<&Value>,
    ) -> Result<(), EngineError> {
        self.permit_relationship(parent, target, child.existing(), MutationAction::Remove, value)?;
        self.plan.unlink(
            &parent.descriptor.name,
            &parent.relationship.name,
            parent.reference.clone(),
            child.reference.clone(),
        );
        self.memberships.insert(link_key(parent, &child.reference), false);
        Ok(())
    }

    /// Unlinks every current member whose key is not in `keep`.
    async fn unlink_absent(
        &mut self,
        parent: Parent<'_>,
        target: &ResourceDescriptor,
        keep: &HashSet<String>,
    ) -> Result<(), EngineError> {
        for member in self.current_members(parent, target).await? {
            if keep.contains(&reference_key(&member.reference)) {
                continue;
            }
            if matches!(parent.relationship.join, Join::ForeignKey { .. }) && !keep.is_empty() {
                // the new link overwrites the foreign key
                self.permit_relationship(parent, target, member.existing(), MutationAction::Remove, None)?;
                self.memberships.insert(link_key(parent, &member.reference), false);
                continue;
            }
            self.plan_unlink(parent, target, &member, None)?;
        }
        Ok(())
    }

    /// Stored members visible to the caller, minus those unlinked earlier in
    /// this request.
    async fn current_members(&mut self, parent: Parent<'_>, target: &ResourceDescriptor) -> Result<Vec<Known>, EngineError> {
        let EntityRef::Existing(parent_identity) = parent.reference else {
            return Ok(Vec::new());
        };
        let member_of = Predicate::MemberOf {
            resource: parent.descriptor.name.clone(),
            identity: parent_identity.clone(),
            relationship: parent.relationship.name.clone(),
        };
        let predicate = Predicate::conjoin(Some(member_of), self.compiler.required(target)?);
        let rows = self
            .store
            .fetch(&FetchRequest::new(&target.name).with_predicate(predicate))
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let identity = target.identity_of(&row.record)?;
                let reference = EntityRef::Existing(identity);
                let unlinked = self.memberships.get(&link_key(parent, &reference)) == Some(&false);
                (!unlinked).then_some(Known {
                    reference,
                    record: row.record,
                    created: false,
                })
            })
            .collect())
    }

    async fn is_member(&mut self, parent: Parent<'_>, target: &ResourceDescriptor, child: &EntityRef) -> Result<bool, EngineError> {
        if let Some(state) = self.memberships.get(&link_key(parent, child)) {
            return Ok(*state);
        }
        let (EntityRef::Existing(parent_identity), EntityRef::Existing(child_identity)) = (parent.reference, child) else {
            return Ok(false);
        };
        let predicate = Predicate::all([
            Predicate::identity(target, child_identity),
            Predicate::MemberOf {
                resource: parent.descriptor.name.clone(),
                identity: parent_identity.clone(),
                relationship: parent.relationship.name.clone(),
            },
        ]);
        Ok(self.store.count(&target.name, Some(&predicate)).await? > 0)
    }

    /// Consults both sides of a relationship change independently.
    fn permit_relationship(
        &self,
        parent: Parent<'_>,
        target: &ResourceDescriptor,
        child_existing: Option<&Record>,
        action: MutationAction,
        value: Option<&Value>,
    ) -> Result<(), EngineError> {
        let forward = MutationCheck {
            resource: parent.descriptor,
            target: MutationTarget::Relationship(&parent.relationship.name),
            action,
            value,
            existing: parent.existing,
            parent: None,
        };
        self.permit(
            self.registry
                .relationship_gate(&parent.descriptor.name, &parent.relationship.name),
            &forward,
        )?;

        if let Some(inverse) = parent
            .relationship
            .back_populates
            .as_deref()
            .and_then(|inverse| target.find_relationship(inverse))
        {
            let backward = MutationCheck {
                resource: target,
                target: MutationTarget::Relationship(&inverse.name),
                action,
                value: None,
                existing: child_existing,
                parent: Some(parent.as_check()),
            };
            self.permit(self.registry.relationship_gate(&target.name, &inverse.name), &backward)?;
        }
        Ok(())
    }

    fn permit(&self, gate: &dyn PermissionGate, check: &MutationCheck<'_>) -> Result<(), EngineError> {
        if gate.check_mutation(check, self.ctx) {
            Ok(())
        } else {
            debug!("mutation check denied: {} on `{}`", check.describe(), check.resource.name);
            Err(EngineError::denied(&check.resource.name, check.describe()))
        }
    }

    fn issue(&mut self, field: impl Into<String>, code: &str, message: impl Into<String>) {
        self.issues.push(ValidationIssue::new(field, code, message));
    }
}

/// Storage keys a new node gets from links rather than from its document.
fn link_satisfied_keys(
    descriptor: &ResourceDescriptor,
    position: Position<'_>,
    relationships: &[(&RelationshipDescriptor, &Value)],
) -> HashSet<String> {
    let mut keys = HashSet::new();
    if let Position::Nested(parent) = position
        && let Join::Reverse { remote, .. } = &parent.relationship.join
        && parent.relationship.target == descriptor.name
    {
        keys.extend(remote.iter().cloned());
    }
    for (relationship, raw) in relationships {
        if let Join::ForeignKey { local, .. } = &relationship.join
            && raw.is_object()
        {
            keys.extend(local.iter().cloned());
        }
    }
    keys
}

fn unchanged(field: &FieldDescriptor, stored: Option<&Value>, next: &Value) -> bool {
    match stored {
        None | Some(Value::Null) => next.is_null(),
        Some(stored) => stored == next || compare_values(stored, next, field.field_type) == Some(Ordering::Equal),
    }
}

fn reference_key(reference: &EntityRef) -> String {
    match reference {
        EntityRef::Existing(identity) => identity.key(),
        EntityRef::Pending(slot) => format!("#pending/{slot}"),
    }
}

fn link_key(parent: Parent<'_>, child: &EntityRef) -> LinkKey {
    (
        parent.descriptor.name.clone(),
        parent.relationship.name.clone(),
        reference_key(parent.reference),
        reference_key(child),
    )
}

fn join_path(base: &str, segment: &str) -> String {
    if base.is_empty() {
        segment.to_string()
    } else {
        format!("{base}.{segment}")
    }
}

fn path_or_root(path: &str) -> &str {
    if path.is_empty() { "$" } else { path }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::store::{MemoryStore, Tables};
    use crate::types::ValidationRule;

    fn registry() -> Arc<Registry> {
        let registry = Registry::builder()
            .resource(
                ResourceDescriptor::new("artists")
                    .identity(["artist_id"])
                    .field(FieldDescriptor::integer("artist_id").generated())
                    .field(FieldDescriptor::string("name"))
                    .relationship(
                        RelationshipDescriptor::one_to_many("albums", "albums", &["artist_id"], &["artist_id"])
                            .back_populates("artist"),
                    ),
            )
            .resource(
                ResourceDescriptor::new("albums")
                    .identity(["album_id"])
                    .field(FieldDescriptor::integer("album_id").generated())
                    .field(FieldDescriptor::string("title"))
                    .field(FieldDescriptor::integer("artist_id"))
                    .relationship(
                        RelationshipDescriptor::many_to_one("artist", "artists", &["artist_id"], &["artist_id"])
                            .back_populates("albums"),
                    )
                    .relationship(
                        RelationshipDescriptor::one_to_many("tracks", "tracks", &["album_id"], &["album_id"])
                            .back_populates("album"),
                    ),
            )
            .resource(
                ResourceDescriptor::new("tracks")
                    .identity(["track_id"])
                    .field(FieldDescriptor::integer("track_id").generated())
                    .field(FieldDescriptor::string("name"))
                    .field(FieldDescriptor::integer("album_id").optional())
                    .field(
                        FieldDescriptor::integer("milliseconds")
                            .optional()
                            .validate(ValidationRule::Range {
                                min: Some(1.0),
                                max: None,
                            }),
                    )
                    .relationship(
                        RelationshipDescriptor::many_to_one("album", "albums", &["album_id"], &["album_id"])
                            .back_populates("tracks"),
                    ),
            )
            .resource(
                ResourceDescriptor::new("playlists")
                    .identity(["playlist_id"])
                    .field(FieldDescriptor::integer("playlist_id").generated())
                    .field(FieldDescriptor::string("name"))
                    .relationship(RelationshipDescriptor::many_to_many(
                        "tracks",
                        "tracks",
                        "playlist_track",
                        "playlist_id",
                        "track_id",
                    )),
            )
            .build()
            .unwrap();
        Arc::new(registry)
    }

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn store(registry: &Arc<Registry>) -> MemoryStore {
        let mut tables = Tables::new();
        tables
            .insert(registry, "artists", record(json!({"artist_id": 1, "name": "AC/DC"})))
            .unwrap();
        tables
            .insert(
                registry,
                "albums",
                record(json!({"album_id": 1, "title": "Let There Be Rock", "artist_id": 1})),
            )
            .unwrap();
        for track_id in 1..=2 {
            tables
                .insert(
                    registry,
                    "tracks",
                    record(json!({"track_id": track_id, "name": format!("Track {track_id}"), "album_id": 1})),
                )
                .unwrap();
        }
        tables
            .insert(registry, "playlists", record(json!({"playlist_id": 1, "name": "Mix"})))
            .unwrap();
        for track_id in 1..=2 {
            tables.associate(
                "playlist_track",
                &[("playlist_id", &Identity::single(1)), ("track_id", &Identity::single(track_id))],
            );
        }
        MemoryStore::with_tables(registry.clone(), tables)
    }

    fn playlist_tracks(store: &MemoryStore) -> Vec<String> {
        store
            .tables()
            .association_tables()
            .flat_map(|(_, rows)| rows.iter())
            .filter_map(|row| row.get("track_id").cloned())
            .collect()
    }

    #[tokio::test]
    async fn identity_only_reference_links_without_writing_the_target() {
        let registry = registry();
        let mut store = store(&registry);
        let ctx = RequestContext::new();
        let outcome = MutationProcessor::new(&registry, &ctx, &mut store)
            .create("albums", &json!({"title": "X", "artist": {"artist_id": 1}}))
            .await
            .unwrap();
        assert_eq!(outcome.identities, vec![Identity::single(2)]);
        let album = store.tables().get("albums", &Identity::single(2)).unwrap();
        assert_eq!(album.get("artist_id"), Some(&json!(1)));
        assert_eq!(
            store.tables().get("artists", &Identity::single(1)).unwrap(),
            &record(json!({"artist_id": 1, "name": "AC/DC"}))
        );
    }

    #[tokio::test]
    async fn unchanged_documents_write_nothing() {
        let registry = registry();
        let mut store = store(&registry);
        let ctx = RequestContext::new();
        let document = json!({
            "album_id": 1,
            "title": "Let There Be Rock",
            "artist_id": 1,
            "self": "/albums/1",
            "tracks": "/albums/1/tracks",
        });
        let before = store.tables().clone();
        let outcome = MutationProcessor::new(&registry, &ctx, &mut store)
            .update("albums", &Identity::single(1), &document, Mode::Replace)
            .await
            .unwrap();
        assert_eq!(outcome.writes, 0);
        assert_eq!(store.tables(), &before);
    }

    #[tokio::test]
    async fn issues_are_collected_across_the_document() {
        let registry = registry();
        let mut store = store(&registry);
        let ctx = RequestContext::new();
        let document = json!({
            "title": 7,
            "artist": {"artist_id": 1},
            "tracks": [{"name": "ok"}, {"milliseconds": 0, "bogus": true}],
        });
        let err = MutationProcessor::new(&registry, &ctx, &mut store)
            .create("albums", &document)
            .await
            .unwrap_err();
        let EngineError::UnprocessableEntity(validation) = err else {
            panic!("expected validation failure, got {err:?}");
        };
        let mut fields: Vec<&str> = validation.issues.iter().map(|issue| issue.field.as_str()).collect();
        fields.sort();
        assert_eq!(fields, ["title", "tracks.1.bogus", "tracks.1.milliseconds", "tracks.1.name"]);
        assert_eq!(store.tables().len("albums"), 1);
    }

    #[tokio::test]
    async fn remove_with_identity_only_detaches() {
        let registry = registry();
        let mut store = store(&registry);
        let ctx = RequestContext::new();
        MutationProcessor::new(&registry, &ctx, &mut store)
            .update(
                "albums",
                &Identity::single(1),
                &json!({"tracks": [{"track_id": 2, "$op": "remove"}]}),
                Mode::Patch,
            )
            .await
            .unwrap();
        let track = store.tables().get("tracks", &Identity::single(2)).unwrap();
        assert_eq!(track.get("album_id"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn explicit_add_of_a_member_is_an_issue() {
        let registry = registry();
        let mut store = store(&registry);
        let ctx = RequestContext::new();
        let err = MutationProcessor::new(&registry, &ctx, &mut store)
            .update(
                "playlists",
                &Identity::single(1),
                &json!({"tracks": [{"track_id": 1, "$op": "add"}]}),
                Mode::Patch,
            )
            .await
            .unwrap_err();
        let EngineError::UnprocessableEntity(validation) = err else {
            panic!("expected validation failure, got {err:?}");
        };
        assert_eq!(validation.issues[0].code, "relationship.already_member");
    }

    #[tokio::test]
    async fn malformed_ops_are_bad_requests() {
        let registry = registry();
        let mut store = store(&registry);
        let ctx = RequestContext::new();
        for op in [json!("merge"), json!(3)] {
            let err = MutationProcessor::new(&registry, &ctx, &mut store)
                .patch_collection("artists", &json!([{"artist_id": 1, "$op": op}]))
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::BadRequest { .. }), "{err:?}");
        }
    }

    #[tokio::test]
    async fn replace_unlinks_unmentioned_members_and_patch_keeps_them() {
        let registry = registry();
        let document = json!({"name": "Mix", "tracks": [{"track_id": 1}]});
        let ctx = RequestContext::new();

        let mut patched = store(&registry);
        MutationProcessor::new(&registry, &ctx, &mut patched)
            .update("playlists", &Identity::single(1), &document, Mode::Patch)
            .await
            .unwrap();
        assert_eq!(playlist_tracks(&patched), ["1", "2"]);

        let mut replaced = store(&registry);
        MutationProcessor::new(&registry, &ctx, &mut replaced)
            .update("playlists", &Identity::single(1), &document, Mode::Replace)
            .await
            .unwrap();
        assert_eq!(playlist_tracks(&replaced), ["1"]);
    }

    #[tokio::test]
    async fn missing_entities_are_not_found() {
        let registry = registry();
        let mut store = store(&registry);
        let ctx = RequestContext::new();
        let err = MutationProcessor::new(&registry, &ctx, &mut store)
            .update("albums", &Identity::single(99), &json!({"title": "Y"}), Mode::Patch)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));

        let err = MutationProcessor::new(&registry, &ctx, &mut store)
            .update(
                "albums",
                &Identity::single(1),
                &json!({"tracks": [{"track_id": 42, "$op": "update", "name": "Z"}]}),
                Mode::Patch,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }

    #[tokio::test]
    async fn to_one_null_unlinks_the_current_member() {
        let registry = registry();
        let mut store = store(&registry);
        let ctx = RequestContext::new();
        MutationProcessor::new(&registry, &ctx, &mut store)
            .update("tracks", &Identity::single(1), &json!({"album": null}), Mode::Patch)
            .await
            .unwrap();
        let track = store.tables().get("tracks", &Identity::single(1)).unwrap();
        assert_eq!(track.get("album_id"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn delete_where_removes_matching_rows() {
        let registry = registry();
        let mut store = store(&registry);
        let ctx = RequestContext::new();
        let outcome = MutationProcessor::new(&registry, &ctx, &mut store)
            .delete_where("tracks", None)
            .await
            .unwrap();
        assert_eq!(outcome.identities.len(), 2);
        assert_eq!(store.tables().len("tracks"), 0);
        assert!(playlist_tracks(&store).is_empty());
    }
}
