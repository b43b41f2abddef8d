use serde::Serialize;

use crate::types::{Identity, Record};

/// Reference to an entity inside a plan: already stored, or created by an
/// earlier `Create` in the same plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityRef {
    Pending(usize),
    Existing(Identity),
}

impl EntityRef {
    pub fn existing(&self) -> Option<&Identity> {
        match self {
            EntityRef::Existing(identity) => Some(identity),
            EntityRef::Pending(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationCommand {
    Create(CreateEntity),
    Update(UpdateEntity),
    Delete(DeleteEntity),
    Link(RelationChange),
    Unlink(RelationChange),
}

impl MutationCommand {
    pub fn resource(&self) -> &str {
        match self {
            MutationCommand::Create(command) => &command.resource,
            MutationCommand::Update(command) => &command.resource,
            MutationCommand::Delete(command) => &command.resource,
            MutationCommand::Link(change) | MutationCommand::Unlink(change) => &change.resource,
        }
    }
}

/// Inserts a new row. `values` are keyed by storage name; generated identity
/// columns may be absent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateEntity {
    pub slot: usize,
    pub resource: String,
    pub values: Record,
}

/// Assigns `values` (storage names) on an existing or pending row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateEntity {
    pub resource: String,
    pub target: EntityRef,
    pub values: Record,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeleteEntity {
    pub resource: String,
    pub target: EntityRef,
}

/// Adds or removes `child` as a member of `parent.relationship`.
/// `resource` is the parent's resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationChange {
    pub resource: String,
    pub relationship: String,
    pub parent: EntityRef,
    pub child: EntityRef,
}

/// Ordered commands committed together by [`crate::store::Store::commit`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MutationPlan {
    pub commands: Vec<MutationCommand>,
    #[serde(skip)]
    pending: usize,
}

impl MutationPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: MutationCommand) {
        if let MutationCommand::Create(create) = &command {
            self.pending = self.pending.max(create.slot + 1);
        }
        self.commands.push(command);
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Number of entities the plan creates.
    pub fn pending_count(&self) -> usize {
        self.pending
    }

    /// Appends a `Create` and returns the reference later commands use for it.
    pub fn create(&mut self, resource: impl Into<String>, values: Record) -> EntityRef {
        let slot = self.pending;
        self.push(MutationCommand::Create(CreateEntity {
            slot,
            resource: resource.into(),
            values,
        }));
        EntityRef::Pending(slot)
    }

    pub fn update(&mut self, resource: impl Into<String>, target: EntityRef, values: Record) {
        self.push(MutationCommand::Update(UpdateEntity {
            resource: resource.into(),
            target,
            values,
        }));
    }

    pub fn delete(&mut self, resource: impl Into<String>, target: EntityRef) {
        self.push(MutationCommand::Delete(DeleteEntity {
            resource: resource.into(),
            target,
        }));
    }

    pub fn link(&mut self, resource: impl Into<String>, relationship: impl Into<String>, parent: EntityRef, child: EntityRef) {
        self.push(MutationCommand::Link(RelationChange {
            resource: resource.into(),
            relationship: relationship.into(),
            parent,
            child,
        }));
    }

    pub fn unlink(
        &mut self,
        resource: impl Into<String>,
        relationship: impl Into<String>,
        parent: EntityRef,
        child: EntityRef,
    ) {
        self.push(MutationCommand::Unlink(RelationChange {
            resource: resource.into(),
            relationship: relationship.into(),
            parent,
            child,
        }));
    }
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommitReport {
    /// Identity assigned to each pending slot, in slot order.
    pub created: Vec<Identity>,
    /// Rows and association entries actually changed.
    pub writes: usize,
}

impl CommitReport {
    pub fn resolve(&self, reference: &EntityRef) -> Option<Identity> {
        match reference {
            EntityRef::Existing(identity) => Some(identity.clone()),
            EntityRef::Pending(slot) => self.created.get(*slot).cloned(),
        }
    }
}
