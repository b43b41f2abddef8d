use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use log::trace;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::EngineError;
use crate::filters::{Predicate, compare_values, matches};
use crate::id::generate_entity_id;
use crate::registry::Registry;
use crate::store::commands::{CreateEntity, EntityRef, MutationCommand, MutationPlan, RelationChange, UpdateEntity};
use crate::store::{CommitReport, FetchRequest, Include, Related, RelatedRequest, RelatedRows, Row, StoreSort};
use crate::types::{
    CascadePolicy, FieldType, Identity, Join, Record, RelationshipDescriptor, ResourceDescriptor, SortOrder,
};

/// One association-table entry: column name to identity key.
pub type AssociationRow = BTreeMap<String, String>;

/// Row storage for every resource plus association tables.
///
/// Rows are keyed by [`Identity::key`]. Both store adapters evaluate fetches
/// and apply plans through this type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tables {
    resources: BTreeMap<String, BTreeMap<String, Record>>,
    associations: BTreeMap<String, BTreeSet<AssociationRow>>,
}

#[derive(Default)]
struct ApplyState {
    created: Vec<Identity>,
    writes: usize,
    touched: Vec<(String, String)>,
}

impl ApplyState {
    fn resolve(&self, reference: &EntityRef) -> Result<Identity, EngineError> {
        match reference {
            EntityRef::Existing(identity) => Ok(identity.clone()),
            EntityRef::Pending(slot) => self
                .created
                .get(*slot)
                .cloned()
                .ok_or_else(|| EngineError::store(format!("pending entity {slot} referenced before it was created"))),
        }
    }

    fn touch(&mut self, resource: &str, key: String) {
        self.writes += 1;
        self.touched.push((resource.to_string(), key));
    }
}

impl Tables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, resource: &str, identity: &Identity) -> Option<&Record> {
        self.resources.get(resource)?.get(&identity.key())
    }

    pub fn rows(&self, resource: &str) -> impl Iterator<Item = &Record> {
        self.resources.get(resource).into_iter().flat_map(BTreeMap::values)
    }

    pub fn len(&self, resource: &str) -> usize {
        self.resources.get(resource).map_or(0, BTreeMap::len)
    }

    pub fn resource_tables(&self) -> impl Iterator<Item = (&String, &BTreeMap<String, Record>)> {
        self.resources.iter()
    }

    pub fn association_tables(&self) -> impl Iterator<Item = (&String, &BTreeSet<AssociationRow>)> {
        self.associations.iter()
    }

    /// Raw row insert, keyed by an already computed identity key.
    pub fn insert_row(&mut self, resource: &str, key: String, record: Record) {
        self.resources.entry(resource.to_string()).or_default().insert(key, record);
    }

    pub fn insert_association(&mut self, table: &str, row: AssociationRow) {
        self.associations.entry(table.to_string()).or_default().insert(row);
    }

    /// Seeds one storage-keyed row and returns its identity.
    pub fn insert(&mut self, registry: &Registry, resource: &str, record: Record) -> Result<Identity, EngineError> {
        let descriptor = registry.require(resource)?;
        let identity = descriptor
            .identity_of(&record)
            .ok_or_else(|| EngineError::store(format!("`{resource}` row is missing identity values")))?;
        self.insert_row(resource, identity.key(), record);
        Ok(identity)
    }

    /// Seeds one association-table entry.
    pub fn associate(&mut self, table: &str, columns: &[(&str, &Identity)]) {
        let row = columns
            .iter()
            .map(|(column, identity)| (column.to_string(), identity.key()))
            .collect();
        self.insert_association(table, row);
    }

    /// Whether `record` (a row of `descriptor`) satisfies `predicate`.
    pub fn evaluate(
        &self,
        registry: &Registry,
        descriptor: &ResourceDescriptor,
        record: &Record,
        predicate: &Predicate,
    ) -> bool {
        match predicate {
            Predicate::And(children) => children
                .iter()
                .all(|child| self.evaluate(registry, descriptor, record, child)),
            Predicate::Or(children) => children
                .iter()
                .any(|child| self.evaluate(registry, descriptor, record, child)),
            Predicate::Not(children) => !children
                .iter()
                .all(|child| self.evaluate(registry, descriptor, record, child)),
            Predicate::Compare {
                key,
                field_type,
                operator,
                value,
                pattern,
            } => matches(*operator, record.get(key), value, *field_type, pattern.as_ref()),
            Predicate::Related {
                relationship,
                target,
                predicate,
            } => {
                let (Some(relationship), Some(target)) = (descriptor.find_relationship(relationship), registry.get(target))
                else {
                    return false;
                };
                self.members(registry, descriptor, record, relationship)
                    .into_iter()
                    .any(|member| self.evaluate(registry, target, member, predicate))
            }
            Predicate::MemberOf {
                resource,
                identity,
                relationship,
            } => {
                let Some(parent_descriptor) = registry.get(resource) else {
                    return false;
                };
                let (Some(relationship), Some(parent), Some(own)) = (
                    parent_descriptor.find_relationship(relationship),
                    self.get(resource, identity),
                    descriptor.identity_of(record),
                ) else {
                    return false;
                };
                let own = own.key();
                self.members(registry, parent_descriptor, parent, relationship)
                    .into_iter()
                    .any(|member| descriptor.identity_of(member).is_some_and(|id| id.key() == own))
            }
        }
    }

    /// Current members of `relationship` for `record`, unordered.
    pub fn members<'t>(
        &'t self,
        registry: &Registry,
        descriptor: &ResourceDescriptor,
        record: &Record,
        relationship: &RelationshipDescriptor,
    ) -> Vec<&'t Record> {
        let Some(target) = registry.target_of(relationship) else {
            return Vec::new();
        };
        match &relationship.join {
            Join::ForeignKey { local, remote } | Join::Reverse { local, remote } => {
                let Some(wanted) = column_values(record, local) else {
                    return Vec::new();
                };
                self.rows(&target.name)
                    .filter(|row| columns_equal(row, remote, &wanted))
                    .collect()
            }
            Join::Association { table, local, remote } => {
                let Some(own) = descriptor.identity_of(record) else {
                    return Vec::new();
                };
                let own = own.key();
                let Some(target_rows) = self.resources.get(&target.name) else {
                    return Vec::new();
                };
                let keys: BTreeSet<&str> = self
                    .associations
                    .get(table)
                    .into_iter()
                    .flatten()
                    .filter(|row| row.get(local) == Some(&own))
                    .filter_map(|row| row.get(remote).map(String::as_str))
                    .collect();
                keys.into_iter().filter_map(|key| target_rows.get(key)).collect()
            }
        }
    }

    pub fn fetch(&self, registry: &Registry, request: &FetchRequest) -> Result<Vec<Row>, EngineError> {
        let descriptor = registry.require(&request.resource)?;
        let selected = self.select(
            registry,
            descriptor,
            self.rows(&descriptor.name),
            request.predicate.as_ref(),
            &request.sorts,
        );
        request
            .pagination
            .apply(selected)
            .into_iter()
            .map(|record| self.build_row(registry, descriptor, record, &request.includes))
            .collect()
    }

    pub fn fetch_related(&self, registry: &Registry, request: &RelatedRequest) -> Result<Vec<RelatedRows>, EngineError> {
        let descriptor = registry.require(&request.resource)?;
        let relationship = find_relationship(descriptor, &request.relationship)?;
        let target = registry.require(&relationship.target)?;
        let mut related = Vec::with_capacity(request.parents.len());
        for parent in &request.parents {
            let rows = match self.get(&descriptor.name, parent) {
                Some(record) => {
                    let members = self.select(
                        registry,
                        target,
                        self.members(registry, descriptor, record, relationship),
                        request.predicate.as_ref(),
                        &request.sorts,
                    );
                    request
                        .pagination
                        .apply(members)
                        .into_iter()
                        .map(|member| self.build_row(registry, target, member, &request.includes))
                        .collect::<Result<Vec<_>, _>>()?
                }
                None => Vec::new(),
            };
            related.push(RelatedRows {
                parent: parent.clone(),
                rows,
            });
        }
        Ok(related)
    }

    pub fn count(&self, registry: &Registry, resource: &str, predicate: Option<&Predicate>) -> Result<u64, EngineError> {
        let descriptor = registry.require(resource)?;
        let count = self
            .rows(resource)
            .filter(|record| predicate.is_none_or(|predicate| self.evaluate(registry, descriptor, record, predicate)))
            .count();
        Ok(count as u64)
    }

    fn select<'t>(
        &'t self,
        registry: &Registry,
        descriptor: &ResourceDescriptor,
        candidates: impl IntoIterator<Item = &'t Record>,
        predicate: Option<&Predicate>,
        sorts: &[StoreSort],
    ) -> Vec<&'t Record> {
        let mut selected: Vec<&Record> = candidates
            .into_iter()
            .filter(|record| predicate.is_none_or(|predicate| self.evaluate(registry, descriptor, record, predicate)))
            .collect();
        selected.sort_by(|left, right| compare_records(descriptor, left, right, sorts));
        selected
    }

    fn build_row(
        &self,
        registry: &Registry,
        descriptor: &ResourceDescriptor,
        record: &Record,
        includes: &[Include],
    ) -> Result<Row, EngineError> {
        let mut row = Row::new(record.clone());
        for include in includes {
            let relationship = find_relationship(descriptor, &include.relationship)?;
            let target = registry.require(&relationship.target)?;
            let members = self.select(
                registry,
                target,
                self.members(registry, descriptor, record, relationship),
                include.predicate.as_ref(),
                &include.sorts,
            );
            let related = if relationship.is_many() {
                Related::Many(
                    members
                        .into_iter()
                        .map(|member| self.build_row(registry, target, member, &include.includes))
                        .collect::<Result<_, _>>()?,
                )
            } else {
                match members.first() {
                    Some(member) => Related::One(Some(Box::new(self.build_row(
                        registry,
                        target,
                        member,
                        &include.includes,
                    )?))),
                    None => Related::One(None),
                }
            };
            row.related.insert(relationship.name.clone(), related);
        }
        Ok(row)
    }

    /// Applies every command of `plan` in order. On error the tables may be
    /// partially modified; callers apply plans to a copy.
    pub fn apply(&mut self, registry: &Registry, plan: &MutationPlan) -> Result<CommitReport, EngineError> {
        let mut state = ApplyState::default();
        for command in &plan.commands {
            trace!("applying {command:?}");
            match command {
                MutationCommand::Create(create) => self.apply_create(registry, create, &mut state)?,
                MutationCommand::Update(update) => self.apply_update(registry, update, &mut state)?,
                MutationCommand::Delete(delete) => {
                    let descriptor = registry.require(&delete.resource)?;
                    let identity = state.resolve(&delete.target)?;
                    if self.get(&descriptor.name, &identity).is_none() {
                        return Err(EngineError::not_found(&descriptor.name, &identity));
                    }
                    self.delete_cascading(registry, descriptor, &identity, &mut state, &mut HashSet::new())?;
                }
                MutationCommand::Link(change) => self.apply_link(registry, change, &mut state)?,
                MutationCommand::Unlink(change) => self.apply_unlink(registry, change, &mut state)?,
            }
        }
        self.check_required(registry, &state)?;
        Ok(CommitReport {
            created: state.created,
            writes: state.writes,
        })
    }

    fn apply_create(&mut self, registry: &Registry, create: &CreateEntity, state: &mut ApplyState) -> Result<(), EngineError> {
        let descriptor = registry.require(&create.resource)?;
        if create.slot != state.created.len() {
            return Err(EngineError::store(format!("create slot {} is out of order", create.slot)));
        }
        let mut record = create.values.clone();
        for field in descriptor.identity_fields() {
            let key = field.storage_key();
            if record.get(key).is_some_and(|value| !value.is_null()) {
                continue;
            }
            if !field.generated {
                return Err(EngineError::Conflict {
                    message: format!("`{}` requires a value for identity field `{}`", descriptor.name, field.name),
                });
            }
            let generated = match field.field_type {
                FieldType::Integer => Value::from(self.next_integer(&descriptor.name, key)),
                _ => Value::String(generate_entity_id()),
            };
            record.insert(key.to_string(), generated);
        }
        let identity = descriptor
            .identity_of(&record)
            .ok_or_else(|| EngineError::store(format!("`{}` row is missing identity values", descriptor.name)))?;
        let key = identity.key();
        let table = self.resources.entry(descriptor.name.clone()).or_default();
        if table.contains_key(&key) {
            return Err(EngineError::Conflict {
                message: format!("`{}` {key} already exists", descriptor.name),
            });
        }
        table.insert(key.clone(), record);
        state.touch(&descriptor.name, key);
        state.created.push(identity);
        Ok(())
    }

    fn next_integer(&self, resource: &str, key: &str) -> i64 {
        self.rows(resource)
            .filter_map(|record| record.get(key).and_then(Value::as_i64))
            .max()
            .unwrap_or(0)
            + 1
    }

    fn apply_update(&mut self, registry: &Registry, update: &UpdateEntity, state: &mut ApplyState) -> Result<(), EngineError> {
        let descriptor = registry.require(&update.resource)?;
        let identity = state.resolve(&update.target)?;
        let key = identity.key();
        let Some(record) = self.resources.get_mut(&descriptor.name).and_then(|table| table.get_mut(&key)) else {
            return Err(EngineError::not_found(&descriptor.name, &identity));
        };
        let mut next = record.clone();
        for (column, value) in &update.values {
            next.insert(column.clone(), value.clone());
        }
        if next == *record {
            return Ok(());
        }
        if descriptor.identity_of(&next).map(|id| id.key()) != Some(key.clone()) {
            return Err(EngineError::Conflict {
                message: format!("identity of `{}` {key} cannot change", descriptor.name),
            });
        }
        *record = next;
        state.touch(&descriptor.name, key);
        Ok(())
    }

    fn apply_link(&mut self, registry: &Registry, change: &RelationChange, state: &mut ApplyState) -> Result<(), EngineError> {
        let descriptor = registry.require(&change.resource)?;
        let relationship = find_relationship(descriptor, &change.relationship)?;
        let target = registry.require(&relationship.target)?;
        let parent = state.resolve(&change.parent)?;
        let child = state.resolve(&change.child)?;
        let parent_record = self
            .get(&descriptor.name, &parent)
            .ok_or_else(|| EngineError::not_found(&descriptor.name, &parent))?;
        let child_record = self
            .get(&target.name, &child)
            .ok_or_else(|| EngineError::not_found(&target.name, &child))?;

        match &relationship.join {
            Join::ForeignKey { local, remote } => {
                let values = column_values(child_record, remote).ok_or_else(|| EngineError::Conflict {
                    message: format!("`{}` {child} has no key to link through `{}`", target.name, relationship.name),
                })?;
                self.assign(&descriptor.name, &parent, local, &values, state);
            }
            Join::Reverse { local, remote } => {
                let values = column_values(parent_record, local).ok_or_else(|| EngineError::Conflict {
                    message: format!("`{}` {parent} has no key to link through `{}`", descriptor.name, relationship.name),
                })?;
                self.assign(&target.name, &child, remote, &values, state);
            }
            Join::Association { table, local, remote } => {
                let row = AssociationRow::from([(local.clone(), parent.key()), (remote.clone(), child.key())]);
                if self.associations.entry(table.clone()).or_default().insert(row) {
                    state.writes += 1;
                }
            }
        }
        Ok(())
    }

    fn apply_unlink(&mut self, registry: &Registry, change: &RelationChange, state: &mut ApplyState) -> Result<(), EngineError> {
        let descriptor = registry.require(&change.resource)?;
        let relationship = find_relationship(descriptor, &change.relationship)?;
        let target = registry.require(&relationship.target)?;
        let parent = state.resolve(&change.parent)?;
        let child = state.resolve(&change.child)?;
        let Some(parent_record) = self.get(&descriptor.name, &parent) else {
            return Err(EngineError::not_found(&descriptor.name, &parent));
        };
        let child_key = child.key();
        let is_member = self
            .members(registry, descriptor, parent_record, relationship)
            .into_iter()
            .any(|member| target.identity_of(member).is_some_and(|id| id.key() == child_key));
        if !is_member {
            return Ok(());
        }

        match &relationship.join {
            Join::ForeignKey { local, .. } => {
                self.assign_null(&descriptor.name, &parent, local, state);
            }
            Join::Reverse { remote, .. } => {
                if relationship.cascade == CascadePolicy::Detach {
                    self.assign_null(&target.name, &child, remote, state);
                }
            }
            Join::Association { table, local, remote } => {
                let row = AssociationRow::from([(local.clone(), parent.key()), (remote.clone(), child_key)]);
                if self.associations.get_mut(table).is_some_and(|rows| rows.remove(&row)) {
                    state.writes += 1;
                }
            }
        }
        if relationship.cascade == CascadePolicy::Delete {
            self.delete_cascading(registry, target, &child, state, &mut HashSet::new())?;
        }
        Ok(())
    }

    fn delete_cascading(
        &mut self,
        registry: &Registry,
        descriptor: &ResourceDescriptor,
        identity: &Identity,
        state: &mut ApplyState,
        visited: &mut HashSet<(String, String)>,
    ) -> Result<(), EngineError> {
        let key = identity.key();
        if !visited.insert((descriptor.name.clone(), key.clone())) {
            return Ok(());
        }
        let Some(record) = self.get(&descriptor.name, identity).cloned() else {
            return Ok(());
        };

        for relationship in &descriptor.relationships {
            let target = registry.require(&relationship.target)?;
            match &relationship.join {
                Join::ForeignKey { .. } => {}
                Join::Reverse { remote, .. } => {
                    let members: Vec<Identity> = self
                        .members(registry, descriptor, &record, relationship)
                        .into_iter()
                        .filter_map(|member| target.identity_of(member))
                        .collect();
                    for member in members {
                        if relationship.cascade == CascadePolicy::Delete {
                            self.delete_cascading(registry, target, &member, state, visited)?;
                        } else {
                            self.assign_null(&target.name, &member, remote, state);
                        }
                    }
                }
                Join::Association { table, local, .. } => {
                    let members: Vec<Identity> = if relationship.cascade == CascadePolicy::Delete {
                        self.members(registry, descriptor, &record, relationship)
                            .into_iter()
                            .filter_map(|member| target.identity_of(member))
                            .collect()
                    } else {
                        Vec::new()
                    };
                    state.writes += self.remove_associations(table, local, &key);
                    for member in members {
                        self.delete_cascading(registry, target, &member, state, visited)?;
                    }
                }
            }
        }

        for incoming in registry.incoming(&descriptor.name) {
            match &incoming.relationship.join {
                Join::ForeignKey { local, remote } => {
                    let Some(wanted) = column_values(&record, remote) else {
                        continue;
                    };
                    let referrers: Vec<Identity> = self
                        .rows(&incoming.source.name)
                        .filter(|row| columns_equal(row, local, &wanted))
                        .filter_map(|row| incoming.source.identity_of(row))
                        .filter(|referrer| incoming.source.name != descriptor.name || referrer.key() != key)
                        .collect();
                    for referrer in referrers {
                        self.assign_null(&incoming.source.name, &referrer, local, state);
                    }
                }
                Join::Association { table, remote, .. } => {
                    state.writes += self.remove_associations(table, remote, &key);
                }
                Join::Reverse { .. } => {}
            }
        }

        if let Some(table) = self.resources.get_mut(&descriptor.name)
            && table.remove(&key).is_some()
        {
            state.writes += 1;
        }
        Ok(())
    }

    fn remove_associations(&mut self, table: &str, column: &str, key: &str) -> usize {
        let Some(rows) = self.associations.get_mut(table) else {
            return 0;
        };
        let before = rows.len();
        rows.retain(|row| row.get(column).map(String::as_str) != Some(key));
        before - rows.len()
    }

    fn assign(&mut self, resource: &str, identity: &Identity, columns: &[String], values: &[Value], state: &mut ApplyState) {
        let key = identity.key();
        let Some(record) = self.resources.get_mut(resource).and_then(|table| table.get_mut(&key)) else {
            return;
        };
        let mut changed = false;
        for (column, value) in columns.iter().zip(values) {
            if record.get(column) != Some(value) {
                record.insert(column.clone(), value.clone());
                changed = true;
            }
        }
        if changed {
            state.touch(resource, key);
        }
    }

    fn assign_null(&mut self, resource: &str, identity: &Identity, columns: &[String], state: &mut ApplyState) {
        let nulls = vec![Value::Null; columns.len()];
        self.assign(resource, identity, columns, &nulls, state);
    }

    /// Every row written by the plan must still carry its non-optional fields.
    fn check_required(&self, registry: &Registry, state: &ApplyState) -> Result<(), EngineError> {
        let mut checked = HashSet::new();
        for (resource, key) in &state.touched {
            if !checked.insert((resource, key)) {
                continue;
            }
            let Some(record) = self.resources.get(resource).and_then(|table| table.get(key)) else {
                continue;
            };
            let descriptor = registry.require(resource)?;
            for field in descriptor.fields.iter().filter(|field| !field.optional) {
                if record.get(field.storage_key()).is_none_or(Value::is_null) {
                    return Err(EngineError::Conflict {
                        message: format!("`{resource}` {key}: `{}` cannot be empty", field.name),
                    });
                }
            }
        }
        Ok(())
    }
}

fn find_relationship<'d>(descriptor: &'d ResourceDescriptor, name: &str) -> Result<&'d RelationshipDescriptor, EngineError> {
    descriptor
        .find_relationship(name)
        .ok_or_else(|| EngineError::store(format!("`{}` has no relationship `{name}`", descriptor.name)))
}

/// Values of `columns`, or `None` when any is unset.
fn column_values(record: &Record, columns: &[String]) -> Option<Vec<Value>> {
    columns
        .iter()
        .map(|column| record.get(column).filter(|value| !value.is_null()).cloned())
        .collect()
}

fn columns_equal(record: &Record, columns: &[String], wanted: &[Value]) -> bool {
    columns
        .iter()
        .zip(wanted)
        .all(|(column, wanted)| record.get(column).is_some_and(|value| same_value(value, wanted)))
}

fn same_value(left: &Value, right: &Value) -> bool {
    left == right || compare_values(left, right, FieldType::Json) == Some(Ordering::Equal)
}

fn compare_records(descriptor: &ResourceDescriptor, left: &Record, right: &Record, sorts: &[StoreSort]) -> Ordering {
    for sort in sorts {
        let ordering = compare_slots(left.get(&sort.key), right.get(&sort.key), sort.field_type);
        let ordering = match sort.order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    for field in descriptor.identity_fields() {
        let key = field.storage_key();
        let ordering = compare_slots(left.get(key), right.get(key), field.field_type);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Nulls sort first.
fn compare_slots(left: Option<&Value>, right: Option<&Value>, field_type: FieldType) -> Ordering {
    let left = left.filter(|value| !value.is_null());
    let right = right.filter(|value| !value.is_null());
    match (left, right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(left), Some(right)) => {
            compare_values(left, right, field_type).unwrap_or_else(|| left.to_string().cmp(&right.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::Operator;
    use crate::query::Pagination;
    use crate::types::FieldDescriptor;
    use serde_json::json;

    fn registry() -> Registry {
        Registry::builder()
            .resource(
                ResourceDescriptor::new("albums")
                    .identity(["album_id"])
                    .field(FieldDescriptor::integer("album_id").generated())
                    .field(FieldDescriptor::string("title"))
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
                    .relationship(
                        RelationshipDescriptor::many_to_one("album", "albums", &["album_id"], &["album_id"])
                            .back_populates("tracks"),
                    )
                    .relationship(RelationshipDescriptor::many_to_many(
                        "playlists",
                        "playlists",
                        "playlist_track",
                        "track_id",
                        "playlist_id",
                    )),
            )
            .resource(
                ResourceDescriptor::new("playlists")
                    .identity(["playlist_id"])
                    .field(FieldDescriptor::integer("playlist_id"))
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
            .unwrap()
    }

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn seeded(registry: &Registry) -> Tables {
        let mut tables = Tables::new();
        tables.insert(registry, "albums", record(json!({"album_id": 1, "title": "One"}))).unwrap();
        tables.insert(registry, "albums", record(json!({"album_id": 2, "title": "Two"}))).unwrap();
        for (id, album) in [(10, 1), (11, 1), (12, 2)] {
            tables
                .insert(registry, "tracks", record(json!({"track_id": id, "name": format!("t{id}"), "album_id": album})))
                .unwrap();
        }
        tables.insert(registry, "playlists", record(json!({"playlist_id": 1, "name": "Mix"}))).unwrap();
        tables.associate("playlist_track", &[("playlist_id", &Identity::single(1)), ("track_id", &Identity::single(12))]);
        tables
    }

    fn compare(key: &str, operator: Operator, value: Value) -> Predicate {
        Predicate::Compare {
            key: key.to_string(),
            field_type: FieldType::Integer,
            operator,
            value,
            pattern: None,
        }
    }

    #[test]
    fn related_predicates_test_membership() {
        let registry = registry();
        let tables = seeded(&registry);
        let request = FetchRequest::new("albums").with_predicate(Some(Predicate::Related {
            relationship: "tracks".into(),
            target: "tracks".into(),
            predicate: Box::new(compare("track_id", Operator::Eq, json!(12))),
        }));
        let rows = tables.fetch(&registry, &request).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record["album_id"], json!(2));

        let members = Predicate::MemberOf {
            resource: "playlists".into(),
            identity: Identity::single(1),
            relationship: "tracks".into(),
        };
        assert_eq!(tables.count(&registry, "tracks", Some(&members)).unwrap(), 1);
    }

    #[test]
    fn related_fetch_windows_each_parent() {
        let registry = registry();
        let tables = seeded(&registry);
        let request = RelatedRequest {
            resource: "albums".into(),
            relationship: "tracks".into(),
            parents: vec![Identity::single(1), Identity::single(2)],
            predicate: None,
            sorts: vec![StoreSort {
                key: "track_id".into(),
                field_type: FieldType::Integer,
                order: SortOrder::Desc,
            }],
            pagination: Pagination::new(0, Some(1)),
            includes: Vec::new(),
        };
        let related = tables.fetch_related(&registry, &request).unwrap();
        assert_eq!(related[0].rows.len(), 1);
        assert_eq!(related[0].rows[0].record["track_id"], json!(11));
        assert_eq!(related[1].rows[0].record["track_id"], json!(12));
    }

    #[test]
    fn plans_create_link_and_generate_identities() {
        let registry = registry();
        let mut tables = seeded(&registry);
        let mut plan = MutationPlan::new();
        let album = plan.create("albums", record(json!({"title": "Three"})));
        let track = plan.create("tracks", record(json!({"name": "new"})));
        plan.link("albums", "tracks", album, track);
        let report = tables.apply(&registry, &plan).unwrap();
        assert_eq!(report.created, vec![Identity::single(3), Identity::single(13)]);
        assert_eq!(tables.get("tracks", &Identity::single(13)).unwrap()["album_id"], json!(3));
        assert_eq!(report.writes, 3);
    }

    #[test]
    fn deleting_detaches_reverse_members_and_association_rows() {
        let registry = registry();
        let mut tables = seeded(&registry);
        let mut plan = MutationPlan::new();
        plan.delete("albums", EntityRef::Existing(Identity::single(2)));
        plan.delete("tracks", EntityRef::Existing(Identity::single(12)));
        tables.apply(&registry, &plan).unwrap();
        assert!(tables.get("albums", &Identity::single(2)).is_none());
        assert!(tables.association_tables().all(|(_, rows)| rows.is_empty()));
    }

    #[test]
    fn empty_plans_write_nothing() {
        let registry = registry();
        let mut tables = seeded(&registry);
        let before = tables.clone();
        let report = tables.apply(&registry, &MutationPlan::new()).unwrap();
        assert_eq!(report.writes, 0);
        assert_eq!(tables, before);
    }

    #[test]
    fn missing_required_values_conflict() {
        let registry = registry();
        let mut tables = seeded(&registry);
        let mut plan = MutationPlan::new();
        plan.update(
            "albums",
            EntityRef::Existing(Identity::single(1)),
            record(json!({"title": null})),
        );
        assert!(matches!(tables.apply(&registry, &plan), Err(EngineError::Conflict { .. })));
    }
}
