use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, LazyLock};

use ::redis::aio::ConnectionManager;
use ::redis::{Script, Value as RedisValue, cmd, from_redis_value, pipe};
use log::{debug, trace, warn};
use serde::Serialize;
use serde_json::{Value, json};

use crate::errors::EngineError;
use crate::filters::Predicate;
use crate::keys::KeyContext;
use crate::registry::Registry;
use crate::store::tables::AssociationRow;
use crate::store::{CommitReport, FetchRequest, MutationPlan, RelatedRequest, RelatedRows, Row, Store, Tables};
use crate::types::{Join, Record};

pub const COMMIT_PLAN_SCRIPT_BODY: &str = include_str!("../../lua/commit_plan.lua");

pub static COMMIT_PLAN_SCRIPT: LazyLock<Script> = LazyLock::new(|| Script::new(COMMIT_PLAN_SCRIPT_BODY));

/// One hash write sent to the commit script.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HashWrite {
    Hset { key: String, field: String, value: String },
    Hdel { key: String, field: String },
}

/// Redis-backed store.
///
/// Each resource is a hash of JSON rows; association tables are hashes keyed
/// by JSON rows. Reads load a snapshot. A commit applies the plan to the
/// snapshot, diffs the result and writes the diff through one Lua script that
/// first checks the namespace version, so a concurrent commit surfaces as
/// [`EngineError::Conflict`] instead of a lost update.
///
/// The expected version is the one seen by the first read after
/// [`Store::begin`], so a commit that lands while a plan is being built
/// conflicts too.
pub struct RedisStore {
    registry: Arc<Registry>,
    connection: ConnectionManager,
    namespace: String,
    read_version: Option<u64>,
}

impl RedisStore {
    pub fn new(registry: Arc<Registry>, connection: ConnectionManager, namespace: impl Into<String>) -> Self {
        Self {
            registry,
            connection,
            namespace: namespace.into(),
            read_version: None,
        }
    }

    pub async fn connect(registry: Arc<Registry>, url: &str, namespace: impl Into<String>) -> Result<Self, EngineError> {
        let client = ::redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self::new(registry, connection, namespace))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Reads every table of the namespace along with its version in one
    /// MULTI/EXEC transaction.
    pub async fn load(&mut self) -> Result<(Tables, u64), EngineError> {
        let keys = KeyContext::new(&self.namespace);
        let resources: Vec<String> = self.registry.resources().map(|descriptor| descriptor.name.clone()).collect();
        let associations = association_tables(&self.registry);

        let mut transaction = pipe();
        transaction.atomic().cmd("GET").arg(keys.version());
        for resource in &resources {
            transaction.cmd("HGETALL").arg(keys.resource(resource));
        }
        for table in &associations {
            transaction.cmd("HGETALL").arg(keys.association(table));
        }
        let replies: Vec<RedisValue> = transaction.query_async(&mut self.connection).await?;
        let mut replies = replies.iter();
        let mut next_reply = || {
            replies
                .next()
                .ok_or_else(|| EngineError::store("snapshot transaction returned too few replies"))
        };

        let version: Option<u64> = from_redis_value(next_reply()?)?;
        let mut tables = Tables::new();
        for resource in &resources {
            let rows: HashMap<String, String> = from_redis_value(next_reply()?)?;
            for (identity_key, raw) in rows {
                let record: Record = serde_json::from_str(&raw)?;
                tables.insert_row(resource, identity_key, record);
            }
        }
        for table in &associations {
            let rows: HashMap<String, String> = from_redis_value(next_reply()?)?;
            for raw in rows.into_keys() {
                let row: AssociationRow = serde_json::from_str(&raw)?;
                tables.insert_association(table, row);
            }
        }
        Ok((tables, version.unwrap_or(0)))
    }

    /// Snapshot for a read; the first read of a plan pins its version.
    async fn snapshot(&mut self) -> Result<Tables, EngineError> {
        let (tables, version) = self.load().await?;
        self.read_version.get_or_insert(version);
        Ok(tables)
    }

    /// Overwrites the namespace contents with `tables`.
    pub async fn replace(&mut self, tables: &Tables) -> Result<u64, EngineError> {
        self.read_version = None;
        let (current, version) = self.load().await?;
        let writes = diff_tables(KeyContext::new(&self.namespace), &current, tables);
        self.write(version, &writes).await
    }

    /// Deletes every key of the namespace.
    pub async fn clear(&mut self) -> Result<usize, EngineError> {
        const SCAN_COUNT: usize = 512;
        self.read_version = None;
        let pattern = KeyContext::new(&self.namespace).pattern();
        let mut cursor: u64 = 0;
        let mut removed = 0;
        loop {
            let (next_cursor, batch): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut self.connection)
                .await?;
            if !batch.is_empty() {
                let deleted: usize = cmd("DEL").arg(&batch).query_async(&mut self.connection).await?;
                removed += deleted;
            }
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }
        Ok(removed)
    }

    async fn write(&mut self, expected_version: u64, writes: &[HashWrite]) -> Result<u64, EngineError> {
        let keys = KeyContext::new(&self.namespace);
        let payload = serde_json::to_string(&json!({
            "expected_version": expected_version,
            "ops": writes,
        }))?;
        trace!("commit script payload: {payload}");

        let mut invocation = COMMIT_PLAN_SCRIPT.prepare_invoke();
        invocation.key(keys.version());
        invocation.arg(payload);
        let raw: String = invocation.invoke_async(&mut self.connection).await?;
        let value: Value = serde_json::from_str(&raw)?;

        if let Some(error) = value.get("error") {
            return match error.as_str() {
                Some("version_conflict") => {
                    Err(self.conflict(expected_version, value.get("actual").and_then(Value::as_u64)))
                }
                Some(other) => Err(EngineError::store(format!("commit script failed: {other}"))),
                None => Err(EngineError::store("commit script failed")),
            };
        }
        Ok(value.get("version").and_then(Value::as_u64).unwrap_or(expected_version + 1))
    }

    fn conflict(&self, expected: u64, actual: Option<u64>) -> EngineError {
        warn!(
            "commit to `{}` lost a race: expected version {expected}, found {actual:?}",
            self.namespace
        );
        EngineError::Conflict {
            message: format!(
                "`{}` was modified concurrently (expected version {expected}, found {})",
                self.namespace,
                actual.map_or_else(|| "unknown".to_string(), |v| v.to_string())
            ),
        }
    }
}

impl Store for RedisStore {
    fn begin(&mut self) {
        self.read_version = None;
    }

    async fn fetch(&mut self, request: &FetchRequest) -> Result<Vec<Row>, EngineError> {
        let tables = self.snapshot().await?;
        tables.fetch(&self.registry, request)
    }

    async fn fetch_related(&mut self, request: &RelatedRequest) -> Result<Vec<RelatedRows>, EngineError> {
        let tables = self.snapshot().await?;
        tables.fetch_related(&self.registry, request)
    }

    async fn count(&mut self, resource: &str, predicate: Option<&Predicate>) -> Result<u64, EngineError> {
        let tables = self.snapshot().await?;
        tables.count(&self.registry, resource, predicate)
    }

    async fn commit(&mut self, plan: &MutationPlan) -> Result<CommitReport, EngineError> {
        let planned_against = self.read_version.take();
        if plan.is_empty() {
            return Ok(CommitReport::default());
        }
        let (snapshot, version) = self.load().await?;
        let expected = planned_against.unwrap_or(version);
        if expected != version {
            return Err(self.conflict(expected, Some(version)));
        }
        let mut next = snapshot.clone();
        let report = next.apply(&self.registry, plan)?;
        let writes = diff_tables(KeyContext::new(&self.namespace), &snapshot, &next);
        if writes.is_empty() {
            return Ok(report);
        }
        let committed = self.write(expected, &writes).await?;
        debug!(
            "redis commit to `{}`: {} commands, {} hash writes, version {committed}",
            self.namespace,
            plan.len(),
            writes.len()
        );
        Ok(report)
    }
}

fn association_tables(registry: &Registry) -> BTreeSet<String> {
    registry
        .resources()
        .flat_map(|descriptor| descriptor.relationships.iter())
        .filter_map(|relationship| match &relationship.join {
            Join::Association { table, .. } => Some(table.clone()),
            _ => None,
        })
        .collect()
}

/// Hash writes turning `before` into `after`.
pub fn diff_tables(keys: KeyContext<'_>, before: &Tables, after: &Tables) -> Vec<HashWrite> {
    let mut writes = Vec::new();
    let empty_rows: BTreeMap<String, Record> = BTreeMap::new();
    let before_rows: HashMap<&String, _> = before.resource_tables().collect();
    let after_rows: HashMap<&String, _> = after.resource_tables().collect();

    for (resource, rows) in after.resource_tables() {
        let previous = before_rows.get(resource).copied().unwrap_or(&empty_rows);
        for (identity_key, record) in rows {
            if previous.get(identity_key) != Some(record) {
                writes.push(HashWrite::Hset {
                    key: keys.resource(resource),
                    field: identity_key.clone(),
                    value: Value::Object(record.clone()).to_string(),
                });
            }
        }
    }
    for (resource, rows) in before.resource_tables() {
        let current = after_rows.get(resource).copied().unwrap_or(&empty_rows);
        for identity_key in rows.keys() {
            if !current.contains_key(identity_key) {
                writes.push(HashWrite::Hdel {
                    key: keys.resource(resource),
                    field: identity_key.clone(),
                });
            }
        }
    }

    let empty_set: BTreeSet<AssociationRow> = BTreeSet::new();
    let before_links: HashMap<&String, _> = before.association_tables().collect();
    let after_links: HashMap<&String, _> = after.association_tables().collect();
    for (table, rows) in after.association_tables() {
        let previous = before_links.get(table).copied().unwrap_or(&empty_set);
        for row in rows.difference(previous) {
            writes.push(HashWrite::Hset {
                key: keys.association(table),
                field: association_field(row),
                value: "1".to_string(),
            });
        }
    }
    for (table, rows) in before.association_tables() {
        let current = after_links.get(table).copied().unwrap_or(&empty_set);
        for row in rows.difference(current) {
            writes.push(HashWrite::Hdel {
                key: keys.association(table),
                field: association_field(row),
            });
        }
    }
    writes
}

fn association_field(row: &AssociationRow) -> String {
    serde_json::to_string(row).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FieldDescriptor, Identity, RelationshipDescriptor, ResourceDescriptor};

    fn registry() -> Registry {
        Registry::builder()
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
            .resource(
                ResourceDescriptor::new("tracks")
                    .identity(["track_id"])
                    .field(FieldDescriptor::integer("track_id")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn diff_emits_only_changed_rows() {
        let registry = registry();
        let mut before = Tables::new();
        let playlist = serde_json::json!({"playlist_id": 1, "name": "Mix"});
        before
            .insert(&registry, "playlists", playlist.as_object().cloned().unwrap())
            .unwrap();
        before
            .insert(&registry, "tracks", serde_json::json!({"track_id": 7}).as_object().cloned().unwrap())
            .unwrap();

        let mut after = before.clone();
        after.associate("playlist_track", &[("playlist_id", &Identity::single(1)), ("track_id", &Identity::single(7))]);
        let keys = KeyContext::new("test");
        let writes = diff_tables(keys, &before, &after);
        assert_eq!(
            writes,
            vec![HashWrite::Hset {
                key: "test:assoc:playlist_track".into(),
                field: r#"{"playlist_id":"1","track_id":"7"}"#.into(),
                value: "1".into(),
            }]
        );

        let reverse = diff_tables(keys, &after, &before);
        assert!(matches!(reverse.as_slice(), [HashWrite::Hdel { .. }]));
        assert!(association_tables(&registry).contains("playlist_track"));
    }
}
