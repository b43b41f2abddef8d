//! Backing-store abstraction.
//!
//! The query builder and mutation processor talk to storage only through
//! [`Store`]. Two adapters ship with the crate: [`MemoryStore`] and
//! [`RedisStore`]; both evaluate requests with the shared [`Tables`] engine.

pub mod commands;
pub mod memory;
pub mod redis;
pub mod tables;

use std::collections::BTreeMap;

use serde::Serialize;

use crate::errors::EngineError;
use crate::filters::Predicate;
use crate::query::Pagination;
use crate::types::{FieldType, Identity, Record, SortOrder};

pub use commands::{CommitReport, EntityRef, MutationCommand, MutationPlan};
pub use memory::MemoryStore;
pub use self::redis::RedisStore;
pub use tables::Tables;

/// Sort key in storage terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSort {
    pub key: String,
    pub field_type: FieldType,
    pub order: SortOrder,
}

/// Root query: rows of `resource` matching `predicate`, ordered, windowed,
/// with eager `includes`.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub resource: String,
    pub predicate: Option<Predicate>,
    /// Applied before the identity tiebreaker.
    pub sorts: Vec<StoreSort>,
    pub pagination: Pagination,
    pub includes: Vec<Include>,
}

impl FetchRequest {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            ..Self::default()
        }
    }

    pub fn with_predicate(mut self, predicate: Option<Predicate>) -> Self {
        self.predicate = predicate;
        self
    }
}

/// Relationship loaded together with its parent rows, unwindowed.
#[derive(Debug, Clone)]
pub struct Include {
    pub relationship: String,
    /// Filters the members (required filter and sub-filter).
    pub predicate: Option<Predicate>,
    pub sorts: Vec<StoreSort>,
    pub includes: Vec<Include>,
}

/// Members of `relationship` for each listed parent, windowed per parent.
#[derive(Debug, Clone)]
pub struct RelatedRequest {
    /// Parent resource.
    pub resource: String,
    pub relationship: String,
    pub parents: Vec<Identity>,
    pub predicate: Option<Predicate>,
    pub sorts: Vec<StoreSort>,
    pub pagination: Pagination,
    pub includes: Vec<Include>,
}

/// One fetched row with whatever relationships were included.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Row {
    pub record: Record,
    pub related: BTreeMap<String, Related>,
}

impl Row {
    pub fn new(record: Record) -> Self {
        Self {
            record,
            related: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Related {
    One(Option<Box<Row>>),
    Many(Vec<Row>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelatedRows {
    pub parent: Identity,
    pub rows: Vec<Row>,
}

/// Storage backend driven by the engine.
///
/// A commit applies the whole plan or nothing.
#[allow(async_fn_in_trait)]
pub trait Store {
    /// Called before a mutation starts reading. Reads from here up to the
    /// next `commit` belong to one plan.
    fn begin(&mut self) {}

    async fn fetch(&mut self, request: &FetchRequest) -> Result<Vec<Row>, EngineError>;

    async fn fetch_related(&mut self, request: &RelatedRequest) -> Result<Vec<RelatedRows>, EngineError>;

    async fn count(&mut self, resource: &str, predicate: Option<&Predicate>) -> Result<u64, EngineError>;

    async fn commit(&mut self, plan: &MutationPlan) -> Result<CommitReport, EngineError>;
}
