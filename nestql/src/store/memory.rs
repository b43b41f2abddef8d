use std::sync::Arc;

use log::debug;

use crate::errors::EngineError;
use crate::filters::Predicate;
use crate::registry::Registry;
use crate::store::{
    CommitReport, FetchRequest, MutationPlan, RelatedRequest, RelatedRows, Row, Store, Tables,
};

/// In-process store. Commits apply the plan to a copy of the tables and swap
/// it in only when every command succeeded.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    registry: Arc<Registry>,
    tables: Tables,
}

impl MemoryStore {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_tables(registry, Tables::new())
    }

    pub fn with_tables(registry: Arc<Registry>, tables: Tables) -> Self {
        Self { registry, tables }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    /// Direct access for seeding; bypasses plans and permission checks.
    pub fn tables_mut(&mut self) -> &mut Tables {
        &mut self.tables
    }
}

impl Store for MemoryStore {
    async fn fetch(&mut self, request: &FetchRequest) -> Result<Vec<Row>, EngineError> {
        self.tables.fetch(&self.registry, request)
    }

    async fn fetch_related(&mut self, request: &RelatedRequest) -> Result<Vec<RelatedRows>, EngineError> {
        self.tables.fetch_related(&self.registry, request)
    }

    async fn count(&mut self, resource: &str, predicate: Option<&Predicate>) -> Result<u64, EngineError> {
        self.tables.count(&self.registry, resource, predicate)
    }

    async fn commit(&mut self, plan: &MutationPlan) -> Result<CommitReport, EngineError> {
        if plan.is_empty() {
            return Ok(CommitReport::default());
        }
        let mut next = self.tables.clone();
        let report = next.apply(&self.registry, plan)?;
        debug!(
            "memory commit: {} commands, {} writes, {} created",
            plan.len(),
            report.writes,
            report.created.len()
        );
        self.tables = next;
        Ok(report)
    }
}
