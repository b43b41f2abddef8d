//! Per-resource entry points.
//!
//! [`Engine`] owns the registry and configuration; [`ResourceHandle`]
//! exposes the read and write operations of one resource. Every operation
//! first asks the resource's gate whether the method is allowed, then parses,
//! plans and runs against the caller's [`Store`]. Writes re-read the
//! affected entities so responses honour `fields` and `embeds`.

use std::sync::Arc;

use log::debug;
use serde::Serialize;
use serde_json::Value;

use crate::builder::{CompiledQuery, QueryBuilder, ResourceCollection};
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::filters::{FilterCompiler, Predicate};
use crate::mutation::{Mode, MutationOutcome, MutationProcessor};
use crate::permissions::{Method, RequestContext};
use crate::query::{Pagination, ParsedQuery, QueryParams, QueryParser};
use crate::registry::Registry;
use crate::store::Store;
use crate::types::{Identity, RelationshipDescriptor, ResourceDescriptor};

pub struct Engine {
    registry: Arc<Registry>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_config(registry, EngineConfig::default())
    }

    pub fn with_config(registry: Arc<Registry>, config: EngineConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn shared_registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handle for `name`; unknown resources are `NotFound`.
    pub fn resource(&self, name: &str) -> Result<ResourceHandle<'_>, EngineError> {
        Ok(ResourceHandle {
            engine: self,
            descriptor: self.registry.require(name)?,
        })
    }
}

/// What a delete applies to.
#[derive(Debug, Clone, Copy)]
pub enum DeleteTarget<'t> {
    Identity(&'t Identity),
    /// Every visible entity matching the query's filter.
    Query(&'t QueryParams),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeleteOutcome {
    pub deleted: Vec<Identity>,
    pub writes: usize,
}

#[derive(Clone, Copy)]
pub struct ResourceHandle<'e> {
    engine: &'e Engine,
    descriptor: &'e ResourceDescriptor,
}

impl<'e> ResourceHandle<'e> {
    pub fn descriptor(&self) -> &'e ResourceDescriptor {
        self.descriptor
    }

    pub fn name(&self) -> &'e str {
        &self.descriptor.name
    }

    /// Methods the gate allows on this resource; `OPTIONS` is always listed.
    pub fn allowed_methods(&self, ctx: &RequestContext) -> Vec<Method> {
        let gate = self.engine.registry.gate(&self.descriptor.name);
        [Method::Get, Method::Post, Method::Put, Method::Patch, Method::Delete]
            .into_iter()
            .filter(|method| gate.method_allowed(self.descriptor, *method, ctx))
            .chain([Method::Options])
            .collect()
    }

    pub fn ensure_allowed(&self, method: Method, ctx: &RequestContext) -> Result<(), EngineError> {
        let gate = self.engine.registry.gate(&self.descriptor.name);
        if gate.method_allowed(self.descriptor, method, ctx) {
            Ok(())
        } else {
            Err(EngineError::denied(&self.descriptor.name, method.as_str()))
        }
    }

    /// Handle for the target of one of this resource's relationships.
    pub fn related(&self, relationship: &str) -> Result<(&'e RelationshipDescriptor, ResourceHandle<'e>), EngineError> {
        let relationship = self
            .descriptor
            .find_relationship(relationship)
            .ok_or_else(|| EngineError::not_found(&self.descriptor.name, relationship))?;
        Ok((relationship, self.engine.resource(&relationship.target)?))
    }

    pub fn parse(&self, params: &QueryParams) -> Result<ParsedQuery, EngineError> {
        let options = self.engine.config.parser_options();
        QueryParser::new(&self.engine.registry, self.descriptor, &options).parse(params)
    }

    fn compile<'q>(
        &self,
        ctx: &'q RequestContext,
        query: &ParsedQuery,
        scope: Option<Predicate>,
    ) -> Result<CompiledQuery<'q>, EngineError>
    where
        'e: 'q,
    {
        QueryBuilder::new(&self.engine.registry, ctx)
            .with_render(self.engine.config.render.clone())
            .compile(&self.descriptor.name, query, scope)
    }

    pub async fn list<S: Store>(
        &self,
        store: &mut S,
        ctx: &RequestContext,
        params: &QueryParams,
    ) -> Result<ResourceCollection, EngineError> {
        self.ensure_allowed(Method::Get, ctx)?;
        let query = self.parse(params)?;
        self.compile(ctx, &query, None)?.collection(store).await
    }

    pub async fn get<S: Store>(
        &self,
        store: &mut S,
        ctx: &RequestContext,
        identity: &Identity,
        params: &QueryParams,
    ) -> Result<Value, EngineError> {
        self.ensure_allowed(Method::Get, ctx)?;
        let query = self.parse(params)?.with_pagination(Pagination::default());
        self.fetch_one(store, ctx, identity, &query)
            .await?
            .ok_or_else(|| EngineError::not_found(&self.descriptor.name, identity))
    }

    /// One rendered attribute of an entity.
    pub async fn get_field<S: Store>(
        &self,
        store: &mut S,
        ctx: &RequestContext,
        identity: &Identity,
        field: &str,
    ) -> Result<Value, EngineError> {
        self.ensure_allowed(Method::Get, ctx)?;
        let visible = self
            .descriptor
            .find_field(field)
            .is_some_and(|field| field.is_rendered());
        if !visible {
            return Err(EngineError::not_found(&self.descriptor.name, format!("{identity}/{field}")));
        }
        let entity = self
            .fetch_one(store, ctx, identity, &ParsedQuery::new())
            .await?
            .ok_or_else(|| EngineError::not_found(&self.descriptor.name, identity))?;
        Ok(entity.get(field).cloned().unwrap_or(Value::Null))
    }

    /// Members of a relationship of one entity, queried like a collection.
    pub async fn list_related<S: Store>(
        &self,
        store: &mut S,
        ctx: &RequestContext,
        identity: &Identity,
        relationship: &str,
        params: &QueryParams,
    ) -> Result<ResourceCollection, EngineError> {
        self.ensure_allowed(Method::Get, ctx)?;
        let (relationship, target) = self.related(relationship)?;
        target.ensure_allowed(Method::Get, ctx)?;
        self.ensure_visible(store, ctx, identity).await?;
        let query = target.parse(params)?;
        let scope = self.membership(identity, relationship);
        target.compile(ctx, &query, Some(scope))?.collection(store).await
    }

    /// The member of a to-one relationship, or `null`.
    pub async fn get_related_one<S: Store>(
        &self,
        store: &mut S,
        ctx: &RequestContext,
        identity: &Identity,
        relationship: &str,
        params: &QueryParams,
    ) -> Result<Value, EngineError> {
        self.ensure_allowed(Method::Get, ctx)?;
        let (relationship, target) = self.related(relationship)?;
        target.ensure_allowed(Method::Get, ctx)?;
        self.ensure_visible(store, ctx, identity).await?;
        let query = target.parse(params)?.with_pagination(Pagination::new(0, Some(1)));
        let scope = self.membership(identity, relationship);
        Ok(target
            .compile(ctx, &query, Some(scope))?
            .first(store)
            .await?
            .unwrap_or(Value::Null))
    }

    /// Identity of the to-one member, if any.
    pub async fn related_identity<S: Store>(
        &self,
        store: &mut S,
        ctx: &RequestContext,
        identity: &Identity,
        relationship: &str,
    ) -> Result<Option<Identity>, EngineError> {
        let (relationship, target) = self.related(relationship)?;
        let scope = self.membership(identity, relationship);
        let query = ParsedQuery::new().with_pagination(Pagination::new(0, Some(1)));
        let rows = target.compile(ctx, &query, Some(scope))?.execute(store).await?;
        Ok(rows.first().and_then(|row| target.descriptor.identity_of(&row.record)))
    }

    /// Whether `child` is currently a visible member of `relationship`.
    pub async fn has_member<S: Store>(
        &self,
        store: &mut S,
        ctx: &RequestContext,
        identity: &Identity,
        relationship: &str,
        child: &Identity,
    ) -> Result<bool, EngineError> {
        let (relationship, target) = self.related(relationship)?;
        let scope = Predicate::all([
            self.membership(identity, relationship),
            Predicate::identity(target.descriptor, child),
        ]);
        let rows = target.compile(ctx, &ParsedQuery::new(), Some(scope))?.execute(store).await?;
        Ok(!rows.is_empty())
    }

    /// Creates from an object (returns the entity) or an array (returns an array).
    pub async fn create<S: Store>(
        &self,
        store: &mut S,
        ctx: &RequestContext,
        document: Value,
        params: &QueryParams,
    ) -> Result<Value, EngineError> {
        self.ensure_allowed(Method::Post, ctx)?;
        let query = self.parse(params)?.with_pagination(Pagination::default());
        let registry = &self.engine.registry;
        let outcome = MutationProcessor::new(registry, ctx, store)
            .create(&self.descriptor.name, &document)
            .await?;
        debug!("created {} `{}` entities", outcome.identities.len(), self.descriptor.name);
        let rendered = self.reread(store, ctx, &outcome, &query).await?;
        if document.is_array() {
            Ok(Value::Array(rendered))
        } else {
            Ok(rendered.into_iter().next().unwrap_or(Value::Null))
        }
    }

    /// `replace` selects PUT semantics, otherwise PATCH.
    pub async fn update<S: Store>(
        &self,
        store: &mut S,
        ctx: &RequestContext,
        identity: &Identity,
        document: Value,
        replace: bool,
        params: &QueryParams,
    ) -> Result<Value, EngineError> {
        let (method, mode) = if replace {
            (Method::Put, Mode::Replace)
        } else {
            (Method::Patch, Mode::Patch)
        };
        self.ensure_allowed(method, ctx)?;
        let query = self.parse(params)?.with_pagination(Pagination::default());
        MutationProcessor::new(&self.engine.registry, ctx, store)
            .update(&self.descriptor.name, identity, &document, mode)
            .await?;
        Ok(self
            .fetch_one(store, ctx, identity, &query)
            .await?
            .unwrap_or_else(|| Value::Object(identity.to_document(self.descriptor))))
    }

    /// Writes one attribute from a bare value and returns its new rendered value.
    pub async fn update_field<S: Store>(
        &self,
        store: &mut S,
        ctx: &RequestContext,
        identity: &Identity,
        field: &str,
        value: Value,
    ) -> Result<Value, EngineError> {
        self.ensure_allowed(Method::Patch, ctx)?;
        MutationProcessor::new(&self.engine.registry, ctx, store)
            .update_field(&self.descriptor.name, identity, field, &value)
            .await?;
        let rendered = self
            .fetch_one(store, ctx, identity, &ParsedQuery::new())
            .await?
            .and_then(|entity| entity.get(field).cloned());
        Ok(rendered.unwrap_or(Value::Null))
    }

    /// `$op`-annotated items applied to the whole collection.
    pub async fn patch_collection<S: Store>(
        &self,
        store: &mut S,
        ctx: &RequestContext,
        items: Value,
        params: &QueryParams,
    ) -> Result<Vec<Value>, EngineError> {
        self.ensure_allowed(Method::Patch, ctx)?;
        let query = self.parse(params)?.with_pagination(Pagination::default());
        let outcome = MutationProcessor::new(&self.engine.registry, ctx, store)
            .patch_collection(&self.descriptor.name, &items)
            .await?;
        self.reread(store, ctx, &outcome, &query).await
    }

    /// Creates `document` (or links it, when it names an existing entity)
    /// as a member of `relationship` and returns the member.
    pub async fn create_related<S: Store>(
        &self,
        store: &mut S,
        ctx: &RequestContext,
        identity: &Identity,
        relationship: &str,
        document: Value,
        params: &QueryParams,
    ) -> Result<Value, EngineError> {
        self.ensure_allowed(Method::Patch, ctx)?;
        let (relationship, target) = self.related(relationship)?;
        target.ensure_allowed(Method::Post, ctx)?;
        let query = target.parse(params)?.with_pagination(Pagination::default());
        let named = document
            .as_object()
            .and_then(|object| target.descriptor.identity_in_document(object));
        let member = if relationship.is_many() {
            Value::Array(vec![document])
        } else {
            document
        };
        let patch = Value::Object(serde_json::Map::from_iter([(relationship.name.clone(), member)]));
        let outcome = MutationProcessor::new(&self.engine.registry, ctx, store)
            .update(&self.descriptor.name, identity, &patch, Mode::Patch)
            .await?;
        let Some(child) = named.or_else(|| outcome.first_created(&target.descriptor.name).cloned()) else {
            return Ok(Value::Null);
        };
        Ok(target
            .fetch_one(store, ctx, &child, &query)
            .await?
            .unwrap_or_else(|| Value::Object(child.to_document(target.descriptor))))
    }

    /// Applies `$op`-annotated items to the members of `relationship` and
    /// returns the resulting members.
    pub async fn patch_related<S: Store>(
        &self,
        store: &mut S,
        ctx: &RequestContext,
        identity: &Identity,
        relationship: &str,
        items: Value,
        params: &QueryParams,
    ) -> Result<ResourceCollection, EngineError> {
        self.ensure_allowed(Method::Patch, ctx)?;
        if !items.is_array() {
            return Err(EngineError::bad_request("a collection patch must be an array"));
        }
        let patch = Value::Object(serde_json::Map::from_iter([(relationship.to_string(), items)]));
        MutationProcessor::new(&self.engine.registry, ctx, store)
            .update(&self.descriptor.name, identity, &patch, Mode::Patch)
            .await?;
        self.list_related(store, ctx, identity, relationship, params).await
    }

    pub async fn delete<S: Store>(
        &self,
        store: &mut S,
        ctx: &RequestContext,
        target: DeleteTarget<'_>,
    ) -> Result<DeleteOutcome, EngineError> {
        self.ensure_allowed(Method::Delete, ctx)?;
        let registry = &self.engine.registry;
        let outcome = match target {
            DeleteTarget::Identity(identity) => {
                MutationProcessor::new(registry, ctx, store)
                    .delete(&self.descriptor.name, identity)
                    .await?
            }
            DeleteTarget::Query(params) => {
                let query = self.parse(params)?;
                let predicate = query
                    .filter
                    .as_ref()
                    .map(|filter| FilterCompiler::new(registry, ctx).compile(self.descriptor, filter))
                    .transpose()?;
                MutationProcessor::new(registry, ctx, store)
                    .delete_where(&self.descriptor.name, predicate)
                    .await?
            }
        };
        Ok(DeleteOutcome {
            deleted: outcome.identities,
            writes: outcome.writes,
        })
    }

    async fn fetch_one<S: Store>(
        &self,
        store: &mut S,
        ctx: &RequestContext,
        identity: &Identity,
        query: &ParsedQuery,
    ) -> Result<Option<Value>, EngineError> {
        let scope = Predicate::identity(self.descriptor, identity);
        self.compile(ctx, query, Some(scope))?.first(store).await
    }

    /// `NotFound` unless the entity exists and passes the required filter.
    pub async fn ensure_visible<S: Store>(
        &self,
        store: &mut S,
        ctx: &RequestContext,
        identity: &Identity,
    ) -> Result<(), EngineError> {
        let query = ParsedQuery::new().with_pagination(Pagination::new(0, Some(1)));
        let scope = Predicate::identity(self.descriptor, identity);
        let rows = self.compile(ctx, &query, Some(scope))?.execute(store).await?;
        if rows.is_empty() {
            Err(EngineError::not_found(&self.descriptor.name, identity))
        } else {
            Ok(())
        }
    }

    fn membership(&self, identity: &Identity, relationship: &RelationshipDescriptor) -> Predicate {
        Predicate::MemberOf {
            resource: self.descriptor.name.clone(),
            identity: identity.clone(),
            relationship: relationship.name.clone(),
        }
    }

    async fn reread<S: Store>(
        &self,
        store: &mut S,
        ctx: &RequestContext,
        outcome: &MutationOutcome,
        query: &ParsedQuery,
    ) -> Result<Vec<Value>, EngineError> {
        let mut rendered = Vec::with_capacity(outcome.identities.len());
        for identity in &outcome.identities {
            let entity = self
                .fetch_one(store, ctx, identity, query)
                .await?
                .unwrap_or_else(|| Value::Object(identity.to_document(self.descriptor)));
            rendered.push(entity);
        }
        Ok(rendered)
    }
}
