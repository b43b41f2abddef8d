//! Compiles parsed queries into store requests and renders the results.
//!
//! Embeds without sub-sorting or sub-pagination ride along with the root
//! fetch as [`Include`]s. Every other embed becomes one [`RelatedRequest`]
//! per path, run after the root in depth order and windowed per parent.
//! The permission gate's required filter is ANDed into every level.

use std::collections::{BTreeMap, HashSet};

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::EngineError;
use crate::filters::{FilterCompiler, Predicate};
use crate::permissions::RequestContext;
use crate::query::{Embed, EmbedSpec, Pagination, PaginationInfo, ParsedQuery};
use crate::registry::Registry;
use crate::store::{FetchRequest, Include, Related, RelatedRequest, Row, Store, StoreSort};
use crate::types::{Identity, ResourceDescriptor, SortSpec};

/// Link rendering options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    /// Add `self` and relationship URLs to rendered entities.
    pub links: bool,
    /// Prepended to every generated URL, e.g. `/api`.
    pub url_prefix: String,
}

impl RenderOptions {
    pub fn entity_url(&self, resource: &str, identity: &Identity) -> String {
        format!("{}/{}/{}", self.url_prefix.trim_end_matches('/'), resource, identity.key())
    }

    pub fn relationship_url(&self, resource: &str, identity: &Identity, relationship: &str) -> String {
        format!("{}/{}", self.entity_url(resource, identity), relationship)
    }
}

/// One page of a list request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceCollection {
    pub items: Vec<Value>,
    pub resources_available: u64,
    pub pagination: PaginationInfo,
}

pub struct QueryBuilder<'a> {
    registry: &'a Registry,
    ctx: &'a RequestContext,
    render: RenderOptions,
}

/// Field selection and embedded children for one level of the result tree.
#[derive(Debug, Clone, Default)]
struct RenderNode {
    fields: Vec<String>,
    children: BTreeMap<String, RenderNode>,
}

#[derive(Debug, Clone)]
struct ScopedFetch {
    path: Vec<String>,
    parent_resource: String,
    request: RelatedRequest,
}

/// A query ready to run against any [`Store`].
#[derive(Debug)]
pub struct CompiledQuery<'a> {
    registry: &'a Registry,
    resource: &'a ResourceDescriptor,
    fetch: FetchRequest,
    scoped: Vec<ScopedFetch>,
    render_tree: RenderNode,
    render: RenderOptions,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(registry: &'a Registry, ctx: &'a RequestContext) -> Self {
        Self {
            registry,
            ctx,
            render: RenderOptions::default(),
        }
    }

    pub fn with_render(mut self, render: RenderOptions) -> Self {
        self.render = render;
        self
    }

    /// Compiles `query` against `resource`. `scope` is ANDed into the root
    /// predicate (identity lookups, relationship sub-collections).
    pub fn compile(
        &self,
        resource: &str,
        query: &ParsedQuery,
        scope: Option<Predicate>,
    ) -> Result<CompiledQuery<'a>, EngineError> {
        let descriptor = self.registry.require(resource)?;
        let compiler = FilterCompiler::new(self.registry, self.ctx);

        let mut embeds = query.embeds.clone();
        embeds.validate()?;

        let predicate = Predicate::conjoin(compiler.scoped(descriptor, query.filter.as_ref())?, scope);
        let fetch = FetchRequest {
            resource: descriptor.name.clone(),
            predicate,
            sorts: store_sorts(descriptor, &query.sorts)?,
            pagination: query.pagination,
            includes: self.includes_for(&compiler, descriptor, &embeds, &[])?,
        };

        let mut scoped_embeds: Vec<&Embed> = embeds.iter().filter(|embed| embed.is_scoped()).collect();
        scoped_embeds.sort_by_key(|embed| embed.depth());
        let mut scoped = Vec::with_capacity(scoped_embeds.len());
        for embed in scoped_embeds {
            let (parent, relationship_name) = match embed.path.split_last() {
                Some((last, parents)) => (self.resource_at(descriptor, parents)?, last.clone()),
                None => return Err(EngineError::invalid_field("embeds", "empty embed path")),
            };
            let relationship = parent
                .find_relationship(&relationship_name)
                .ok_or_else(|| EngineError::invalid_field(embed.dotted(), "not a relationship"))?;
            let target = self.registry.require(&relationship.target)?;
            scoped.push(ScopedFetch {
                path: embed.path.clone(),
                parent_resource: parent.name.clone(),
                request: RelatedRequest {
                    resource: parent.name.clone(),
                    relationship: relationship_name,
                    parents: Vec::new(),
                    predicate: compiler.scoped(target, embed.filter.as_ref())?,
                    sorts: store_sorts(target, &embed.sorts)?,
                    pagination: embed.pagination,
                    includes: self.includes_for(&compiler, target, &embeds, &embed.path)?,
                },
            });
        }

        let render_tree = render_tree(&query.fields, &embeds, &[]);
        debug!(
            "compiled `{resource}` query: predicate {:?}, {} includes, {} scoped fetches",
            fetch.predicate,
            fetch.includes.len(),
            scoped.len()
        );
        Ok(CompiledQuery {
            registry: self.registry,
            resource: descriptor,
            fetch,
            scoped,
            render_tree,
            render: self.render.clone(),
        })
    }

    /// Eager includes for the unscoped embeds directly below `parent_path`.
    fn includes_for(
        &self,
        compiler: &FilterCompiler<'_>,
        parent: &ResourceDescriptor,
        embeds: &EmbedSpec,
        parent_path: &[String],
    ) -> Result<Vec<Include>, EngineError> {
        let mut includes = Vec::new();
        for embed in embeds.children_of(parent_path) {
            if embed.is_scoped() {
                continue;
            }
            let Some(name) = embed.path.last() else {
                continue;
            };
            let relationship = parent.find_relationship(name).ok_or_else(|| {
                EngineError::invalid_field(embed.dotted(), format!("`{name}` is not a relationship of `{}`", parent.name))
            })?;
            let target = self.registry.require(&relationship.target)?;
            includes.push(Include {
                relationship: name.clone(),
                predicate: compiler.scoped(target, embed.filter.as_ref())?,
                sorts: Vec::new(),
                includes: self.includes_for(compiler, target, embeds, &embed.path)?,
            });
        }
        Ok(includes)
    }

    fn resource_at(&self, root: &'a ResourceDescriptor, path: &[String]) -> Result<&'a ResourceDescriptor, EngineError> {
        let mut current = root;
        for segment in path {
            let relationship = current
                .find_relationship(segment)
                .ok_or_else(|| EngineError::invalid_field(path.join("."), format!("`{segment}` is not a relationship")))?;
            current = self.registry.require(&relationship.target)?;
        }
        Ok(current)
    }
}

fn store_sorts(descriptor: &ResourceDescriptor, sorts: &[SortSpec]) -> Result<Vec<StoreSort>, EngineError> {
    sorts
        .iter()
        .map(|sort| {
            let field = descriptor
                .find_field(&sort.field)
                .filter(|field| field.is_filterable())
                .ok_or_else(|| {
                    EngineError::invalid_field(&sort.field, format!("`{}` cannot be sorted on", sort.field))
                })?;
            Ok(StoreSort {
                key: field.storage_key().to_string(),
                field_type: field.field_type,
                order: sort.order,
            })
        })
        .collect()
}

fn render_tree(fields: &[String], embeds: &EmbedSpec, path: &[String]) -> RenderNode {
    let mut node = RenderNode {
        fields: fields.to_vec(),
        children: BTreeMap::new(),
    };
    for embed in embeds.children_of(path) {
        if let Some(name) = embed.path.last() {
            node.children
                .insert(name.clone(), render_tree(&embed.fields, embeds, &embed.path));
        }
    }
    node
}

impl CompiledQuery<'_> {
    pub fn fetch_request(&self) -> &FetchRequest {
        &self.fetch
    }

    pub fn pagination(&self) -> Pagination {
        self.fetch.pagination
    }

    /// Fetches the root rows and attaches every scoped embed.
    pub async fn execute<S: Store>(&self, store: &mut S) -> Result<Vec<Row>, EngineError> {
        let mut rows = store.fetch(&self.fetch).await?;
        for scoped in &self.scoped {
            let parent_descriptor = self.registry.require(&scoped.parent_resource)?;
            let parent_path = &scoped.path[..scoped.path.len() - 1];
            let mut seen = HashSet::new();
            let parents: Vec<Identity> = rows_at(&rows, parent_path)
                .into_iter()
                .filter_map(|row| parent_descriptor.identity_of(&row.record))
                .filter(|identity| seen.insert(identity.key()))
                .collect();

            let mut request = scoped.request.clone();
            request.parents = parents;
            let related: BTreeMap<String, Vec<Row>> = if request.parents.is_empty() {
                BTreeMap::new()
            } else {
                store
                    .fetch_related(&request)
                    .await?
                    .into_iter()
                    .map(|group| (group.parent.key(), group.rows))
                    .collect()
            };

            for parent in rows_at_mut(&mut rows, parent_path) {
                let members = parent_descriptor
                    .identity_of(&parent.record)
                    .and_then(|identity| related.get(&identity.key()))
                    .cloned()
                    .unwrap_or_default();
                parent
                    .related
                    .insert(request.relationship.clone(), Related::Many(members));
            }
        }
        Ok(rows)
    }

    /// Runs the query and renders one page with pagination metadata.
    pub async fn collection<S: Store>(&self, store: &mut S) -> Result<ResourceCollection, EngineError> {
        let rows = self.execute(store).await?;
        let resources_available = store.count(&self.resource.name, self.fetch.predicate.as_ref()).await?;
        Ok(ResourceCollection {
            items: self.render(&rows),
            resources_available,
            pagination: PaginationInfo::new(&self.fetch.pagination, resources_available),
        })
    }

    /// Runs the query and renders the first row, if any.
    pub async fn first<S: Store>(&self, store: &mut S) -> Result<Option<Value>, EngineError> {
        let rows = self.execute(store).await?;
        Ok(rows.first().map(|row| self.render_row(self.resource, row, &self.render_tree)))
    }

    pub fn render(&self, rows: &[Row]) -> Vec<Value> {
        rows.iter()
            .map(|row| self.render_row(self.resource, row, &self.render_tree))
            .collect()
    }

    fn render_row(&self, descriptor: &ResourceDescriptor, row: &Row, node: &RenderNode) -> Value {
        let mut out = Map::new();
        for field in descriptor.fields.iter().filter(|field| field.is_rendered()) {
            if !node.fields.is_empty() && !node.fields.contains(&field.name) {
                continue;
            }
            let value = row.record.get(field.storage_key()).cloned().unwrap_or(Value::Null);
            out.insert(field.name.clone(), value);
        }

        let identity = descriptor.identity_of(&row.record);
        if self.render.links
            && let Some(identity) = &identity
        {
            out.insert(
                "self".to_string(),
                Value::String(self.render.entity_url(&descriptor.name, identity)),
            );
        }

        for relationship in &descriptor.relationships {
            let Some(child) = node.children.get(&relationship.name) else {
                if self.render.links
                    && let Some(identity) = &identity
                {
                    out.insert(
                        relationship.name.clone(),
                        Value::String(self.render.relationship_url(&descriptor.name, identity, &relationship.name)),
                    );
                }
                continue;
            };
            let Some(target) = self.registry.target_of(relationship) else {
                continue;
            };
            let rendered = match row.related.get(&relationship.name) {
                Some(Related::Many(members)) => Value::Array(
                    members
                        .iter()
                        .map(|member| self.render_row(target, member, child))
                        .collect(),
                ),
                Some(Related::One(Some(member))) => self.render_row(target, member, child),
                Some(Related::One(None)) | None if relationship.is_many() => Value::Array(Vec::new()),
                Some(Related::One(None)) | None => Value::Null,
            };
            out.insert(relationship.name.clone(), rendered);
        }
        Value::Object(out)
    }
}

fn rows_at<'r>(rows: &'r [Row], path: &[String]) -> Vec<&'r Row> {
    let Some((first, rest)) = path.split_first() else {
        return rows.iter().collect();
    };
    let mut found = Vec::new();
    for row in rows {
        match row.related.get(first) {
            Some(Related::Many(members)) => found.extend(rows_at(members, rest)),
            Some(Related::One(Some(member))) => found.extend(rows_at(std::slice::from_ref(member.as_ref()), rest)),
            _ => {}
        }
    }
    found
}

fn rows_at_mut<'r>(rows: &'r mut [Row], path: &[String]) -> Vec<&'r mut Row> {
    let Some((first, rest)) = path.split_first() else {
        return rows.iter_mut().collect();
    };
    let mut found = Vec::new();
    for row in rows {
        match row.related.get_mut(first) {
            Some(Related::Many(members)) => found.extend(rows_at_mut(members, rest)),
            Some(Related::One(Some(member))) => found.extend(rows_at_mut(std::slice::from_mut(member.as_mut()), rest)),
            _ => {}
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::filters::FilterExpr;
    use crate::permissions::PermissionGate;
    use crate::query::{ParserOptions, QueryParams, QueryParser};
    use crate::store::MemoryStore;
    use crate::types::{FieldDescriptor, Record, RelationshipDescriptor};

    struct OddTracksOnly;

    impl PermissionGate for OddTracksOnly {
        fn required_filter(&self, _resource: &ResourceDescriptor, _ctx: &RequestContext) -> Option<FilterExpr> {
            Some(FilterExpr::or([FilterExpr::eq("track_id", 1), FilterExpr::eq("track_id", 3)]))
        }
    }

    fn registry(gated: bool) -> Arc<Registry> {
        let builder = Registry::builder()
            .resource(
                ResourceDescriptor::new("albums")
                    .identity(["album_id"])
                    .field(FieldDescriptor::integer("album_id"))
                    .field(FieldDescriptor::string("title").data_key("Title"))
                    .relationship(RelationshipDescriptor::one_to_many(
                        "tracks",
                        "tracks",
                        &["album_id"],
                        &["album_id"],
                    )),
            )
            .resource(
                ResourceDescriptor::new("tracks")
                    .identity(["track_id"])
                    .field(FieldDescriptor::integer("track_id"))
                    .field(FieldDescriptor::string("name"))
                    .field(FieldDescriptor::integer("album_id").optional())
                    .field(FieldDescriptor::string("secret").hidden().optional()),
            );
        let builder = if gated { builder.gate("tracks", OddTracksOnly) } else { builder };
        Arc::new(builder.build().unwrap())
    }

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn store(registry: &Arc<Registry>) -> MemoryStore {
        let mut store = MemoryStore::new(registry.clone());
        let tables = store.tables_mut();
        tables
            .insert(registry, "albums", record(json!({"album_id": 1, "Title": "First"})))
            .unwrap();
        tables
            .insert(registry, "albums", record(json!({"album_id": 2, "Title": "Second"})))
            .unwrap();
        for (track_id, album_id) in [(1, 1), (2, 1), (3, 1), (4, 2)] {
            tables
                .insert(
                    registry,
                    "tracks",
                    record(json!({
                        "track_id": track_id,
                        "name": format!("Track {track_id}"),
                        "album_id": album_id,
                        "secret": "x",
                    })),
                )
                .unwrap();
        }
        store
    }

    fn parse(registry: &Registry, query: &str) -> ParsedQuery {
        let albums = registry.require("albums").unwrap();
        QueryParser::new(registry, albums, &ParserOptions::default())
            .parse(&QueryParams::parse(query))
            .unwrap()
    }

    #[test]
    fn render_options_build_urls() {
        let render = RenderOptions {
            links: true,
            url_prefix: "/api/".into(),
        };
        assert_eq!(render.entity_url("albums", &Identity::single(1)), "/api/albums/1");
        assert_eq!(
            render.relationship_url("albums", &Identity::single(1), "tracks"),
            "/api/albums/1/tracks"
        );
    }

    #[tokio::test]
    async fn renders_api_names_and_hides_hidden_fields() {
        let registry = registry(false);
        let mut store = store(&registry);
        let ctx = RequestContext::new();
        let query = parse(&registry, "embeds=tracks&album_id=2");
        let compiled = QueryBuilder::new(&registry, &ctx).compile("albums", &query, None).unwrap();
        let page = compiled.collection(&mut store).await.unwrap();
        assert_eq!(page.resources_available, 1);
        assert_eq!(
            page.items,
            vec![json!({
                "album_id": 2,
                "title": "Second",
                "tracks": [{"track_id": 4, "name": "Track 4", "album_id": 2}],
            })]
        );
    }

    #[tokio::test]
    async fn required_filters_apply_to_includes() {
        let registry = registry(true);
        let mut store = store(&registry);
        let ctx = RequestContext::new();
        let query = parse(&registry, "embeds=tracks&album_id=1&fields=title&fields=tracks.track_id");
        let compiled = QueryBuilder::new(&registry, &ctx).compile("albums", &query, None).unwrap();
        let items = compiled.collection(&mut store).await.unwrap().items;
        assert_eq!(
            items,
            vec![json!({"title": "First", "tracks": [{"track_id": 1}, {"track_id": 3}]})]
        );
    }

    #[tokio::test]
    async fn scoped_embeds_are_windowed_per_parent() {
        let registry = registry(false);
        let mut store = store(&registry);
        let ctx = RequestContext::new();
        let query = parse(
            &registry,
            "embeds=tracks&tracks._limit_=1&tracks._sorts_=-track_id&fields=album_id&fields=tracks.track_id",
        );
        let compiled = QueryBuilder::new(&registry, &ctx).compile("albums", &query, None).unwrap();
        let items = compiled.collection(&mut store).await.unwrap().items;
        assert_eq!(
            items,
            vec![
                json!({"album_id": 1, "tracks": [{"track_id": 3}]}),
                json!({"album_id": 2, "tracks": [{"track_id": 4}]}),
            ]
        );
    }

    #[tokio::test]
    async fn links_cover_self_and_unembedded_relationships() {
        let registry = registry(false);
        let mut store = store(&registry);
        let ctx = RequestContext::new();
        let render = RenderOptions {
            links: true,
            url_prefix: "/api".into(),
        };
        let descriptor = registry.require("albums").unwrap();
        let scope = Some(Predicate::identity(descriptor, &Identity::single(1)));
        let compiled = QueryBuilder::new(&registry, &ctx)
            .with_render(render)
            .compile("albums", &ParsedQuery::new(), scope)
            .unwrap();
        let item = compiled.first(&mut store).await.unwrap().unwrap();
        assert_eq!(item["self"], json!("/api/albums/1"));
        assert_eq!(item["tracks"], json!("/api/albums/1/tracks"));
    }

    #[test]
    fn sorting_on_unknown_fields_is_rejected() {
        let registry = registry(false);
        let ctx = RequestContext::new();
        let query = ParsedQuery::new().with_sort(SortSpec::asc("nope"));
        let err = QueryBuilder::new(&registry, &ctx)
            .compile("albums", &query, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidFilterField { .. }));
    }
}
