//! Query-string parsing: flat and structured filters, field selection,
//! relationship embeds with their sub-directives, sorting and pagination.

pub mod embed;
pub mod pagination;
pub mod structured;

use std::collections::BTreeMap;

use log::trace;
use serde_json::Value;

use crate::errors::EngineError;
use crate::filters::{FilterExpr, Operator, resolve_field_path, resolve_relationship_path};
use crate::registry::Registry;
use crate::types::{ResourceDescriptor, SortSpec};

pub use embed::{Embed, EmbedSpec};
pub use pagination::{LIMIT_PARAM, OFFSET_PARAM, PAGE_PARAM, Pagination, PaginationInfo};
pub use structured::{parse_structured, structured_to_expr};

pub const EMBEDS_PARAM: &str = "embeds";
pub const FIELDS_PARAM: &str = "fields";
pub const QUERY_PARAM: &str = "query";
pub const SORT_PARAM: &str = "sort";

/// Keys never treated as flat filters.
pub const RESERVED_PARAMS: [&str; 7] = [
    EMBEDS_PARAM,
    FIELDS_PARAM,
    LIMIT_PARAM,
    OFFSET_PARAM,
    PAGE_PARAM,
    QUERY_PARAM,
    SORT_PARAM,
];

const SUBQUERY: &str = "_subquery_";
const SUBFILTER: &str = "_subfilter_";
const SUB_LIMIT: &str = "_limit_";
const SUB_OFFSET: &str = "_offset_";
const SUB_SORTS: &str = "_sorts_";

pub const DEFAULT_MAX_FILTER_NODES: usize = 100;

/// Ordered multimap of decoded query parameters. A repeated key is the array case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes an `application/x-www-form-urlencoded` string. A leading `?` is ignored.
    pub fn parse(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        url::form_urlencoded::parse(query.as_bytes())
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        pairs.into_iter().collect()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(candidate, _)| candidate == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.pairs
            .iter()
            .filter(move |(candidate, _)| candidate == key)
            .map(|(_, value)| value.as_str())
    }

    /// Distinct keys in first-seen order.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        for (key, _) in &self.pairs {
            if !keys.contains(&key.as_str()) {
                keys.push(key);
            }
        }
        keys
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Re-encodes the parameters as a query string.
    pub fn to_query_string(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.pairs.iter())
            .finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for QueryParams {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            pairs: iter.into_iter().map(|(key, value)| (key.into(), value.into())).collect(),
        }
    }
}

impl From<BTreeMap<String, String>> for QueryParams {
    fn from(map: BTreeMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

/// Limits applied while parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParserOptions {
    /// Ceiling on structured-filter nodes.
    pub max_filter_nodes: usize,
    /// Page ceiling for resources that do not declare their own.
    pub default_page_max_size: Option<u64>,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            max_filter_nodes: DEFAULT_MAX_FILTER_NODES,
            default_page_max_size: None,
        }
    }
}

/// Everything a read request asks for, validated against the schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedQuery {
    pub filter: Option<FilterExpr>,
    /// Root attributes to render; empty means all visible fields.
    pub fields: Vec<String>,
    pub embeds: EmbedSpec,
    pub sorts: Vec<SortSpec>,
    pub pagination: Pagination,
}

impl ParsedQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: FilterExpr) -> Self {
        self.filter = FilterExpr::conjoin(self.filter.take(), Some(filter));
        self
    }

    pub fn with_embed(mut self, embed: Embed) -> Self {
        self.embeds.push(embed);
        self
    }

    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sorts.push(sort);
        self
    }

    pub fn with_pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = pagination;
        self
    }
}

/// Parses [`QueryParams`] for one resource.
pub struct QueryParser<'a> {
    registry: &'a Registry,
    resource: &'a ResourceDescriptor,
    options: &'a ParserOptions,
}

enum SubDirective {
    StructuredFilter,
    /// `<rel>._subquery_.<path>[-op]`, holding `<path>[-op]`.
    FlatFilter(String),
    Limit,
    Offset,
    Sorts,
}

impl<'a> QueryParser<'a> {
    pub fn new(registry: &'a Registry, resource: &'a ResourceDescriptor, options: &'a ParserOptions) -> Self {
        Self {
            registry,
            resource,
            options,
        }
    }

    pub fn parse(&self, params: &QueryParams) -> Result<ParsedQuery, EngineError> {
        let page_max_size = self.resource.page_max_size.or(self.options.default_page_max_size);
        let mut parsed = ParsedQuery {
            pagination: Pagination::from_params(params, page_max_size)?,
            ..ParsedQuery::default()
        };

        for raw in params.get_all(EMBEDS_PARAM) {
            for entry in split_list(raw) {
                self.parse_embed_entry(entry, &mut parsed.embeds)?;
            }
        }

        let mut flat_filters = Vec::new();
        for key in params.keys() {
            if RESERVED_PARAMS.contains(&key) {
                continue;
            }
            if let Some((relationship_path, directive)) = split_sub_directive(key)? {
                let values: Vec<&str> = params.get_all(key).collect();
                self.apply_sub_directive(key, &relationship_path, &directive, &values, &mut parsed.embeds)?;
                continue;
            }
            if let Some(expr) = self.flat_filter(self.resource, key, params.get_all(key))? {
                flat_filters.push(expr);
            }
        }

        let mut filter = match flat_filters.len() {
            0 => None,
            1 => flat_filters.pop(),
            _ => Some(FilterExpr::And(flat_filters)),
        };
        for raw in params.get_all(QUERY_PARAM) {
            let expr = parse_structured(raw, QUERY_PARAM, self.options.max_filter_nodes)?;
            self.validate_filter(self.resource, &expr)?;
            filter = FilterExpr::conjoin(filter, Some(expr));
        }
        if let Some(expr) = &filter
            && expr.node_count() > self.options.max_filter_nodes
        {
            return Err(EngineError::QueryTooComplex {
                limit: self.options.max_filter_nodes,
            });
        }
        parsed.filter = filter;

        for raw in params.get_all(FIELDS_PARAM) {
            for entry in split_list(raw) {
                self.parse_field_entry(entry, &mut parsed)?;
            }
        }

        if let Some(raw) = params.get(SORT_PARAM) {
            parsed.sorts = self.parse_sorts(self.resource, SORT_PARAM, raw)?;
        }

        Ok(parsed)
    }

    /// `tracks.genre` or `tracks.name`: a relationship path, optionally ending in a field.
    fn parse_embed_entry(&self, entry: &str, embeds: &mut EmbedSpec) -> Result<(), EngineError> {
        let segments: Vec<&str> = entry.split('.').collect();
        let mut current = self.resource;
        let mut path = Vec::new();
        let mut field = None;
        for (index, segment) in segments.iter().enumerate() {
            if let Some(relationship) = current.find_relationship(segment) {
                current = self.registry.target_of(relationship).ok_or_else(|| {
                    EngineError::invalid_field(entry, format!("relationship `{segment}` has no associated resource"))
                })?;
                path.push(segment.to_string());
                continue;
            }
            let is_last = index + 1 == segments.len();
            match current.find_field(segment) {
                Some(found) if is_last && !path.is_empty() => {
                    if !found.is_rendered() {
                        return Err(EngineError::invalid_field(entry, format!("`{segment}` cannot be selected")));
                    }
                    field = Some(found.name.clone());
                }
                Some(_) => {
                    return Err(EngineError::invalid_field(
                        entry,
                        format!("`{segment}` is a field and cannot be embedded"),
                    ));
                }
                None => {
                    return Err(EngineError::invalid_field(
                        entry,
                        format!("`{segment}` is not a relationship of `{}`", current.name),
                    ));
                }
            }
        }
        let embed = embeds.request(&path)?;
        if let Some(field) = field {
            embed.fields.push(field);
        }
        Ok(())
    }

    fn apply_sub_directive(
        &self,
        key: &str,
        relationship_path: &[String],
        directive: &SubDirective,
        values: &[&str],
        embeds: &mut EmbedSpec,
    ) -> Result<(), EngineError> {
        let segments: Vec<&str> = relationship_path.iter().map(String::as_str).collect();
        let hops = resolve_relationship_path(self.registry, self.resource, &segments, key)?;
        let Some((_, relationship)) = hops.last() else {
            return Err(EngineError::malformed(key, "sub-directive without a relationship"));
        };
        let target = self.registry.require(&relationship.target)?;
        let to_one = !relationship.is_many();

        // Flat sub-filters OR their repeated values like root flat filters;
        // every other directive takes exactly one distinct value.
        let value = match (directive, values) {
            (SubDirective::FlatFilter(_), _) => "",
            (_, [first, rest @ ..]) if rest.iter().all(|other| other == first) => *first,
            (_, []) => return Err(EngineError::malformed(key, "missing value")),
            _ => {
                return Err(EngineError::DuplicateEmbed {
                    path: relationship_path.join("."),
                });
            }
        };
        let embed = embeds.ensure(relationship_path);

        match directive {
            SubDirective::StructuredFilter => {
                let expr = parse_structured(value, key, self.options.max_filter_nodes)?;
                self.validate_filter(target, &expr)?;
                embed.filter = FilterExpr::conjoin(embed.filter.take(), Some(expr));
            }
            SubDirective::FlatFilter(flat_key) => {
                let Some(expr) = self.flat_filter(target, flat_key, values.iter().copied())? else {
                    return Err(EngineError::invalid_field(
                        key,
                        format!("`{flat_key}` is not a field of `{}`", target.name),
                    ));
                };
                embed.filter = FilterExpr::conjoin(embed.filter.take(), Some(expr));
            }
            SubDirective::Limit => {
                if to_one {
                    return Err(EngineError::malformed(key, "cannot limit a to-one relationship"));
                }
                let limit = match value.trim().parse::<u64>() {
                    Ok(limit) if limit > 0 => limit,
                    _ => return Err(EngineError::malformed(key, "limit must be a positive integer")),
                };
                let ceiling = target.page_max_size.or(self.options.default_page_max_size);
                if let Some(max) = ceiling
                    && limit > max
                {
                    return Err(EngineError::malformed(
                        key,
                        format!("limit {limit} exceeds the maximum page size of {max}"),
                    ));
                }
                embed.pagination.limit = Some(limit);
            }
            SubDirective::Offset => {
                if to_one {
                    return Err(EngineError::malformed(key, "cannot offset a to-one relationship"));
                }
                embed.pagination.offset = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| EngineError::malformed(key, "offset must be a non-negative integer"))?;
            }
            SubDirective::Sorts => {
                if to_one {
                    return Err(EngineError::malformed(key, "cannot sort a to-one relationship"));
                }
                let sorts = self.parse_sorts(target, key, value)?;
                if sorts.is_empty() {
                    return Err(EngineError::malformed(key, "empty sort"));
                }
                embed.sorts = sorts;
            }
        }
        Ok(())
    }

    /// Builds the filter for one flat key. Values of a repeated key are ORed.
    /// Returns `None` when the first path segment is not part of `resource`.
    fn flat_filter<'v>(
        &self,
        resource: &ResourceDescriptor,
        key: &str,
        values: impl Iterator<Item = &'v str>,
    ) -> Result<Option<FilterExpr>, EngineError> {
        let (path, operator) = match key.rsplit_once('-') {
            Some((path, suffix)) => match Operator::from_suffix(suffix) {
                Some(operator) => (path, operator),
                None => (key, Operator::Eq),
            },
            None => (key, Operator::Eq),
        };
        let first = path.split('.').next().unwrap_or(path);
        if resource.find_field(first).is_none() && resource.find_relationship(first).is_none() {
            trace!("ignoring query parameter `{key}` on `{}`", resource.name);
            return Ok(None);
        }
        resolve_field_path(self.registry, self.registry.require(&resource.name)?, path)?;

        let mut alternatives: Vec<FilterExpr> = values
            .map(|value| FilterExpr::compare(path, operator, Value::String(value.to_string())))
            .collect();
        Ok(match alternatives.len() {
            0 => None,
            1 => alternatives.pop(),
            _ => Some(FilterExpr::Or(alternatives)),
        })
    }

    fn validate_filter(&self, resource: &ResourceDescriptor, expr: &FilterExpr) -> Result<(), EngineError> {
        let resource = self.registry.require(&resource.name)?;
        for leaf in expr.leaves() {
            resolve_field_path(self.registry, resource, &leaf.path)?;
        }
        Ok(())
    }

    fn parse_field_entry(&self, entry: &str, parsed: &mut ParsedQuery) -> Result<(), EngineError> {
        let segments: Vec<&str> = entry.split('.').collect();
        let Some((name, prefix)) = segments.split_last() else {
            return Ok(());
        };
        let (resource, selection) = if prefix.is_empty() {
            (self.resource, &mut parsed.fields)
        } else {
            let hops = resolve_relationship_path(self.registry, self.resource, prefix, entry)?;
            let path: Vec<String> = prefix.iter().map(|segment| segment.to_string()).collect();
            let Some(embed) = parsed.embeds.get_mut(&path) else {
                return Err(EngineError::invalid_field(
                    entry,
                    format!("`{}` is not embedded", path.join(".")),
                ));
            };
            let target = match hops.last() {
                Some((_, relationship)) => self.registry.require(&relationship.target)?,
                None => self.resource,
            };
            (target, &mut embed.fields)
        };
        let Some(field) = resource.find_field(name) else {
            return Err(EngineError::invalid_field(
                entry,
                format!("`{name}` is not a field of `{}`", resource.name),
            ));
        };
        if field.write_only {
            return Err(EngineError::invalid_field(entry, format!("`{name}` is write-only")));
        }
        if !selection.contains(&field.name) {
            selection.push(field.name.clone());
        }
        Ok(())
    }

    fn parse_sorts(&self, resource: &ResourceDescriptor, parameter: &str, raw: &str) -> Result<Vec<SortSpec>, EngineError> {
        let sorts = SortSpec::parse_list(raw);
        for sort in &sorts {
            match resource.find_field(&sort.field) {
                Some(field) if field.is_filterable() => {}
                Some(_) => {
                    return Err(EngineError::invalid_field(
                        &sort.field,
                        format!("`{}` cannot be sorted on ({parameter})", sort.field),
                    ));
                }
                None => {
                    return Err(EngineError::invalid_field(
                        &sort.field,
                        format!("`{}` is not a field of `{}`", sort.field, resource.name),
                    ));
                }
            }
        }
        Ok(sorts)
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|entry| !entry.is_empty())
}

/// Splits `tracks._limit_` style keys. `Ok(None)` for keys without a marker
/// (or with a marker in first position, which cannot name a relationship).
fn split_sub_directive(key: &str) -> Result<Option<(Vec<String>, SubDirective)>, EngineError> {
    let segments: Vec<&str> = key.split('.').collect();
    let Some(position) = segments
        .iter()
        .position(|segment| matches!(*segment, SUBQUERY | SUBFILTER | SUB_LIMIT | SUB_OFFSET | SUB_SORTS))
    else {
        return Ok(None);
    };
    if position == 0 {
        return Ok(None);
    }
    let relationship_path: Vec<String> = segments[..position].iter().map(|s| s.to_string()).collect();
    let rest = &segments[position + 1..];
    let directive = match segments[position] {
        SUBQUERY | SUBFILTER if rest.is_empty() => SubDirective::StructuredFilter,
        SUBQUERY | SUBFILTER => SubDirective::FlatFilter(rest.join(".")),
        marker if !rest.is_empty() => {
            return Err(EngineError::malformed(key, format!("unexpected segments after `{marker}`")));
        }
        SUB_LIMIT => SubDirective::Limit,
        SUB_OFFSET => SubDirective::Offset,
        _ => SubDirective::Sorts,
    };
    Ok(Some((relationship_path, directive)))
}
