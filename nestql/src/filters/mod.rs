//! Boolean filter expressions over dotted field paths.
//!
//! A [`FilterExpr`] is what the query parser produces and what permission
//! gates return as required filters. It names fields by API path; it is turned
//! into a store-level [`Predicate`] by [`FilterCompiler`].

pub mod compare;
pub mod compile;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

pub use compare::{compare_values, like_regex, matches};
pub use compile::{FilterCompiler, Predicate, ResolvedPath, resolve_field_path, resolve_relationship_path};

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
}

impl Operator {
    pub const ALL: [Operator; 7] = [
        Operator::Eq,
        Operator::Ne,
        Operator::Gt,
        Operator::Gte,
        Operator::Lt,
        Operator::Lte,
        Operator::Like,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Like => "like",
        }
    }

    /// Flat-syntax suffix name (`gte` in `album_id-gte`).
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.as_str() == suffix)
    }

    /// Structured-syntax token (`$gte`).
    pub fn from_token(token: &str) -> Option<Self> {
        token.strip_prefix('$').and_then(Self::from_suffix)
    }

    pub fn token(&self) -> String {
        format!("${}", self.as_str())
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Leaf comparison: `path operator value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub path: String,
    pub operator: Operator,
    pub value: Value,
}

/// Filter tree. `And(vec![])` matches everything, `Or(vec![])` matches nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterExpr {
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    /// Negation of the conjunction of the children.
    Not(Vec<FilterExpr>),
    Compare(Comparison),
}

impl FilterExpr {
    pub fn compare(path: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        FilterExpr::Compare(Comparison {
            path: path.into(),
            operator,
            value: value.into(),
        })
    }

    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, Operator::Eq, value)
    }

    pub fn ne(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, Operator::Ne, value)
    }

    pub fn gt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, Operator::Gt, value)
    }

    pub fn gte(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, Operator::Gte, value)
    }

    pub fn lt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, Operator::Lt, value)
    }

    pub fn lte(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(path, Operator::Lte, value)
    }

    pub fn like(path: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::compare(path, Operator::Like, Value::String(pattern.into()))
    }

    pub fn and(children: impl IntoIterator<Item = FilterExpr>) -> Self {
        FilterExpr::And(children.into_iter().collect())
    }

    pub fn or(children: impl IntoIterator<Item = FilterExpr>) -> Self {
        FilterExpr::Or(children.into_iter().collect())
    }

    pub fn not(child: FilterExpr) -> Self {
        FilterExpr::Not(vec![child])
    }

    pub fn always() -> Self {
        FilterExpr::And(Vec::new())
    }

    pub fn never() -> Self {
        FilterExpr::Or(Vec::new())
    }

    /// ANDs two optional filters.
    pub fn conjoin(left: Option<FilterExpr>, right: Option<FilterExpr>) -> Option<FilterExpr> {
        match (left, right) {
            (None, other) | (other, None) => other,
            (Some(FilterExpr::And(mut items)), Some(FilterExpr::And(more))) => {
                items.extend(more);
                Some(FilterExpr::And(items))
            }
            (Some(FilterExpr::And(mut items)), Some(other)) => {
                items.push(other);
                Some(FilterExpr::And(items))
            }
            (Some(left), Some(right)) => Some(FilterExpr::And(vec![left, right])),
        }
    }

    /// Total number of nodes in the tree.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            count += 1;
            match node {
                FilterExpr::And(children) | FilterExpr::Or(children) | FilterExpr::Not(children) => {
                    stack.extend(children.iter());
                }
                FilterExpr::Compare(_) => {}
            }
        }
        count
    }

    /// Every leaf comparison, in tree order.
    pub fn leaves(&self) -> Vec<&Comparison> {
        let mut leaves = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                FilterExpr::And(children) | FilterExpr::Or(children) | FilterExpr::Not(children) => {
                    stack.extend(children.iter().rev());
                }
                FilterExpr::Compare(comparison) => leaves.push(comparison),
            }
        }
        leaves
    }

    /// Structured (`$and`/`$or`/`$not`) JSON form, as accepted by the `query` parameter.
    pub fn to_json(&self) -> Value {
        match self {
            FilterExpr::And(children) => json!({ "$and": children.iter().map(Self::to_json).collect::<Vec<_>>() }),
            FilterExpr::Or(children) => json!({ "$or": children.iter().map(Self::to_json).collect::<Vec<_>>() }),
            FilterExpr::Not(children) => json!({ "$not": children.iter().map(Self::to_json).collect::<Vec<_>>() }),
            FilterExpr::Compare(comparison) => {
                let mut ops = Map::new();
                ops.insert(comparison.operator.token(), comparison.value.clone());
                let mut leaf = Map::new();
                leaf.insert(comparison.path.clone(), Value::Object(ops));
                Value::Object(leaf)
            }
        }
    }
}

impl fmt::Display for FilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operators_parse_from_suffixes_and_tokens() {
        assert_eq!(Operator::from_suffix("gte"), Some(Operator::Gte));
        assert_eq!(Operator::from_suffix("between"), None);
        assert_eq!(Operator::from_token("$like"), Some(Operator::Like));
        assert_eq!(Operator::from_token("like"), None);
        assert_eq!(Operator::Ne.token(), "$ne");
    }

    #[test]
    fn conjoin_flattens_and_nodes() {
        let left = FilterExpr::and([FilterExpr::eq("a", 1)]);
        let joined = FilterExpr::conjoin(Some(left), Some(FilterExpr::eq("b", 2))).unwrap();
        assert_eq!(joined, FilterExpr::and([FilterExpr::eq("a", 1), FilterExpr::eq("b", 2)]));
        assert_eq!(FilterExpr::conjoin(None, None), None);
    }

    #[test]
    fn node_count_includes_composites() {
        let expr = FilterExpr::or([
            FilterExpr::eq("a", 1),
            FilterExpr::not(FilterExpr::and([FilterExpr::gt("b", 2), FilterExpr::lt("b", 9)])),
        ]);
        assert_eq!(expr.node_count(), 6);
        let paths: Vec<_> = expr.leaves().iter().map(|leaf| leaf.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "b", "b"]);
    }

    #[test]
    fn to_json_uses_structured_tokens() {
        let expr = FilterExpr::and([FilterExpr::lte("album_id", 10)]);
        assert_eq!(expr.to_json(), json!({"$and": [{"album_id": {"$lte": 10}}]}));
    }
}
