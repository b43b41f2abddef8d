//! Structured filter syntax: `{"$and": [...], "$or": [...], "$not": ..., "<path>": literal | {"$op": literal}}`.

use serde_json::{Map, Value};

use crate::errors::EngineError;
use crate::filters::{FilterExpr, Operator};

#[derive(Clone, Copy)]
enum Combinator {
    And,
    Or,
    Not,
}

enum Task<'v> {
    /// Convert an object whose keys are combinators or paths.
    Object { object: &'v Map<String, Value>, prefix: String },
    /// Convert one `key: value` entry of such an object.
    Entry { key: &'v str, value: &'v Value, prefix: String },
    /// Pop `arity` finished children and wrap them.
    Build { combinator: Combinator, arity: usize },
}

/// Parses a JSON-encoded structured filter.
pub fn parse_structured(raw: &str, parameter: &str, max_nodes: usize) -> Result<FilterExpr, EngineError> {
    let value: Value = serde_json::from_str(raw).map_err(|err| {
        if err.to_string().contains("recursion limit") {
            EngineError::QueryTooComplex { limit: max_nodes }
        } else {
            EngineError::malformed(parameter, format!("invalid JSON: {err}"))
        }
    })?;
    structured_to_expr(&value, parameter, max_nodes)
}

/// Converts an already decoded structured filter, iteratively, failing with
/// `QueryTooComplex` as soon as more than `max_nodes` nodes are produced.
pub fn structured_to_expr(value: &Value, parameter: &str, max_nodes: usize) -> Result<FilterExpr, EngineError> {
    let Value::Object(root) = value else {
        return Err(EngineError::malformed(parameter, "structured query must be a JSON object"));
    };

    let mut nodes = 0usize;
    let mut count = |extra: usize| -> Result<(), EngineError> {
        nodes += extra;
        if nodes > max_nodes {
            Err(EngineError::QueryTooComplex { limit: max_nodes })
        } else {
            Ok(())
        }
    };

    let mut tasks = vec![Task::Object {
        object: root,
        prefix: String::new(),
    }];
    let mut output: Vec<FilterExpr> = Vec::new();

    while let Some(task) = tasks.pop() {
        match task {
            Task::Object { object, prefix } => {
                if object.is_empty() {
                    let at = prefix.trim_end_matches('.');
                    let at = if at.is_empty() { parameter } else { at };
                    return Err(EngineError::malformed(at, "empty filter object"));
                }
                if object.len() > 1 {
                    count(1)?;
                    tasks.push(Task::Build {
                        combinator: Combinator::And,
                        arity: object.len(),
                    });
                }
                for (key, value) in object.iter().rev() {
                    tasks.push(Task::Entry {
                        key,
                        value,
                        prefix: prefix.clone(),
                    });
                }
            }
            Task::Entry { key, value, prefix } => match key {
                "$and" | "$or" => {
                    let Value::Array(children) = value else {
                        return Err(EngineError::malformed(parameter, format!("{key} expects an array")));
                    };
                    count(1)?;
                    let combinator = if key == "$and" { Combinator::And } else { Combinator::Or };
                    tasks.push(Task::Build {
                        combinator,
                        arity: children.len(),
                    });
                    push_children(&mut tasks, children, &prefix, parameter, key)?;
                }
                "$not" => {
                    count(1)?;
                    match value {
                        Value::Array(children) => {
                            tasks.push(Task::Build {
                                combinator: Combinator::Not,
                                arity: children.len(),
                            });
                            push_children(&mut tasks, children, &prefix, parameter, key)?;
                        }
                        Value::Object(object) => {
                            tasks.push(Task::Build {
                                combinator: Combinator::Not,
                                arity: 1,
                            });
                            tasks.push(Task::Object {
                                object,
                                prefix: prefix.clone(),
                            });
                        }
                        _ => return Err(EngineError::malformed(parameter, "$not expects an object or array")),
                    }
                }
                token if token.starts_with('$') => {
                    return Err(EngineError::malformed(parameter, format!("unknown operator `{token}`")));
                }
                path => {
                    let path = format!("{prefix}{path}");
                    match value {
                        Value::Object(object) if is_operator_map(object) => {
                            if object.len() > 1 {
                                count(1)?;
                            }
                            let mut leaves = Vec::with_capacity(object.len());
                            for (token, literal) in object {
                                let operator = Operator::from_token(token).ok_or_else(|| {
                                    EngineError::malformed(&path, format!("unknown operator `{token}`"))
                                })?;
                                leaves.push(leaf(&path, operator, literal)?);
                                count(1)?;
                            }
                            output.push(if leaves.len() == 1 {
                                leaves.remove(0)
                            } else {
                                FilterExpr::And(leaves)
                            });
                        }
                        Value::Object(object) if is_nested_scope(object) => {
                            tasks.push(Task::Object {
                                object,
                                prefix: format!("{path}."),
                            });
                        }
                        Value::Object(object) if object.is_empty() => {
                            return Err(EngineError::malformed(&path, "empty filter object"));
                        }
                        Value::Object(_) => {
                            return Err(EngineError::malformed(&path, "cannot mix operators and nested fields"));
                        }
                        literal => {
                            output.push(leaf(&path, Operator::Eq, literal)?);
                            count(1)?;
                        }
                    }
                }
            },
            Task::Build { combinator, arity } => {
                let children = output.split_off(output.len().saturating_sub(arity));
                output.push(match combinator {
                    Combinator::And => FilterExpr::And(children),
                    Combinator::Or => FilterExpr::Or(children),
                    Combinator::Not => FilterExpr::Not(children),
                });
            }
        }
    }

    match (output.pop(), output.is_empty()) {
        (Some(expr), true) => Ok(expr),
        _ => Err(EngineError::malformed(parameter, "unbalanced structured query")),
    }
}

fn is_combinator(key: &str) -> bool {
    matches!(key, "$and" | "$or" | "$not")
}

/// `{"$gt": 1, "$lte": 5}`: comparison tokens only.
fn is_operator_map(object: &Map<String, Value>) -> bool {
    !object.is_empty() && object.keys().all(|k| k.starts_with('$') && !is_combinator(k))
}

/// `{"name": "x", "$or": [...]}`: paths relative to the enclosing key.
fn is_nested_scope(object: &Map<String, Value>) -> bool {
    !object.is_empty() && object.keys().all(|k| !k.starts_with('$') || is_combinator(k))
}

fn push_children<'v>(
    tasks: &mut Vec<Task<'v>>,
    children: &'v [Value],
    prefix: &str,
    parameter: &str,
    key: &str,
) -> Result<(), EngineError> {
    for child in children.iter().rev() {
        let Value::Object(object) = child else {
            return Err(EngineError::malformed(parameter, format!("{key} children must be objects")));
        };
        tasks.push(Task::Object {
            object,
            prefix: prefix.to_string(),
        });
    }
    Ok(())
}

fn leaf(path: &str, operator: Operator, literal: &Value) -> Result<FilterExpr, EngineError> {
    if literal.is_array() || literal.is_object() {
        return Err(EngineError::malformed(path, "comparison values must be scalars"));
    }
    Ok(FilterExpr::compare(path, operator, literal.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> Result<FilterExpr, EngineError> {
        structured_to_expr(&value, "query", 100)
    }

    #[test]
    fn literals_are_equality_and_tokens_map_to_operators() {
        let expr = parse(json!({"album_id": {"$gt": 8, "$lte": 10}})).unwrap();
        assert_eq!(expr, FilterExpr::and([FilterExpr::gt("album_id", 8), FilterExpr::lte("album_id", 10)]));
        assert_eq!(parse(json!({"title": "X"})).unwrap(), FilterExpr::eq("title", "X"));
    }

    #[test]
    fn combinators_preserve_child_order() {
        let expr = parse(json!({"$or": [{"a": 1}, {"$not": {"b": 2}}, {"$and": [{"c": 3}, {"d": 4}]}]})).unwrap();
        assert_eq!(
            expr,
            FilterExpr::or([
                FilterExpr::eq("a", 1),
                FilterExpr::Not(vec![FilterExpr::eq("b", 2)]),
                FilterExpr::and([FilterExpr::eq("c", 3), FilterExpr::eq("d", 4)]),
            ])
        );
    }

    #[test]
    fn nested_objects_prefix_paths() {
        let expr = parse(json!({"artist": {"name": {"$like": "AC%"}}})).unwrap();
        assert_eq!(expr, FilterExpr::like("artist.name", "AC%"));
        let nested = parse(json!({"tracks": {"$or": [{"name": "A"}, {"name": "B"}]}})).unwrap();
        assert_eq!(
            nested,
            FilterExpr::or([FilterExpr::eq("tracks.name", "A"), FilterExpr::eq("tracks.name", "B")])
        );
    }

    #[test]
    fn malformed_shapes_are_rejected() {
        for bad in [
            json!([]),
            json!({}),
            json!({"tracks": {}}),
            json!({"a": {"$between": 1}}),
            json!({"$xor": []}),
            json!({"$and": {"a": 1}}),
            json!({"a": [1, 2]}),
            json!({"a": {"$gt": 1, "b": 2}}),
        ] {
            let err = parse(bad.clone()).unwrap_err();
            assert!(matches!(err, EngineError::MalformedQuery { .. }), "{bad}: {err:?}");
        }
    }

    #[test]
    fn node_ceiling_is_enforced() {
        let children: Vec<Value> = (0..120).map(|i| json!({"album_id": i})).collect();
        let err = parse(json!({"$or": children})).unwrap_err();
        assert!(matches!(err, EngineError::QueryTooComplex { limit: 100 }));

        let mut deep = json!({"album_id": 1});
        for _ in 0..200 {
            deep = json!({"$not": deep});
        }
        let err = structured_to_expr(&deep, "query", 100).unwrap_err();
        assert!(matches!(err, EngineError::QueryTooComplex { .. }));
    }

    #[test]
    fn deeply_nested_json_text_is_too_complex() {
        let raw = format!("{}{}", "{\"$not\":".repeat(300), "}".repeat(300));
        let err = parse_structured(&raw, "query", 100).unwrap_err();
        assert!(matches!(err, EngineError::QueryTooComplex { .. }));
    }
}
