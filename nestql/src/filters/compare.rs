use std::cmp::Ordering;

use regex::Regex;
use serde_json::Value;

use crate::filters::Operator;
use crate::types::{FieldType, parse_datetime};

/// Orders two JSON scalars of the same kind. Mixed kinds (and nulls) are incomparable.
pub fn compare_values(left: &Value, right: &Value, field_type: FieldType) -> Option<Ordering> {
    if field_type == FieldType::DateTime
        && let (Some(l), Some(r)) = (left.as_str(), right.as_str())
        && let (Some(l), Some(r)) = (parse_datetime(l), parse_datetime(r))
    {
        return Some(l.cmp(&r));
    }
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => match (l.as_i64(), r.as_i64()) {
            (Some(l), Some(r)) => Some(l.cmp(&r)),
            _ => l.as_f64()?.partial_cmp(&r.as_f64()?),
        },
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

/// Translates a SQL `LIKE` pattern (`%` any run, `_` any char) into an anchored regex.
pub fn like_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut translated = String::with_capacity(pattern.len() + 8);
    translated.push_str("(?s)^");
    let mut escaped = false;
    for ch in pattern.chars() {
        if escaped {
            translated.push_str(&regex::escape(&ch.to_string()));
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '%' => translated.push_str(".*"),
            '_' => translated.push('.'),
            other => translated.push_str(&regex::escape(&other.to_string())),
        }
    }
    if escaped {
        translated.push_str(&regex::escape("\\"));
    }
    translated.push('$');
    Regex::new(&translated)
}

/// Evaluates `stored operator expected` with SQL-style null handling:
/// `eq null` / `ne null` test presence, every other comparison against null is false.
pub fn matches(
    operator: Operator,
    stored: Option<&Value>,
    expected: &Value,
    field_type: FieldType,
    pattern: Option<&Regex>,
) -> bool {
    let stored = stored.unwrap_or(&Value::Null);
    if expected.is_null() {
        return match operator {
            Operator::Eq => stored.is_null(),
            Operator::Ne => !stored.is_null(),
            _ => false,
        };
    }
    if stored.is_null() {
        return false;
    }
    match operator {
        Operator::Like => match (stored.as_str(), pattern) {
            (Some(text), Some(regex)) => regex.is_match(text),
            _ => false,
        },
        Operator::Eq => compare_values(stored, expected, field_type) == Some(Ordering::Equal),
        Operator::Ne => compare_values(stored, expected, field_type) != Some(Ordering::Equal),
        Operator::Gt => compare_values(stored, expected, field_type) == Some(Ordering::Greater),
        Operator::Gte => matches!(
            compare_values(stored, expected, field_type),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::Lt => compare_values(stored, expected, field_type) == Some(Ordering::Less),
        Operator::Lte => matches!(
            compare_values(stored, expected, field_type),
            Some(Ordering::Less | Ordering::Equal)
        ),
    }
}
