//! Per-field coercion and rule checks for mutation documents.

use email_address::EmailAddress;
use regex::Regex;
use serde_json::Value;
use url::Url;
use uuid::Uuid;

use crate::errors::ValidationIssue;
use crate::types::{FieldDescriptor, FieldType, ValidationRule};

pub fn is_valid_email(value: &str) -> bool {
    EmailAddress::is_valid(value)
}

/// Absolute URLs only; `Url::parse` rejects relative references.
pub fn is_valid_url(value: &str) -> bool {
    Url::parse(value).is_ok()
}

pub fn is_valid_uuid(value: &str) -> bool {
    Uuid::parse_str(value).is_ok()
}

/// Coerces one document value and runs the field's rules on it.
///
/// `path` is the dotted document path reported with each issue. `null` is
/// accepted only for optional fields.
pub fn check_field_value(field: &FieldDescriptor, path: &str, raw: &Value) -> Result<Value, Vec<ValidationIssue>> {
    if raw.is_null() {
        return if field.optional {
            Ok(Value::Null)
        } else {
            Err(vec![ValidationIssue::new(path, "field.required", "value cannot be null")])
        };
    }
    let value = field
        .field_type
        .coerce(raw)
        .map_err(|message| vec![ValidationIssue::new(path, "field.invalid_type", message)])?;
    let issues: Vec<ValidationIssue> = field
        .validations
        .iter()
        .flat_map(|rule| violations(rule, field.field_type, &value))
        .map(|(code, message)| ValidationIssue::new(path, code, message))
        .collect();
    if issues.is_empty() { Ok(value) } else { Err(issues) }
}

/// `(code, message)` for each way `value` breaks `rule`. Rules that do not
/// apply to the value's shape are skipped.
fn violations(rule: &ValidationRule, field_type: FieldType, value: &Value) -> Vec<(&'static str, String)> {
    let text = value.as_str();
    match rule {
        ValidationRule::Length { min, max } => measure(field_type, value)
            .map(|len| bounds("validation.length", "length", len as f64, min.map(|m| m as f64), max.map(|m| m as f64)))
            .unwrap_or_default(),
        ValidationRule::Range { min, max } => numeric(value)
            .map(|number| bounds("validation.range", "value", number, *min, *max))
            .unwrap_or_default(),
        ValidationRule::Regex { pattern } => match (text, Regex::new(pattern)) {
            (None, _) => Vec::new(),
            (Some(_), Err(_)) => vec![(
                "validation.regex",
                format!("pattern {pattern} is not a valid regular expression"),
            )],
            (Some(candidate), Ok(regex)) if !regex.is_match(candidate) => {
                vec![("validation.regex", format!("value does not match pattern {pattern}"))]
            }
            (Some(_), Ok(_)) => Vec::new(),
        },
        ValidationRule::Enum {
            allowed,
            case_insensitive,
        } => {
            let accepted = |candidate: &str| {
                allowed.iter().any(|option| {
                    if *case_insensitive {
                        option.eq_ignore_ascii_case(candidate)
                    } else {
                        option == candidate
                    }
                })
            };
            match text {
                Some(candidate) if !accepted(candidate) => {
                    vec![("validation.enum", format!("value must be one of {allowed:?}"))]
                }
                _ => Vec::new(),
            }
        }
        ValidationRule::Email => failed_check(text, is_valid_email, "validation.email", "a valid email address"),
        ValidationRule::Url => failed_check(text, is_valid_url, "validation.url", "a valid URL"),
        ValidationRule::Uuid => failed_check(text, is_valid_uuid, "validation.uuid", "a valid UUID"),
    }
}

fn bounds(code: &'static str, subject: &str, actual: f64, min: Option<f64>, max: Option<f64>) -> Vec<(&'static str, String)> {
    let mut found = Vec::new();
    if let Some(min) = min
        && actual < min
    {
        found.push((code, format!("{subject} must be at least {min}")));
    }
    if let Some(max) = max
        && actual > max
    {
        found.push((code, format!("{subject} must be at most {max}")));
    }
    found
}

fn failed_check(
    text: Option<&str>,
    check: fn(&str) -> bool,
    code: &'static str,
    expected: &str,
) -> Vec<(&'static str, String)> {
    match text {
        Some(candidate) if !check(candidate) => vec![(code, format!("value must be {expected}"))],
        _ => Vec::new(),
    }
}

/// Characters for strings, elements for JSON arrays.
fn measure(field_type: FieldType, value: &Value) -> Option<usize> {
    match (field_type, value) {
        (FieldType::String | FieldType::DateTime | FieldType::Json, Value::String(text)) => Some(text.chars().count()),
        (FieldType::Json, Value::Array(items)) => Some(items.len()),
        _ => None,
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn email_validation() {
        assert!(is_valid_email("test@example.com"));
        assert!(!is_valid_email("invalid"));
    }

    #[test]
    fn url_validation() {
        assert!(is_valid_url("https://example.com"));
        assert!(!is_valid_url("not-a-url"));
    }

    #[test]
    fn uuid_validation() {
        assert!(is_valid_uuid("550e8400-e29b-41d4-a716-446655440000"));
        assert!(!is_valid_uuid("not-a-uuid"));
    }

    #[test]
    fn coercion_runs_before_rules() {
        let field = FieldDescriptor::integer("milliseconds").validate(ValidationRule::Range {
            min: Some(1.0),
            max: None,
        });
        assert_eq!(check_field_value(&field, "milliseconds", &json!("42")), Ok(json!(42)));

        let issues = check_field_value(&field, "tracks.1.milliseconds", &json!(0)).unwrap_err();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "tracks.1.milliseconds");
        assert_eq!(issues[0].code, "validation.range");

        let issues = check_field_value(&field, "milliseconds", &json!("soon")).unwrap_err();
        assert_eq!(issues[0].code, "field.invalid_type");
    }

    #[test]
    fn rules_aggregate_per_value() {
        let field = FieldDescriptor::string("email")
            .validate(ValidationRule::Length {
                min: Some(30),
                max: None,
            })
            .validate(ValidationRule::Email);
        let issues = check_field_value(&field, "email", &json!("nope")).unwrap_err();
        let codes: Vec<&str> = issues.iter().map(|issue| issue.code.as_str()).collect();
        assert_eq!(codes, ["validation.length", "validation.email"]);
    }

    #[test]
    fn nulls_need_optional_fields() {
        let required = FieldDescriptor::string("name");
        assert!(check_field_value(&required, "name", &Value::Null).is_err());
        let optional = FieldDescriptor::string("composer").optional();
        assert_eq!(check_field_value(&optional, "composer", &Value::Null), Ok(Value::Null));
    }

    #[test]
    fn enums_can_ignore_case() {
        let field = FieldDescriptor::string("media").validate(ValidationRule::Enum {
            allowed: vec!["AAC".into(), "MPEG".into()],
            case_insensitive: true,
        });
        assert!(check_field_value(&field, "media", &json!("aac")).is_ok());
        assert!(check_field_value(&field, "media", &json!("flac")).is_err());
    }
}
