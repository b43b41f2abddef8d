use std::fmt;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// A stored row, keyed by storage (data-key) names.
pub type Record = Map<String, Value>;

/// Describes one exposed resource type: its fields, relationships and identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Resource name; doubles as the route segment.
    pub name: String,
    /// API names of the identity fields, in key order.
    pub identity: Vec<String>,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
    #[serde(default)]
    pub relationships: Vec<RelationshipDescriptor>,
    /// Largest page a client may request; also the default page size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_max_size: Option<u64>,
}

impl ResourceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn identity<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.identity = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn relationship(mut self, relationship: RelationshipDescriptor) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn page_max_size(mut self, size: u64) -> Self {
        self.page_max_size = Some(size);
        self
    }

    pub fn find_field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn find_field_by_key(&self, key: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| field.storage_key() == key)
    }

    pub fn find_relationship(&self, name: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.iter().find(|relationship| relationship.name == name)
    }

    pub fn identity_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.identity.iter().filter_map(|name| self.find_field(name))
    }

    pub fn is_identity(&self, name: &str) -> bool {
        self.identity.iter().any(|id| id == name)
    }

    /// Identity of a stored record, if every identity column is set.
    pub fn identity_of(&self, record: &Record) -> Option<Identity> {
        let mut values = Vec::with_capacity(self.identity.len());
        for field in self.identity_fields() {
            match record.get(field.storage_key()) {
                Some(Value::Null) | None => return None,
                Some(value) => values.push(value.clone()),
            }
        }
        Some(Identity(values))
    }

    /// Identity named by an input document (API names), coerced to field types.
    /// `None` when any identity field is absent or fails coercion.
    pub fn identity_in_document(&self, document: &Map<String, Value>) -> Option<Identity> {
        let mut values = Vec::with_capacity(self.identity.len());
        for field in self.identity_fields() {
            let raw = document.get(&field.name)?;
            if raw.is_null() {
                return None;
            }
            values.push(field.field_type.coerce(raw).ok()?);
        }
        Some(Identity(values))
    }

    /// Parses identity path segments (one per identity field).
    pub fn parse_identity(&self, segments: &[&str]) -> Option<Identity> {
        if segments.len() != self.identity.len() {
            return None;
        }
        let mut values = Vec::with_capacity(segments.len());
        for (field, raw) in self.identity_fields().zip(segments) {
            values.push(field.field_type.coerce(&Value::String((*raw).to_string())).ok()?);
        }
        Some(Identity(values))
    }
}

/// Exposed scalar attribute of a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    /// Storage attribute name when it differs from the API name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_key: Option<String>,
    #[serde(default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub read_only: bool,
    /// Accepted on input, never rendered, never filterable.
    #[serde(default)]
    pub write_only: bool,
    #[serde(default = "default_true")]
    pub queryable: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub optional: bool,
    /// Value is assigned by the store on create.
    #[serde(default)]
    pub generated: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validations: Vec<ValidationRule>,
}

fn default_true() -> bool {
    true
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            data_key: None,
            field_type,
            read_only: false,
            write_only: false,
            queryable: true,
            hidden: false,
            optional: false,
            generated: false,
            validations: Vec::new(),
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Integer)
    }

    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Number)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::Boolean)
    }

    pub fn datetime(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::DateTime)
    }

    pub fn data_key(mut self, key: impl Into<String>) -> Self {
        self.data_key = Some(key.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn write_only(mut self) -> Self {
        self.write_only = true;
        self.queryable = false;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn not_queryable(mut self) -> Self {
        self.queryable = false;
        self
    }

    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    pub fn validate(mut self, rule: ValidationRule) -> Self {
        self.validations.push(rule);
        self
    }

    pub fn storage_key(&self) -> &str {
        self.data_key.as_deref().unwrap_or(&self.name)
    }

    pub fn is_rendered(&self) -> bool {
        !self.hidden && !self.write_only
    }

    /// Must be supplied when creating, or when replacing with PUT.
    pub fn required_on_input(&self) -> bool {
        !self.optional && !self.read_only && !self.generated
    }

    pub fn is_filterable(&self) -> bool {
        self.queryable && !self.write_only
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    String,
    Integer,
    Number,
    Boolean,
    DateTime,
    Json,
}

impl FieldType {
    /// Converts an input value to this type's canonical JSON form.
    ///
    /// Strings are accepted for every scalar type so flat query parameters and
    /// route segments can be coerced the same way as document values.
    pub fn coerce(&self, value: &Value) -> Result<Value, String> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match self {
            FieldType::Json => Ok(value.clone()),
            FieldType::String => match value {
                Value::String(_) => Ok(value.clone()),
                _ => Err("expected a string".to_string()),
            },
            FieldType::Integer => match value {
                Value::Number(number) => {
                    if let Some(int) = number.as_i64() {
                        Ok(Value::from(int))
                    } else {
                        match number.as_f64() {
                            Some(float) if float.fract() == 0.0 && float.abs() < i64::MAX as f64 => {
                                Ok(Value::from(float as i64))
                            }
                            _ => Err("expected an integer".to_string()),
                        }
                    }
                }
                Value::String(raw) => raw
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| format!("`{raw}` is not an integer")),
                _ => Err("expected an integer".to_string()),
            },
            FieldType::Number => match value {
                Value::Number(_) => Ok(value.clone()),
                Value::String(raw) => raw
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| format!("`{raw}` is not a number")),
                _ => Err("expected a number".to_string()),
            },
            FieldType::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                Value::String(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" => Ok(Value::Bool(true)),
                    "false" | "0" => Ok(Value::Bool(false)),
                    _ => Err(format!("`{raw}` is not a boolean")),
                },
                _ => Err("expected a boolean".to_string()),
            },
            FieldType::DateTime => match value {
                Value::String(raw) => parse_datetime(raw)
                    .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
                    .ok_or_else(|| format!("`{raw}` is not an RFC 3339 datetime")),
                _ => Err("expected a datetime string".to_string()),
            },
        }
    }
}

/// Parses RFC 3339 timestamps and bare `YYYY-MM-DD` dates (midnight UTC).
pub fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ValidationRule {
    Length {
        min: Option<usize>,
        max: Option<usize>,
    },
    Range {
        min: Option<f64>,
        max: Option<f64>,
    },
    Regex {
        pattern: String,
    },
    Enum {
        allowed: Vec<String>,
        #[serde(default)]
        case_insensitive: bool,
    },
    Email,
    Url,
    Uuid,
}

/// Relationship between two resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipDescriptor {
    pub name: String,
    /// Name of the target resource, resolved through the registry.
    pub target: String,
    pub cardinality: Cardinality,
    pub join: Join,
    /// Name of the inverse relationship on the target, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub back_populates: Option<String>,
    #[serde(default)]
    pub cascade: CascadePolicy,
    #[serde(default)]
    pub read_only: bool,
}

impl RelationshipDescriptor {
    fn with(name: impl Into<String>, target: impl Into<String>, cardinality: Cardinality, join: Join) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            cardinality,
            join,
            back_populates: None,
            cascade: CascadePolicy::Detach,
            read_only: false,
        }
    }

    /// This resource stores `local` columns referencing the target's `remote` columns.
    pub fn many_to_one(name: impl Into<String>, target: impl Into<String>, local: &[&str], remote: &[&str]) -> Self {
        Self::with(name, target, Cardinality::ManyToOne, Join::foreign_key(local, remote))
    }

    /// The target stores `remote` columns referencing this resource's `local` columns.
    pub fn one_to_many(name: impl Into<String>, target: impl Into<String>, local: &[&str], remote: &[&str]) -> Self {
        Self::with(name, target, Cardinality::OneToMany, Join::reverse(local, remote))
    }

    pub fn one_to_one(name: impl Into<String>, target: impl Into<String>, local: &[&str], remote: &[&str]) -> Self {
        Self::with(name, target, Cardinality::OneToOne, Join::reverse(local, remote))
    }

    pub fn many_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        table: impl Into<String>,
        local: impl Into<String>,
        remote: impl Into<String>,
    ) -> Self {
        Self::with(
            name,
            target,
            Cardinality::ManyToMany,
            Join::Association {
                table: table.into(),
                local: local.into(),
                remote: remote.into(),
            },
        )
    }

    pub fn back_populates(mut self, inverse: impl Into<String>) -> Self {
        self.back_populates = Some(inverse.into());
        self
    }

    pub fn cascade(mut self, policy: CascadePolicy) -> Self {
        self.cascade = policy;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn is_many(&self) -> bool {
        matches!(self.cardinality, Cardinality::OneToMany | Cardinality::ManyToMany)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    ManyToOne,
    OneToOne,
    OneToMany,
    ManyToMany,
}

/// How membership of a relationship is stored. Column names are storage keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Join {
    /// This resource's `local` columns hold the target's `remote` columns.
    ForeignKey { local: Vec<String>, remote: Vec<String> },
    /// The target's `remote` columns hold this resource's `local` columns.
    Reverse { local: Vec<String>, remote: Vec<String> },
    /// Rows in `table` pair this resource's identity key (`local`) with the target's (`remote`).
    Association { table: String, local: String, remote: String },
}

impl Join {
    fn foreign_key(local: &[&str], remote: &[&str]) -> Self {
        Join::ForeignKey {
            local: local.iter().map(|s| s.to_string()).collect(),
            remote: remote.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn reverse(local: &[&str], remote: &[&str]) -> Self {
        Join::Reverse {
            local: local.iter().map(|s| s.to_string()).collect(),
            remote: remote.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// What the store does with a member detached from a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadePolicy {
    /// Delete the detached member.
    Delete,
    /// Clear the link and keep the member.
    #[default]
    Detach,
}

/// Ordered identity values of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity(pub Vec<Value>);

impl Identity {
    pub fn single(value: impl Into<Value>) -> Self {
        Identity(vec![value.into()])
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Canonical key string, components joined with `/`.
    pub fn key(&self) -> String {
        self.0.iter().map(component_key).collect::<Vec<_>>().join("/")
    }

    /// Identity fields as an API-named document.
    pub fn to_document(&self, descriptor: &ResourceDescriptor) -> Map<String, Value> {
        descriptor.identity.iter().cloned().zip(self.0.iter().cloned()).collect()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

pub(crate) fn component_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub order: SortOrder,
}

impl SortSpec {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Desc,
        }
    }

    /// Parses `name,-title` into ascending `name`, descending `title`.
    pub fn parse_list(raw: &str) -> Vec<SortSpec> {
        raw.split(',')
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(|segment| match segment.strip_prefix('-') {
                Some(field) => SortSpec::desc(field.trim()),
                None => SortSpec::asc(segment.strip_prefix('+').unwrap_or(segment)),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn coerces_query_strings_to_field_types() {
        assert_eq!(FieldType::Integer.coerce(&json!("10")).unwrap(), json!(10));
        assert_eq!(FieldType::Integer.coerce(&json!(4.0)).unwrap(), json!(4));
        assert!(FieldType::Integer.coerce(&json!("ten")).is_err());
        assert_eq!(FieldType::Boolean.coerce(&json!("TRUE")).unwrap(), json!(true));
        assert_eq!(FieldType::Number.coerce(&json!("0.99")).unwrap(), json!(0.99));
        assert!(FieldType::String.coerce(&json!(5)).is_err());
        assert_eq!(FieldType::String.coerce(&Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn datetimes_normalize_to_utc() {
        let coerced = FieldType::DateTime.coerce(&json!("2024-03-01T10:00:00+02:00")).unwrap();
        assert_eq!(coerced, json!("2024-03-01T08:00:00Z"));
        let date_only = FieldType::DateTime.coerce(&json!("2024-03-01")).unwrap();
        assert_eq!(date_only, json!("2024-03-01T00:00:00Z"));
    }

    #[test]
    fn identity_keys_join_components() {
        let identity = Identity(vec![json!(3), json!("abc")]);
        assert_eq!(identity.key(), "3/abc");
        assert_eq!(Identity::single(7).to_string(), "7");
    }

    #[test]
    fn identity_from_document_requires_every_field() {
        let descriptor = ResourceDescriptor::new("lines")
            .identity(["invoice_id", "line"])
            .field(FieldDescriptor::integer("invoice_id"))
            .field(FieldDescriptor::integer("line"));
        let full = json!({"invoice_id": "4", "line": 2});
        let partial = json!({"invoice_id": 4});
        assert_eq!(
            descriptor.identity_in_document(full.as_object().unwrap()),
            Some(Identity(vec![json!(4), json!(2)]))
        );
        assert_eq!(descriptor.identity_in_document(partial.as_object().unwrap()), None);
        assert_eq!(
            descriptor.parse_identity(&["4", "2"]),
            Some(Identity(vec![json!(4), json!(2)]))
        );
        assert_eq!(descriptor.parse_identity(&["4"]), None);
    }

    #[test]
    fn parse_sort_list_handles_direction_prefixes() {
        let sorts = SortSpec::parse_list("track_id, -name,+title");
        assert_eq!(
            sorts,
            vec![SortSpec::asc("track_id"), SortSpec::desc("name"), SortSpec::asc("title")]
        );
    }

    #[test]
    fn descriptors_deserialize_with_defaults() {
        let descriptor: ResourceDescriptor = serde_json::from_value(json!({
            "name": "artists",
            "identity": ["artist_id"],
            "fields": [
                {"name": "artist_id", "field_type": "integer", "generated": true},
                {"name": "name", "data_key": "Name", "validations": [{"rule": "length", "min": 1, "max": 120}]}
            ],
            "relationships": [{
                "name": "albums", "target": "albums", "cardinality": "one_to_many",
                "join": {"kind": "reverse", "local": ["artist_id"], "remote": ["artist_id"]}
            }]
        }))
        .unwrap();
        let name = descriptor.find_field("name").unwrap();
        assert_eq!(name.storage_key(), "Name");
        assert!(name.queryable);
        assert!(descriptor.find_relationship("albums").unwrap().is_many());
    }
}
