use std::fmt;

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

/// Top-level error type returned by every engine entry point.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A query parameter could not be parsed.
    #[error("malformed query parameter `{parameter}`: {message}")]
    MalformedQuery { parameter: String, message: String },

    /// A filter, sort, field or embed path does not resolve to something queryable.
    #[error("invalid field `{path}`: {message}")]
    InvalidFilterField { path: String, message: String },

    /// The structured filter exceeded the configured node ceiling.
    #[error("query exceeds the maximum of {limit} filter nodes")]
    QueryTooComplex { limit: usize },

    /// The same relationship path was requested more than once.
    #[error("relationship `{path}` is embedded more than once")]
    DuplicateEmbed { path: String },

    /// The permission gate refused the operation.
    #[error("permission denied: cannot {action} on `{resource}`")]
    PermissionDenied { resource: String, action: String },

    /// A referenced entity (or resource) does not exist.
    #[error("`{resource}` {identity} not found")]
    NotFound { resource: String, identity: String },

    /// Validation failed for one or more fields.
    #[error("unprocessable entity")]
    UnprocessableEntity(#[from] ValidationError),

    /// The request document is structurally invalid.
    #[error("bad request: {message}")]
    BadRequest { message: String },

    #[error("method {method} not allowed on `{path}`")]
    MethodNotAllowed { method: String, path: String },

    /// A commit was rejected because of a constraint or concurrent modification.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// Schema descriptors are inconsistent.
    #[error("invalid schema for `{resource}`: {message}")]
    InvalidSchema { resource: String, message: String },

    /// The backing store failed.
    #[error("store error: {message}")]
    Store { message: String },

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Machine-readable classification of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedQuery,
    InvalidFilterField,
    QueryTooComplex,
    DuplicateEmbed,
    PermissionDenied,
    NotFound,
    UnprocessableEntity,
    BadRequest,
    MethodNotAllowed,
    Conflict,
    InvalidSchema,
    Store,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MalformedQuery => "malformed_query",
            ErrorKind::InvalidFilterField => "invalid_filter_field",
            ErrorKind::QueryTooComplex => "query_too_complex",
            ErrorKind::DuplicateEmbed => "duplicate_embed",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::NotFound => "not_found",
            ErrorKind::UnprocessableEntity => "unprocessable_entity",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::MethodNotAllowed => "method_not_allowed",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidSchema => "invalid_schema",
            ErrorKind::Store => "store",
        }
    }

    /// Suggested HTTP status for hosts that speak HTTP.
    pub fn status_hint(&self) -> u16 {
        match self {
            ErrorKind::MalformedQuery
            | ErrorKind::InvalidFilterField
            | ErrorKind::QueryTooComplex
            | ErrorKind::DuplicateEmbed
            | ErrorKind::BadRequest => 400,
            ErrorKind::PermissionDenied => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::MethodNotAllowed => 405,
            ErrorKind::Conflict => 409,
            ErrorKind::UnprocessableEntity => 422,
            ErrorKind::InvalidSchema | ErrorKind::Store => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::MalformedQuery { .. } => ErrorKind::MalformedQuery,
            EngineError::InvalidFilterField { .. } => ErrorKind::InvalidFilterField,
            EngineError::QueryTooComplex { .. } => ErrorKind::QueryTooComplex,
            EngineError::DuplicateEmbed { .. } => ErrorKind::DuplicateEmbed,
            EngineError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            EngineError::NotFound { .. } => ErrorKind::NotFound,
            EngineError::UnprocessableEntity(_) => ErrorKind::UnprocessableEntity,
            EngineError::BadRequest { .. } => ErrorKind::BadRequest,
            EngineError::MethodNotAllowed { .. } => ErrorKind::MethodNotAllowed,
            EngineError::Conflict { .. } => ErrorKind::Conflict,
            EngineError::InvalidSchema { .. } => ErrorKind::InvalidSchema,
            EngineError::Store { .. } | EngineError::Redis(_) | EngineError::Serialization(_) => ErrorKind::Store,
        }
    }

    pub fn malformed(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::MalformedQuery {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    pub fn invalid_field(path: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::InvalidFilterField {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn not_found(resource: impl Into<String>, identity: impl fmt::Display) -> Self {
        EngineError::NotFound {
            resource: resource.into(),
            identity: identity.to_string(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        EngineError::BadRequest {
            message: message.into(),
        }
    }

    pub fn denied(resource: impl Into<String>, action: impl Into<String>) -> Self {
        EngineError::PermissionDenied {
            resource: resource.into(),
            action: action.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        EngineError::Store {
            message: message.into(),
        }
    }

    /// Renders the error as a response body: `{kind, message, errors?}`.
    pub fn to_body(&self) -> Value {
        let mut body = json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        if let EngineError::UnprocessableEntity(validation) = self {
            body["errors"] = validation.to_value();
        }
        body
    }
}

/// Collection of validation issues encountered while preparing a mutation.
#[derive(Debug, Error)]
#[error("validation errors: {issues:?}")]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    pub fn new<I>(issues: I) -> Self
    where
        I: IntoIterator<Item = ValidationIssue>,
    {
        Self {
            issues: issues.into_iter().collect(),
        }
    }

    /// Convenience helper for constructing a single-field validation error.
    pub fn single(field: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new([ValidationIssue::new(field, code, message)])
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    /// Issues reported against one path.
    pub fn for_field<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a ValidationIssue> + 'a {
        self.issues.iter().filter(move |issue| issue.field == field)
    }

    /// Path-keyed detail list: `{ "tracks.0.name": [{code, message}] }`.
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        for issue in &self.issues {
            let entry = map.entry(issue.field.clone()).or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(items) = entry {
                items.push(json!({ "code": issue.code, "message": issue.message }));
            }
        }
        Value::Object(map)
    }
}

/// Detailed validation failure for a single field or logical path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub field: String,
    pub code: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

pub type ValidationResult<T> = Result<T, ValidationError>;
