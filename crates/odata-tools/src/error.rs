//! Error types for `odata-mcp-tools`.

use serde_json::{Value, json};
use thiserror::Error;

/// Metadata document could not be turned into a [`crate::model::Model`].
///
/// A parse never yields a partial model: any of these aborts the whole document.
#[derive(Error, Debug)]
pub enum ParseError {
    /// The input is not well-formed XML.
    #[error("ill-formed metadata document: {0}")]
    Xml(#[from] roxmltree::Error),

    /// The input bytes are not valid UTF-8.
    #[error("metadata document is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    /// The root element is not a versioned `Edmx` envelope, or it holds no schema.
    #[error("metadata document has no {0}")]
    MissingRoot(&'static str),

    /// A required attribute is absent.
    #[error("<{element}> in {context} is missing required attribute '{attribute}'")]
    MissingAttribute {
        element: String,
        attribute: &'static str,
        context: String,
    },

    /// An attribute is present but its value cannot be interpreted.
    #[error("<{element}> attribute '{attribute}' has invalid value '{value}'")]
    InvalidAttribute {
        element: String,
        attribute: &'static str,
        value: String,
    },

    /// A `<PropertyRef>` names a property that neither the type nor its ancestors declare.
    #[error("entity type '{entity_type}' declares key property '{property}' which does not exist")]
    UnknownKeyProperty {
        entity_type: String,
        property: String,
    },

    /// A type inherits from itself (directly or transitively).
    #[error("base type cycle detected at '{0}'")]
    BaseTypeCycle(String),

    /// Two declarations of the same kind share a qualified name.
    #[error("duplicate {kind} '{name}'")]
    DuplicateName { kind: &'static str, name: String },
}

/// The type model could not be turned into a consistent operation catalog.
#[derive(Error, Debug)]
pub enum SynthesisError {
    /// Two descriptors formed the same operation name.
    #[error("operation name '{name}' is produced by both {first} and {second}")]
    NameCollision {
        name: String,
        first: String,
        second: String,
    },

    /// An entity set (or singleton) references a type that is not in the model.
    #[error("entity set '{entity_set}' references unknown entity type '{entity_type}'")]
    MissingEntityType {
        entity_set: String,
        entity_type: String,
    },

    /// Two input parameters of one operation share a name.
    #[error("parameter '{parameter}' appears more than once in operation '{operation}'")]
    ParameterCollision { operation: String, parameter: String },

    /// The profile is internally inconsistent.
    #[error("invalid tool profile: {0}")]
    InvalidProfile(String),
}

/// A single invocation failed.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// Caller-supplied parameters do not satisfy the published input schema.
    #[error("validation error: {0}")]
    Validation(String),

    /// No service base address is available.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No operation with this name exists in the current catalog.
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    /// The remote service answered with a non-2xx status.
    #[error("upstream returned {status}: {message}")]
    Http {
        status: u16,
        message: String,
        body: Option<Value>,
    },

    /// The request never produced a response (connect, DNS, timeout at the socket level).
    #[error("transport error: {0}")]
    Transport(String),

    /// A nominally successful response carried a body that is not valid JSON.
    #[error("malformed upstream response (status {status}): {message}")]
    MalformedResponse { status: u16, message: String },

    /// The invocation was cancelled before a response arrived.
    #[error("invocation cancelled")]
    Cancelled,

    /// The outbound request was rejected by the outbound HTTP policy.
    #[error("outbound request blocked: {0}")]
    Blocked(String),

    /// The request address could not be constructed.
    #[error("invalid request URL: {0}")]
    InvalidUrl(String),
}

impl ExecutionError {
    /// Stable, machine-readable error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::Validation(_) => "validation",
            ExecutionError::Configuration(_) => "configuration",
            ExecutionError::UnknownOperation(_) => "unknown_operation",
            ExecutionError::Http { .. } => "upstream_status",
            ExecutionError::Transport(_) => "transport",
            ExecutionError::MalformedResponse { .. } => "malformed_upstream_response",
            ExecutionError::Cancelled => "cancelled",
            ExecutionError::Blocked(_) => "blocked",
            ExecutionError::InvalidUrl(_) => "invalid_url",
        }
    }

    /// Remote status code, when the failure came from an actual response.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            ExecutionError::Http { status, .. }
            | ExecutionError::MalformedResponse { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Caller-facing structured error object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut out = json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        if let Some(status) = self.status() {
            out["status"] = json!(status);
        }
        if let ExecutionError::Http {
            body: Some(body), ..
        } = self
        {
            out["body"] = body.clone();
        }
        out
    }
}

/// Main error type for OData tooling.
#[derive(Error, Debug)]
pub enum ODataToolsError {
    /// Configuration errors (invalid config, missing fields, conflicts).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Startup errors (metadata failed to load, catalog could not be built in time).
    #[error("Startup error: {0}")]
    Startup(String),

    #[error("Metadata error: failed to fetch metadata from '{url}': {message}")]
    MetadataFetch { url: String, message: String },

    #[error("Metadata error: {0}")]
    Parse(#[from] ParseError),

    #[error("Synthesis error: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for OData tooling operations.
pub type Result<T> = std::result::Result<T, ODataToolsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_value_carries_status_and_body() {
        let err = ExecutionError::Http {
            status: 404,
            message: "Resource not found".to_string(),
            body: Some(json!({"error": {"code": "NotFound"}})),
        };
        let v = err.to_value();
        assert_eq!(v["kind"], json!("upstream_status"));
        assert_eq!(v["status"], json!(404));
        assert_eq!(v["body"]["error"]["code"], json!("NotFound"));
    }

    #[test]
    fn cancelled_is_distinct_from_transport() {
        assert_eq!(ExecutionError::Cancelled.kind(), "cancelled");
        assert_eq!(ExecutionError::Transport("x".into()).kind(), "transport");
        assert!(ExecutionError::Cancelled.to_value().get("status").is_none());
    }
}
