//! Rich diagnostic error types for kg-loom.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text so callers know whether a failure is
//! worth retrying later, a configuration defect, or a caller-side bug.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for kg-loom.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text) through to the user.
#[derive(Debug, Error, Diagnostic)]
pub enum LoomError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Convenience alias for results across the crate.
pub type LoomResult<T> = std::result::Result<T, LoomError>;

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("no usable credentials: the key list is empty after trimming blanks")]
    #[diagnostic(
        code(loom::config::empty_credentials),
        help(
            "Provide at least one non-blank key in `[llm] api_key` \
             or set KG_LOOM_API_KEYS to a comma-separated list."
        )
    )]
    EmptyCredentials,

    #[error("failed to read config file: {path}")]
    #[diagnostic(
        code(loom::config::read),
        help("Ensure the config file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    #[diagnostic(
        code(loom::config::parse),
        help("Check the TOML syntax and the field types in the config file.")
    )]
    Parse { path: String, message: String },

    #[error("invalid configuration: {message}")]
    #[diagnostic(code(loom::config::invalid))]
    Invalid { message: String },
}

// ---------------------------------------------------------------------------
// Gateway errors (terminal outcomes of one logical remote call)
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum GatewayError {
    #[error("all credentials exhausted after {attempts} attempts (rate limited)")]
    #[diagnostic(
        code(loom::gateway::all_keys_exhausted),
        help(
            "Every key is cooling down after rate limiting. Try again later, \
             add more keys, or lower the request rate."
        )
    )]
    AllKeysExhausted { attempts: u32 },

    #[error("upstream unavailable after {attempts} attempts (last status {status})")]
    #[diagnostic(
        code(loom::gateway::upstream_unavailable),
        help("The completion endpoint kept returning server errors. Try again later.")
    )]
    UpstreamUnavailable {
        attempts: u32,
        status: u16,
        body: String,
    },

    #[error("request rejected with status {status}: {body}")]
    #[diagnostic(
        code(loom::gateway::request_rejected),
        help(
            "The endpoint refused the request shape. Check the model name, \
             base URL, credentials and sampling parameters; retrying will not help."
        )
    )]
    RequestRejected { status: u16, body: String },

    #[error("transport failure after {attempts} attempts: {message}")]
    #[diagnostic(
        code(loom::gateway::transport),
        help("Check network connectivity and the configured base URL and timeout.")
    )]
    TransportError { attempts: u32, message: String },

    #[error("malformed response after {attempts} attempts: {message}")]
    #[diagnostic(
        code(loom::gateway::malformed_response),
        help(
            "The endpoint answered 200 but without `choices[0].message.content` \
             (or `.text`). Check that the base URL speaks the chat-completions envelope."
        )
    )]
    MalformedResponse { attempts: u32, message: String },

    #[error("call cancelled after {attempts} attempts")]
    #[diagnostic(code(loom::gateway::cancelled))]
    Cancelled { attempts: u32 },

    #[error("failed to encode request payload: {message}")]
    #[diagnostic(code(loom::gateway::serialize))]
    Serialize { message: String },
}

impl GatewayError {
    /// Short, stable name of the error kind, used in logs and batch reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AllKeysExhausted { .. } => "all_keys_exhausted",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::RequestRejected { .. } => "request_rejected",
            Self::TransportError { .. } => "transport_error",
            Self::MalformedResponse { .. } => "malformed_response",
            Self::Cancelled { .. } => "cancelled",
            Self::Serialize { .. } => "serialize",
        }
    }
}

/// Result type for gateway operations.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

// ---------------------------------------------------------------------------
// Graph errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("invalid node identifier \"{raw}\": label is empty")]
    #[diagnostic(
        code(loom::graph::invalid_node),
        help("Node identifiers have the form NAMESPACE|label with a non-empty label.")
    )]
    InvalidNode { raw: String },

    #[error("triple field `{field}` is empty")]
    #[diagnostic(
        code(loom::graph::empty_field),
        help("Every triple needs a non-empty subject, predicate and object.")
    )]
    EmptyField { field: &'static str },
}

/// Result type for graph operations.
pub type GraphResult<T> = std::result::Result<T, GraphError>;

// ---------------------------------------------------------------------------
// Checkpoint errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointError {
    #[error("failed to write checkpoint: {path}")]
    #[diagnostic(
        code(loom::checkpoint::io),
        help("Check that the output directory exists and is writable.")
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize checkpoint: {message}")]
    #[diagnostic(code(loom::checkpoint::serialize))]
    Serialize { message: String },

    #[error("failed to parse triples file {path}: {message}")]
    #[diagnostic(
        code(loom::checkpoint::parse),
        help("The file must hold a JSON array of triple records.")
    )]
    Parse { path: String, message: String },
}

/// Result type for checkpoint and triple-file I/O.
pub type CheckpointResult<T> = std::result::Result<T, CheckpointError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_kind_names_are_stable() {
        assert_eq!(
            GatewayError::AllKeysExhausted { attempts: 3 }.kind(),
            "all_keys_exhausted"
        );
        assert_eq!(
            GatewayError::RequestRejected {
                status: 400,
                body: String::new()
            }
            .kind(),
            "request_rejected"
        );
    }

    #[test]
    fn top_level_wraps_transparently() {
        let err: LoomError = ConfigError::EmptyCredentials.into();
        assert!(err.to_string().contains("no usable credentials"));
        assert_eq!(
            err.code().map(|c| c.to_string()).as_deref(),
            Some("loom::config::empty_credentials")
        );
    }
}
