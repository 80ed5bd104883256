use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// GraphQlError
// ---------------------------------------------------------------------------

/// A single error entry from a GraphQL response's `errors` array.
///
/// These arrive inside an otherwise-successful transport response and are
/// handled per [`ErrorPolicy`](crate::types::ErrorPolicy) — they are data,
/// not a failure of the transport itself.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GraphQlError {
    pub message: String,
    /// Response path the error applies to, if the server reported one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<serde_json::Value>,
}

impl GraphQlError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: Vec::new(),
            extensions: None,
        }
    }
}

impl fmt::Display for GraphQlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} (at {})", self.message, self.path.join("."))
        }
    }
}

impl std::error::Error for GraphQlError {}

// ---------------------------------------------------------------------------
// UsageError
// ---------------------------------------------------------------------------

/// Invalid options passed by the caller. These fail synchronously, before
/// any network or cache work starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("Operation requires a document")]
    MissingDocument,

    #[error("Expected a {expected} document, received a {received} document")]
    WrongDocumentKind {
        expected: &'static str,
        received: &'static str,
    },

    #[error("Fetch policy \"{policy}\" is not supported by {operation}")]
    UnsupportedFetchPolicy {
        policy: &'static str,
        operation: &'static str,
    },

    #[error("Option \"{option}\" is not supported by {operation}")]
    UnsupportedOption {
        option: &'static str,
        operation: &'static str,
    },
}

// ---------------------------------------------------------------------------
// ClientError — top-level rollup
// ---------------------------------------------------------------------------

/// The crate-wide error type, distinguishing network-origin failures from
/// GraphQL-origin ones and from lifecycle aborts.
///
/// `Clone` throughout: errors are replayed to late subscribers of shared
/// in-flight streams, so they are stored by value (message strings, not
/// boxed sources).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("GraphQL error response: {}", format_graphql_errors(.0))]
    GraphQl(Vec<GraphQlError>),

    #[error("Store reset while operation was in flight")]
    StoreReset,

    #[error("QueryManager stopped while operation was in flight")]
    Stopped,
}

impl ClientError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// The GraphQL errors carried by this error, if it is GraphQL-origin.
    pub fn graphql_errors(&self) -> &[GraphQlError] {
        match self {
            Self::GraphQl(errors) => errors,
            _ => &[],
        }
    }
}

fn format_graphql_errors(errors: &[GraphQlError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convenience alias — the default error type is `ClientError`.
pub type Result<T, E = ClientError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
