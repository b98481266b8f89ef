use std::fmt;

use serde::{Deserialize, Serialize};

/// Which side failed to recognize a resource kind.
///
/// Kept distinct so the caller can back off longer while a CRD is being installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaErrorKind {
    /// The endpoint does not serve the kind (yet).
    KindNotServed,
    /// The kind cannot be resolved locally (malformed apiVersion/kind).
    KindUnrecognized,
}

impl fmt::Display for SchemaErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaErrorKind::KindNotServed => f.write_str("kind not served by endpoint"),
            SchemaErrorKind::KindUnrecognized => f.write_str("kind not recognized"),
        }
    }
}

/// Failures of one reconcile cycle. None are retried internally.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("schema ({kind}): {message}")]
    Schema { kind: SchemaErrorKind, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("policy: {0}")]
    Policy(String),
    #[error("expression: {0}")]
    Expression(String),
    #[error("not_found: {0}")]
    NotFound(String),
    /// A registration failed and undoing it failed too; both are kept.
    #[error("{original}; rollback failed: {rollback}")]
    Rollback { original: Box<Error>, rollback: Box<Error> },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn schema(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Error::Schema { kind, message: message.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Short label used for metrics and the `Synced` condition reason.
    pub fn label(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration",
            Error::Schema { .. } => "schema",
            Error::Transport(_) => "transport",
            Error::Timeout(_) => "timeout",
            Error::Policy(_) => "policy",
            Error::Expression(_) => "expression",
            Error::NotFound(_) => "not_found",
            Error::Rollback { original, .. } => original.label(),
        }
    }

    /// Prefix the message with what was being attempted.
    pub fn context(self, what: &str) -> Self {
        match self {
            Error::Configuration(m) => Error::Configuration(format!("{}: {}", what, m)),
            Error::Schema { kind, message } => Error::Schema { kind, message: format!("{}: {}", what, message) },
            Error::Transport(m) => Error::Transport(format!("{}: {}", what, m)),
            Error::Timeout(m) => Error::Timeout(format!("{}: {}", what, m)),
            Error::Policy(m) => Error::Policy(format!("{}: {}", what, m)),
            Error::Expression(m) => Error::Expression(format!("{}: {}", what, m)),
            Error::NotFound(m) => Error::NotFound(format!("{}: {}", what, m)),
            other @ Error::Rollback { .. } => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_error_keeps_both_messages() {
        let e = Error::Rollback {
            original: Box::new(Error::Timeout("waiting for cache sync".into())),
            rollback: Box::new(Error::Transport("cancel failed".into())),
        };
        let s = e.to_string();
        assert!(s.contains("waiting for cache sync"), "{s}");
        assert!(s.contains("cancel failed"), "{s}");
        assert_eq!(e.label(), "timeout");
    }

    #[test]
    fn context_preserves_variant() {
        let e = Error::NotFound("w1".into()).context("fetching observed object");
        assert!(e.is_not_found());
        assert_eq!(e.to_string(), "not_found: fetching observed object: w1");
    }
}
