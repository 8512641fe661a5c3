//! Provisioning error taxonomy.

use std::path::PathBuf;
use std::sync::Arc;

use crate::request::RequestKind;

/// Errors that terminate a provisioning run.
///
/// Every variant is terminal: the workflow never retries a stage.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum ProvisionError {
    /// The transport never reached the connected state.
    #[error("connection failed: {0}")]
    ConnectionFault(String),

    /// A topic subscription was refused or failed.
    #[error("subscribe to '{topic}' failed: {reason}")]
    SubscribeFault { topic: String, reason: String },

    /// A request could not be published.
    #[error("publish to '{topic}' failed: {reason}")]
    PublishFault { topic: String, reason: String },

    /// The service answered on the rejected topic.
    #[error("{kind} request rejected with code:'{code}' message:'{message}' status code:'{status}'")]
    RejectedByService {
        kind: RequestKind,
        code: String,
        message: String,
        status: u16,
    },

    /// No response arrived within the attempt budget.
    #[error("{kind} did not respond after {attempts} attempts")]
    Timeout { kind: RequestKind, attempts: u32 },

    /// The run was interrupted while waiting on the broker.
    #[error("{kind} wait cancelled")]
    Cancelled { kind: RequestKind },

    /// An accepted response did not carry the fields the next stage needs.
    #[error("malformed {kind} response: {reason}")]
    MalformedPayload { kind: RequestKind, reason: String },

    /// No PEM block with the expected label was found.
    #[error("no '{label}' PEM block found in response")]
    ExtractionError { label: String },

    /// Writing credential material to disk failed.
    #[error("failed to write {}: {source}", path.display())]
    PersistenceFault {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// Configuration was incomplete or unreadable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ProvisionError {
    /// Build a persistence fault from an IO error.
    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::PersistenceFault {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    /// The stable failure category for this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::ConnectionFault(_) => FailureKind::Connection,
            Self::SubscribeFault { .. } => FailureKind::Subscribe,
            Self::PublishFault { .. } => FailureKind::Publish,
            Self::RejectedByService { .. } => FailureKind::Rejected,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Cancelled { .. } => FailureKind::Cancelled,
            Self::MalformedPayload { .. } => FailureKind::Malformed,
            Self::ExtractionError { .. } => FailureKind::Extraction,
            Self::PersistenceFault { .. } => FailureKind::Persistence,
            Self::InvalidConfig(_) => FailureKind::Config,
        }
    }
}

/// Failure categories surfaced to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Config,
    Connection,
    Subscribe,
    Publish,
    Rejected,
    Timeout,
    Extraction,
    Persistence,
    Malformed,
    Cancelled,
}

impl FailureKind {
    /// Process exit code for this failure. Success exits with 0.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Config => 2,
            Self::Connection => 10,
            Self::Subscribe => 11,
            Self::Publish => 12,
            Self::Rejected => 13,
            Self::Timeout => 14,
            Self::Extraction => 15,
            Self::Persistence => 16,
            Self::Malformed => 17,
            // Conventional exit status after SIGINT.
            Self::Cancelled => 130,
        }
    }

    /// Short machine-greppable label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Connection => "connection",
            Self::Subscribe => "subscribe",
            Self::Publish => "publish",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
            Self::Extraction => "extraction",
            Self::Persistence => "persistence",
            Self::Malformed => "malformed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let kinds = [
            FailureKind::Config,
            FailureKind::Connection,
            FailureKind::Subscribe,
            FailureKind::Publish,
            FailureKind::Rejected,
            FailureKind::Timeout,
            FailureKind::Extraction,
            FailureKind::Persistence,
            FailureKind::Malformed,
            FailureKind::Cancelled,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|k| k.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
        assert!(!codes.contains(&0));
    }

    #[test]
    fn test_rejection_message_carries_details() {
        let err = ProvisionError::RejectedByService {
            kind: RequestKind::CreateKeysAndCertificate,
            code: "ResourceAlreadyExists".into(),
            message: "already exists".into(),
            status: 409,
        };
        let text = err.to_string();
        assert!(text.contains("CreateKeysAndCertificate"));
        assert!(text.contains("ResourceAlreadyExists"));
        assert!(text.contains("409"));
        assert_eq!(err.kind(), FailureKind::Rejected);
    }

    #[test]
    fn test_interrupt_is_not_a_timeout() {
        let cancelled = ProvisionError::Cancelled {
            kind: RequestKind::RegisterThing,
        };
        let timeout = ProvisionError::Timeout {
            kind: RequestKind::RegisterThing,
            attempts: 20,
        };
        assert_eq!(cancelled.kind(), FailureKind::Cancelled);
        assert_ne!(cancelled.kind().exit_code(), timeout.kind().exit_code());
        assert_eq!(cancelled.kind().exit_code(), 130);
    }

    #[test]
    fn test_persistence_fault_keeps_path() {
        let err = ProvisionError::persistence(
            "/tmp/cert.pem",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/tmp/cert.pem"));
        assert_eq!(err.kind(), FailureKind::Persistence);
    }
}
