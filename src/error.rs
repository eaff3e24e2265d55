//! Error taxonomy shared by the explorer, the server lifecycle and the MCP surface.
//!
//! Every variant renders as a short, user-facing message naming the action and
//! the connection or collection involved. The underlying cause (if any) is kept
//! as an `anyhow::Error` source so logs can still show the full chain.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExplorerError {
    /// Malformed connection URI or mutation input. Rejected before any I/O.
    #[error("{0}")]
    Validation(String),

    /// The database behind a connection could not be reached or authenticated.
    #[error("Failed to connect to MongoDB '{connection}'.")]
    Connection {
        connection: String,
        #[source]
        source: anyhow::Error,
    },

    /// Enumerating a database or collection failed mid-inspection.
    #[error("Failed to read '{target}' from '{connection}'.")]
    Fetch {
        connection: String,
        target: String,
        #[source]
        source: anyhow::Error,
    },

    /// A write command failed. The cached tree is left untouched.
    #[error("Could not {action} on '{connection}'.")]
    Mutation {
        connection: String,
        action: String,
        #[source]
        source: anyhow::Error,
    },

    /// The ephemeral server failed to start or stop.
    #[error("Mongo server failed to {action}.")]
    Lifecycle {
        action: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// A connection or tree node could not be resolved.
    #[error("{0}")]
    NotFound(String),

    /// The node does not carry the requested command.
    #[error("'{node}' does not support {command}")]
    Unsupported { node: String, command: String },
}

impl ExplorerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn connection(connection: &str, source: anyhow::Error) -> Self {
        Self::Connection {
            connection: connection.to_string(),
            source,
        }
    }

    pub fn fetch(connection: &str, target: &str, source: anyhow::Error) -> Self {
        Self::Fetch {
            connection: connection.to_string(),
            target: target.to_string(),
            source,
        }
    }

    pub fn mutation(connection: &str, action: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Mutation {
            connection: connection.to_string(),
            action: action.into(),
            source,
        }
    }

    /// True for errors caused by the caller's input rather than by I/O.
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::NotFound(_) | Self::Unsupported { .. }
        )
    }

    /// Message plus the full cause chain, for logs and protocol error payloads.
    pub fn detailed(&self) -> String {
        let mut msg = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            msg.push_str(": ");
            msg.push_str(&cause.to_string());
            source = cause.source();
        }
        msg
    }
}

pub type ExplorerResult<T> = std::result::Result<T, ExplorerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_target() {
        let err = ExplorerError::connection("A", anyhow::anyhow!("refused"));
        assert_eq!(err.to_string(), "Failed to connect to MongoDB 'A'.");

        let err = ExplorerError::mutation("A", "insert the document", anyhow::anyhow!("dup key"));
        assert_eq!(err.to_string(), "Could not insert the document on 'A'.");
    }

    #[test]
    fn test_detailed_includes_cause_chain() {
        let cause = anyhow::anyhow!("socket closed").context("ping failed");
        let err = ExplorerError::connection("A", cause);
        let detailed = err.detailed();
        assert!(detailed.starts_with("Failed to connect to MongoDB 'A'."));
        assert!(detailed.contains("ping failed"));
        assert!(detailed.contains("socket closed"));
    }

    #[test]
    fn test_client_errors() {
        assert!(ExplorerError::validation("bad").is_client_error());
        assert!(ExplorerError::NotFound("x".to_string()).is_client_error());
        assert!(!ExplorerError::connection("A", anyhow::anyhow!("x")).is_client_error());
    }
}
