//! Error taxonomy shared by every layer of the client.

use thiserror::Error;

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A mapping, registry, or parameter problem the caller must fix.
    #[error("configuration error: {reason}")]
    Config {
        /// What is misconfigured.
        reason: String,
    },

    /// The broker or a connection-scoped resource failed.
    #[error("transport error: {reason}")]
    Transport {
        /// What the transport reported.
        reason: String,
    },

    /// A body could not be encoded or decoded.
    #[error("marshalling error: {reason}")]
    Marshal {
        /// What the codec reported.
        reason: String,
    },

    /// No reply arrived before the wait deadline.
    #[error("no reply within {elapsed_ms}ms")]
    Timeout {
        /// How long the caller waited.
        elapsed_ms: u64,
    },

    /// The call was cancelled while waiting.
    #[error("call was cancelled while waiting")]
    Cancelled,

    /// The reply listener terminated without producing a result.
    #[error("reply listener failed before a result was produced")]
    ReplyFailed,
}

impl ClientError {
    /// Shorthand for a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Shorthand for a transport error.
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Shorthand for a marshalling error.
    pub fn marshal(reason: impl Into<String>) -> Self {
        Self::Marshal {
            reason: reason.into(),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ClientError>;
