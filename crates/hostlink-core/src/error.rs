//! Error types for the hostlink control plane.
//!
//! Errors fall into the taxonomy the control plane reacts to: protocol
//! violations and routing misses are recoverable at message level, transport
//! failures make a channel unusable, and programming errors (duplicate routes,
//! conflicting profile flags) are reported to the caller.

use crate::channel_info::DecodeError;
use crate::ipc::protocol::ProtocolError;
use crate::routing::RoutingId;
use thiserror::Error;

/// Main error type for the hostlink library.
#[derive(Debug, Error)]
pub enum LinkError {
    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Invalid channel id {channel_id:?}: {reason}")]
    InvalidChannelId { channel_id: String, reason: String },

    #[error("Channel {channel_id:?} was created by an incompatible version")]
    IncompatibleChannel { channel_id: String },

    #[error("Timed out connecting to channel {channel_id:?}")]
    ConnectTimeout { channel_id: String },

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Peer replied with an error to message type {type_id:#x}")]
    ReplyError { type_id: u32 },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Channel token error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Routing errors
    #[error("Route already registered: {0}")]
    RouteExists(RoutingId),

    #[error("Routing id block exhausted")]
    RoutingIdsExhausted,

    // Lifecycle errors
    #[error("Process watchdog is shutting down")]
    WatchdogShutDown,

    #[error("Profile not found: {0}")]
    ProfileNotFound(u64),

    #[error("Profile manager has already destroyed all profiles")]
    ProfilesDestroyed,

    #[error("Host control loop is not running")]
    HostStopped,

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for hostlink operations.
pub type Result<T> = std::result::Result<T, LinkError>;

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl LinkError {
    /// Create an IO error with extra context.
    pub fn io_with_context(err: std::io::Error, context: impl Into<String>) -> Self {
        LinkError::Io {
            message: format!("{}: {}", context.into(), err),
            source: Some(err),
        }
    }

    /// Whether this error leaves the underlying channel unusable.
    ///
    /// Transport failures are fatal to the channel; every other error is
    /// recovered at message level and the channel stays up.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            LinkError::Io { .. }
                | LinkError::InvalidChannelId { .. }
                | LinkError::IncompatibleChannel { .. }
                | LinkError::ConnectTimeout { .. }
                | LinkError::ChannelClosed
        )
    }
}
