//! Error types for the source bridge.
//!
//! Only two classes are ever visible to callers of a session: handshake
//! timeouts ([`LifecycleError`]) and premature access to handshake state
//! ([`AccessError`]). Malformed input and handler failures are contained in
//! the transport and only logged.

use crate::messaging::{ContextId, EnvelopeId};
use crate::session::GuestState;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why a guest failed to come up within the handshake deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleCause {
    /// The guest never sent `hello` within the hello timeout.
    NotStarted,

    /// The guest never sent `ready` within the ready timeout.
    NotReady,
}

impl LifecycleCause {
    /// Wire name of the cause (`not_started` / `not_ready`).
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleCause::NotStarted => "not_started",
            LifecycleCause::NotReady => "not_ready",
        }
    }
}

impl fmt::Display for LifecycleCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handshake timeout reported to the host's error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("loading bridge guest failed: {cause}")]
pub struct LifecycleError {
    /// The milestone that was missed.
    pub cause: LifecycleCause,
}

impl LifecycleError {
    /// Create an error for the given cause.
    pub fn new(cause: LifecycleCause) -> Self {
        Self { cause }
    }
}

/// Synchronous accessor called before the handshake state it reads exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    /// The handshake response has not been received yet.
    #[error("bridge is not yet initialized; call `init()` before {accessor}()")]
    NotInitialized {
        /// Name of the accessor that was called.
        accessor: &'static str,
    },

    /// The session was destroyed; a new session is needed.
    #[error("bridge session was destroyed; {accessor}() is no longer available")]
    Destroyed {
        /// Name of the accessor that was called.
        accessor: &'static str,
    },

    /// The handshake completed but the host did not supply this field.
    #[error("{accessor}() is unavailable: the host did not provide `{field}` in the handshake")]
    NotProvided {
        /// Name of the accessor that was called.
        accessor: &'static str,
        /// Handshake payload field that was missing.
        field: &'static str,
    },
}

/// Errors raised by the raw cross-context channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// No context with this identity is reachable through the channel.
    #[error("unknown target context: {0}")]
    UnknownContext(ContextId),

    /// The target context stopped listening.
    #[error("target context disconnected: {0}")]
    Disconnected(ContextId),
}

/// Errors related to sending envelopes and awaiting replies.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The client was closed; no further traffic is accepted and pending
    /// requests are rejected with this error.
    #[error("transport client closed")]
    Closed,

    /// A request with this id is already awaiting a reply.
    #[error("request id already pending: {0}")]
    DuplicateRequestId(EnvelopeId),

    /// The envelope could not be serialized.
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    /// The raw channel refused the message.
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Failure of an event or request handler.
///
/// Handler errors never leave the dispatch loop; they are logged and, for
/// requests, answered with an error reply.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The envelope payload did not decode into the handler's payload type.
    #[error("payload decode failed: {0}")]
    Payload(#[from] serde_json::Error),

    /// The handler could not send its own traffic.
    #[error("transport failed inside handler: {0}")]
    Transport(#[from] TransportError),

    /// The host's token provider failed.
    #[error("token provider failed: {0}")]
    TokenProvider(String),

    /// Application-level failure.
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Application-level failure with a message.
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

/// Errors surfaced by guest session operations.
#[derive(Debug, Error)]
pub enum GuestError {
    /// Sending or awaiting failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A payload could not be encoded or decoded.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    /// The host answered with `ok = false`.
    #[error("host rejected `{kind}` request: {reason}")]
    Rejected {
        /// Type of the rejected request.
        kind: String,
        /// Error text carried by the reply, if any.
        reason: String,
    },

    /// The host answered with an unparsable expiry timestamp.
    #[error("invalid credential timestamp: {0}")]
    InvalidTimestamp(#[from] chrono::ParseError),

    /// `init()` was called while the session was not `Uninitialized`.
    #[error("guest session already initialized (state: {0:?})")]
    AlreadyInitialized(GuestState),
}
