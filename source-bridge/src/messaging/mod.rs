//! Envelope transport between two execution contexts.
//!
//! - [`envelope`]: wire format and inbound validation
//! - [`channel`]: the raw channel seam and its in-memory implementation
//! - [`correlation`]: pending request table and reply futures
//! - [`handlers`]: per-type handler registry and typed adapters
//! - [`client`]: the transport client tying them together

pub mod channel;
pub mod client;
pub mod correlation;
pub mod envelope;
pub mod handlers;

pub use channel::{
    ANY_ORIGIN, ContextId, Counterpart, MemoryChannel, MemoryRouter, RawChannel, RawMessage,
};
pub use client::{DiscardReason, Outbox, TransportClient};
pub use correlation::{PendingRequests, ReplyFuture, Resolution};
pub use envelope::{
    Envelope, EnvelopeId, Incoming, Malformed, ReplyEnvelope, parse_incoming, to_payload,
};
pub use handlers::{
    EventHandler, HandlerRegistry, LocalBoxFuture, RequestHandler, event_handler, request_handler,
};
