//! # Source Bridge
//!
//! Bidirectional messaging between two execution contexts that can only
//! exchange opaque strings, such as an application and an untrusted embedded
//! plugin.
//!
//! The bridge offers three primitives over the raw channel:
//!
//! - fire-and-forget events,
//! - correlated request/response calls,
//! - a `hello`/`ready` handshake through which a host supervises a guest.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┬──────────────────────────────┐
//! │  GuestSession                │  HostSession                 │
//! │  • hello → cache state       │  • answers hello / auth      │
//! │  • ready, current_token      │  • hello + ready timers      │
//! ├──────────────────────────────┴──────────────────────────────┤
//! │                    TransportClient                          │
//! │  Envelope codec • PendingRequests • HandlerRegistry         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                RawChannel (MemoryRouter, ...)               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything runs on one thread: clients and sessions are `Rc`-based and
//! spawn their tasks with `tokio::task::spawn_local`, so they must live
//! inside a `tokio::task::LocalSet`.
//!
//! ## Quick Start
//!
//! ```ignore
//! use source_bridge::prelude::*;
//!
//! let router = MemoryRouter::new();
//! let (channel, inbox) = router.register("host", "https://app.example");
//! let config = ClientConfig::new(Counterpart::new("guest", "https://plugin.example"));
//!
//! let host = HostSession::new(
//!     TransportClient::new(config, channel, inbox),
//!     HostOptions::new(fetch_token).on_error(|host, err| {
//!         tracing::error!("plugin failed to load: {}", err);
//!         host.destroy();
//!     }),
//! );
//! host.boot();
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod messaging;
pub mod prelude;
pub mod session;

pub use config::{ClientConfig, HandshakeConfig};
pub use error::{
    AccessError, ChannelError, GuestError, HandlerError, LifecycleCause, LifecycleError,
    TransportError,
};
pub use messaging::{
    ANY_ORIGIN, ContextId, Counterpart, Envelope, EnvelopeId, MemoryChannel, MemoryRouter,
    RawChannel, RawMessage, ReplyEnvelope, ReplyFuture, TransportClient,
};
pub use session::{
    Auth, AuthPayload, Context, GuestOptions, GuestSession, GuestState, HelloPayload, HostOptions,
    HostSession, HostState, PluginInfo, TokenProvider,
};
