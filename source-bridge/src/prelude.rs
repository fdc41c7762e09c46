//! Common imports for the source bridge.
//!
//! ```ignore
//! use source_bridge::prelude::*;
//! ```

pub use crate::config::{ClientConfig, HandshakeConfig};
pub use crate::error::{
    AccessError, GuestError, HandlerError, LifecycleCause, LifecycleError, TransportError,
};
pub use crate::messaging::{
    ContextId, Counterpart, MemoryRouter, RawChannel, RawMessage, TransportClient, event_handler,
    request_handler,
};
pub use crate::session::{
    Auth, Context, GuestOptions, GuestSession, GuestState, HelloPayload, HostOptions, HostSession,
    HostState, PluginInfo, TokenProvider,
};

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
pub use std::time::Duration;
