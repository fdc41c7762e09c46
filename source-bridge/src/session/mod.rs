//! Handshake sessions built on the transport client.
//!
//! A [`GuestSession`] announces itself with `hello`, caches the host's answer
//! and signals `ready`. A [`HostSession`] answers `hello` and credential
//! requests, and supervises the guest with two independent timers.

pub mod guest;
pub mod host;
pub mod lifecycle;
pub mod payloads;

pub use guest::{GuestOptions, GuestSession};
pub use host::{ErrorCallback, HostOptions, HostSession, TokenProvider};
pub use lifecycle::{GuestState, HostState};
pub use payloads::{Auth, AuthPayload, Context, HelloPayload, PluginInfo};
