//! Raw cross-context channel.
//!
//! The transport client never touches the host environment's messaging
//! primitive directly: outbound strings go through [`RawChannel`], inbound
//! strings arrive as [`RawMessage`] values on an unbounded receiver. Any
//! environment that can post a string to a context and report the sender of
//! incoming strings can back a client.
//!
//! [`MemoryRouter`] is the in-process implementation, used when both roles
//! run in the same process (tests, demos, embedded hosts).

use crate::error::ChannelError;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use tokio::sync::mpsc;

/// Origin wildcard accepted by [`RawChannel::post_message`].
pub const ANY_ORIGIN: &str = "*";

/// Identity of one execution context (a window, frame, worker, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(String);

impl ContextId {
    /// Create a context identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// The one context a client exchanges envelopes with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counterpart {
    /// Identity of the counterpart context.
    pub context: ContextId,

    /// Origin the counterpart must declare, and the target origin used when
    /// posting to it. [`ANY_ORIGIN`] disables the origin check.
    pub origin: String,
}

impl Counterpart {
    /// Counterpart with a strict origin.
    pub fn new(context: impl Into<ContextId>, origin: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            origin: origin.into(),
        }
    }

    /// Whether a message declaring `origin` may come from this counterpart.
    pub fn accepts_origin(&self, origin: &str) -> bool {
        self.origin == ANY_ORIGIN || self.origin == origin
    }
}

/// One inbound message as delivered by the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Context that posted the message.
    pub source: ContextId,

    /// Origin declared by the sender.
    pub origin: String,

    /// Opaque string payload.
    pub data: String,
}

/// Outbound half of the environment's messaging primitive.
pub trait RawChannel {
    /// Post `data` to `target`.
    ///
    /// When `target_origin` is not [`ANY_ORIGIN`] and does not match the
    /// target's actual origin, the message is silently not delivered.
    fn post_message(
        &self,
        target: &ContextId,
        data: String,
        target_origin: &str,
    ) -> Result<(), ChannelError>;
}

struct Registration {
    origin: String,
    sender: mpsc::UnboundedSender<RawMessage>,
}

/// In-process message router connecting any number of contexts.
///
/// # Example
///
/// ```rust,ignore
/// let router = MemoryRouter::new();
/// let (host_channel, host_inbox) = router.register("host", "https://app.example");
/// let (guest_channel, guest_inbox) = router.register("guest", "https://plugin.example");
///
/// guest_channel.post_message(&"host".into(), "{}".to_string(), "https://app.example")?;
/// let raw = host_inbox.recv().await;
/// ```
#[derive(Clone, Default)]
pub struct MemoryRouter {
    contexts: Rc<RefCell<HashMap<ContextId, Registration>>>,
}

impl MemoryRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a context and obtain its channel and inbox.
    ///
    /// Registering an existing context replaces its inbox.
    pub fn register(
        &self,
        context: impl Into<ContextId>,
        origin: impl Into<String>,
    ) -> (MemoryChannel, mpsc::UnboundedReceiver<RawMessage>) {
        let context = context.into();
        let origin = origin.into();
        let (sender, receiver) = mpsc::unbounded_channel();

        self.contexts.borrow_mut().insert(
            context.clone(),
            Registration {
                origin: origin.clone(),
                sender,
            },
        );

        let channel = MemoryChannel {
            local: context,
            origin,
            router: self.clone(),
        };
        (channel, receiver)
    }

    /// Remove a context; posts to it fail with `UnknownContext` afterwards.
    pub fn unregister(&self, context: &ContextId) {
        self.contexts.borrow_mut().remove(context);
    }

    fn deliver(
        &self,
        from: &MemoryChannel,
        target: &ContextId,
        data: String,
        target_origin: &str,
    ) -> Result<(), ChannelError> {
        let contexts = self.contexts.borrow();
        let registration = contexts
            .get(target)
            .ok_or_else(|| ChannelError::UnknownContext(target.clone()))?;

        if target_origin != ANY_ORIGIN && target_origin != registration.origin {
            tracing::debug!(
                "MemoryRouter: dropping message from {} to {}: target origin {} != {}",
                from.local,
                target,
                target_origin,
                registration.origin
            );
            return Ok(());
        }

        registration
            .sender
            .send(RawMessage {
                source: from.local.clone(),
                origin: from.origin.clone(),
                data,
            })
            .map_err(|_| ChannelError::Disconnected(target.clone()))
    }
}

/// A context's handle on a [`MemoryRouter`].
#[derive(Clone)]
pub struct MemoryChannel {
    local: ContextId,
    origin: String,
    router: MemoryRouter,
}

impl MemoryChannel {
    /// Identity of the context owning this channel.
    pub fn context(&self) -> &ContextId {
        &self.local
    }

    /// Origin this context declares on every message.
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

impl RawChannel for MemoryChannel {
    fn post_message(
        &self,
        target: &ContextId,
        data: String,
        target_origin: &str,
    ) -> Result<(), ChannelError> {
        self.router.deliver(self, target, data, target_origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivers_with_source_and_origin() {
        let router = MemoryRouter::new();
        let (host, _host_inbox) = router.register("host", "https://host.test");
        let (_guest, mut guest_inbox) = router.register("guest", "https://guest.test");

        host.post_message(&"guest".into(), "hi".to_string(), "https://guest.test")
            .unwrap();

        let raw = guest_inbox.try_recv().unwrap();
        assert_eq!(raw.source, ContextId::from("host"));
        assert_eq!(raw.origin, "https://host.test");
        assert_eq!(raw.data, "hi");
    }

    #[test]
    fn test_target_origin_mismatch_is_silently_dropped() {
        let router = MemoryRouter::new();
        let (host, _host_inbox) = router.register("host", "https://host.test");
        let (_guest, mut guest_inbox) = router.register("guest", "https://guest.test");

        host.post_message(&"guest".into(), "hi".to_string(), "https://evil.test")
            .unwrap();
        assert!(guest_inbox.try_recv().is_err());

        host.post_message(&"guest".into(), "hi".to_string(), ANY_ORIGIN)
            .unwrap();
        assert!(guest_inbox.try_recv().is_ok());
    }

    #[test]
    fn test_unknown_and_disconnected_targets() {
        let router = MemoryRouter::new();
        let (host, _host_inbox) = router.register("host", "https://host.test");

        let result = host.post_message(&"nobody".into(), "x".to_string(), ANY_ORIGIN);
        assert_eq!(result, Err(ChannelError::UnknownContext("nobody".into())));

        let (_guest, guest_inbox) = router.register("guest", "https://guest.test");
        drop(guest_inbox);
        let result = host.post_message(&"guest".into(), "x".to_string(), ANY_ORIGIN);
        assert_eq!(result, Err(ChannelError::Disconnected("guest".into())));
    }

    #[test]
    fn test_unregistered_context_is_unknown() {
        let router = MemoryRouter::new();
        let (host, _host_inbox) = router.register("host", "https://host.test");
        let (_guest, mut guest_inbox) = router.register("guest", "https://guest.test");

        router.unregister(&"guest".into());

        let result = host.post_message(&"guest".into(), "x".to_string(), ANY_ORIGIN);
        assert_eq!(result, Err(ChannelError::UnknownContext("guest".into())));
        assert!(guest_inbox.try_recv().is_err());
    }

    #[test]
    fn test_counterpart_origin_check() {
        let strict = Counterpart::new("guest", "https://guest.test");
        assert!(strict.accepts_origin("https://guest.test"));
        assert!(!strict.accepts_origin("https://other.test"));

        let any = Counterpart::new("guest", ANY_ORIGIN);
        assert!(any.accepts_origin("https://other.test"));
    }
}
