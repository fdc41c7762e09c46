//! Transport client: the correlating message bus over one raw channel.
//!
//! A [`TransportClient`] owns one side of a host/guest pair. It turns the raw
//! channel into a typed envelope bus:
//!
//! - Outbound: events, requests (registered for correlation) and replies.
//! - Inbound: a listener task reads the raw inbox, filters by counterpart
//!   source and origin, matches replies to pending requests and dispatches
//!   everything else to the handlers registered for its type.
//!
//! # Inbound Pipeline
//!
//! ```text
//! RawMessage
//!   ↓ 1. source == counterpart.context        else discard (ForeignSource)
//!   ↓ 2. counterpart accepts declared origin  else discard (ForeignOrigin)
//!   ↓ 3. parse_incoming                       else discard (Malformed)
//!   ├─ Reply → PendingRequests::resolve       (unmatched replies are dropped)
//!   └─ Event → spawn_local(dispatch)          handlers run in registration order
//! ```
//!
//! Discards are logged at debug level and never surface to callers.
//!
//! # Threading
//!
//! Single-threaded. The client spawns its listener with
//! `tokio::task::spawn_local`, so it must be created inside a
//! `tokio::task::LocalSet`.

use crate::config::ClientConfig;
use crate::error::{HandlerError, TransportError};
use crate::messaging::correlation::Resolution;
use crate::messaging::envelope::{Malformed, to_payload};
use crate::messaging::{
    Counterpart, Envelope, EnvelopeId, EventHandler, HandlerRegistry, Incoming, LocalBoxFuture,
    PendingRequests, RawChannel, RawMessage, ReplyEnvelope, ReplyFuture, RequestHandler,
    parse_incoming,
};
use serde::Serialize;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Why an inbound raw message was not processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Posted by a context other than the counterpart.
    ForeignSource,

    /// Declared an origin the counterpart does not accept.
    ForeignOrigin,

    /// Not a valid envelope.
    Malformed(Malformed),

    /// The client is closed.
    Closed,
}

/// Outbound half of a client.
///
/// Cloned into handlers that need to send traffic (replies, pushes) without
/// holding the whole client.
#[derive(Clone)]
pub struct Outbox {
    channel: Rc<dyn RawChannel>,
    counterpart: Counterpart,
    label: Rc<str>,
    shutdown: CancellationToken,
}

impl Outbox {
    /// Whether the owning client is closed.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Post an event with an already-encoded payload.
    pub fn send_event(
        &self,
        kind: impl Into<String>,
        payload: Option<Value>,
    ) -> Result<EnvelopeId, TransportError> {
        let envelope = Envelope {
            id: EnvelopeId::generate(),
            kind: kind.into(),
            payload,
        };
        self.post(&envelope)?;
        tracing::debug!("[{}] sent event `{}` ({})", self.label, envelope.kind, envelope.id);
        Ok(envelope.id)
    }

    /// Post a successful reply to `request`.
    pub fn send_reply(
        &self,
        request: &Envelope,
        payload: Option<Value>,
    ) -> Result<(), TransportError> {
        let reply = ReplyEnvelope::success(request, payload);
        self.post(&reply)?;
        tracing::debug!(
            "[{}] replied to `{}` ({})",
            self.label,
            request.kind,
            request.id
        );
        Ok(())
    }

    /// Post an `ok = false` reply describing `error`.
    pub fn send_error_reply(
        &self,
        request: &Envelope,
        error: &HandlerError,
    ) -> Result<(), TransportError> {
        let reply = ReplyEnvelope::failure(request, error.to_string());
        self.post(&reply)
    }

    /// Adapt a request handler into an event handler that answers the
    /// requester.
    ///
    /// On success the computed payload is sent back; on failure an error
    /// reply is sent and the handler error is still returned for logging.
    pub fn replying(&self, handler: RequestHandler) -> EventHandler {
        let outbox = self.clone();
        Rc::new(move |request: Envelope| -> LocalBoxFuture<Result<(), HandlerError>> {
            let outbox = outbox.clone();
            let handler = Rc::clone(&handler);
            Box::pin(async move {
                match handler(request.clone()).await {
                    Ok(payload) => {
                        outbox.send_reply(&request, payload)?;
                        Ok(())
                    }
                    Err(e) => {
                        if let Err(send_err) = outbox.send_error_reply(&request, &e) {
                            tracing::warn!(
                                "[{}] could not send error reply for `{}`: {}",
                                outbox.label,
                                request.kind,
                                send_err
                            );
                        }
                        Err(e)
                    }
                }
            })
        })
    }

    fn post<T: Serialize>(&self, envelope: &T) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let data = serde_json::to_string(envelope)?;
        self.channel
            .post_message(&self.counterpart.context, data, &self.counterpart.origin)?;
        Ok(())
    }
}

struct ClientInner {
    outbox: Outbox,
    pending: PendingRequests,
    handlers: RefCell<HandlerRegistry>,
    listener: RefCell<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.outbox.shutdown.cancel();
    }
}

/// Correlating envelope bus bound to one counterpart context.
///
/// Cheap to clone; clones share the same pending table, handlers and
/// listener.
///
/// # Example
///
/// ```rust,ignore
/// let (channel, inbox) = router.register("guest", "https://plugin.test");
/// let config = ClientConfig::new(Counterpart::new("host", "https://app.test"));
/// let client = TransportClient::new(config, channel, inbox);
///
/// let reply = client.send_request("authentication", &()).await?;
/// ```
#[derive(Clone)]
pub struct TransportClient {
    inner: Rc<ClientInner>,
}

impl TransportClient {
    /// Create a client and start listening on `inbox`.
    ///
    /// Must be called from within a `LocalSet`.
    pub fn new<C>(
        config: ClientConfig,
        channel: C,
        inbox: mpsc::UnboundedReceiver<RawMessage>,
    ) -> Self
    where
        C: RawChannel + 'static,
    {
        let shutdown = CancellationToken::new();
        let inner = Rc::new(ClientInner {
            outbox: Outbox {
                channel: Rc::new(channel),
                counterpart: config.counterpart,
                label: Rc::from(config.label),
                shutdown: shutdown.clone(),
            },
            pending: PendingRequests::new(),
            handlers: RefCell::new(HandlerRegistry::new()),
            listener: RefCell::new(None),
        });

        tracing::debug!(
            "[{}] transport client started, counterpart {}",
            inner.outbox.label,
            inner.outbox.counterpart.context
        );

        let listener =
            tokio::task::spawn_local(run_listener(Rc::downgrade(&inner), shutdown, inbox));
        *inner.listener.borrow_mut() = Some(listener);

        Self { inner }
    }

    /// Log label of this client.
    pub fn label(&self) -> &str {
        &self.inner.outbox.label
    }

    /// The counterpart this client talks to.
    pub fn counterpart(&self) -> &Counterpart {
        &self.inner.outbox.counterpart
    }

    /// A handle for sending without owning the client.
    pub fn outbox(&self) -> Outbox {
        self.inner.outbox.clone()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.outbox.is_closed()
    }

    /// Number of requests awaiting replies.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Post a one-way event.
    pub fn send_event<P: Serialize + ?Sized>(
        &self,
        kind: &str,
        payload: &P,
    ) -> Result<EnvelopeId, TransportError> {
        self.inner.outbox.send_event(kind, to_payload(payload)?)
    }

    /// Post a request and return a future for its reply.
    ///
    /// The request is registered and posted before this returns; awaiting the
    /// future only waits. The future resolves with the full reply envelope
    /// (including `ok = false` replies) or fails with
    /// [`TransportError::Closed`] if the client closes first.
    pub fn send_request<P: Serialize + ?Sized>(&self, kind: &str, payload: &P) -> ReplyFuture {
        let id = EnvelopeId::generate();
        if self.is_closed() {
            return ReplyFuture::failed(id, TransportError::Closed);
        }

        let payload = match to_payload(payload) {
            Ok(payload) => payload,
            Err(e) => return ReplyFuture::failed(id, e.into()),
        };
        let envelope = Envelope {
            id: id.clone(),
            kind: kind.to_string(),
            payload,
        };

        let receiver = match self.inner.pending.register(id.clone(), kind) {
            Ok(receiver) => receiver,
            Err(e) => return ReplyFuture::failed(id, e),
        };

        if let Err(e) = self.inner.outbox.post(&envelope) {
            self.inner.pending.forget(&id);
            return ReplyFuture::failed(id, e);
        }

        tracing::debug!("[{}] sent request `{}` ({})", self.label(), kind, id);
        ReplyFuture::waiting(id, receiver)
    }

    /// Post a successful reply to `request`.
    pub fn send_reply<P: Serialize + ?Sized>(
        &self,
        request: &Envelope,
        payload: &P,
    ) -> Result<(), TransportError> {
        self.inner.outbox.send_reply(request, to_payload(payload)?)
    }

    /// Register a handler for every non-reply envelope of type `kind`.
    ///
    /// Handlers for the same type run sequentially in registration order. A
    /// failing handler is logged and does not prevent later handlers from
    /// running.
    pub fn on_event(&self, kind: impl Into<String>, handler: EventHandler) {
        self.inner.handlers.borrow_mut().register(kind, handler);
    }

    /// Register a handler whose result is sent back as the reply.
    pub fn on_request(&self, kind: impl Into<String>, handler: RequestHandler) {
        let handler = self.inner.outbox.replying(handler);
        self.on_event(kind, handler);
    }

    /// Number of handlers registered for `kind`.
    pub fn handler_count(&self, kind: &str) -> usize {
        self.inner.handlers.borrow().handler_count(kind)
    }

    /// Feed one raw message through the inbound pipeline.
    ///
    /// Normally called by the listener task; exposed for environments that
    /// deliver messages through their own loop.
    pub fn receive(&self, raw: RawMessage) -> Result<(), DiscardReason> {
        accept(&self.inner, raw)
    }

    /// Stop listening, reject pending requests and drop all handlers.
    ///
    /// Idempotent. After close every send fails with
    /// [`TransportError::Closed`] and inbound traffic is ignored.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.inner.outbox.shutdown.cancel();

        if let Some(listener) = self.inner.listener.borrow_mut().take() {
            listener.abort();
        }
        let rejected = self.inner.pending.reject_all();
        self.inner.handlers.borrow_mut().clear();

        tracing::debug!(
            "[{}] transport client closed ({} pending requests rejected)",
            self.label(),
            rejected
        );
    }
}

/// Inbound loop: one raw message at a time until shutdown or the inbox closes.
async fn run_listener(
    inner: Weak<ClientInner>,
    shutdown: CancellationToken,
    mut inbox: mpsc::UnboundedReceiver<RawMessage>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            raw = inbox.recv() => {
                let Some(raw) = raw else {
                    tracing::debug!("Inbox closed, listener exiting");
                    break;
                };
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                // Discards are already logged.
                let _ = accept(&inner, raw);
            }
        }
    }
}

fn accept(inner: &Rc<ClientInner>, raw: RawMessage) -> Result<(), DiscardReason> {
    let outbox = &inner.outbox;
    if outbox.is_closed() {
        return Err(DiscardReason::Closed);
    }

    if raw.source != outbox.counterpart.context {
        tracing::debug!(
            "[{}] discarding message from foreign context {}",
            outbox.label,
            raw.source
        );
        return Err(DiscardReason::ForeignSource);
    }

    if !outbox.counterpart.accepts_origin(&raw.origin) {
        tracing::debug!(
            "[{}] discarding message with foreign origin {}",
            outbox.label,
            raw.origin
        );
        return Err(DiscardReason::ForeignOrigin);
    }

    let incoming = parse_incoming(&raw.data).map_err(|reason| {
        tracing::debug!("[{}] discarding non-envelope ({:?})", outbox.label, reason);
        DiscardReason::Malformed(reason)
    })?;

    match incoming {
        Incoming::Reply(reply) => {
            let in_reply_to = reply.in_reply_to.clone();
            if inner.pending.resolve(reply) == Resolution::Unknown {
                tracing::debug!(
                    "[{}] dropping reply to unknown request {}",
                    outbox.label,
                    in_reply_to
                );
            }
        }
        Incoming::Event(envelope) => {
            tokio::task::spawn_local(dispatch(Rc::clone(inner), envelope));
        }
    }
    Ok(())
}

/// Run every handler registered for the envelope's type, in order.
async fn dispatch(inner: Rc<ClientInner>, envelope: Envelope) {
    let handlers = inner.handlers.borrow().handlers_for(&envelope.kind);
    if handlers.is_empty() {
        tracing::debug!(
            "[{}] no handler for `{}` ({})",
            inner.outbox.label,
            envelope.kind,
            envelope.id
        );
        return;
    }

    tracing::debug!(
        "[{}] dispatching `{}` ({}) to {} handler(s)",
        inner.outbox.label,
        envelope.kind,
        envelope.id,
        handlers.len()
    );

    for handler in handlers {
        if inner.outbox.is_closed() {
            break;
        }
        if let Err(e) = handler(envelope.clone()).await {
            tracing::warn!(
                "[{}] handler for `{}` failed: {}",
                inner.outbox.label,
                envelope.kind,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{MemoryRouter, event_handler, request_handler};
    use serde_json::json;
    use std::cell::Cell;
    use tokio::task::LocalSet;

    fn raw(source: &str, origin: &str, data: &str) -> RawMessage {
        RawMessage {
            source: source.into(),
            origin: origin.to_string(),
            data: data.to_string(),
        }
    }

    #[tokio::test]
    async fn test_receive_filters_source_origin_and_garbage() {
        LocalSet::new()
            .run_until(async {
                let router = MemoryRouter::new();
                let (channel, inbox) = router.register("guest", "https://guest.test");
                let _host = router.register("host", "https://host.test");
                let config = ClientConfig::new(Counterpart::new("host", "https://host.test"));
                let client = TransportClient::new(config, channel, inbox);

                let event = r#"{"id":"e1","type":"ping"}"#;
                assert_eq!(
                    client.receive(raw("intruder", "https://host.test", event)),
                    Err(DiscardReason::ForeignSource)
                );
                assert_eq!(
                    client.receive(raw("host", "https://evil.test", event)),
                    Err(DiscardReason::ForeignOrigin)
                );
                assert_eq!(
                    client.receive(raw("host", "https://host.test", "garbage")),
                    Err(DiscardReason::Malformed(Malformed::NotJson))
                );
                assert_eq!(client.receive(raw("host", "https://host.test", event)), Ok(()));

                client.close();
                assert_eq!(
                    client.receive(raw("host", "https://host.test", event)),
                    Err(DiscardReason::Closed)
                );
            })
            .await;
    }

    #[tokio::test]
    async fn test_request_and_reply_between_clients() {
        LocalSet::new()
            .run_until(async {
                let router = MemoryRouter::new();
                let (host_channel, host_inbox) = router.register("host", "*");
                let (guest_channel, guest_inbox) = router.register("guest", "*");

                let host = TransportClient::new(
                    ClientConfig::new(Counterpart::new("guest", "*")).with_label("host"),
                    host_channel,
                    host_inbox,
                );
                let guest = TransportClient::new(
                    ClientConfig::new(Counterpart::new("host", "*")).with_label("guest"),
                    guest_channel,
                    guest_inbox,
                );

                host.on_request(
                    "double",
                    request_handler(|n: u32| async move { Ok(n * 2) }),
                );

                let reply = guest.send_request("double", &21).await.unwrap();
                assert!(reply.ok);
                assert_eq!(reply.payload, Some(json!(42)));
                assert_eq!(guest.pending_requests(), 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_failing_request_handler_sends_error_reply() {
        LocalSet::new()
            .run_until(async {
                let router = MemoryRouter::new();
                let (host_channel, host_inbox) = router.register("host", "*");
                let (guest_channel, guest_inbox) = router.register("guest", "*");
                let host = TransportClient::new(
                    ClientConfig::new(Counterpart::new("guest", "*")),
                    host_channel,
                    host_inbox,
                );
                let guest = TransportClient::new(
                    ClientConfig::new(Counterpart::new("host", "*")),
                    guest_channel,
                    guest_inbox,
                );

                host.on_request(
                    "fail",
                    request_handler(|_: ()| async { Err::<(), _>(HandlerError::failed("nope")) }),
                );

                let reply = guest.send_request("fail", &()).await.unwrap();
                assert!(!reply.ok);
                assert_eq!(reply.error_text(), "nope");
            })
            .await;
    }

    #[tokio::test]
    async fn test_close_rejects_pending_and_blocks_sends() {
        LocalSet::new()
            .run_until(async {
                let router = MemoryRouter::new();
                let (channel, inbox) = router.register("guest", "*");
                let _host = router.register("host", "*");
                let client = TransportClient::new(
                    ClientConfig::new(Counterpart::new("host", "*")),
                    channel,
                    inbox,
                );

                let calls = Rc::new(Cell::new(0));
                let counter = Rc::clone(&calls);
                client.on_event(
                    "ping",
                    event_handler(move |_: ()| {
                        counter.set(counter.get() + 1);
                        async { Ok(()) }
                    }),
                );

                let pending = client.send_request("never-answered", &());
                assert_eq!(client.pending_requests(), 1);

                client.close();
                client.close();

                assert!(matches!(pending.await, Err(TransportError::Closed)));
                assert!(matches!(
                    client.send_event("ping", &()),
                    Err(TransportError::Closed)
                ));
                assert!(matches!(
                    client.send_request("x", &()).await,
                    Err(TransportError::Closed)
                ));
                assert_eq!(client.handler_count("ping"), 0);
                assert_eq!(calls.get(), 0);
            })
            .await;
    }
}
