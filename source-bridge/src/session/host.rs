//! Host-side session.
//!
//! The host accepts exactly one guest. It answers the guest's `hello` and
//! `authentication` requests, waits for `ready`, and supervises the
//! handshake with two independent timers armed by [`HostSession::boot`]:
//!
//! ```text
//! boot() ──┬── hello timer (hello_timeout) ── cancelled by `hello` ── else NotStarted
//!          └── ready timer (ready_timeout) ── cancelled by `ready` ── else NotReady
//! ```
//!
//! Receiving `hello` does not cancel the ready timer. A fired timer reports
//! its cause exactly once to the `on_error` callback; the session stays
//! alive until the caller destroys it.

use crate::config::HandshakeConfig;
use crate::error::{HandlerError, LifecycleCause, LifecycleError, TransportError};
use crate::messaging::{
    Envelope, EnvelopeId, EventHandler, LocalBoxFuture, RequestHandler, TransportClient,
    event_handler, request_handler,
};
use crate::session::lifecycle::HostState;
use crate::session::payloads::{Auth, AuthPayload};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Supplies credentials to the guest.
///
/// Implemented for any `Fn() -> impl Future<Output = Result<Auth, HandlerError>>`.
#[async_trait(?Send)]
pub trait TokenProvider {
    /// Obtain a current credential.
    async fn token(&self) -> Result<Auth, HandlerError>;
}

#[async_trait(?Send)]
impl<F, Fut> TokenProvider for F
where
    F: Fn() -> Fut + 'static,
    Fut: Future<Output = Result<Auth, HandlerError>> + 'static,
{
    async fn token(&self) -> Result<Auth, HandlerError> {
        (self)().await
    }
}

/// Callback receiving handshake timeouts.
pub type ErrorCallback = Rc<dyn Fn(&HostSession, LifecycleError)>;

type ReadyCallback = Rc<dyn Fn(&HostSession)>;

enum CustomHandler {
    Event(EventHandler),
    Request(RequestHandler),
}

/// Options for [`HostSession::new`].
///
/// # Example
///
/// ```rust,ignore
/// let options = HostOptions::new(|| async { Ok(Auth::new("T", expiry())) })
///     .hello_timeout(Duration::from_secs(2))
///     .on_hello(|| async { Ok(HelloPayload::default()) })
///     .on_error(|host, err| {
///         tracing::error!("guest failed: {}", err);
///         host.destroy();
///     });
/// ```
pub struct HostOptions {
    token_provider: Rc<dyn TokenProvider>,
    handshake: HandshakeConfig,
    on_error: Option<ErrorCallback>,
    on_hello: Option<RequestHandler>,
    on_ready: Option<ReadyCallback>,
    handlers: Vec<(String, CustomHandler)>,
}

impl HostOptions {
    /// Options with default handshake deadlines and the given token provider.
    pub fn new<T: TokenProvider + 'static>(token_provider: T) -> Self {
        Self {
            token_provider: Rc::new(token_provider),
            handshake: HandshakeConfig::default(),
            on_error: None,
            on_hello: None,
            on_ready: None,
            handlers: Vec::new(),
        }
    }

    /// Replace both handshake deadlines.
    pub fn handshake(mut self, config: HandshakeConfig) -> Self {
        self.handshake = config;
        self
    }

    /// Time allowed for `hello` after `boot()`.
    pub fn hello_timeout(mut self, timeout: Duration) -> Self {
        self.handshake.hello_timeout = timeout;
        self
    }

    /// Time allowed for `ready` after `boot()`.
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.handshake.ready_timeout = timeout;
        self
    }

    /// Called once per fired handshake timer. Defaults to logging the error.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&HostSession, LifecycleError) + 'static,
    {
        self.on_error = Some(Rc::new(callback));
        self
    }

    /// Compute the payload answering `hello`. Without it `hello` is answered
    /// with an empty reply.
    pub fn on_hello<R, F, Fut>(mut self, handler: F) -> Self
    where
        R: Serialize + 'static,
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + 'static,
    {
        self.on_hello = Some(request_handler(move |_: IgnoredAny| handler()));
        self
    }

    /// Called when the guest sends `ready`.
    pub fn on_ready<F>(mut self, callback: F) -> Self
    where
        F: Fn(&HostSession) + 'static,
    {
        self.on_ready = Some(Rc::new(callback));
        self
    }

    /// Handle `kind` events from the guest.
    pub fn on_event<P, F, Fut>(mut self, kind: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned + 'static,
        F: Fn(P) -> Fut + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + 'static,
    {
        self.handlers
            .push((kind.into(), CustomHandler::Event(event_handler(handler))));
        self
    }

    /// Answer `kind` requests from the guest.
    pub fn on_request<P, R, F, Fut>(mut self, kind: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(P) -> Fut + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + 'static,
    {
        self.handlers
            .push((kind.into(), CustomHandler::Request(request_handler(handler))));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Milestone {
    Hello,
    Ready,
}

impl Milestone {
    fn missed(self) -> LifecycleCause {
        match self {
            Milestone::Hello => LifecycleCause::NotStarted,
            Milestone::Ready => LifecycleCause::NotReady,
        }
    }
}

struct HostInner {
    client: TransportClient,
    handshake: HandshakeConfig,
    state: Cell<HostState>,
    hello_seen: Cell<bool>,
    ready_seen: Cell<bool>,
    hello_timer: RefCell<Option<CancellationToken>>,
    ready_timer: RefCell<Option<CancellationToken>>,
    token_provider: Rc<dyn TokenProvider>,
    on_error: Option<ErrorCallback>,
    on_ready: Option<ReadyCallback>,
}

impl HostInner {
    fn set_state(&self, next: HostState) -> bool {
        let current = self.state.get();
        if !current.can_transition_to(next) {
            tracing::debug!(
                "[{}] ignoring host transition {:?} -> {:?}",
                self.client.label(),
                current,
                next
            );
            return false;
        }
        tracing::debug!("[{}] host {:?} -> {:?}", self.client.label(), current, next);
        self.state.set(next);
        true
    }

    fn timer_slot(&self, milestone: Milestone) -> &RefCell<Option<CancellationToken>> {
        match milestone {
            Milestone::Hello => &self.hello_timer,
            Milestone::Ready => &self.ready_timer,
        }
    }

    fn cancel_timer(&self, milestone: Milestone) {
        if let Some(token) = self.timer_slot(milestone).borrow_mut().take() {
            token.cancel();
        }
    }

    fn reach(&self, milestone: Milestone) {
        match milestone {
            Milestone::Hello => self.hello_seen.set(true),
            Milestone::Ready => self.ready_seen.set(true),
        }
        self.cancel_timer(milestone);
        tracing::info!("[{}] guest reached {:?}", self.client.label(), milestone);

        if milestone == Milestone::Ready && self.state.get() == HostState::Booted {
            self.set_state(HostState::Ready);
        }
    }
}

/// Host side of a bridge, supervising one guest.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct HostSession {
    inner: Rc<HostInner>,
}

impl HostSession {
    /// Wire the handshake handlers onto `client`.
    ///
    /// Timers are not armed until [`boot`](Self::boot).
    pub fn new(client: TransportClient, options: HostOptions) -> Self {
        let HostOptions {
            token_provider,
            handshake,
            on_error,
            on_hello,
            on_ready,
            handlers,
        } = options;

        let inner = Rc::new(HostInner {
            client,
            handshake,
            state: Cell::new(HostState::Created),
            hello_seen: Cell::new(false),
            ready_seen: Cell::new(false),
            hello_timer: RefCell::new(None),
            ready_timer: RefCell::new(None),
            token_provider,
            on_error,
            on_ready,
        });

        let client = &inner.client;
        client.on_request(
            "authentication",
            authentication_handler(Rc::clone(&inner.token_provider)),
        );
        client.on_request("hello", hello_handler(Rc::downgrade(&inner), on_hello));
        client.on_event("ready", ready_handler(Rc::downgrade(&inner)));

        for (kind, handler) in handlers {
            match handler {
                CustomHandler::Event(handler) => client.on_event(kind, handler),
                CustomHandler::Request(handler) => client.on_request(kind, handler),
            }
        }

        Self { inner }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HostState {
        self.inner.state.get()
    }

    /// Whether `boot()` has been called and the session is not destroyed.
    pub fn is_booted(&self) -> bool {
        self.state().is_booted()
    }

    /// The underlying transport client.
    pub fn client(&self) -> &TransportClient {
        &self.inner.client
    }

    /// Arm the handshake timers. Idempotent; a no-op after `destroy()`.
    ///
    /// A milestone already received before boot does not get a timer.
    pub fn boot(&self) {
        let inner = &self.inner;
        if inner.state.get() != HostState::Created {
            tracing::debug!(
                "[{}] boot ignored in state {:?}",
                inner.client.label(),
                inner.state.get()
            );
            return;
        }

        inner.set_state(HostState::Booted);
        tracing::info!(
            "[{}] booted (hello within {:?}, ready within {:?})",
            inner.client.label(),
            inner.handshake.hello_timeout,
            inner.handshake.ready_timeout
        );

        if !inner.hello_seen.get() {
            let token = self.arm_timer(Milestone::Hello, inner.handshake.hello_timeout);
            *inner.hello_timer.borrow_mut() = Some(token);
        }
        if inner.ready_seen.get() {
            inner.set_state(HostState::Ready);
        } else {
            let token = self.arm_timer(Milestone::Ready, inner.handshake.ready_timeout);
            *inner.ready_timer.borrow_mut() = Some(token);
        }
    }

    /// Close the transport and cancel pending timers. Idempotent.
    ///
    /// Safe to call from within `on_error`.
    pub fn destroy(&self) {
        let inner = &self.inner;
        if inner.state.get().is_terminal() {
            return;
        }
        inner.cancel_timer(Milestone::Hello);
        inner.cancel_timer(Milestone::Ready);
        inner.client.close();
        inner.set_state(HostState::Destroyed);
        tracing::info!("[{}] host session destroyed", inner.client.label());
    }

    /// Send a one-way event to the guest. Legal in any state.
    pub fn send_event<P: Serialize + ?Sized>(
        &self,
        kind: &str,
        payload: &P,
    ) -> Result<EnvelopeId, TransportError> {
        self.inner.client.send_event(kind, payload)
    }

    /// Obtain a credential from the token provider and push it to the guest
    /// as an `authentication` event.
    pub async fn refresh_token(&self) -> Result<Auth, HandlerError> {
        let provider = Rc::clone(&self.inner.token_provider);
        let auth = provider.token().await?;
        self.send_event("authentication", &AuthPayload::from(&auth))?;
        Ok(auth)
    }

    fn arm_timer(&self, milestone: Milestone, after: Duration) -> CancellationToken {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let weak = Rc::downgrade(&self.inner);

        tokio::task::spawn_local(async move {
            tokio::select! {
                biased;

                _ = cancelled.cancelled() => {}

                _ = tokio::time::sleep(after) => {
                    if let Some(inner) = weak.upgrade() {
                        HostSession { inner }.timer_fired(milestone);
                    }
                }
            }
        });

        token
    }

    fn timer_fired(&self, milestone: Milestone) {
        // An emptied slot means the milestone arrived or the session was
        // destroyed while the sleep was completing.
        if self.inner.timer_slot(milestone).borrow_mut().take().is_none() {
            return;
        }

        let error = LifecycleError::new(milestone.missed());
        self.inner.set_state(HostState::Errored(error.cause));
        tracing::error!("[{}] {}", self.inner.client.label(), error);

        if let Some(callback) = self.inner.on_error.clone() {
            callback(self, error);
        }
    }
}

fn authentication_handler(provider: Rc<dyn TokenProvider>) -> RequestHandler {
    request_handler(move |_: IgnoredAny| {
        let provider = Rc::clone(&provider);
        async move {
            let auth = provider.token().await?;
            Ok(AuthPayload::from(&auth))
        }
    })
}

fn hello_handler(inner: Weak<HostInner>, on_hello: Option<RequestHandler>) -> RequestHandler {
    Rc::new(move |request: Envelope| -> LocalBoxFuture<Result<Option<Value>, HandlerError>> {
        if let Some(inner) = inner.upgrade() {
            inner.reach(Milestone::Hello);
        }
        match &on_hello {
            Some(handler) => handler(request),
            None => Box::pin(async { Ok(None) }),
        }
    })
}

fn ready_handler(inner: Weak<HostInner>) -> EventHandler {
    Rc::new(move |_: Envelope| -> LocalBoxFuture<Result<(), HandlerError>> {
        if let Some(inner) = inner.upgrade() {
            inner.reach(Milestone::Ready);
            if let Some(callback) = inner.on_ready.clone() {
                callback(&HostSession { inner });
            }
        }
        Box::pin(async { Ok(()) })
    })
}
