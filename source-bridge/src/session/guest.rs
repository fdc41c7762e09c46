//! Guest-side session.
//!
//! # Handshake
//!
//! ```text
//! Guest                                 Host
//!   │── hello (request) ──────────────────►│
//!   │◄───────────── reply {context, auth, …}│
//!   │   install handlers, Initialized       │
//!   │── ready (event) ────────────────────►│   (when auto_ready)
//! ```
//!
//! After the handshake the session keeps its cached context and credential
//! fresh from `context` and `authentication` events pushed by the host.

use crate::error::{AccessError, GuestError, HandlerError, TransportError};
use crate::messaging::{Envelope, EventHandler, LocalBoxFuture, TransportClient, event_handler};
use crate::session::lifecycle::GuestState;
use crate::session::payloads::{Auth, AuthPayload, Context, HelloPayload, PluginInfo};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::{Rc, Weak};

type ContextListener = Rc<dyn Fn(&Context) -> Result<(), HandlerError>>;

/// Options for [`GuestSession::init`].
///
/// # Example
///
/// ```rust,ignore
/// let options = GuestOptions::new()
///     .auto_ready(false)
///     .on_event("theme", |theme: Theme| async move {
///         apply(theme);
///         Ok(())
///     });
/// ```
pub struct GuestOptions {
    auto_ready: bool,
    handlers: Vec<(String, EventHandler)>,
}

impl Default for GuestOptions {
    fn default() -> Self {
        Self {
            auto_ready: true,
            handlers: Vec::new(),
        }
    }
}

impl GuestOptions {
    /// Options with `auto_ready` enabled and no handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether to send `ready` as soon as the handshake completes.
    pub fn auto_ready(mut self, auto_ready: bool) -> Self {
        self.auto_ready = auto_ready;
        self
    }

    /// Handle `kind` events with a typed handler, installed after the
    /// handshake.
    pub fn on_event<P, F, Fut>(mut self, kind: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned + 'static,
        F: Fn(P) -> Fut + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + 'static,
    {
        self.handlers.push((kind.into(), event_handler(handler)));
        self
    }
}

struct GuestInner {
    client: TransportClient,
    state: Cell<GuestState>,
    auth: RefCell<Option<Auth>>,
    context: RefCell<Option<Context>>,
    plugin_info: RefCell<Option<PluginInfo>>,
    context_listeners: RefCell<Vec<ContextListener>>,
}

impl GuestInner {
    fn set_state(&self, next: GuestState) {
        let current = self.state.get();
        if !current.can_transition_to(next) {
            tracing::warn!(
                "[{}] ignoring guest transition {:?} -> {:?}",
                self.client.label(),
                current,
                next
            );
            return;
        }
        tracing::debug!("[{}] guest {:?} -> {:?}", self.client.label(), current, next);
        self.state.set(next);
    }

    fn store_auth(&self, payload: AuthPayload) {
        match Auth::try_from(payload) {
            Ok(auth) => *self.auth.borrow_mut() = Some(auth),
            Err(e) => tracing::warn!(
                "[{}] ignoring credential with invalid expiry: {}",
                self.client.label(),
                e
            ),
        }
    }

    fn store_context(&self, context: Context) {
        *self.context.borrow_mut() = Some(context.clone());
        self.notify_context(&context);
    }

    fn notify_context(&self, context: &Context) {
        let listeners = self.context_listeners.borrow().clone();
        for listener in listeners {
            if let Err(e) = listener(context) {
                tracing::warn!("[{}] context listener failed: {}", self.client.label(), e);
            }
        }
    }
}

/// Guest side of a bridge.
///
/// Cheap to clone; clones share state. Independent sessions (several guests
/// in one process) are separate values with separate clients.
#[derive(Clone)]
pub struct GuestSession {
    inner: Rc<GuestInner>,
}

impl GuestSession {
    /// Wrap a transport client talking to the host.
    ///
    /// Registers the `context` and `authentication` event handlers that keep
    /// the cached handshake state fresh.
    pub fn new(client: TransportClient) -> Self {
        let inner = Rc::new(GuestInner {
            client,
            state: Cell::new(GuestState::Uninitialized),
            auth: RefCell::new(None),
            context: RefCell::new(None),
            plugin_info: RefCell::new(None),
            context_listeners: RefCell::new(Vec::new()),
        });

        let weak = Rc::downgrade(&inner);
        inner
            .client
            .on_event("context", cache_handler(weak.clone(), GuestInner::store_context));
        inner
            .client
            .on_event("authentication", cache_handler(weak, GuestInner::store_auth));

        Self { inner }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> GuestState {
        self.inner.state.get()
    }

    /// Whether the handshake has completed.
    pub fn is_initialized(&self) -> bool {
        self.state() == GuestState::Initialized
    }

    /// The underlying transport client.
    pub fn client(&self) -> &TransportClient {
        &self.inner.client
    }

    /// Perform the handshake and return the host's reply payload as `T`.
    ///
    /// Waits without a timeout: a host that never answers leaves this future
    /// pending until the session is destroyed. The host's own hello timer is
    /// the cancellation mechanism.
    pub async fn init<T: DeserializeOwned>(&self, options: GuestOptions) -> Result<T, GuestError> {
        let state = self.state();
        if state != GuestState::Uninitialized {
            return Err(GuestError::AlreadyInitialized(state));
        }

        self.inner.set_state(GuestState::Initializing);
        tracing::info!("[{}] sending hello", self.inner.client.label());

        let result = self.handshake(options).await;
        if result.is_err() && self.state() == GuestState::Initializing {
            self.inner.set_state(GuestState::Uninitialized);
        }
        result
    }

    async fn handshake<T: DeserializeOwned>(&self, options: GuestOptions) -> Result<T, GuestError> {
        let reply = self.inner.client.send_request("hello", &()).await?;
        if !reply.ok {
            return Err(GuestError::Rejected {
                kind: reply.kind.clone(),
                reason: reply.error_text(),
            });
        }
        if self.state() != GuestState::Initializing {
            return Err(TransportError::Closed.into());
        }

        let response: T = reply.payload_as()?;

        match reply.payload_as::<HelloPayload>() {
            Ok(hello) => {
                if let Some(auth) = hello.auth {
                    self.inner.store_auth(auth);
                }
                if let Some(plugin_info) = hello.plugin_info {
                    *self.inner.plugin_info.borrow_mut() = Some(plugin_info);
                }
                if let Some(context) = hello.context {
                    *self.inner.context.borrow_mut() = Some(context);
                }
            }
            Err(e) => tracing::debug!(
                "[{}] hello reply carries no handshake state: {}",
                self.inner.client.label(),
                e
            ),
        }

        for (kind, handler) in options.handlers {
            self.inner.client.on_event(kind, handler);
        }

        self.inner.set_state(GuestState::Initialized);
        tracing::info!("[{}] handshake complete", self.inner.client.label());

        let context = self.inner.context.borrow().clone();
        if let Some(context) = context {
            self.inner.notify_context(&context);
        }

        if options.auto_ready {
            self.ready()?;
        }
        Ok(response)
    }

    /// Send a one-way event to the host. Legal in any state.
    pub fn send_event<P: Serialize + ?Sized>(
        &self,
        kind: &str,
        payload: &P,
    ) -> Result<(), GuestError> {
        self.inner.client.send_event(kind, payload)?;
        Ok(())
    }

    /// Send a request to the host and decode its reply payload.
    ///
    /// An `ok = false` reply fails with [`GuestError::Rejected`].
    pub async fn send_request<P, R>(&self, kind: &str, payload: &P) -> Result<R, GuestError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let reply = self.inner.client.send_request(kind, payload).await?;
        if !reply.ok {
            return Err(GuestError::Rejected {
                kind: kind.to_string(),
                reason: reply.error_text(),
            });
        }
        Ok(reply.payload_as()?)
    }

    /// Announce readiness. Each call sends one `ready` event.
    pub fn ready(&self) -> Result<(), GuestError> {
        self.send_event("ready", &())
    }

    /// Fetch a fresh credential from the host.
    ///
    /// Always a round trip, in any state. The cached credential is updated
    /// with the result.
    pub async fn current_token(&self) -> Result<Auth, GuestError> {
        let payload: AuthPayload = self.send_request("authentication", &()).await?;
        let auth = Auth::try_from(payload)?;
        *self.inner.auth.borrow_mut() = Some(auth.clone());
        Ok(auth)
    }

    /// Last credential received from the host, without a round trip.
    pub fn cached_token(&self) -> Result<Auth, AccessError> {
        self.require_initialized("cached_token")?;
        self.inner.auth.borrow().clone().ok_or(AccessError::NotProvided {
            accessor: "cached_token",
            field: "auth",
        })
    }

    /// Context received in the handshake or the latest `context` event.
    pub fn current_context(&self) -> Result<Context, AccessError> {
        self.require_initialized("current_context")?;
        self.inner.context.borrow().clone().ok_or(AccessError::NotProvided {
            accessor: "current_context",
            field: "context",
        })
    }

    /// Mount information received in the handshake.
    pub fn info(&self) -> Result<PluginInfo, AccessError> {
        self.require_initialized("info")?;
        self.inner.plugin_info.borrow().clone().ok_or(AccessError::NotProvided {
            accessor: "info",
            field: "plugin_info",
        })
    }

    /// Register a listener for context changes.
    ///
    /// If a context is already known the listener is invoked immediately.
    /// Listener failures are logged.
    pub fn on_context_update<F>(&self, listener: F)
    where
        F: Fn(&Context) -> Result<(), HandlerError> + 'static,
    {
        let listener: ContextListener = Rc::new(listener);
        self.inner
            .context_listeners
            .borrow_mut()
            .push(Rc::clone(&listener));

        let current = self.inner.context.borrow().clone();
        if let Some(context) = current {
            if let Err(e) = listener(&context) {
                tracing::warn!("[{}] context listener failed: {}", self.inner.client.label(), e);
            }
        }
    }

    /// Close the transport and stop all callbacks. Idempotent.
    ///
    /// A pending `init()` or request fails with [`TransportError::Closed`].
    pub fn destroy(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.inner.set_state(GuestState::Destroyed);
        self.inner.client.close();
        self.inner.context_listeners.borrow_mut().clear();
        tracing::info!("[{}] guest session destroyed", self.inner.client.label());
    }

    fn require_initialized(&self, accessor: &'static str) -> Result<(), AccessError> {
        match self.state() {
            GuestState::Initialized => Ok(()),
            GuestState::Destroyed => Err(AccessError::Destroyed { accessor }),
            GuestState::Uninitialized | GuestState::Initializing => {
                Err(AccessError::NotInitialized { accessor })
            }
        }
    }
}

/// Event handler decoding a payload into the session cache.
fn cache_handler<P>(inner: Weak<GuestInner>, store: fn(&GuestInner, P)) -> EventHandler
where
    P: DeserializeOwned + 'static,
{
    Rc::new(move |envelope: Envelope| -> LocalBoxFuture<Result<(), HandlerError>> {
        let decoded = envelope.payload_as::<P>();
        let inner = inner.upgrade();
        Box::pin(async move {
            let payload = decoded?;
            if let Some(inner) = inner {
                store(&inner, payload);
            }
            Ok(())
        })
    })
}
