//! Event handler table and typed handler adapters.
//!
//! On the wire every envelope is a `{type, payload}` pair with an untyped
//! payload. In process, each handler registration binds a concrete payload
//! type: the adapters below deserialize the payload right after the generic
//! envelope check, so application code never sees raw JSON.
//!
//! ```text
//! Envelope { type: "context", payload: {...} }
//!   ↓
//! registry.handlers_for("context")      (registration order)
//!   ↓
//! EventHandler closure:
//!   1. Deserialize payload → P
//!   2. Call the application handler with P
//!   3. (requests) Serialize R and send the reply
//! ```

use crate::error::HandlerError;
use crate::messaging::{Envelope, to_payload};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

/// Boxed, non-`Send` future.
pub type LocalBoxFuture<T> = Pin<Box<dyn Future<Output = T>>>;

/// Type-erased handler for one non-reply envelope.
pub type EventHandler = Rc<dyn Fn(Envelope) -> LocalBoxFuture<Result<(), HandlerError>>>;

/// Type-erased request handler computing a reply payload.
///
/// Turned into an [`EventHandler`] by `Outbox::replying`, which sends the
/// computed payload (or an error reply) back to the requester.
pub type RequestHandler =
    Rc<dyn Fn(Envelope) -> LocalBoxFuture<Result<Option<Value>, HandlerError>>>;

/// Bind a typed event handler.
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Deserialize)]
/// struct Theme { dark: bool }
///
/// let handler = event_handler(|theme: Theme| async move {
///     apply_theme(theme.dark);
///     Ok(())
/// });
/// client.on_event("theme", handler);
/// ```
pub fn event_handler<P, F, Fut>(handler: F) -> EventHandler
where
    P: DeserializeOwned + 'static,
    F: Fn(P) -> Fut + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + 'static,
{
    let handler = Rc::new(handler);
    Rc::new(move |envelope: Envelope| -> LocalBoxFuture<Result<(), HandlerError>> {
        let handler = Rc::clone(&handler);
        Box::pin(async move {
            let payload: P = envelope.payload_as()?;
            handler(payload).await
        })
    })
}

/// Bind a typed request handler.
///
/// `R` serializing to JSON `null` produces a reply without payload.
pub fn request_handler<P, R, F, Fut>(handler: F) -> RequestHandler
where
    P: DeserializeOwned + 'static,
    R: Serialize + 'static,
    F: Fn(P) -> Fut + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + 'static,
{
    let handler = Rc::new(handler);
    Rc::new(move |envelope: Envelope| -> LocalBoxFuture<Result<Option<Value>, HandlerError>> {
        let handler = Rc::clone(&handler);
        Box::pin(async move {
            let payload: P = envelope.payload_as()?;
            let response = handler(payload).await?;
            Ok(to_payload(&response)?)
        })
    })
}

/// Registry mapping message kinds to ordered handler lists.
///
/// Multiple handlers per kind are allowed; all of them run, in registration
/// order, for every matching envelope.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<EventHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to the list for `kind`.
    pub fn register(&mut self, kind: impl Into<String>, handler: EventHandler) {
        let kind = kind.into();
        tracing::debug!("Registering handler for `{}`", kind);
        self.handlers.entry(kind).or_default().push(handler);
    }

    /// Snapshot of the handlers for `kind`, in registration order.
    ///
    /// Cloned so the registry is not borrowed while handlers run.
    pub fn handlers_for(&self, kind: &str) -> Vec<EventHandler> {
        self.handlers.get(kind).cloned().unwrap_or_default()
    }

    /// Whether any handler is registered for `kind`.
    pub fn has_handler(&self, kind: &str) -> bool {
        self.handlers.get(kind).is_some_and(|list| !list.is_empty())
    }

    /// Number of handlers registered for `kind`.
    pub fn handler_count(&self, kind: &str) -> usize {
        self.handlers.get(kind).map_or(0, Vec::len)
    }

    /// Drop every handler.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::cell::RefCell;

    #[derive(Debug, Deserialize)]
    struct Greeting {
        name: String,
    }

    fn envelope(kind: &str, payload: Option<Value>) -> Envelope {
        Envelope {
            id: crate::messaging::EnvelopeId::generate(),
            kind: kind.to_string(),
            payload,
        }
    }

    #[test]
    fn test_registration_order_and_counts() {
        let mut registry = HandlerRegistry::new();
        assert!(!registry.has_handler("greet"));

        registry.register("greet", event_handler(|_: ()| async { Ok(()) }));
        registry.register("greet", event_handler(|_: ()| async { Ok(()) }));
        registry.register("other", event_handler(|_: ()| async { Ok(()) }));

        assert_eq!(registry.handler_count("greet"), 2);
        assert_eq!(registry.handlers_for("greet").len(), 2);
        assert_eq!(registry.handler_count("missing"), 0);
        assert!(registry.handlers_for("missing").is_empty());

        registry.clear();
        assert!(!registry.has_handler("greet"));
    }

    #[tokio::test]
    async fn test_typed_event_handler_decodes_payload() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let handler = event_handler(move |greeting: Greeting| {
            let sink = Rc::clone(&sink);
            async move {
                sink.borrow_mut().push(greeting.name);
                Ok(())
            }
        });

        handler(envelope("greet", Some(json!({"name": "ada"}))))
            .await
            .unwrap();
        assert_eq!(*seen.borrow(), vec!["ada".to_string()]);
    }

    #[tokio::test]
    async fn test_typed_event_handler_rejects_bad_payload() {
        let handler = event_handler(|_: Greeting| async { Ok(()) });

        let result = handler(envelope("greet", Some(json!(17)))).await;
        assert!(matches!(result, Err(HandlerError::Payload(_))));
    }

    #[tokio::test]
    async fn test_request_handler_serializes_response() {
        let handler = request_handler(|greeting: Greeting| async move {
            Ok(format!("hello {}", greeting.name))
        });

        let payload = handler(envelope("greet", Some(json!({"name": "ada"}))))
            .await
            .unwrap();
        assert_eq!(payload, Some(json!("hello ada")));

        let unit = request_handler(|_: ()| async { Ok(()) });
        assert_eq!(unit(envelope("noop", None)).await.unwrap(), None);
    }
}
