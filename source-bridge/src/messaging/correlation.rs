//! Request/response correlation.
//!
//! # Architecture
//!
//! ```text
//! Request Flow:
//!   1. Register oneshot::Sender under the request id
//!   2. Post the request over the raw channel
//!   3. Caller awaits the ReplyFuture (oneshot::Receiver)
//!
//! Reply Flow:
//!   4. Reply arrives with in_reply_to
//!   5. Remove the entry for in_reply_to (at most once)
//!   6. Fire the oneshot::Sender with the full ReplyEnvelope
//!
//! Close Flow:
//!   4. Client closes
//!   5. Every entry is dropped, receivers observe TransportError::Closed
//! ```
//!
//! There is no per-request timeout at this layer. A request whose reply
//! never arrives stays pending until the client closes.

use crate::error::TransportError;
use crate::messaging::{EnvelopeId, ReplyEnvelope};
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// A request waiting for its reply.
///
/// Consumed on completion, so an entry can only ever be completed once.
pub struct PendingReply {
    /// Kind of the request, kept for diagnostics.
    kind: String,

    /// Delivers the reply to the waiting caller.
    sender: oneshot::Sender<ReplyEnvelope>,

    /// When the request was registered.
    start_time: Instant,
}

impl PendingReply {
    fn new(kind: String, sender: oneshot::Sender<ReplyEnvelope>) -> Self {
        Self {
            kind,
            sender,
            start_time: Instant::now(),
        }
    }

    /// Kind of the request.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Time since the request was registered.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Hand the reply to the waiting caller.
    ///
    /// Returns false if the caller stopped waiting (dropped its future).
    pub fn complete(self, reply: ReplyEnvelope) -> bool {
        let elapsed = self.elapsed();
        match self.sender.send(reply) {
            Ok(()) => {
                tracing::debug!(
                    "PendingReply::complete: `{}` answered after {:?}",
                    self.kind,
                    elapsed
                );
                true
            }
            Err(_) => {
                tracing::warn!(
                    "PendingReply::complete: caller of `{}` stopped waiting",
                    self.kind
                );
                false
            }
        }
    }
}

/// Outcome of matching an inbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The waiting caller received the reply.
    Delivered,

    /// An entry existed but its caller had dropped the future.
    Abandoned,

    /// No request with this id is pending (late, duplicate or foreign reply).
    Unknown,
}

/// Table of requests awaiting replies, keyed by request id.
///
/// Uses `RefCell` for interior mutability (single-threaded, no locking).
/// Borrows never span an await point.
#[derive(Default)]
pub struct PendingRequests {
    entries: RefCell<HashMap<EnvelopeId, PendingReply>>,
}

impl PendingRequests {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a continuation for request `id`.
    ///
    /// At most one continuation may exist per id.
    pub fn register(
        &self,
        id: EnvelopeId,
        kind: impl Into<String>,
    ) -> Result<oneshot::Receiver<ReplyEnvelope>, TransportError> {
        let mut entries = self.entries.borrow_mut();
        if entries.contains_key(&id) {
            return Err(TransportError::DuplicateRequestId(id));
        }

        let (tx, rx) = oneshot::channel();
        entries.insert(id, PendingReply::new(kind.into(), tx));
        Ok(rx)
    }

    /// Remove the entry for `id` without completing it.
    ///
    /// The waiting caller observes [`TransportError::Closed`].
    pub fn forget(&self, id: &EnvelopeId) -> bool {
        self.entries.borrow_mut().remove(id).is_some()
    }

    /// Match a reply to its request, removing the entry.
    pub fn resolve(&self, reply: ReplyEnvelope) -> Resolution {
        // Release the borrow before completing: the woken caller may issue
        // new requests.
        let entry = self.entries.borrow_mut().remove(&reply.in_reply_to);
        match entry {
            Some(pending) => {
                if pending.complete(reply) {
                    Resolution::Delivered
                } else {
                    Resolution::Abandoned
                }
            }
            None => Resolution::Unknown,
        }
    }

    /// Drop every entry; all waiting callers observe `Closed`.
    ///
    /// Returns the number of rejected requests.
    pub fn reject_all(&self) -> usize {
        let drained: Vec<PendingReply> =
            self.entries.borrow_mut().drain().map(|(_, p)| p).collect();
        for pending in &drained {
            tracing::debug!(
                "PendingRequests::reject_all: rejecting `{}` after {:?}",
                pending.kind(),
                pending.elapsed()
            );
        }
        drained.len()
    }

    /// Number of requests awaiting replies.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Whether no request is awaiting a reply.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Whether request `id` is awaiting a reply.
    pub fn contains(&self, id: &EnvelopeId) -> bool {
        self.entries.borrow().contains_key(id)
    }
}

/// Future resolving to the reply of one request.
///
/// Created by `TransportClient::send_request`. The request is already
/// registered and posted when this future is returned.
pub struct ReplyFuture {
    id: EnvelopeId,
    state: ReplyState,
}

enum ReplyState {
    Waiting(oneshot::Receiver<ReplyEnvelope>),
    Failed(Option<TransportError>),
}

impl ReplyFuture {
    pub(crate) fn waiting(id: EnvelopeId, receiver: oneshot::Receiver<ReplyEnvelope>) -> Self {
        Self {
            id,
            state: ReplyState::Waiting(receiver),
        }
    }

    pub(crate) fn failed(id: EnvelopeId, error: TransportError) -> Self {
        Self {
            id,
            state: ReplyState::Failed(Some(error)),
        }
    }

    /// Id of the request this future waits on.
    pub fn id(&self) -> &EnvelopeId {
        &self.id
    }
}

impl Future for ReplyFuture {
    type Output = Result<ReplyEnvelope, TransportError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            ReplyState::Waiting(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(reply)) => Poll::Ready(Ok(reply)),
                // Sender dropped: the entry was rejected on close.
                Poll::Ready(Err(_)) => Poll::Ready(Err(TransportError::Closed)),
                Poll::Pending => Poll::Pending,
            },
            ReplyState::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(TransportError::Closed)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_to(id: &str) -> ReplyEnvelope {
        ReplyEnvelope {
            id: EnvelopeId::generate(),
            kind: "test".to_string(),
            in_reply_to: EnvelopeId::new(id),
            ok: true,
            payload: None,
            error: None,
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let pending = PendingRequests::new();
        let rx = pending.register(EnvelopeId::new("q1"), "test").unwrap();
        assert_eq!(pending.len(), 1);

        assert_eq!(pending.resolve(reply_to("q1")), Resolution::Delivered);
        assert!(pending.is_empty());

        let reply = rx.blocking_recv().unwrap();
        assert_eq!(reply.in_reply_to.as_str(), "q1");
    }

    #[test]
    fn test_duplicate_reply_is_dropped() {
        let pending = PendingRequests::new();
        let _rx = pending.register(EnvelopeId::new("q1"), "test").unwrap();

        assert_eq!(pending.resolve(reply_to("q1")), Resolution::Delivered);
        assert_eq!(pending.resolve(reply_to("q1")), Resolution::Unknown);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let pending = PendingRequests::new();
        let _rx = pending.register(EnvelopeId::new("q1"), "test").unwrap();

        let result = pending.register(EnvelopeId::new("q1"), "test");
        assert!(matches!(result, Err(TransportError::DuplicateRequestId(_))));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_abandoned_request() {
        let pending = PendingRequests::new();
        let rx = pending.register(EnvelopeId::new("q1"), "test").unwrap();
        drop(rx);

        assert_eq!(pending.resolve(reply_to("q1")), Resolution::Abandoned);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_unrelated_reply_leaves_other_requests_pending() {
        let pending = PendingRequests::new();
        let _rx1 = pending.register(EnvelopeId::new("q1"), "test").unwrap();
        let mut rx2 = pending.register(EnvelopeId::new("q2"), "test").unwrap();

        assert_eq!(pending.resolve(reply_to("q1")), Resolution::Delivered);
        assert!(pending.contains(&EnvelopeId::new("q2")));
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reject_all_fails_waiting_futures() {
        let pending = PendingRequests::new();
        let rx = pending.register(EnvelopeId::new("q1"), "test").unwrap();
        let future = ReplyFuture::waiting(EnvelopeId::new("q1"), rx);

        assert_eq!(pending.reject_all(), 1);
        assert!(matches!(future.await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_failed_future_reports_error() {
        let future = ReplyFuture::failed(EnvelopeId::new("q1"), TransportError::Closed);
        assert_eq!(future.id().as_str(), "q1");
        assert!(matches!(future.await, Err(TransportError::Closed)));
    }
}
