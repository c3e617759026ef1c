//! Correlation of outstanding human-input requests
//!
//! A human-proxy turn suspends the run loop on a one-shot completion
//! handle until a viewer answers, the session tears down, or the turn is
//! interrupted. Each request gets a unique id; resolution is idempotent
//! from the caller's perspective (resolving an unknown or already-settled
//! id reports `false` and does nothing).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    /// No transport is bound, so a request could never be answered.
    /// Failing immediately beats hanging forever.
    #[error("no input transport bound to the correlator")]
    NoTransport,

    /// The request was cancelled before an answer arrived (turn
    /// interrupted, or the session cancelled all pending input).
    #[error("input request {0} was cancelled")]
    Cancelled(String),
}

/// Notification handed to the transport when a new request is registered.
#[derive(Debug, Clone)]
pub struct InputRequestNotice {
    pub request_id: String,
    pub prompt: String,
    pub requester: String,
}

/// Delivery channel for new-request notifications, typically a session
/// broadcasting to its viewers.
pub trait InputTransport: Send + Sync {
    fn notify(&self, notice: InputRequestNotice);
}

impl<F: Fn(InputRequestNotice) + Send + Sync> InputTransport for F {
    fn notify(&self, notice: InputRequestNotice) {
        self(notice);
    }
}

/// Registry of pending human-input requests for one session.
#[derive(Default)]
pub struct InputCorrelator {
    transport: Mutex<Option<Arc<dyn InputTransport>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<String>>>,
}

impl InputCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the transport that learns about new requests. Rebinding (a
    /// session reconnecting its fan-out) replaces the previous transport.
    pub fn bind_transport(&self, transport: Arc<dyn InputTransport>) {
        *self.transport.lock().unwrap() = Some(transport);
    }

    /// Register a request and suspend until it is resolved or cancelled.
    ///
    /// Concurrent requests are independently addressable; cancelling one
    /// never affects another.
    pub async fn request(
        &self,
        prompt: impl Into<String>,
        requester: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<String, InputError> {
        let transport = self
            .transport
            .lock()
            .unwrap()
            .clone()
            .ok_or(InputError::NoTransport)?;

        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(request_id.clone(), tx);

        transport.notify(InputRequestNotice {
            request_id: request_id.clone(),
            prompt: prompt.into(),
            requester: requester.into(),
        });

        tokio::select! {
            answer = rx => {
                // A dropped sender means cancel_all ran; the entry is
                // already gone from the registry.
                answer.map_err(|_| InputError::Cancelled(request_id))
            }
            () = cancel.cancelled() => {
                self.pending.lock().unwrap().remove(&request_id);
                Err(InputError::Cancelled(request_id))
            }
        }
    }

    /// Complete a pending request. Returns `false` (logged, no side
    /// effect) when the id is unknown or already completed.
    pub fn resolve(&self, request_id: &str, value: impl Into<String>) -> bool {
        let Some(tx) = self.pending.lock().unwrap().remove(request_id) else {
            tracing::warn!(request_id, "resolve for unknown or completed input request");
            return false;
        };
        tx.send(value.into()).is_ok()
    }

    /// Cancel every still-pending request and clear the registry. Safe to
    /// call at any time, including after entries already completed.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.pending.lock().unwrap().drain().collect();
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "cancelling pending input requests");
        }
        // Dropping the senders wakes every waiting requester with an error.
    }

    #[allow(dead_code)] // Introspection API, exercised by tests
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    #[allow(dead_code)] // Introspection API, exercised by tests
    pub fn has_pending(&self) -> bool {
        !self.pending.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn correlator_with_channel() -> (Arc<InputCorrelator>, mpsc::UnboundedReceiver<InputRequestNotice>) {
        let correlator = Arc::new(InputCorrelator::new());
        let (tx, rx) = mpsc::unbounded_channel();
        correlator.bind_transport(Arc::new(move |notice: InputRequestNotice| {
            let _ = tx.send(notice);
        }));
        (correlator, rx)
    }

    #[tokio::test]
    async fn test_no_transport_fails_immediately() {
        let correlator = InputCorrelator::new();
        let cancel = CancellationToken::new();
        let result = correlator.request("prompt", "alice", &cancel).await;
        assert_eq!(result, Err(InputError::NoTransport));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_resolve_round_trip() {
        let (correlator, mut notices) = correlator_with_channel();
        let cancel = CancellationToken::new();

        let waiter = {
            let correlator = correlator.clone();
            tokio::spawn(async move { correlator.request("name a number", "alice", &cancel).await })
        };

        let notice = notices.recv().await.unwrap();
        assert_eq!(notice.requester, "alice");
        assert_eq!(notice.prompt, "name a number");
        assert!(correlator.has_pending());

        assert!(correlator.resolve(&notice.request_id, "42"));
        assert_eq!(waiter.await.unwrap(), Ok("42".to_string()));
        assert_eq!(correlator.pending_count(), 0);

        // Second resolve of the same id reports stale.
        assert!(!correlator.resolve(&notice.request_id, "43"));
    }

    #[tokio::test]
    async fn test_resolve_unknown_id_is_false() {
        let (correlator, _notices) = correlator_with_channel();
        assert!(!correlator.resolve("no-such-id", "value"));
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_independent() {
        let (correlator, mut notices) = correlator_with_channel();
        let cancel_a = CancellationToken::new();
        let cancel_b = CancellationToken::new();

        let waiter_a = {
            let correlator = correlator.clone();
            let cancel = cancel_a.clone();
            tokio::spawn(async move { correlator.request("a?", "alice", &cancel).await })
        };
        let waiter_b = {
            let correlator = correlator.clone();
            let cancel = cancel_b.clone();
            tokio::spawn(async move { correlator.request("b?", "bob", &cancel).await })
        };

        let first = notices.recv().await.unwrap();
        let second = notices.recv().await.unwrap();
        assert_eq!(correlator.pending_count(), 2);

        let (alice_id, bob_id) = if first.requester == "alice" {
            (first.request_id, second.request_id)
        } else {
            (second.request_id, first.request_id)
        };

        // Cancelling bob's turn leaves alice's request untouched.
        cancel_b.cancel();
        assert!(matches!(
            waiter_b.await.unwrap(),
            Err(InputError::Cancelled(_))
        ));
        assert_eq!(correlator.pending_count(), 1);

        assert!(correlator.resolve(&alice_id, "ok"));
        assert_eq!(waiter_a.await.unwrap(), Ok("ok".to_string()));

        // Bob's entry was removed by cancellation: resolving it is stale.
        assert!(!correlator.resolve(&bob_id, "late"));
    }

    #[tokio::test]
    async fn test_cancel_all_wakes_everyone() {
        let (correlator, mut notices) = correlator_with_channel();
        let cancel = CancellationToken::new();

        let mut waiters = Vec::new();
        for i in 0..3 {
            let correlator = correlator.clone();
            let cancel = cancel.clone();
            waiters.push(tokio::spawn(async move {
                correlator.request(format!("q{i}"), "alice", &cancel).await
            }));
        }
        for _ in 0..3 {
            notices.recv().await.unwrap();
        }
        assert_eq!(correlator.pending_count(), 3);

        correlator.cancel_all();
        assert_eq!(correlator.pending_count(), 0);
        assert!(!correlator.has_pending());

        for waiter in waiters {
            assert!(matches!(
                waiter.await.unwrap(),
                Err(InputError::Cancelled(_))
            ));
        }

        // Calling again with nothing pending is harmless.
        correlator.cancel_all();
    }

    #[tokio::test]
    async fn test_turn_cancellation_removes_entry() {
        let (correlator, mut notices) = correlator_with_channel();
        let cancel = CancellationToken::new();

        let waiter = {
            let correlator = correlator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { correlator.request("q", "alice", &cancel).await })
        };
        notices.recv().await.unwrap();

        cancel.cancel();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(InputError::Cancelled(_))
        ));

        // Removed as if externally cancelled.
        tokio::time::timeout(Duration::from_millis(100), async {
            while correlator.pending_count() != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("entry should be removed after cancellation");
    }
}
