//! Pending call state tracking.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::bridge::protocol::ControlRequest;
use crate::value::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Pending,
    Resolved,
}

struct CallInner {
    id: String,
    payload: Record,
    created_at: Instant,
    response: watch::Sender<Option<Arc<Record>>>,
}

/// An outstanding request and the slot its response lands in.
///
/// Clones share the same call: the caller keeps one to wait on, the
/// dispatcher's worker resolves another. The response is set exactly once and
/// every waiter observes the same `Arc<Record>`.
#[derive(Clone)]
pub struct PendingCall {
    inner: Arc<CallInner>,
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

impl PendingCall {
    pub fn new(id: impl Into<String>, payload: Record) -> Self {
        let (response, _) = watch::channel(None);
        Self {
            inner: Arc::new(CallInner {
                id: id.into(),
                payload,
                created_at: Instant::now(),
                response,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn payload(&self) -> &Record {
        &self.inner.payload
    }

    pub fn status(&self) -> CallStatus {
        if self.inner.response.borrow().is_some() {
            CallStatus::Resolved
        } else {
            CallStatus::Pending
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status() == CallStatus::Resolved
    }

    /// Time since the call was created.
    pub fn elapsed(&self) -> Duration {
        self.inner.created_at.elapsed()
    }

    /// Response if already resolved, without waiting.
    pub fn try_response(&self) -> Option<Arc<Record>> {
        self.inner.response.borrow().clone()
    }

    /// Wait until the response is set.
    ///
    /// Any number of tasks may wait on clones of the same call; all of them
    /// are released by the single resolution.
    pub async fn wait(&self) -> Arc<Record> {
        let mut rx = self.inner.response.subscribe();
        loop {
            if let Some(response) = rx.borrow_and_update().as_ref() {
                return Arc::clone(response);
            }
            // The sender lives in `inner`, which `self` keeps alive.
            if rx.changed().await.is_err() {
                unreachable!("pending call sender dropped while a waiter holds it");
            }
        }
    }

    /// Request frame for the wire.
    pub(crate) fn request(&self) -> ControlRequest {
        ControlRequest::call(self.inner.id.clone(), self.inner.payload.clone())
    }

    /// Store the response and wake every waiter.
    ///
    /// Returns `false` if the call was already resolved (bug in the caller);
    /// the first response is kept.
    pub(crate) fn resolve(&self, response: Record) -> bool {
        let response = Arc::new(response);
        let stored = self.inner.response.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(response);
            true
        });

        if !stored {
            debug_assert!(false, "pending call resolved twice");
            tracing::error!(call_id = %self.inner.id, "Bug: attempted to resolve call twice");
        }
        stored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn response(pairs: &[(&str, &str)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect()
    }

    #[test]
    fn new_starts_pending() {
        let call = PendingCall::new("r1", response(&[("q", "dune")]));
        assert_eq!(call.id(), "r1");
        assert_eq!(call.status(), CallStatus::Pending);
        assert!(call.try_response().is_none());
        assert_eq!(call.payload().get("q"), Some(&Value::from("dune")));
    }

    #[test]
    fn resolve_sets_response_once() {
        let call = PendingCall::new("r1", Record::new());
        assert!(call.resolve(response(&[("ok", "1")])));
        assert!(call.is_resolved());
        assert_eq!(
            call.try_response().as_deref(),
            Some(&response(&[("ok", "1")]))
        );
    }

    #[test]
    fn request_carries_id_and_payload() {
        let call = PendingCall::new("r1", response(&[("q", "dune")]));
        assert_eq!(
            call.request(),
            ControlRequest::call("r1", response(&[("q", "dune")]))
        );
    }

    #[tokio::test]
    async fn wait_returns_immediately_if_resolved() {
        let call = PendingCall::new("r1", Record::new());
        call.resolve(response(&[("ok", "1")]));

        let got = call.wait().await;
        assert_eq!(got.get("ok"), Some(&Value::from("1")));
    }

    #[tokio::test]
    async fn wait_blocks_until_resolved() {
        let call = PendingCall::new("r1", Record::new());
        let waiter = {
            let call = call.clone();
            tokio::spawn(async move { call.wait().await })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        call.resolve(response(&[("ok", "1")]));
        let got = waiter.await.unwrap();
        assert_eq!(got.get("ok"), Some(&Value::from("1")));
    }

    #[tokio::test]
    async fn all_waiters_observe_the_same_response() {
        let call = PendingCall::new("r1", Record::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let call = call.clone();
                tokio::spawn(async move { call.wait().await })
            })
            .collect();

        tokio::task::yield_now().await;
        call.resolve(response(&[("ok", "1")]));

        let mut results = Vec::new();
        for waiter in waiters {
            results.push(waiter.await.unwrap());
        }
        for result in &results[1..] {
            assert!(Arc::ptr_eq(&results[0], result));
        }
    }
}
