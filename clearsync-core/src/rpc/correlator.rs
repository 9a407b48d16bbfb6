use crate::error::{ClearsyncError, Result};
use crate::rpc::{ResponseFrame, RpcMethod};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::oneshot;

type Waiter = oneshot::Sender<Result<Value>>;

struct PendingRequest {
    method: RpcMethod,
    expected: RpcMethod,
    created_at: Instant,
    sender: Waiter,
}

/// Maps request ids to the futures waiting on their replies.
///
/// A waiter is always registered before its request is written, so a reply
/// can never arrive for an id that is not yet in the map.
pub struct Correlator {
    pending: Mutex<HashMap<u64, PendingRequest>>,
    next_id: AtomicU64,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn register(&self, id: u64, method: RpcMethod) -> oneshot::Receiver<Result<Value>> {
        let (sender, receiver) = oneshot::channel();
        let expected = method.response_method();
        tracing::debug!("Registered waiter {} for {}", id, method);
        self.pending.lock().insert(
            id,
            PendingRequest {
                method,
                expected,
                created_at: Instant::now(),
                sender,
            },
        );
        receiver
    }

    /// Route a response to its waiter. Falls back to the oldest waiter
    /// expecting this method when the id is absent or unknown.
    pub fn complete(&self, frame: ResponseFrame) -> bool {
        let pending = {
            let mut map = self.pending.lock();
            let by_id = frame.id.filter(|id| map.contains_key(id));
            let key = by_id.or_else(|| {
                map.iter()
                    .filter(|(_, p)| p.expected == frame.method)
                    .min_by_key(|(id, p)| (p.created_at, **id))
                    .map(|(id, _)| *id)
            });
            key.and_then(|id| map.remove(&id))
        };

        match pending {
            Some(pending) => {
                tracing::debug!(
                    "{} answered after {}ms",
                    pending.method,
                    pending.created_at.elapsed().as_millis()
                );
                if pending.sender.send(Ok(frame.params)).is_err() {
                    tracing::debug!("Waiter for {} was dropped", pending.method);
                }
                true
            }
            None => false,
        }
    }

    /// Fail one waiter. Returns false if `id` is not pending.
    pub fn fail(&self, id: u64, make_error: impl FnOnce(&RpcMethod) -> ClearsyncError) -> bool {
        let pending = self.pending.lock().remove(&id);
        match pending {
            Some(pending) => {
                let error = make_error(&pending.method);
                tracing::warn!("{} failed: {}", pending.method, error);
                let _ = pending.sender.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding waiter, building one error per request.
    pub fn fail_all(&self, make_error: impl Fn(&RpcMethod) -> ClearsyncError) -> usize {
        let drained: Vec<PendingRequest> = self.pending.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            let _ = pending.sender.send(Err(make_error(&pending.method)));
        }
        if count > 0 {
            tracing::warn!("Failed {} pending request(s)", count);
        }
        count
    }

    /// Drop a waiter without notifying it (timeout or send failure).
    pub fn cancel(&self, id: u64) {
        self.pending.lock().remove(&id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(id: Option<u64>, method: RpcMethod) -> ResponseFrame {
        ResponseFrame {
            id,
            method,
            params: json!({ "ok": true }),
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_complete_by_id() {
        let correlator = Correlator::new();
        let first = correlator.register(1, RpcMethod::GetConfig);
        let second = correlator.register(2, RpcMethod::GetConfig);

        assert!(correlator.complete(frame(Some(2), RpcMethod::GetConfig)));
        assert!(second.await.unwrap().is_ok());
        assert_eq!(correlator.pending_count(), 1);
        drop(first);
    }

    #[tokio::test]
    async fn test_unknown_id_routes_to_oldest_matching_waiter() {
        let correlator = Correlator::new();
        let challenge = correlator.register(1, RpcMethod::AuthRequest);
        let _config = correlator.register(2, RpcMethod::GetConfig);

        assert!(correlator.complete(frame(None, RpcMethod::AuthChallenge)));
        assert!(challenge.await.unwrap().is_ok());
        assert!(!correlator.complete(frame(Some(99), RpcMethod::CloseChannel)));
    }

    #[tokio::test]
    async fn test_fail_single_and_all() {
        let correlator = Correlator::new();
        let a = correlator.register(1, RpcMethod::CreateChannel);
        let b = correlator.register(2, RpcMethod::ResizeChannel);
        let c = correlator.register(3, RpcMethod::CloseChannel);

        assert!(correlator.fail(1, |m| ClearsyncError::protocol(m.as_str(), "denied")));
        assert!(matches!(
            a.await.unwrap(),
            Err(ClearsyncError::Protocol { .. })
        ));

        let failed = correlator.fail_all(|m| ClearsyncError::protocol(m.as_str(), "down"));
        assert_eq!(failed, 2);
        assert!(b.await.unwrap().is_err());
        assert!(c.await.unwrap().is_err());
        assert_eq!(correlator.pending_count(), 0);
    }

    #[test]
    fn test_ids_increase() {
        let correlator = Correlator::new();
        let a = correlator.next_id();
        let b = correlator.next_id();
        assert!(b > a);
    }
}
