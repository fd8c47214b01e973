use crate::{Error, MethodCall, Result};
use std::collections::VecDeque;
use tokio::sync::oneshot;

/// Waiter for the peer's answer to an outbound request.
pub type ResponseSender = oneshot::Sender<Result<MethodCall>>;

/// An outbound call held back while a key exchange is pending.
#[derive(Debug)]
pub struct QueuedMethod {
    pub topic: String,
    pub call: MethodCall,
    pub callback: Option<ResponseSender>,
}

impl QueuedMethod {
    /// Fails the caller's waiter, if any.
    pub fn fail(self, error: Error) {
        if let Some(callback) = self.callback {
            let _ = callback.send(Err(error));
        }
    }
}

/// FIFO of [`QueuedMethod`]s. In-memory only; a restart drops the queue
/// together with the pending rotation that caused it.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    entries: VecDeque<QueuedMethod>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: QueuedMethod) {
        self.entries.push_back(entry);
    }

    /// Puts back an entry that could not be delivered, ahead of everything else.
    pub fn requeue(&mut self, entry: QueuedMethod) {
        self.entries.push_front(entry);
    }

    pub fn pop(&mut self) -> Option<QueuedMethod> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Empties the queue, failing every waiter with the error built by `error`.
    pub fn fail_all(&mut self, error: impl Fn() -> Error) -> usize {
        let count = self.entries.len();
        for entry in self.entries.drain(..) {
            entry.fail(error());
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64, callback: Option<ResponseSender>) -> QueuedMethod {
        QueuedMethod {
            topic: "peer".to_string(),
            call: MethodCall::result(id, serde_json::Value::Bool(true)),
            callback,
        }
    }

    #[test]
    fn test_preserves_enqueue_order_and_requeue_goes_first() {
        let mut queue = OutboundQueue::new();
        queue.push(entry(1, None));
        queue.push(entry(2, None));
        queue.push(entry(3, None));

        let first = queue.pop().unwrap();
        assert_eq!(first.call.id(), 1);
        queue.requeue(first);

        let ids: Vec<u64> = std::iter::from_fn(|| queue.pop()).map(|e| e.call.id()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_fail_all_notifies_waiters() {
        let mut queue = OutboundQueue::new();
        let (tx, rx) = oneshot::channel();
        queue.push(entry(1, Some(tx)));
        queue.push(entry(2, None));

        assert_eq!(queue.fail_all(|| Error::Timeout("key exchange".to_string())), 2);
        assert!(queue.is_empty());
        assert!(matches!(rx.await.unwrap(), Err(Error::Timeout(_))));
    }
}
