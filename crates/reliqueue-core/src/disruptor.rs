use crate::error::Result;
use crate::queue::Queue;
use crate::Message;
use async_trait::async_trait;
use serde::Deserialize;

/// A bounded in-process ring buffer (spec.md §4.5).
///
/// Built on `flume`'s bounded MPMC channel, the same channel crate the
/// teacher uses for `Spool::enumerate`. There is no ephemeral storage
/// and no crash recovery story: this adapter exists purely to satisfy
/// the contract for latency-sensitive in-process pipelines where
/// losing in-flight work on a crash is acceptable.
///
/// `enqueue` and `take` are both non-blocking: a full buffer reports
/// `Ok(false)` (the caller may retry) rather than blocking the
/// producer, and an empty buffer reports `Ok(None)` rather than
/// blocking the consumer, consistent with every other adapter's
/// best-effort, non-blocking contract semantics.
/// Configuration for the disruptor adapter: just the ring buffer's
/// fixed capacity.
#[derive(Debug, Clone, Deserialize)]
pub struct DisruptorQueueConfig {
    pub capacity: usize,
}

pub struct DisruptorQueue {
    sender: flume::Sender<Message>,
    receiver: flume::Receiver<Message>,
}

impl DisruptorQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = flume::bounded(capacity);
        Self { sender, receiver }
    }

    pub fn open(config: &DisruptorQueueConfig) -> Self {
        Self::new(config.capacity)
    }
}

#[async_trait]
impl Queue for DisruptorQueue {
    async fn enqueue(&self, msg: Message) -> Result<bool> {
        let sent = self.sender.try_send(msg).is_ok();
        tracing::trace!(sent, "enqueue");
        Ok(sent)
    }

    async fn requeue(&self, mut msg: Message) -> Result<bool> {
        msg.mark_requeued();
        let sent = self.sender.try_send(msg).is_ok();
        tracing::trace!(sent, "requeue");
        Ok(sent)
    }

    async fn requeue_silent(&self, msg: Message) -> Result<bool> {
        let sent = self.sender.try_send(msg).is_ok();
        tracing::trace!(sent, "requeue_silent");
        Ok(sent)
    }

    async fn take(&self) -> Result<Option<Message>> {
        let taken = self.receiver.try_recv().ok();
        if let Some(msg) = &taken {
            tracing::trace!(id = %msg.id, "take");
        }
        Ok(taken)
    }

    async fn finalize(&self, _id: &str) -> Result<()> {
        // No ephemeral storage: a taken message is gone the moment
        // `take` returns it, so there is nothing to acknowledge.
        Ok(())
    }

    async fn orphans(&self, _threshold_ms: i64) -> Result<Vec<Message>> {
        Ok(Vec::new())
    }

    async fn queue_size(&self) -> Result<usize> {
        Ok(self.sender.len())
    }

    async fn ephemeral_size(&self) -> Result<usize> {
        Ok(0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Message;

    #[tokio::test]
    async fn fifo_round_trip() {
        let q = DisruptorQueue::new(4);
        q.enqueue(Message::new(None, b"a".to_vec())).await.unwrap();
        q.enqueue(Message::new(None, b"b".to_vec())).await.unwrap();

        let first = q.take().await.unwrap().unwrap();
        assert_eq!(first.content, b"a");
        q.finalize(first.id.as_str()).await.unwrap();

        assert_eq!(q.ephemeral_size().await.unwrap(), 0);
        assert!(q.orphans(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn capacity_bounds_enqueue() {
        let q = DisruptorQueue::new(1);
        assert!(q.enqueue(Message::new(None, b"a".to_vec())).await.unwrap());
        assert!(!q.enqueue(Message::new(None, b"b".to_vec())).await.unwrap());
    }

    #[tokio::test]
    async fn empty_take_returns_none() {
        let q = DisruptorQueue::new(1);
        assert!(q.take().await.unwrap().is_none());
    }
}
