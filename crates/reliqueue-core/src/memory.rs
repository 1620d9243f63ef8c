use crate::ephemeral::{EnqueueKind, EphemeralPolicy};
use crate::error::Result;
use crate::queue::{Ordering, Queue, DEFAULT_ORPHAN_BATCH_SIZE};
use crate::{Message, MessageId};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

/// The in-memory reference adapter (spec.md §4.2): the behavioral
/// yardstick every other adapter is tested against.
///
/// Queue storage is an ordered sequence of ids; ephemeral storage maps
/// id to its take-timestamp; a separate payload map holds the message
/// itself so long as it is reachable from either store (I3/I4). All
/// operations take the same exclusive lock, so there is no partial
/// state a concurrent reader could observe.
pub struct InMemoryQueue {
    ordering: Ordering,
    ephemeral_policy: EphemeralPolicy,
    inner: Mutex<Inner>,
}

struct Inner {
    pending: VecDeque<MessageId>,
    payloads: HashMap<MessageId, Message>,
    ephemeral: HashMap<MessageId, Instant>,
}

impl InMemoryQueue {
    pub fn new(ordering: Ordering, ephemeral_policy: EphemeralPolicy) -> Self {
        Self {
            ordering,
            ephemeral_policy,
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                payloads: HashMap::new(),
                ephemeral: HashMap::new(),
            }),
        }
    }

    fn do_enqueue(&self, msg: Message, kind: EnqueueKind) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let kind = self.ephemeral_policy.resolve_kind(kind);
        if matches!(kind, EnqueueKind::Requeue | EnqueueKind::RequeueSilent) {
            inner.ephemeral.remove(&msg.id);
        }
        inner.pending.push_back(msg.id.clone());
        inner.payloads.insert(msg.id.clone(), msg);
        true
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn enqueue(&self, msg: Message) -> Result<bool> {
        tracing::trace!(id = %msg.id, "enqueue");
        Ok(self.do_enqueue(msg, EnqueueKind::New))
    }

    async fn requeue(&self, mut msg: Message) -> Result<bool> {
        msg.mark_requeued();
        tracing::trace!(id = %msg.id, "requeue");
        Ok(self.do_enqueue(msg, EnqueueKind::Requeue))
    }

    async fn requeue_silent(&self, msg: Message) -> Result<bool> {
        tracing::trace!(id = %msg.id, "requeue_silent");
        Ok(self.do_enqueue(msg, EnqueueKind::RequeueSilent))
    }

    async fn take(&self) -> Result<Option<Message>> {
        let mut inner = self.inner.lock().unwrap();

        if self
            .ephemeral_policy
            .is_at_capacity(inner.ephemeral.len())
        {
            tracing::debug!("take: ephemeral storage at capacity");
            return Ok(None);
        }

        let id = match self.ordering {
            Ordering::Fifo => inner.pending.pop_front(),
            Ordering::Lifo => inner.pending.pop_back(),
        };
        let Some(id) = id else {
            return Ok(None);
        };

        let msg = inner
            .payloads
            .get(&id)
            .cloned()
            .expect("pending id always has a payload");

        if self.ephemeral_policy.disabled {
            inner.payloads.remove(&id);
        } else {
            inner.ephemeral.insert(id.clone(), Instant::now());
        }

        tracing::trace!(%id, "take");
        Ok(Some(msg))
    }

    async fn finalize(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let id: MessageId = id.into();
        inner.ephemeral.remove(&id);
        inner.payloads.remove(&id);
        tracing::trace!(%id, "finalize");
        Ok(())
    }

    async fn orphans(&self, threshold_ms: i64) -> Result<Vec<Message>> {
        let inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let threshold = std::time::Duration::from_millis(threshold_ms.max(0) as u64);

        let mut out: Vec<Message> = inner
            .ephemeral
            .iter()
            .filter(|(_, taken_at)| now.duration_since(**taken_at) >= threshold)
            .filter_map(|(id, _)| inner.payloads.get(id).cloned())
            .collect();

        out.sort_by_key(|m| m.timestamp);
        out.truncate(DEFAULT_ORPHAN_BATCH_SIZE);
        tracing::debug!(count = out.len(), threshold_ms, "orphans");
        Ok(out)
    }

    async fn queue_size(&self) -> Result<usize> {
        Ok(self.inner.lock().unwrap().pending.len())
    }

    async fn ephemeral_size(&self) -> Result<usize> {
        Ok(self.inner.lock().unwrap().ephemeral.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Message;
    use std::time::Duration;

    fn queue(ephemeral_max: Option<usize>) -> InMemoryQueue {
        InMemoryQueue::new(Ordering::Fifo, EphemeralPolicy::new(false, ephemeral_max))
    }

    #[tokio::test]
    async fn round_trip() {
        let q = queue(None);
        assert!(q.enqueue(Message::new(None, b"hello".to_vec())).await.unwrap());
        let taken = q.take().await.unwrap().unwrap();
        assert_eq!(taken.content, b"hello");
        assert_eq!(taken.num_requeues, 0);
        assert_eq!(taken.origin_timestamp, taken.timestamp);
        q.finalize(taken.id.as_str()).await.unwrap();
        assert_eq!(q.queue_size().await.unwrap(), 0);
        assert_eq!(q.ephemeral_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn requeue_updates_counters() {
        let q = queue(None);
        q.enqueue(Message::new(None, b"x".to_vec())).await.unwrap();
        let origin = {
            let taken = q.take().await.unwrap().unwrap();
            let origin = taken.origin_timestamp;
            q.requeue(taken).await.unwrap();
            origin
        };
        let second = q.take().await.unwrap().unwrap();
        assert_eq!(second.num_requeues, 1);
        assert_eq!(second.origin_timestamp, origin);
        assert!(second.timestamp >= origin);
    }

    #[tokio::test]
    async fn silent_requeue_preserves_counters() {
        let q = queue(None);
        q.enqueue(Message::new(None, b"x".to_vec())).await.unwrap();
        let first = q.take().await.unwrap().unwrap();
        let origin_ts = first.timestamp;
        q.requeue_silent(first).await.unwrap();
        let second = q.take().await.unwrap().unwrap();
        assert_eq!(second.num_requeues, 0);
        assert_eq!(second.timestamp, origin_ts);
    }

    #[tokio::test]
    async fn orphan_reclaim() {
        let q = queue(None);
        q.enqueue(Message::new(None, b"orph".to_vec())).await.unwrap();
        let taken = q.take().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let orphans = q.orphans(10).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, taken.id);

        q.requeue(taken).await.unwrap();
        let again = q.take().await.unwrap().unwrap();
        assert_eq!(again.content, b"orph");
    }

    #[tokio::test]
    async fn cap_pushback() {
        let q = queue(Some(2));
        for i in 0..4u8 {
            q.enqueue(Message::new(None, vec![i])).await.unwrap();
        }
        let t1 = q.take().await.unwrap().unwrap();
        let _t2 = q.take().await.unwrap().unwrap();
        assert!(q.take().await.unwrap().is_none());

        q.finalize(t1.id.as_str()).await.unwrap();
        let t3 = q.take().await.unwrap().unwrap();
        assert_eq!(t3.content, vec![2]);
    }

    #[tokio::test]
    async fn fifo_across_three_producers() {
        let q = queue(None);
        q.enqueue(Message::new(None, b"a".to_vec())).await.unwrap();
        q.enqueue(Message::new(None, b"b".to_vec())).await.unwrap();
        q.enqueue(Message::new(None, b"c".to_vec())).await.unwrap();

        let a = q.take().await.unwrap().unwrap();
        let b = q.take().await.unwrap().unwrap();
        let c = q.take().await.unwrap().unwrap();
        assert_eq!((a.content, b.content, c.content), (b"a".to_vec(), b"b".to_vec(), b"c".to_vec()));
    }

    #[tokio::test]
    async fn lifo_ordering() {
        let q = InMemoryQueue::new(Ordering::Lifo, EphemeralPolicy::enabled());
        q.enqueue(Message::new(None, b"a".to_vec())).await.unwrap();
        q.enqueue(Message::new(None, b"b".to_vec())).await.unwrap();
        let first = q.take().await.unwrap().unwrap();
        assert_eq!(first.content, b"b");
    }

    #[tokio::test]
    async fn non_duplication_under_concurrency() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let q = Arc::new(queue(None));
        for i in 0..200u32 {
            q.enqueue(Message::new(None, i.to_le_bytes().to_vec()))
                .await
                .unwrap();
        }

        let mut handles = vec![];
        for _ in 0..8 {
            let q = Arc::clone(&q);
            handles.push(tokio::spawn(async move {
                let mut taken = vec![];
                loop {
                    match q.take().await.unwrap() {
                        Some(msg) => taken.push(msg.id),
                        None => break,
                    }
                }
                taken
            }));
        }

        let mut all = HashSet::new();
        for h in handles {
            for id in h.await.unwrap() {
                assert!(all.insert(id), "duplicate delivery detected");
            }
        }
        assert_eq!(all.len(), 200);
    }
}
