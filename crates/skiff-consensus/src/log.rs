//! Contract against the tablet's operation log.
//!
//! The on-disk log is owned by the tablet server, not by consensus; the
//! core only needs ordered, crash-safe appends with a durability signal,
//! suffix truncation, read-back for peer catch-up, and a place to hand GC
//! floor hints. [`MemLog`] is the in-memory implementation used by tests
//! and single-process harnesses.

use crate::error::{RaftError, Result};
use crate::types::{OpId, ReplicateMsg};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Invoked once the appended entries are durable (or have terminally
/// failed). Never invoked inline from `append`; implementations dispatch it
/// from their own context so callers may hold locks while enqueueing.
pub type AppendCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// GC floor hints handed to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionIndexes {
    /// Never GC at or below this index; operations up to here may not be
    /// fully committed/applied.
    pub for_durability: u64,

    /// Prefer not to GC below this index so lagging peers can catch up from
    /// the log instead of a full copy.
    pub for_peers: u64,
}

/// Append-only, ordered, crash-safe operation log.
pub trait Log: Send + Sync {
    /// Enqueue `msgs` for appending, in order. Must not block on I/O: the
    /// write happens on the log's own execution context and `on_durable`
    /// fires when the batch is stable (or has failed terminally).
    ///
    /// Entry indices must continue the log contiguously, and enqueued
    /// entries must be readable via [`Log::read`] immediately, ahead of
    /// durability; the commit watermark separately waits for the durable
    /// acknowledgement.
    fn append(&self, msgs: Vec<Arc<ReplicateMsg>>, on_durable: AppendCallback) -> Result<()>;

    /// Synchronously drop every entry with index greater than `index`.
    fn truncate_after(&self, index: u64) -> Result<()>;

    /// Id of the last appended entry, `OpId::MIN` for an empty log.
    fn last_op_id(&self) -> OpId;

    /// Read up to `max` entries with index greater than `after_index`, in
    /// index order. Entries below the GC floor may be unavailable.
    fn read(&self, after_index: u64, max: usize) -> Result<Vec<Arc<ReplicateMsg>>>;

    /// Id of the entry at exactly `index`, if still readable.
    fn op_id_at(&self, index: u64) -> Option<OpId> {
        if index == 0 {
            return Some(OpId::MIN);
        }
        match self.read(index - 1, 1) {
            Ok(entries) => entries
                .first()
                .filter(|m| m.id.index == index)
                .map(|m| m.id),
            Err(_) => None,
        }
    }

    /// Record GC floor hints. Purely advisory.
    fn set_retention(&self, retention: RetentionIndexes);
}

/// In-memory log for tests and harnesses. Appends are durable immediately;
/// callbacks are dispatched on the runtime to mimic a real log's
/// asynchronous completion.
pub struct MemLog {
    inner: Mutex<MemLogInner>,
}

struct MemLogInner {
    entries: BTreeMap<u64, Arc<ReplicateMsg>>,
    retention: RetentionIndexes,
}

impl MemLog {
    pub fn new() -> Arc<Self> {
        Arc::new(MemLog {
            inner: Mutex::new(MemLogInner {
                entries: BTreeMap::new(),
                retention: RetentionIndexes {
                    for_durability: 0,
                    for_peers: 0,
                },
            }),
        })
    }

    /// All entries, in index order. Test helper.
    pub fn entries(&self) -> Vec<Arc<ReplicateMsg>> {
        self.inner.lock().entries.values().cloned().collect()
    }

    /// All entry ids, in index order. Test helper.
    pub fn op_ids(&self) -> Vec<OpId> {
        self.inner.lock().entries.values().map(|m| m.id).collect()
    }

    pub fn retention(&self) -> RetentionIndexes {
        self.inner.lock().retention
    }
}

impl Log for MemLog {
    fn append(&self, msgs: Vec<Arc<ReplicateMsg>>, on_durable: AppendCallback) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            for msg in &msgs {
                let expected = inner.entries.keys().next_back().map_or(1, |i| i + 1);
                if msg.id.index != expected {
                    return Err(RaftError::IllegalState(format!(
                        "non-contiguous append: expected index {}, got {}",
                        expected, msg.id
                    )));
                }
                inner.entries.insert(msg.id.index, msg.clone());
            }
        }
        // Complete off the caller's stack, like a real log's append pool.
        tokio::spawn(async move {
            on_durable(Ok(()));
        });
        Ok(())
    }

    fn truncate_after(&self, index: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.entries.split_off(&(index + 1));
        Ok(())
    }

    fn last_op_id(&self) -> OpId {
        self.inner
            .lock()
            .entries
            .values()
            .next_back()
            .map_or(OpId::MIN, |m| m.id)
    }

    fn read(&self, after_index: u64, max: usize) -> Result<Vec<Arc<ReplicateMsg>>> {
        let inner = self.inner.lock();
        Ok(inner
            .entries
            .range(after_index + 1..)
            .take(max)
            .map(|(_, m)| m.clone())
            .collect())
    }

    fn set_retention(&self, retention: RetentionIndexes) {
        self.inner.lock().retention = retention;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Payload;

    fn msg(term: u64, index: u64) -> Arc<ReplicateMsg> {
        Arc::new(ReplicateMsg::new(OpId::new(term, index), Payload::NoOp))
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let log = MemLog::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        log.append(vec![msg(1, 1), msg(1, 2), msg(2, 3)], Box::new(|r| {
            tx.send(r).unwrap();
        }))
        .unwrap();
        rx.await.unwrap().unwrap();

        assert_eq!(log.last_op_id(), OpId::new(2, 3));
        let read = log.read(1, 10).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].id, OpId::new(1, 2));
        assert_eq!(read[1].id, OpId::new(2, 3));
        assert_eq!(log.op_id_at(2), Some(OpId::new(1, 2)));
        assert_eq!(log.op_id_at(0), Some(OpId::MIN));
        assert_eq!(log.op_id_at(9), None);
    }

    #[tokio::test]
    async fn test_append_rejects_gap() {
        let log = MemLog::new();
        let err = log.append(vec![msg(1, 5)], Box::new(|_| {}));
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_truncate_after() {
        let log = MemLog::new();
        log.append(
            vec![msg(1, 1), msg(1, 2), msg(1, 3)],
            Box::new(|_| {}),
        )
        .unwrap();
        log.truncate_after(1).unwrap();
        assert_eq!(log.last_op_id(), OpId::new(1, 1));
        assert!(log.read(1, 10).unwrap().is_empty());

        // Appends continue from the new tail.
        log.append(vec![msg(2, 2)], Box::new(|_| {})).unwrap();
        assert_eq!(log.last_op_id(), OpId::new(2, 2));
    }
}
