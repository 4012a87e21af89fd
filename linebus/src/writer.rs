//! The write serializer: sole writer to the durable log store.
//!
//! Replication, hard-state persistence and state-machine apply all funnel
//! their store mutations through one bounded queue with a single consumer
//! task, converting concurrent callers into one ordered stream. The store
//! itself never sees concurrent writers.
//!
//! Callers block while the queue is full; the consensus core must never
//! drop a durable write, so backpressure propagates upstream and slows
//! replication instead. On store failure the consumer retries with
//! exponential backoff and flips the shared [`StoreHealth`] watch to
//! `Degraded`, which the consensus core observes to give up leadership
//! until the store recovers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

use crate::error::StorageError;
use crate::error::WriteQueueError;
use crate::raft::Entry;
use crate::storage::AppliedEvent;
use crate::storage::HardState;
use crate::storage::LogStore;

/// Consecutive failures after which the store is reported degraded.
const DEGRADE_AFTER_FAILURES: u32 = 3;
/// Backoff bounds for store retries.
const RETRY_BASE: Duration = Duration::from_millis(50);
const RETRY_CAP: Duration = Duration::from_secs(5);

/// Health of the durable store as observed by the write serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreHealth {
    Healthy,
    /// The store is failing writes; the serializer is retrying. The node
    /// is read-only and must not lead.
    Degraded,
    /// The store is corrupt or the serializer has exited. Unrecoverable
    /// without operator intervention.
    Failed,
}

/// A durable mutation, applied in queue order.
#[derive(Debug)]
pub enum WriteCommand {
    /// Append entries to the Raft log.
    AppendEntries(Vec<Entry>),
    /// Discard the log suffix starting at the given index.
    TruncateFrom(u64),
    /// Persist term/vote.
    SaveHardState(HardState),
    /// Apply committed entries to the state machine.
    Apply(Vec<Entry>),
}

/// The result of a completed write.
#[derive(Debug)]
pub enum WriteOutcome {
    Done,
    /// Apply results, in entry order.
    Applied(Vec<AppliedEvent>),
}

struct WriteRequest {
    cmd: WriteCommand,
    tx: oneshot::Sender<Result<WriteOutcome>>,
}

/// Cloneable producer side of the write queue.
#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::Sender<WriteRequest>,
    health_rx: watch::Receiver<StoreHealth>,
}

impl WriteHandle {
    /// Enqueue a write and wait until it is durable.
    ///
    /// Blocks while the queue is full. This is the only enqueue the
    /// consensus core uses: its callers need the durability guarantee
    /// before answering RPCs, and they are forbidden from dropping.
    pub async fn submit(&self, cmd: WriteCommand) -> Result<WriteOutcome> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WriteRequest { cmd, tx })
            .await
            .map_err(|_| anyhow!(WriteQueueError::Closed))?;
        rx.await.map_err(|_| anyhow!(WriteQueueError::Closed))?
    }

    /// Enqueue without blocking; fails with `Backpressure` when the queue
    /// is full. Callers which use this must be prepared to retry or shed.
    pub fn try_submit(&self, cmd: WriteCommand) -> Result<oneshot::Receiver<Result<WriteOutcome>>, WriteQueueError> {
        let (tx, rx) = oneshot::channel();
        self.tx.try_send(WriteRequest { cmd, tx }).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => WriteQueueError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => WriteQueueError::Closed,
        })?;
        Ok(rx)
    }

    /// A watch over the store health as seen by the consumer.
    pub fn health(&self) -> watch::Receiver<StoreHealth> {
        self.health_rx.clone()
    }
}

/// Spawn the write serializer for the given store.
///
/// Returns the producer handle and the consumer task handle. The consumer
/// drains the queue and exits once every `WriteHandle` clone is dropped.
pub fn spawn<S: LogStore>(storage: Arc<S>, queue_depth: usize, batch_max: usize) -> (WriteHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(queue_depth);
    let (health_tx, health_rx) = watch::channel(StoreHealth::Healthy);
    let core = WriterCore {
        storage,
        rx,
        health_tx,
        batch_max,
        consecutive_failures: 0,
        fatal: false,
    };
    let handle = tokio::spawn(core.main().instrument(tracing::debug_span!("writer")));
    (WriteHandle { tx, health_rx }, handle)
}

/// The single consumer of the write queue.
struct WriterCore<S: LogStore> {
    storage: Arc<S>,
    rx: mpsc::Receiver<WriteRequest>,
    health_tx: watch::Sender<StoreHealth>,
    batch_max: usize,
    consecutive_failures: u32,
    fatal: bool,
}

impl<S: LogStore> WriterCore<S> {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn main(mut self) {
        while let Some(first) = self.rx.recv().await {
            // Drain what is already queued, preserving FIFO order, so a
            // burst of appends lands in few store transactions.
            let mut batch = vec![first];
            while batch.len() < self.batch_max {
                match self.rx.try_recv() {
                    Ok(req) => batch.push(req),
                    Err(_) => break,
                }
            }
            self.process_batch(batch).await;
        }
        tracing::debug!("write queue closed, serializer exiting");
        if !self.fatal {
            let _ = self.health_tx.send(StoreHealth::Failed);
        }
    }

    async fn process_batch(&mut self, batch: Vec<WriteRequest>) {
        let mut iter = batch.into_iter().peekable();
        while let Some(req) = iter.next() {
            match req.cmd {
                WriteCommand::AppendEntries(mut entries) => {
                    // Coalesce consecutive appends into one transaction.
                    let mut acks = vec![req.tx];
                    while let Some(WriteRequest {
                        cmd: WriteCommand::AppendEntries(_),
                        ..
                    }) = iter.peek()
                    {
                        match iter.next() {
                            Some(WriteRequest {
                                cmd: WriteCommand::AppendEntries(more),
                                tx,
                            }) => {
                                entries.extend(more);
                                acks.push(tx);
                            }
                            _ => unreachable!("peeked variant changed"),
                        }
                    }
                    let res = self.run_with_retries(&WriteCommand::AppendEntries(entries)).await;
                    for tx in acks {
                        let _ = tx.send(match &res {
                            Ok(_) => Ok(WriteOutcome::Done),
                            Err(err) => Err(anyhow!("{}", err)),
                        });
                    }
                }
                cmd => {
                    let res = self.run_with_retries(&cmd).await;
                    let _ = req.tx.send(res);
                }
            }
        }
    }

    /// Execute one command, retrying transient failures with exponential
    /// backoff. Corruption is terminal: the health watch flips to
    /// `Failed` and all queued and future writes are rejected.
    async fn run_with_retries(&mut self, cmd: &WriteCommand) -> Result<WriteOutcome> {
        if self.fatal {
            return Err(anyhow!(StorageError::Corrupt("store previously reported corruption".into())));
        }
        let mut backoff = RETRY_BASE;
        loop {
            match self.execute(cmd).await {
                Ok(outcome) => {
                    if self.consecutive_failures > 0 {
                        tracing::info!("store recovered after {} failed attempts", self.consecutive_failures);
                        self.consecutive_failures = 0;
                        let _ = self.health_tx.send(StoreHealth::Healthy);
                    }
                    return Ok(outcome);
                }
                Err(err) => {
                    if err.downcast_ref::<StorageError>().map(|e| matches!(e, StorageError::Corrupt(_))).unwrap_or(false)
                    {
                        tracing::error!(error=%err, "store corruption detected, halting writes");
                        self.fatal = true;
                        let _ = self.health_tx.send(StoreHealth::Failed);
                        return Err(err);
                    }
                    self.consecutive_failures += 1;
                    if self.consecutive_failures == DEGRADE_AFTER_FAILURES {
                        tracing::warn!(error=%err, "store degraded, node goes read-only");
                        let _ = self.health_tx.send(StoreHealth::Degraded);
                    }
                    tracing::warn!(error=%err, attempt=self.consecutive_failures, "store write failed, retrying in {:?}", backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, RETRY_CAP);
                }
            }
        }
    }

    async fn execute(&self, cmd: &WriteCommand) -> Result<WriteOutcome> {
        match cmd {
            WriteCommand::AppendEntries(entries) => {
                let refs: Vec<&Entry> = entries.iter().collect();
                self.storage.append_to_log(&refs).await?;
                Ok(WriteOutcome::Done)
            }
            WriteCommand::TruncateFrom(index) => {
                self.storage.delete_logs_from(*index..).await?;
                Ok(WriteOutcome::Done)
            }
            WriteCommand::SaveHardState(hs) => {
                self.storage.save_hard_state(hs).await?;
                Ok(WriteOutcome::Done)
            }
            WriteCommand::Apply(entries) => {
                let refs: Vec<&Entry> = entries.iter().collect();
                let events = self.storage.apply_to_state_machine(&refs).await?;
                Ok(WriteOutcome::Applied(events))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fmt::Debug;
    use std::ops::RangeBounds;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    use anyhow::anyhow;
    use async_trait::async_trait;

    use super::*;
    use crate::raft::EntryPayload;
    use crate::storage::InitialState;
    use crate::storage::StoredMessage;
    use crate::storage::StoreSnapshot;
    use crate::storage::SubscriberInfo;
    use crate::LogId;

    /// An in-memory store with fault injection for serializer tests.
    #[derive(Default)]
    struct FlakyLog {
        log: Mutex<BTreeMap<u64, Entry>>,
        hard_state: Mutex<Option<HardState>>,
        /// Number of upcoming writes which fail as unavailable.
        fail_next: AtomicU32,
    }

    impl FlakyLog {
        fn check_fault(&self) -> Result<()> {
            let remaining = self.fail_next.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_next.fetch_sub(1, Ordering::SeqCst);
                return Err(anyhow!(StorageError::Unavailable("injected".into())));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl LogStore for FlakyLog {
        async fn get_initial_state(&self) -> Result<InitialState> {
            Ok(InitialState::new_initial())
        }

        async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
            self.check_fault()?;
            *self.hard_state.lock().unwrap() = Some(hs.clone());
            Ok(())
        }

        async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
            &self,
            range: RNG,
        ) -> Result<Vec<Entry>> {
            Ok(self
                .log
                .lock()
                .unwrap()
                .iter()
                .filter(|(idx, _)| range.contains(idx))
                .map(|(_, e)| e.clone())
                .collect())
        }

        async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry>> {
            Ok(self.log.lock().unwrap().get(&log_index).cloned())
        }

        async fn get_last_log_id(&self) -> Result<LogId> {
            Ok(self
                .log
                .lock()
                .unwrap()
                .values()
                .last()
                .map(|e| e.log_id)
                .unwrap_or(LogId { term: 0, index: 0 }))
        }

        async fn delete_logs_from<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
            &self,
            range: RNG,
        ) -> Result<()> {
            self.check_fault()?;
            self.log.lock().unwrap().retain(|idx, _| !range.contains(idx));
            Ok(())
        }

        async fn append_to_log(&self, entries: &[&Entry]) -> Result<()> {
            self.check_fault()?;
            let mut log = self.log.lock().unwrap();
            for entry in entries {
                log.insert(entry.log_id.index, (*entry).clone());
            }
            Ok(())
        }

        async fn apply_to_state_machine(&self, entries: &[&Entry]) -> Result<Vec<AppliedEvent>> {
            self.check_fault()?;
            Ok(entries.iter().map(|e| AppliedEvent::Noop { log_id: e.log_id }).collect())
        }

        async fn read_messages(&self, _limit: usize) -> Result<Vec<StoredMessage>> {
            Ok(Vec::new())
        }

        async fn read_subscribers(&self) -> Result<Vec<SubscriberInfo>> {
            Ok(Vec::new())
        }

        async fn snapshot_state(&self) -> Result<StoreSnapshot> {
            Ok(StoreSnapshot::default())
        }
    }

    fn noop_entry(index: u64) -> Entry {
        Entry {
            log_id: LogId { term: 1, index },
            payload: EntryPayload::Noop,
        }
    }

    #[tokio::test]
    async fn writes_are_durable_before_ack_and_keep_order() {
        let store = Arc::new(FlakyLog::default());
        let (handle, _task) = spawn(store.clone(), 16, 4);

        for index in 1..=8 {
            handle.submit(WriteCommand::AppendEntries(vec![noop_entry(index)])).await.unwrap();
            assert!(store.log.lock().unwrap().contains_key(&index), "entry {} durable on ack", index);
        }
        let indexes: Vec<u64> = store.log.lock().unwrap().keys().copied().collect();
        assert_eq!(indexes, (1..=8).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn apply_returns_events_in_entry_order() {
        let store = Arc::new(FlakyLog::default());
        let (handle, _task) = spawn(store, 16, 4);

        let outcome = handle
            .submit(WriteCommand::Apply(vec![noop_entry(1), noop_entry(2), noop_entry(3)]))
            .await
            .unwrap();
        match outcome {
            WriteOutcome::Applied(events) => {
                let indexes: Vec<u64> = events.iter().map(|e| e.log_index()).collect();
                assert_eq!(indexes, vec![1, 2, 3]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn transient_failures_degrade_then_recover() {
        let store = Arc::new(FlakyLog::default());
        let (handle, _task) = spawn(store.clone(), 16, 4);
        let mut health = handle.health();
        assert_eq!(*health.borrow(), StoreHealth::Healthy);

        // Record the degraded-then-healthy transition as it happens.
        let watcher = tokio::spawn(async move {
            let mut saw_degraded = false;
            loop {
                {
                    let current = *health.borrow_and_update();
                    if current == StoreHealth::Degraded {
                        saw_degraded = true;
                    } else if saw_degraded && current == StoreHealth::Healthy {
                        return true;
                    }
                }
                if health.changed().await.is_err() {
                    return saw_degraded;
                }
            }
        });

        store.fail_next.store(DEGRADE_AFTER_FAILURES, Ordering::SeqCst);
        handle.submit(WriteCommand::AppendEntries(vec![noop_entry(1)])).await.unwrap();

        // The write eventually landed despite the injected failures, and
        // the health watch saw the round trip.
        assert!(store.log.lock().unwrap().contains_key(&1));
        let outcome = tokio::time::timeout(Duration::from_secs(5), watcher).await;
        assert!(matches!(outcome, Ok(Ok(true))), "health should report degraded then healthy");
    }

    #[tokio::test]
    async fn try_submit_reports_backpressure_when_full() {
        // A store wedged on failures keeps the consumer busy while the
        // queue fills.
        let store = Arc::new(FlakyLog::default());
        store.fail_next.store(u32::MAX, Ordering::SeqCst);
        let (handle, _task) = spawn(store, 2, 1);

        // One request occupies the consumer, the rest fill the queue.
        let mut pending = Vec::new();
        for index in 1..=8 {
            match handle.try_submit(WriteCommand::AppendEntries(vec![noop_entry(index)])) {
                Ok(rx) => pending.push(rx),
                Err(WriteQueueError::Backpressure) => return,
                Err(other) => panic!("unexpected error {:?}", other),
            }
            tokio::task::yield_now().await;
        }
        panic!("queue never reported backpressure");
    }
}
