//! An embedded, crash-safe implementation of the `linebus::storage::LogStore`
//! trait on top of redb.
//!
//! Each broker node owns one database file (`messages_node_<id>.db`) with
//! four tables: the Raft log keyed by index, committed messages keyed by
//! their store sequence number, the replicated subscriber registrations,
//! and a small metadata table for the hard state, the last applied log id
//! and the message sequence counter. redb transactions are durable on
//! commit, so a record returned as appended survives process and kernel
//! crashes.
//!
//! The store expects a single mutating caller (the broker's write
//! serializer); readers run concurrently under redb's MVCC snapshots.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::ops::Bound;
use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use redb::Database;
use redb::ReadableTable;
use redb::ReadableTableMetadata;
use redb::TableDefinition;

use linebus::error::StorageError;
use linebus::raft::Entry;
use linebus::raft::EntryPayload;
use linebus::storage::AppliedEvent;
use linebus::storage::HardState;
use linebus::storage::InitialState;
use linebus::storage::LogStore;
use linebus::storage::LogStoreDebug;
use linebus::storage::StoredMessage;
use linebus::storage::StoreSnapshot;
use linebus::storage::SubscriberInfo;
use linebus::LogId;

const RAFT_LOG: TableDefinition<u64, &[u8]> = TableDefinition::new("raft_log");
const MESSAGES: TableDefinition<u64, &[u8]> = TableDefinition::new("messages");
const SUBSCRIBERS: TableDefinition<&str, &[u8]> = TableDefinition::new("subscribers");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const META_HARD_STATE: &str = "hard_state";
const META_LAST_APPLIED: &str = "last_applied";
const META_NEXT_SEQ: &str = "next_seq";
const META_TOPICS: &str = "topics";

/// Errors surfaced while opening a database.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("database unavailable: {0}")]
    Unavailable(String),
    #[error("database corrupt: {0}")]
    Corrupt(String),
}

impl OpenError {
    /// Convert into the broker's storage error taxonomy.
    pub fn into_storage_error(self) -> StorageError {
        match self {
            OpenError::Unavailable(msg) => StorageError::Unavailable(msg),
            OpenError::Corrupt(msg) => StorageError::Corrupt(msg),
        }
    }
}

/// Map an engine failure into the broker's retryable error class.
fn unavailable<E: std::fmt::Display>(err: E) -> anyhow::Error {
    anyhow::Error::new(StorageError::Unavailable(err.to_string()))
}

/// Map a decode failure into the broker's fatal error class.
fn corrupt<E: std::fmt::Display>(err: E) -> anyhow::Error {
    anyhow::Error::new(StorageError::Corrupt(err.to_string()))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(unavailable)
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(corrupt)
}

/// The redb-backed durable log store of one broker node.
#[derive(Clone)]
pub struct DiskStore {
    db: Arc<Database>,
}

impl DiskStore {
    /// Open or create the database at the given path.
    ///
    /// A database which fails redb's integrity checks is reported as
    /// corrupt; the broker refuses to start on it.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, OpenError> {
        let db = Database::create(path.as_ref()).map_err(|err| match err {
            redb::DatabaseError::Storage(redb::StorageError::Corrupted(msg)) => OpenError::Corrupt(msg),
            other => OpenError::Unavailable(other.to_string()),
        })?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables().map_err(|err| OpenError::Unavailable(err.to_string()))?;
        Ok(store)
    }

    /// Open a store backed by a throwaway temp file, for tests.
    pub fn open_temporary() -> Result<Self, OpenError> {
        let tmpfile = tempfile::NamedTempFile::new().map_err(|err| OpenError::Unavailable(err.to_string()))?;
        let store = Self::open(tmpfile.path())?;
        // redb owns the file handle; the OS reclaims the inode when the
        // process exits.
        std::mem::forget(tmpfile);
        Ok(store)
    }

    fn ensure_tables(&self) -> Result<()> {
        let txn = self.db.begin_write().map_err(unavailable)?;
        {
            txn.open_table(RAFT_LOG).map_err(unavailable)?;
            txn.open_table(MESSAGES).map_err(unavailable)?;
            txn.open_table(SUBSCRIBERS).map_err(unavailable)?;
            txn.open_table(META).map_err(unavailable)?;
        }
        txn.commit().map_err(unavailable)?;
        Ok(())
    }

    fn read_meta<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let txn = self.db.begin_read().map_err(unavailable)?;
        let table = txn.open_table(META).map_err(unavailable)?;
        match table.get(key).map_err(unavailable)? {
            Some(bytes) => Ok(Some(decode(bytes.value())?)),
            None => Ok(None),
        }
    }

    /// Clamp an arbitrary range of log indexes to concrete bounds.
    fn index_bounds<RNG: RangeBounds<u64>>(range: &RNG) -> (u64, u64) {
        let start = match range.start_bound() {
            Bound::Included(v) => *v,
            Bound::Excluded(v) => v.saturating_add(1),
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(v) => *v,
            Bound::Excluded(v) => v.saturating_sub(1),
            Bound::Unbounded => u64::MAX,
        };
        (start, end)
    }
}

#[async_trait]
impl LogStore for DiskStore {
    async fn get_initial_state(&self) -> Result<InitialState> {
        let hard_state: Option<HardState> = self.read_meta(META_HARD_STATE)?;
        let last_applied: Option<LogId> = self.read_meta(META_LAST_APPLIED)?;
        let last_log_id = self.get_last_log_id().await?;

        let mut state = InitialState::new_initial();
        if let Some(hs) = hard_state {
            state.hard_state = hs;
        }
        if let Some(applied) = last_applied {
            state.last_applied_log = applied;
        }
        state.last_log_id = last_log_id;
        Ok(state)
    }

    async fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        let txn = self.db.begin_write().map_err(unavailable)?;
        {
            let mut table = txn.open_table(META).map_err(unavailable)?;
            table.insert(META_HARD_STATE, encode(hs)?.as_slice()).map_err(unavailable)?;
        }
        txn.commit().map_err(unavailable)?;
        Ok(())
    }

    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry>> {
        let (start, end) = Self::index_bounds(&range);
        if start > end {
            return Ok(Vec::new());
        }
        let txn = self.db.begin_read().map_err(unavailable)?;
        let table = txn.open_table(RAFT_LOG).map_err(unavailable)?;
        let mut entries = Vec::new();
        for item in table.range(start..=end).map_err(unavailable)? {
            let (_, bytes) = item.map_err(unavailable)?;
            entries.push(decode(bytes.value())?);
        }
        Ok(entries)
    }

    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry>> {
        let txn = self.db.begin_read().map_err(unavailable)?;
        let table = txn.open_table(RAFT_LOG).map_err(unavailable)?;
        match table.get(log_index).map_err(unavailable)? {
            Some(bytes) => Ok(Some(decode(bytes.value())?)),
            None => Ok(None),
        }
    }

    async fn get_last_log_id(&self) -> Result<LogId> {
        let txn = self.db.begin_read().map_err(unavailable)?;
        let table = txn.open_table(RAFT_LOG).map_err(unavailable)?;
        let result = match table.last().map_err(unavailable)? {
            Some((_, bytes)) => {
                let entry: Entry = decode(bytes.value())?;
                Ok(entry.log_id)
            }
            None => Ok(LogId { term: 0, index: 0 }),
        };
        result
    }

    async fn delete_logs_from<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(&self, range: RNG) -> Result<()> {
        let (start, end) = Self::index_bounds(&range);
        if start > end {
            return Ok(());
        }
        let txn = self.db.begin_write().map_err(unavailable)?;
        {
            let mut table = txn.open_table(RAFT_LOG).map_err(unavailable)?;
            let doomed: Vec<u64> = table
                .range(start..=end)
                .map_err(unavailable)?
                .map(|item| item.map(|(key, _)| key.value()))
                .collect::<std::result::Result<_, _>>()
                .map_err(unavailable)?;
            for key in doomed {
                table.remove(key).map_err(unavailable)?;
            }
        }
        txn.commit().map_err(unavailable)?;
        Ok(())
    }

    async fn append_to_log(&self, entries: &[&Entry]) -> Result<()> {
        let txn = self.db.begin_write().map_err(unavailable)?;
        {
            let mut table = txn.open_table(RAFT_LOG).map_err(unavailable)?;
            for entry in entries {
                table
                    .insert(entry.log_id.index, encode(entry)?.as_slice())
                    .map_err(unavailable)?;
            }
        }
        txn.commit().map_err(unavailable)?;
        Ok(())
    }

    async fn apply_to_state_machine(&self, entries: &[&Entry]) -> Result<Vec<AppliedEvent>> {
        let mut events = Vec::with_capacity(entries.len());
        let txn = self.db.begin_write().map_err(unavailable)?;
        {
            let mut messages = txn.open_table(MESSAGES).map_err(unavailable)?;
            let mut subscribers = txn.open_table(SUBSCRIBERS).map_err(unavailable)?;
            let mut meta = txn.open_table(META).map_err(unavailable)?;

            let mut next_seq: u64 = match meta.get(META_NEXT_SEQ).map_err(unavailable)? {
                Some(bytes) => decode(bytes.value())?,
                None => 1,
            };
            let mut topics: BTreeSet<String> = match meta.get(META_TOPICS).map_err(unavailable)? {
                Some(bytes) => decode(bytes.value())?,
                None => BTreeSet::new(),
            };

            let mut last_applied = LogId { term: 0, index: 0 };
            for entry in entries {
                last_applied = entry.log_id;
                match &entry.payload {
                    EntryPayload::Noop => {
                        events.push(AppliedEvent::Noop { log_id: entry.log_id });
                    }
                    EntryPayload::Publish(msg) => {
                        let stored = StoredMessage {
                            seq_no: next_seq,
                            log_index: entry.log_id.index,
                            message: msg.clone(),
                        };
                        messages.insert(next_seq, encode(&stored)?.as_slice()).map_err(unavailable)?;
                        topics.insert(msg.topic.clone());
                        next_seq += 1;
                        events.push(AppliedEvent::Published(stored));
                    }
                    EntryPayload::Subscribe(sub) => {
                        let mut info = match subscribers.get(sub.subscriber_id.as_str()).map_err(unavailable)? {
                            Some(bytes) => decode::<SubscriberInfo>(bytes.value())?,
                            None => SubscriberInfo {
                                subscriber_id: sub.subscriber_id.clone(),
                                node_id: sub.node_id,
                                topics: BTreeSet::new(),
                                last_heartbeat_ms: 0,
                            },
                        };
                        info.node_id = sub.node_id;
                        info.topics.insert(sub.topic.clone());
                        subscribers
                            .insert(sub.subscriber_id.as_str(), encode(&info)?.as_slice())
                            .map_err(unavailable)?;
                        events.push(AppliedEvent::Subscribed {
                            log_index: entry.log_id.index,
                            subscription: sub.clone(),
                        });
                    }
                    EntryPayload::Unsubscribe(unsub) => {
                        let decoded = {
                            let existing = subscribers.get(unsub.subscriber_id.as_str()).map_err(unavailable)?;
                            match existing {
                                Some(bytes) => {
                                    let info: SubscriberInfo = decode(bytes.value())?;
                                    Some(info)
                                }
                                None => None,
                            }
                        };
                        if let Some(mut info) = decoded {
                            info.topics.remove(&unsub.topic);
                            if info.topics.is_empty() {
                                subscribers.remove(unsub.subscriber_id.as_str()).map_err(unavailable)?;
                            } else {
                                subscribers
                                    .insert(unsub.subscriber_id.as_str(), encode(&info)?.as_slice())
                                    .map_err(unavailable)?;
                            }
                        }
                        events.push(AppliedEvent::Unsubscribed {
                            log_index: entry.log_id.index,
                            unsubscription: unsub.clone(),
                        });
                    }
                }
            }

            if last_applied.index > 0 {
                meta.insert(META_LAST_APPLIED, encode(&last_applied)?.as_slice()).map_err(unavailable)?;
            }
            meta.insert(META_NEXT_SEQ, encode(&next_seq)?.as_slice()).map_err(unavailable)?;
            meta.insert(META_TOPICS, encode(&topics)?.as_slice()).map_err(unavailable)?;
        }
        txn.commit().map_err(unavailable)?;
        Ok(events)
    }

    async fn read_messages(&self, limit: usize) -> Result<Vec<StoredMessage>> {
        let txn = self.db.begin_read().map_err(unavailable)?;
        let table = txn.open_table(MESSAGES).map_err(unavailable)?;
        let mut newest: Vec<StoredMessage> = Vec::with_capacity(limit);
        for item in table.iter().map_err(unavailable)?.rev().take(limit) {
            let (_, bytes) = item.map_err(unavailable)?;
            newest.push(decode(bytes.value())?);
        }
        newest.reverse();
        Ok(newest)
    }

    async fn read_subscribers(&self) -> Result<Vec<SubscriberInfo>> {
        let txn = self.db.begin_read().map_err(unavailable)?;
        let table = txn.open_table(SUBSCRIBERS).map_err(unavailable)?;
        let mut all = Vec::new();
        for item in table.iter().map_err(unavailable)? {
            let (_, bytes) = item.map_err(unavailable)?;
            all.push(decode(bytes.value())?);
        }
        Ok(all)
    }

    async fn snapshot_state(&self) -> Result<StoreSnapshot> {
        let txn = self.db.begin_read().map_err(unavailable)?;
        let messages = txn.open_table(MESSAGES).map_err(unavailable)?;
        let subscribers = txn.open_table(SUBSCRIBERS).map_err(unavailable)?;
        let meta = txn.open_table(META).map_err(unavailable)?;

        let topics: BTreeSet<String> = match meta.get(META_TOPICS).map_err(unavailable)? {
            Some(bytes) => decode(bytes.value())?,
            None => BTreeSet::new(),
        };
        let last_applied: LogId = match meta.get(META_LAST_APPLIED).map_err(unavailable)? {
            Some(bytes) => decode(bytes.value())?,
            None => LogId { term: 0, index: 0 },
        };

        Ok(StoreSnapshot {
            message_count: messages.len().map_err(unavailable)?,
            subscriber_count: subscribers.len().map_err(unavailable)?,
            topics: topics.into_iter().collect(),
            last_applied: last_applied.index,
        })
    }
}

#[async_trait]
impl LogStoreDebug for DiskStore {
    async fn read_hard_state(&self) -> Option<HardState> {
        self.read_meta(META_HARD_STATE).ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linebus::message::Message;
    use linebus::message::PayloadFormat;
    use linebus::raft::Subscription;
    use linebus::raft::Unsubscription;

    fn entry(term: u64, index: u64, payload: EntryPayload) -> Entry {
        Entry {
            log_id: LogId { term, index },
            payload,
        }
    }

    fn publish(term: u64, index: u64, topic: &str, value: &str) -> Entry {
        entry(
            term,
            index,
            EntryPayload::Publish(Message {
                id: index,
                event_name: "event".into(),
                value: value.into(),
                topic: topic.into(),
                format: PayloadFormat::Raw,
                body: format!("[{}] {}", topic, value),
            }),
        )
    }

    #[tokio::test]
    async fn hard_state_round_trip() {
        let store = DiskStore::open_temporary().unwrap();
        let hs = HardState {
            current_term: 3,
            voted_for: Some(1),
        };
        store.save_hard_state(&hs).await.unwrap();
        assert_eq!(store.read_hard_state().await, Some(hs));
    }

    #[tokio::test]
    async fn log_append_read_and_truncate() {
        let store = DiskStore::open_temporary().unwrap();
        let entries: Vec<Entry> = (1..=5).map(|i| entry(1, i, EntryPayload::Noop)).collect();
        let refs: Vec<&Entry> = entries.iter().collect();
        store.append_to_log(&refs).await.unwrap();

        assert_eq!(store.get_last_log_id().await.unwrap(), LogId { term: 1, index: 5 });
        let read = store.get_log_entries(2..4).await.unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].log_id.index, 2);
        assert_eq!(read[1].log_id.index, 3);

        store.delete_logs_from(4..).await.unwrap();
        assert_eq!(store.get_last_log_id().await.unwrap().index, 3);
        assert!(store.try_get_log_entry(5).await.unwrap().is_none());
        assert!(store.try_get_log_entry(3).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn apply_assigns_monotone_sequence_numbers() {
        let store = DiskStore::open_temporary().unwrap();
        let entries = vec![
            publish(1, 1, "news", "a"),
            entry(1, 2, EntryPayload::Noop),
            publish(1, 3, "sports", "b"),
        ];
        let refs: Vec<&Entry> = entries.iter().collect();
        let events = store.apply_to_state_machine(&refs).await.unwrap();

        assert_eq!(events.len(), 3);
        match (&events[0], &events[2]) {
            (AppliedEvent::Published(first), AppliedEvent::Published(second)) => {
                assert_eq!(first.seq_no, 1);
                assert_eq!(second.seq_no, 2);
            }
            other => panic!("unexpected events: {:?}", other),
        }

        let messages = store.read_messages(10).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message.topic, "news");
        assert_eq!(messages[1].message.topic, "sports");

        let snapshot = store.snapshot_state().await.unwrap();
        assert_eq!(snapshot.message_count, 2);
        assert_eq!(snapshot.last_applied, 3);
        assert_eq!(snapshot.topics, vec!["news".to_string(), "sports".to_string()]);
    }

    #[tokio::test]
    async fn subscribe_and_unsubscribe_maintain_registrations() {
        let store = DiskStore::open_temporary().unwrap();
        let sub = Subscription {
            subscriber_id: "sub-1".into(),
            node_id: 2,
            topic: "news".into(),
        };
        let entries = vec![
            entry(1, 1, EntryPayload::Subscribe(sub.clone())),
            entry(1, 2, EntryPayload::Subscribe(sub.clone())),
        ];
        let refs: Vec<&Entry> = entries.iter().collect();
        store.apply_to_state_machine(&refs).await.unwrap();

        let subs = store.read_subscribers().await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].node_id, 2);
        assert_eq!(subs[0].topics.iter().collect::<Vec<_>>(), vec!["news"]);

        let unsub = entry(
            1,
            3,
            EntryPayload::Unsubscribe(Unsubscription {
                subscriber_id: "sub-1".into(),
                topic: "news".into(),
            }),
        );
        store.apply_to_state_machine(&[&unsub]).await.unwrap();
        assert!(store.read_subscribers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn restart_reconstructs_applied_state() {
        let tmpfile = tempfile::NamedTempFile::new().unwrap();
        let path = tmpfile.path().to_path_buf();

        {
            let store = DiskStore::open(&path).unwrap();
            let entries = vec![publish(1, 1, "news", "persisted"), publish(1, 2, "news", "also")];
            let refs: Vec<&Entry> = entries.iter().collect();
            store.append_to_log(&refs).await.unwrap();
            store.apply_to_state_machine(&refs).await.unwrap();
            store
                .save_hard_state(&HardState {
                    current_term: 1,
                    voted_for: Some(0),
                })
                .await
                .unwrap();
        }

        let store = DiskStore::open(&path).unwrap();
        let state = store.get_initial_state().await.unwrap();
        assert_eq!(state.hard_state.current_term, 1);
        assert_eq!(state.last_log_id, LogId { term: 1, index: 2 });
        assert_eq!(state.last_applied_log.index, 2);

        // The sequence counter resumes where it left off.
        let next = publish(1, 3, "news", "after restart");
        let events = store.apply_to_state_machine(&[&next]).await.unwrap();
        match &events[0] {
            AppliedEvent::Published(stored) => assert_eq!(stored.seq_no, 3),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn read_messages_is_bounded_and_ordered() {
        let store = DiskStore::open_temporary().unwrap();
        let entries: Vec<Entry> = (1..=10).map(|i| publish(1, i, "news", &format!("m{}", i))).collect();
        let refs: Vec<&Entry> = entries.iter().collect();
        store.apply_to_state_machine(&refs).await.unwrap();

        let recent = store.read_messages(3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message.value, "m8");
        assert_eq!(recent[2].message.value, "m10");
        assert!(recent.windows(2).all(|w| w[0].seq_no < w[1].seq_no));
    }
}
