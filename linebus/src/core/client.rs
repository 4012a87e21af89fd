use std::sync::Arc;

use crate::core::LeaderState;
use crate::error::ClientWriteError;
use crate::error::RaftResult;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponse;
use crate::raft::ClientWriteResponseTx;
use crate::raft::Entry;
use crate::raft::EntryPayload;
use crate::replication::RaftEvent;
use crate::storage::AppliedEvent;
use crate::storage::LogStore;
use crate::writer::WriteCommand;
use crate::LogId;
use crate::RaftNetwork;

/// A wrapper around a ClientRequest which has been transformed into an Entry, along with its response channel.
pub(super) struct ClientRequestEntry {
    /// The Arc'd entry of the ClientRequest.
    ///
    /// This value is Arc'd so that it may be sent across thread boundaries for replication
    /// without having to clone the data payload itself.
    pub entry: Arc<Entry>,
    /// The response channel for the request. The initial noop entry of a
    /// new leader's term has no client waiting on it.
    pub tx: Option<ClientWriteResponseTx>,
}

impl ClientRequestEntry {
    /// Create a new instance from the raw components of a client request.
    pub(crate) fn from_entry(entry: Entry, tx: Option<ClientWriteResponseTx>) -> Self {
        Self {
            entry: Arc::new(entry),
            tx,
        }
    }
}

impl<'a, N: RaftNetwork, S: LogStore> LeaderState<'a, N, S> {
    /// Commit the initial entry which new leaders are obligated to create when first coming to power.
    ///
    /// The entry is a noop in the new term; committing it is what makes
    /// any entries carried over from earlier terms committable.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        let req = ClientWriteRequest::noop();
        let entry = self.append_payload_to_log(req.entry).await?;
        self.core.last_log_id.term = self.core.current_term; // This only ever needs to be updated once per term.

        let cr_entry = ClientRequestEntry::from_entry(entry, None);
        self.replicate_client_request(cr_entry).await;

        Ok(())
    }

    /// Handle client write requests.
    #[tracing::instrument(level = "trace", skip(self, rpc, tx))]
    pub(super) async fn handle_client_write_request(&mut self, rpc: ClientWriteRequest, tx: ClientWriteResponseTx) {
        match self.append_payload_to_log(rpc.entry).await {
            Ok(entry) => {
                let entry = ClientRequestEntry::from_entry(entry, Some(tx));
                self.replicate_client_request(entry).await;
            }
            Err(err) => {
                let _ = tx.send(Err(ClientWriteError::RaftError(err)));
            }
        }
    }

    /// Transform the given payload into an entry, assign an index and term, and append the entry to the log.
    #[tracing::instrument(level = "trace", skip(self, payload))]
    pub(super) async fn append_payload_to_log(&mut self, payload: EntryPayload) -> RaftResult<Entry> {
        let entry = Entry {
            log_id: LogId {
                index: self.core.last_log_id.index + 1,
                term: self.core.current_term,
            },
            payload,
        };
        self.core
            .writer
            .submit(WriteCommand::AppendEntries(vec![entry.clone()]))
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;
        self.core.last_log_id.index = entry.log_id.index;

        self.leader_report_metrics();

        Ok(entry)
    }

    /// Begin the process of replicating the given client request.
    ///
    /// NOTE WELL: this routine does not wait for the request to actually finish replication, it
    /// merely begins the process. Once the request is committed to the cluster, its response will
    /// be generated asynchronously.
    #[tracing::instrument(level = "trace", skip(self, req))]
    pub(super) async fn replicate_client_request(&mut self, req: ClientRequestEntry) {
        // Replicate the request if there are other cluster members. The client response will be
        // returned elsewhere after the entry has been committed to the cluster.
        let entry_arc = req.entry.clone();
        self.awaiting_committed.push(req);

        if self.nodes.is_empty() {
            // There are no other voting nodes, so the payload is committed
            // as soon as it is durable locally.
            self.core.commit_index = entry_arc.log_id.index;
            self.leader_report_metrics();
            self.core.trigger_apply_to_state_machine();
            return;
        }

        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send((
                RaftEvent::Replicate {
                    entry: entry_arc.clone(),
                    commit_index: self.core.commit_index,
                },
                tracing::debug_span!("CH"),
            ));
        }
    }

    /// Send responses to clients whose writes have been applied.
    ///
    /// Requests are buffered in `awaiting_committed` in log order; the
    /// apply task reports events in the same order, so the two streams
    /// zip together by log index.
    #[tracing::instrument(level = "trace", skip(self, events))]
    pub(super) fn respond_to_applied_requests(&mut self, events: Vec<AppliedEvent>) {
        if self.awaiting_committed.is_empty() {
            return;
        }
        let applied_through = self.core.last_applied.index;
        let mut still_waiting = Vec::new();
        for req in self.awaiting_committed.drain(..) {
            let index = req.entry.log_id.index;
            if index > applied_through {
                still_waiting.push(req);
                continue;
            }
            if let Some(tx) = req.tx {
                match events.iter().find(|e| e.log_index() == index) {
                    Some(event) => {
                        let _ = tx.send(Ok(ClientWriteResponse {
                            index,
                            event: event.clone(),
                        }));
                    }
                    None => {
                        // The entry was applied in a batch we no longer
                        // hold events for; this should not be reachable
                        // with a single apply task.
                        tracing::error!(index, "applied entry has no event for its waiting client");
                    }
                }
            }
        }
        self.awaiting_committed = still_waiting;
    }
}
