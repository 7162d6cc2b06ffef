//! Log replication
//!
//! The leader runs one task per follower. Each task sends whatever the
//! follower is missing (entries, or snapshot chunks once those entries are
//! compacted away), then sleeps until new entries arrive or the heartbeat
//! interval elapses.

use super::state::{Core, Replicator, SnapshotTransfer};
use super::Shared;
use crate::log::{EntryPayload, LogEntry, Snapshot};
use crate::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, ConflictHint, InstallSnapshotRequest,
};
use replica_core::{LogIndex, Member, MemberId, NodeRole, Result, Term};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// The next RPC a replication task should send
pub(super) enum Outbound {
    Append {
        target: Member,
        request: AppendEntriesRequest,
    },
    Snapshot {
        target: Member,
        request: InstallSnapshotRequest,
    },
}

impl Core {
    /// Append one entry in the current term to the local log and flush it
    pub(super) fn append_local(&mut self, payload: EntryPayload) -> Result<LogEntry> {
        let entry = LogEntry::new(self.hard.term, self.store.last_index() + 1, payload);
        let written = self
            .store
            .append(std::slice::from_ref(&entry))
            .and_then(|_| self.store.flush());
        if let Err(e) = written {
            self.storage_failed(&e);
            return Err(e);
        }
        Ok(entry)
    }

    /// Build the next request for `peer`, or `None` if the task should exit
    pub(super) fn next_replication(
        &mut self,
        peer: &MemberId,
        term: Term,
        task_id: u64,
    ) -> Option<Outbound> {
        if self.stopped || self.role != NodeRole::Leader || self.hard.term != term {
            return None;
        }
        let last_index = self.store.last_index();
        let commit = self.commit_index;
        let max_entries = self.config.max_append_entries as u64;
        let chunk_size = self.config.snapshot_chunk_size;

        let progress = self.leader.as_mut()?.progress.get_mut(peer)?;
        if progress.task_id != task_id {
            return None;
        }
        if progress.next_index > last_index + 1 {
            progress.next_index = last_index + 1;
        }

        let prev_index = progress.next_index - 1;
        if progress.snapshot.is_none() {
            if let Some(prev_term) = self.store.term_at(prev_index) {
                let entries = self
                    .store
                    .entries(progress.next_index, progress.next_index + max_entries);
                return Some(Outbound::Append {
                    target: progress.member.clone(),
                    request: AppendEntriesRequest {
                        term,
                        leader_id: self.id.clone(),
                        prev_log_index: prev_index,
                        prev_log_term: prev_term,
                        entries,
                        leader_commit: commit,
                    },
                });
            }
        }

        let Some(Snapshot { meta, data }) = self.store.snapshot() else {
            error!(
                "Entries before {} are gone but no snapshot exists",
                progress.next_index
            );
            return None;
        };
        let transfer = match progress.snapshot {
            Some(t) if t.index == meta.last_included_index => t,
            _ => {
                info!(
                    "Sending snapshot at index {} to {}",
                    meta.last_included_index, peer
                );
                SnapshotTransfer {
                    index: meta.last_included_index,
                    offset: 0,
                }
            }
        };
        progress.snapshot = Some(transfer);

        let start = (transfer.offset as usize).min(data.len());
        let end = (start + chunk_size).min(data.len());
        Some(Outbound::Snapshot {
            target: progress.member.clone(),
            request: InstallSnapshotRequest {
                term,
                leader_id: self.id.clone(),
                last_included_index: meta.last_included_index,
                last_included_term: meta.last_included_term,
                roster: meta.roster,
                offset: start as u64,
                data: data[start..end].to_vec(),
                done: end == data.len(),
            },
        })
    }

    /// Last index in our log holding an entry of `term`
    fn last_index_of_term(&self, term: Term) -> Option<LogIndex> {
        let floor = self.store.snapshot_index();
        let mut index = self.store.last_index();
        while index > floor {
            match self.store.term_at(index) {
                Some(t) if t == term => return Some(index),
                Some(t) if t < term => return None,
                _ => {}
            }
            index -= 1;
        }
        (floor > 0 && self.store.term_at(floor) == Some(term)).then_some(floor)
    }

    /// Process a follower's AppendEntries reply. Returns true if more should
    /// be sent right away.
    pub(super) fn handle_append_response(
        &mut self,
        peer: &MemberId,
        term: Term,
        task_id: u64,
        resp: AppendEntriesResponse,
    ) -> bool {
        if resp.term > self.hard.term {
            info!(
                "Follower {} is at term {}, stepping down",
                peer, resp.term
            );
            self.become_follower(resp.term, None);
            return false;
        }
        if self.role != NodeRole::Leader || self.hard.term != term {
            return false;
        }

        let last_index = self.store.last_index();
        let hinted_next = resp.conflict.as_ref().map(|c| match c.term {
            Some(t) => self
                .last_index_of_term(t)
                .map(|i| i + 1)
                .unwrap_or(c.index),
            None => c.index,
        });

        let Some(progress) = self
            .leader
            .as_mut()
            .and_then(|l| l.progress.get_mut(peer))
        else {
            return false;
        };
        if progress.task_id != task_id {
            return false;
        }

        if resp.success {
            progress.match_index = progress.match_index.max(resp.match_index);
            progress.next_index = progress.match_index + 1;
            let more = progress.next_index <= last_index;
            self.advance_commit();
            return more;
        }

        let Some(next) = hinted_next else {
            return false;
        };
        let next = next
            .min(progress.next_index.saturating_sub(1))
            .max(progress.match_index + 1)
            .min(last_index + 1);
        let moved = next < progress.next_index;
        debug!(
            "Follower {} rejected entries, next index {} -> {}",
            peer, progress.next_index, next
        );
        progress.next_index = next;
        moved
    }

    /// Move the commit index to the highest index held by a quorum, if
    /// that entry belongs to the current term
    pub(super) fn advance_commit(&mut self) {
        if self.role != NodeRole::Leader {
            return;
        }
        let Some(leader) = self.leader.as_ref() else {
            return;
        };
        let last_index = self.store.last_index();
        let id = &self.id;
        let quorum_index = self.roster.quorum_index(|member| {
            if member == id {
                last_index
            } else {
                leader
                    .progress
                    .get(member)
                    .map(|p| p.match_index)
                    .unwrap_or(0)
            }
        });

        if quorum_index <= self.commit_index {
            return;
        }
        if self.store.term_at(quorum_index) != Some(self.hard.term) {
            debug!(
                "Index {} is replicated but from an earlier term",
                quorum_index
            );
            return;
        }

        debug!("Commit index {} -> {}", self.commit_index, quorum_index);
        self.commit_index = quorum_index;
        self.apply_committed();
        self.wake_replicators();
    }

    /// Handle an AppendEntries RPC request
    pub(super) fn handle_append_entries(&mut self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let reject = |term: Term, conflict: Option<ConflictHint>| AppendEntriesResponse {
            term,
            success: false,
            match_index: 0,
            conflict,
        };

        if self.stopped || self.storage_fault.is_some() || req.term < self.hard.term {
            return reject(self.hard.term, None);
        }
        if !self.accept_leader(req.term, &req.leader_id) {
            return reject(self.hard.term, None);
        }
        let term = self.hard.term;

        // Everything up to the snapshot is committed, so it matches.
        let snapshot_index = self.store.snapshot_index();
        let mut prev_index = req.prev_log_index;
        let mut prev_term = req.prev_log_term;
        let mut entries = req.entries;
        if prev_index < snapshot_index {
            entries.retain(|e| e.index > snapshot_index);
            prev_index = snapshot_index;
            prev_term = self.store.term_at(snapshot_index).unwrap_or(0);
        }

        match self.store.term_at(prev_index) {
            None => {
                let index = self.store.last_index() + 1;
                debug!(
                    "Log too short for prev index {}, asking for {}",
                    prev_index, index
                );
                return reject(term, Some(ConflictHint { term: None, index }));
            }
            Some(found) if found != prev_term => {
                let mut first = prev_index;
                while first > snapshot_index + 1 && self.store.term_at(first - 1) == Some(found) {
                    first -= 1;
                }
                debug!(
                    "Term mismatch at {} (ours {}, leader's {})",
                    prev_index, found, prev_term
                );
                return reject(
                    term,
                    Some(ConflictHint {
                        term: Some(found),
                        index: first,
                    }),
                );
            }
            Some(_) => {}
        }

        let last_new = prev_index + entries.len() as LogIndex;
        let mut append_from = None;
        for (i, entry) in entries.iter().enumerate() {
            match self.store.term_at(entry.index) {
                Some(t) if t == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.commit_index {
                        error!(
                            "Leader {} conflicts with committed entry {}",
                            req.leader_id, entry.index
                        );
                        return reject(term, None);
                    }
                    warn!("Truncating divergent log from index {}", entry.index);
                    if let Err(e) = self.store.truncate_from(entry.index) {
                        self.storage_failed(&e);
                        return reject(self.hard.term, None);
                    }
                    self.fail_pending_from(entry.index);
                    append_from = Some(i);
                    break;
                }
                None => {
                    append_from = Some(i);
                    break;
                }
            }
        }

        if let Some(i) = append_from {
            let written = self
                .store
                .append(&entries[i..])
                .and_then(|_| self.store.flush());
            if let Err(e) = written {
                self.storage_failed(&e);
                return reject(self.hard.term, None);
            }
        }

        if req.leader_commit > self.commit_index {
            let commit = req.leader_commit.min(last_new);
            if commit > self.commit_index {
                self.commit_index = commit;
                self.apply_committed();
            }
        }

        AppendEntriesResponse {
            term,
            success: true,
            match_index: last_new,
            conflict: None,
        }
    }
}

impl Shared {
    /// Replication task for one follower. Exits when the node leaves the
    /// term it was started in, or the follower leaves the roster.
    pub(super) async fn replicate(self: Arc<Self>, replicator: Replicator) {
        let Replicator {
            peer,
            term,
            task_id,
            notify,
        } = replicator;
        debug!("Replicating to {} in term {}", peer, term);

        loop {
            let outbound = self.core.lock().next_replication(&peer, term, task_id);
            let Some(outbound) = outbound else {
                break;
            };

            let more = match outbound {
                Outbound::Append { target, request } => {
                    let result = self.rpc(self.transport.append_entries(&target, request)).await;
                    match result {
                        Ok(resp) => {
                            let mut core = self.core.lock();
                            core.handle_append_response(&peer, term, task_id, resp)
                        }
                        Err(e) => {
                            debug!("AppendEntries to {} failed: {}", peer, e);
                            false
                        }
                    }
                }
                Outbound::Snapshot { target, request } => {
                    let index = request.last_included_index;
                    let offset = request.offset;
                    let result = self
                        .rpc(self.transport.install_snapshot(&target, request))
                        .await;
                    match result {
                        Ok(resp) => {
                            let mut core = self.core.lock();
                            core.handle_snapshot_response(&peer, term, task_id, index, offset, resp)
                        }
                        Err(e) => {
                            debug!("InstallSnapshot to {} failed: {}", peer, e);
                            false
                        }
                    }
                }
            };
            if more {
                continue;
            }

            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        debug!("Replication to {} for term {} stopped", peer, term);
    }
}
