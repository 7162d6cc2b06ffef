//! Snapshots and log compaction
//!
//! A snapshot captures the state machine and roster at the last applied
//! index; the log prefix it covers is then discarded. Followers too far
//! behind receive the snapshot in chunks.

use super::state::{Core, IncomingSnapshot};
use crate::event::RaftEvent;
use crate::log::{Snapshot, SnapshotMeta};
use crate::rpc::{InstallSnapshotRequest, InstallSnapshotResponse};
use replica_core::{LogIndex, MemberId, NodeRole, ReplicaError, Result, Term};
use tracing::{debug, error, info, warn};

impl Core {
    /// Compact once enough entries have been applied since the last snapshot
    pub(super) fn maybe_compact(&mut self) {
        let threshold = self.config.snapshot_threshold;
        if threshold == 0 || self.last_applied < self.store.snapshot_index() + threshold {
            return;
        }
        if let Err(e) = self.compact() {
            warn!("Automatic compaction failed: {}", e);
        }
    }

    /// Snapshot the state machine at the last applied index and drop the
    /// log prefix it covers. Returns the snapshot index.
    pub(super) fn compact(&mut self) -> Result<LogIndex> {
        if self.stopped {
            return Err(ReplicaError::Shutdown);
        }
        let index = self.last_applied;
        if index <= self.store.snapshot_index() {
            return Ok(self.store.snapshot_index());
        }
        let term = self.store.term_at(index).ok_or_else(|| {
            ReplicaError::Storage(format!("No term recorded for applied index {}", index))
        })?;
        let data = self
            .state_machine
            .snapshot()
            .map_err(ReplicaError::StateMachine)?;

        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_included_index: index,
                last_included_term: term,
                roster: self.roster.clone(),
            },
            data,
        };
        let size = snapshot.data.len();
        if let Err(e) = self.store.compact(snapshot) {
            self.storage_failed(&e);
            return Err(e);
        }

        info!(
            "Node {} compacted log through index {} ({} byte snapshot)",
            self.id, index, size
        );
        self.notifier.notify(RaftEvent::SnapshotTaken { index });
        Ok(index)
    }

    /// Handle one chunk of an InstallSnapshot RPC request
    pub(super) fn handle_install_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse {
        let respond = |term: Term, bytes_received: u64, installed: bool| InstallSnapshotResponse {
            term,
            bytes_received,
            installed,
        };

        if self.stopped || self.storage_fault.is_some() || req.term < self.hard.term {
            return respond(self.hard.term, 0, false);
        }
        if !self.accept_leader(req.term, &req.leader_id) {
            return respond(self.hard.term, 0, false);
        }
        let term = self.hard.term;

        if req.last_included_index <= self.commit_index {
            debug!(
                "Already committed through {}, snapshot at {} not needed",
                self.commit_index, req.last_included_index
            );
            self.incoming_snapshot = None;
            return respond(term, 0, true);
        }

        if req.offset == 0 {
            self.incoming_snapshot = Some(IncomingSnapshot {
                index: req.last_included_index,
                term: req.last_included_term,
                data: Vec::new(),
            });
        }
        let Some(incoming) = self.incoming_snapshot.as_mut().filter(|s| {
            s.index == req.last_included_index && s.term == req.last_included_term
        }) else {
            // Chunks of a different snapshot; ask for this one from the start.
            return respond(term, 0, false);
        };
        if req.offset != incoming.data.len() as u64 {
            return respond(term, incoming.data.len() as u64, false);
        }
        incoming.data.extend_from_slice(&req.data);
        let received = incoming.data.len() as u64;
        if !req.done {
            return respond(term, received, false);
        }

        let data = self
            .incoming_snapshot
            .take()
            .map(|s| s.data)
            .unwrap_or_default();
        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_included_index: req.last_included_index,
                last_included_term: req.last_included_term,
                roster: req.roster,
            },
            data,
        };
        match self.install_snapshot(snapshot) {
            Ok(()) => respond(self.hard.term, received, true),
            Err(_) => respond(self.hard.term, 0, false),
        }
    }

    /// Replace state machine and log prefix with a snapshot from the leader
    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let index = snapshot.meta.last_included_index;
        let roster = snapshot.meta.roster.clone();

        // The state machine and the store must agree on the snapshot, so the
        // previous state is kept until both have accepted it.
        let previous = self
            .state_machine
            .snapshot()
            .map_err(ReplicaError::StateMachine)?;
        if let Err(e) = self.state_machine.restore(&snapshot.data) {
            error!("Failed to restore snapshot at index {}: {}", index, e);
            self.roll_back_state_machine(&previous);
            return Err(ReplicaError::StateMachine(e));
        }
        if let Err(e) = self.store.install_snapshot(snapshot) {
            self.roll_back_state_machine(&previous);
            self.storage_failed(&e);
            return Err(e);
        }

        // Submissions covered by the snapshot can no longer be matched to
        // their entries.
        let beyond = self.pending.split_off(&(index + 1));
        for (index, pending) in std::mem::replace(&mut self.pending, beyond) {
            let _ = pending.tx.send(Err(ReplicaError::NotCommitted { index }));
        }
        let last_index = self.store.last_index();
        self.fail_pending_from(last_index + 1);

        self.commit_index = index;
        self.last_applied = index;
        self.apply_roster(index, roster);
        let _ = self.persist_commit(index);

        info!("Node {} installed snapshot at index {}", self.id, index);
        self.notifier.notify(RaftEvent::SnapshotInstalled { index });
        Ok(())
    }

    fn roll_back_state_machine(&mut self, previous: &[u8]) {
        if let Err(e) = self.state_machine.restore(previous) {
            error!(
                "Node {} could not roll back its state machine: {}",
                self.id, e
            );
        }
    }

    /// Process a follower's reply to a snapshot chunk. Returns true if the
    /// next chunk (or entries) should be sent right away.
    pub(super) fn handle_snapshot_response(
        &mut self,
        peer: &MemberId,
        term: Term,
        task_id: u64,
        index: LogIndex,
        offset: u64,
        resp: InstallSnapshotResponse,
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

        if resp.installed {
            progress.snapshot = None;
            progress.match_index = progress.match_index.max(index);
            progress.next_index = progress.match_index + 1;
            let more = progress.next_index <= last_index;
            debug!("Follower {} installed snapshot at {}", peer, index);
            self.advance_commit();
            return more;
        }

        match progress.snapshot.as_mut() {
            Some(transfer) if transfer.index == index => {
                transfer.offset = resp.bytes_received;
                resp.bytes_received > offset
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::state::testing::*;
    use super::super::state::Pending;
    use crate::log::{EntryPayload, LogEntry, LogStore};
    use crate::rpc::RequestVoteResponse;
    use crate::state_machine::{KvCommand, KvQuery, KvStateMachine, StateMachine};
    use replica_core::{MemberId, NodeRole, ReplicaError};
    use std::sync::atomic::Ordering;
    use tokio::sync::oneshot;

    fn set(key: &str, value: &str) -> EntryPayload {
        EntryPayload::Command(
            KvCommand::Set {
                key: key.to_string(),
                value: value.as_bytes().to_vec(),
            }
            .encode()
            .unwrap(),
        )
    }

    /// Single-node leader with `n` applied commands
    fn leader_with_entries(n: u8) -> super::Core {
        let mut node = new_core(1, 1);
        node.start_election();
        assert_eq!(node.role, NodeRole::Leader);
        for i in 0..n {
            node.append_local(set(&format!("k{}", i), "v")).unwrap();
        }
        node.advance_commit();
        assert_eq!(node.last_applied, n as u64);
        node
    }

    #[test]
    fn test_compact_discards_prefix() {
        let mut node = leader_with_entries(5);
        assert_eq!(node.compact().unwrap(), 5);
        assert_eq!(node.store.snapshot_index(), 5);
        assert_eq!(node.store.first_index(), 6);
        assert_eq!(node.store.term_at(5), Some(1));
        // Nothing new to compact.
        assert_eq!(node.compact().unwrap(), 5);
    }

    #[test]
    fn test_threshold_triggers_compaction() {
        let mut node = new_core(1, 1);
        node.config.snapshot_threshold = 3;
        node.start_election();
        for i in 0..4 {
            node.append_local(set(&format!("k{}", i), "v")).unwrap();
            node.advance_commit();
        }
        assert_eq!(node.store.snapshot_index(), 3);
    }

    #[test]
    fn test_chunked_transfer_installs_on_follower() {
        let mut leader = new_core(1, 2);
        leader.start_election();
        let replicators = leader.handle_vote_response(
            &MemberId::from("node2"),
            1,
            RequestVoteResponse {
                term: 1,
                vote_granted: true,
            },
        );
        let r = &replicators[0];
        leader
            .append_local(set("color", "blue"))
            .unwrap();
        leader
            .leader
            .as_mut()
            .unwrap()
            .progress
            .get_mut(&r.peer)
            .unwrap()
            .match_index = 1;
        leader.advance_commit();
        leader.compact().unwrap();
        leader
            .leader
            .as_mut()
            .unwrap()
            .progress
            .get_mut(&r.peer)
            .unwrap()
            .next_index = 1;

        let mut follower = new_core(2, 2);
        let mut chunks = 0;
        loop {
            let Some(super::super::replication::Outbound::Snapshot { request, .. }) =
                leader.next_replication(&r.peer, r.term, r.task_id)
            else {
                break;
            };
            chunks += 1;
            let index = request.last_included_index;
            let offset = request.offset;
            let resp = follower.handle_install_snapshot(request);
            leader.handle_snapshot_response(&r.peer, r.term, r.task_id, index, offset, resp);
            assert!(chunks < 1000);
        }

        assert!(chunks > 1);
        assert_eq!(follower.last_applied, 1);
        assert_eq!(follower.commit_index, 1);
        assert_eq!(follower.store.snapshot_index(), 1);
        let value = follower
            .state_machine
            .query(
                &KvQuery::Get {
                    key: "color".to_string(),
                }
                .encode()
                .unwrap(),
            )
            .unwrap();
        let mut expected = KvStateMachine::new();
        expected
            .apply(&KvCommand::Set {
                key: "color".to_string(),
                value: b"blue".to_vec(),
            }
            .encode()
            .unwrap())
            .unwrap();
        assert_eq!(
            value,
            expected
                .query(
                    &KvQuery::Get {
                        key: "color".to_string()
                    }
                    .encode()
                    .unwrap()
                )
                .unwrap()
        );
    }

    #[test]
    fn test_out_of_order_chunk_reports_expected_offset() {
        let mut follower = new_core(2, 2);
        let chunk = |offset: u64, done: bool| crate::rpc::InstallSnapshotRequest {
            term: 1,
            leader_id: MemberId::from("node1"),
            last_included_index: 3,
            last_included_term: 1,
            roster: Default::default(),
            offset,
            data: vec![0; 4],
            done,
        };
        let first = follower.handle_install_snapshot(chunk(0, false));
        assert_eq!(first.bytes_received, 4);
        let skipped = follower.handle_install_snapshot(chunk(12, false));
        assert_eq!(skipped.bytes_received, 4);
        assert!(!skipped.installed);
    }

    fn local_value(node: &super::Core, key: &str) -> Option<Vec<u8>> {
        let query = KvQuery::Get {
            key: key.to_string(),
        }
        .encode()
        .unwrap();
        KvQuery::decode_value(&node.state_machine.query(&query).unwrap()).unwrap()
    }

    /// Single-chunk transfer carrying the follower's current roster
    fn whole_snapshot(
        follower: &super::Core,
        index: u64,
        data: Vec<u8>,
    ) -> crate::rpc::InstallSnapshotRequest {
        crate::rpc::InstallSnapshotRequest {
            term: 1,
            leader_id: MemberId::from("node1"),
            last_included_index: index,
            last_included_term: 1,
            roster: follower.roster.clone(),
            offset: 0,
            data,
            done: true,
        }
    }

    #[test]
    fn test_store_failure_leaves_state_machine_untouched() {
        let (store, failing) = FlakyStore::with_switch();
        let mut follower = new_core_with_store(2, 2, Box::new(store));
        let mut source = KvStateMachine::new();
        source
            .apply(&KvCommand::Set {
                key: "k".to_string(),
                value: b"v".to_vec(),
            }
            .encode()
            .unwrap())
            .unwrap();
        let data = source.snapshot().unwrap();
        follower.become_follower(1, None);

        failing.store(true, Ordering::SeqCst);
        let resp = follower.handle_install_snapshot(whole_snapshot(&follower, 5, data.clone()));
        assert!(!resp.installed);
        assert_eq!(follower.last_applied, 0);
        assert_eq!(follower.commit_index, 0);
        assert_eq!(follower.store.snapshot_index(), 0);
        assert_eq!(local_value(&follower, "k"), None);

        failing.store(false, Ordering::SeqCst);
        follower.check_storage();
        let resp = follower.handle_install_snapshot(whole_snapshot(&follower, 5, data));
        assert!(resp.installed);
        assert_eq!(follower.last_applied, 5);
        assert_eq!(follower.store.snapshot_index(), 5);
        assert_eq!(local_value(&follower, "k"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_corrupt_snapshot_is_not_installed() {
        let mut follower = new_core(2, 2);
        follower
            .state_machine
            .apply(&KvCommand::Set {
                key: "kept".to_string(),
                value: b"yes".to_vec(),
            }
            .encode()
            .unwrap())
            .unwrap();

        let resp = follower.handle_install_snapshot(whole_snapshot(&follower, 5, vec![0xff; 3]));
        assert!(!resp.installed);
        assert_eq!(follower.store.snapshot_index(), 0);
        assert!(follower.storage_fault.is_none());
        assert_eq!(local_value(&follower, "kept"), Some(b"yes".to_vec()));
    }

    #[test]
    fn test_install_fails_covered_pending_as_not_committed() {
        let mut follower = new_core(2, 2);
        follower
            .store
            .append(&[LogEntry::new(1, 1, EntryPayload::Noop)])
            .unwrap();
        let (tx, mut rx) = oneshot::channel();
        follower.pending.insert(1, Pending { term: 1, tx });

        let data = KvStateMachine::new().snapshot().unwrap();
        let resp = follower.handle_install_snapshot(crate::rpc::InstallSnapshotRequest {
            term: 2,
            leader_id: MemberId::from("node1"),
            last_included_index: 4,
            last_included_term: 2,
            roster: follower.roster.clone(),
            offset: 0,
            data,
            done: true,
        });
        assert!(resp.installed);
        assert_eq!(follower.commit_index, 4);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(ReplicaError::NotCommitted { index: 1 })
        ));
    }
}
