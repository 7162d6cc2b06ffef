//! Applying committed entries
//!
//! Entries reach the state machine strictly in index order, exactly once,
//! and only after the commit index covers them.

use super::state::Core;
use crate::event::RaftEvent;
use crate::log::EntryPayload;
use replica_core::{LogIndex, NodeRole, ReplicaError, Result, Roster, Term};
use tracing::{debug, error, info};

impl Core {
    /// Apply every committed entry not yet applied
    pub(super) fn apply_committed(&mut self) {
        let start = self.last_applied;
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.store.get(index) else {
                error!("Committed entry {} is missing from the log", index);
                break;
            };

            let result = match &entry.payload {
                EntryPayload::Command(command) => self
                    .state_machine
                    .apply(command)
                    .map_err(ReplicaError::StateMachine),
                EntryPayload::Membership(roster) => {
                    self.apply_roster(index, roster.clone());
                    Ok(Vec::new())
                }
                EntryPayload::Noop => Ok(Vec::new()),
            };

            self.last_applied = index;
            self.resolve_pending(index, entry.term, result);
            if !self.replaying {
                self.notifier.notify(RaftEvent::EntryCommitted {
                    index,
                    term: entry.term,
                });
            }
        }

        if self.last_applied == start || self.replaying {
            return;
        }
        debug!(
            "Node {} applied entries {}..={}",
            self.id,
            start + 1,
            self.last_applied
        );
        if self.persist_commit(self.commit_index).is_err() {
            return;
        }
        self.maybe_compact();
    }

    /// Hand the result to the submitter, if it is still waiting
    fn resolve_pending(&mut self, index: LogIndex, term: Term, result: Result<Vec<u8>>) {
        let Some(pending) = self.pending.remove(&index) else {
            return;
        };
        let outcome = if pending.term == term {
            result
        } else {
            // Another leader's entry took this slot.
            Err(ReplicaError::SubmissionLost { index })
        };
        let _ = pending.tx.send(outcome);
    }

    /// Switch quorum calculations to a newly committed roster
    pub(super) fn apply_roster(&mut self, index: LogIndex, roster: Roster) {
        let previous = std::mem::replace(&mut self.roster, roster);
        let (added, removed) = previous.diff(&self.roster);

        for member in added {
            if !self.replaying {
                info!("Member {} joined at index {}", member, index);
                self.notifier.notify(RaftEvent::MemberJoined {
                    member,
                    roster: self.roster.clone(),
                });
            }
        }
        for member in removed {
            if !self.replaying {
                info!("Member {} removed at index {}", member, index);
                self.notifier.notify(RaftEvent::MemberRemoved {
                    member,
                    roster: self.roster.clone(),
                });
            }
        }

        let roster = &self.roster;
        if let Some(leader) = self.leader.as_mut() {
            if leader.pending_membership.is_some_and(|p| p <= index) {
                leader.pending_membership = None;
            }
            leader.progress.retain(|id, _| roster.contains(id));
        }

        if self.role == NodeRole::Leader && !self.roster.contains(&self.id) {
            info!("Node {} left the roster, stepping down", self.id);
            let term = self.hard.term;
            self.become_follower(term, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::state::testing::*;
    use super::super::state::Pending;
    use crate::log::{LogEntry, LogStore};
    use crate::state_machine::{KvCommand, KvOutput};
    use replica_core::ReplicaError;
    use tokio::sync::oneshot;

    fn set(key: &str) -> Vec<u8> {
        KvCommand::Set {
            key: key.to_string(),
            value: b"v".to_vec(),
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn test_applies_in_order_up_to_commit() {
        let mut core = new_core(1, 3);
        core.store
            .append(&[
                LogEntry::new(1, 1, crate::log::EntryPayload::Command(set("a"))),
                LogEntry::new(1, 2, crate::log::EntryPayload::Command(set("b"))),
                LogEntry::new(1, 3, crate::log::EntryPayload::Command(set("c"))),
            ])
            .unwrap();
        core.commit_index = 2;
        core.apply_committed();
        assert_eq!(core.last_applied, 2);
        assert_eq!(core.hard.commit, 2);
        assert!(core
            .state_machine
            .query(&crate::state_machine::KvQuery::Keys.encode().unwrap())
            .is_ok());
    }

    #[test]
    fn test_resolves_matching_pending_with_result() {
        let mut core = new_core(1, 1);
        core.store
            .append(&[LogEntry::new(2, 1, crate::log::EntryPayload::Command(set("x")))])
            .unwrap();
        let (tx, mut rx) = oneshot::channel();
        core.pending.insert(1, Pending { term: 2, tx });
        core.commit_index = 1;
        core.apply_committed();
        let out = rx.try_recv().unwrap().unwrap();
        assert_eq!(KvOutput::decode(&out).unwrap(), KvOutput::Previous(None));
    }

    #[test]
    fn test_pending_from_other_term_is_lost() {
        let mut core = new_core(1, 1);
        core.store
            .append(&[LogEntry::new(3, 1, crate::log::EntryPayload::Noop)])
            .unwrap();
        let (tx, mut rx) = oneshot::channel();
        core.pending.insert(1, Pending { term: 2, tx });
        core.commit_index = 1;
        core.apply_committed();
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(ReplicaError::SubmissionLost { index: 1 })
        ));
    }

    #[test]
    fn test_state_machine_error_is_returned_but_entry_still_applied() {
        let mut core = new_core(1, 1);
        core.store
            .append(&[LogEntry::new(1, 1, crate::log::EntryPayload::Command(vec![0xff; 8]))])
            .unwrap();
        let (tx, mut rx) = oneshot::channel();
        core.pending.insert(1, Pending { term: 1, tx });
        core.commit_index = 1;
        core.apply_committed();
        assert_eq!(core.last_applied, 1);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(ReplicaError::StateMachine(_))
        ));
    }

    #[test]
    fn test_membership_entry_changes_roster_on_apply() {
        let mut core = new_core(1, 3);
        let grown = core.roster.with_member(member(4));
        core.store
            .append(&[LogEntry::new(1, 1, crate::log::EntryPayload::Membership(grown))])
            .unwrap();
        assert_eq!(core.roster.len(), 3);
        core.commit_index = 1;
        core.apply_committed();
        assert_eq!(core.roster.len(), 4);
        assert_eq!(core.roster.quorum(), 3);
    }
}
