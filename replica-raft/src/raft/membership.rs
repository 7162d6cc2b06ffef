//! Membership changes
//!
//! One member is added or removed per change, and only one change may be
//! uncommitted at a time. Any two majorities of rosters differing by a single
//! member overlap, so the switch needs no joint phase. The new roster takes
//! effect on each node when its entry is applied.

use super::state::{Core, Replicator};
use super::submission::PendingSubmission;
use crate::log::EntryPayload;
use replica_core::{Member, MemberId, ReplicaError, Result};
use std::fmt;
use tracing::info;

/// A single-member roster change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Add(Member),
    Remove(MemberId),
}

impl fmt::Display for MembershipChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipChange::Add(member) => write!(f, "add {}", member),
            MembershipChange::Remove(id) => write!(f, "remove {}", id),
        }
    }
}

impl Core {
    /// Propose a roster change. A joining member gets a replication task
    /// right away so it can catch up before the change commits.
    pub(super) fn propose_membership(
        &mut self,
        change: MembershipChange,
    ) -> Result<(PendingSubmission, Option<Replicator>)> {
        self.ensure_writable()?;
        if let Some(index) = self.leader.as_ref().and_then(|l| l.pending_membership) {
            return Err(ReplicaError::MembershipChangeInProgress(index));
        }

        let roster = match &change {
            MembershipChange::Add(member) => {
                if self.roster.contains(&member.id) {
                    return Err(ReplicaError::InvalidMembershipChange(format!(
                        "{} is already a member",
                        member.id
                    )));
                }
                self.roster.with_member(member.clone())
            }
            MembershipChange::Remove(id) => {
                if !self.roster.contains(id) {
                    return Err(ReplicaError::InvalidMembershipChange(format!(
                        "{} is not a member",
                        id
                    )));
                }
                if self.roster.len() == 1 {
                    return Err(ReplicaError::InvalidMembershipChange(
                        "Cannot remove the last member".to_string(),
                    ));
                }
                self.roster.without_member(id)
            }
        };

        let index = self.store.last_index() + 1;
        let replicator = match &change {
            MembershipChange::Add(member) => self.track_follower(member.clone(), index),
            MembershipChange::Remove(_) => None,
        };
        if let Some(leader) = self.leader.as_mut() {
            leader.pending_membership = Some(index);
        }
        info!("Proposing membership change ({}) at index {}", change, index);

        match self.propose(EntryPayload::Membership(roster)) {
            Ok(pending) => Ok((pending, replicator)),
            Err(e) => {
                if let Some(leader) = self.leader.as_mut() {
                    leader.pending_membership = None;
                    if let MembershipChange::Add(member) = &change {
                        leader.progress.remove(&member.id);
                    }
                }
                Err(e)
            }
        }
    }
}
