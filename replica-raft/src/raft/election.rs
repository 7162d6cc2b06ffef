//! Leader election
//!
//! Followers that hear nothing from a leader for a randomized election
//! timeout become candidates, bump the term, vote for themselves and ask the
//! roster for votes. A candidate holding votes from a majority of the
//! current roster becomes leader for that term.

use super::state::{Core, LeaderState, Replicator};
use super::Shared;
use crate::log::{EntryPayload, HardState};
use crate::rpc::{RequestVoteRequest, RequestVoteResponse};
use replica_core::{Member, MemberId, NodeRole, Term};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

/// What a node must do after starting an election
pub(super) enum Campaign {
    /// Single-member roster: the node won on its own vote
    Won(Vec<Replicator>),
    /// Ask these peers for their votes
    Requests {
        request: RequestVoteRequest,
        peers: Vec<Member>,
    },
}

impl Core {
    /// Become a candidate for the next term
    pub(super) fn start_election(&mut self) -> Option<Campaign> {
        let next = HardState {
            term: self.hard.term + 1,
            voted_for: Some(self.id.clone()),
            commit: self.hard.commit,
        };
        if self.persist_hard_state(next).is_err() {
            return None;
        }
        self.leader = None;
        self.leader_id = None;
        self.votes.clear();
        self.votes.insert(self.id.clone());
        self.set_role(NodeRole::Candidate);
        self.reset_election_timer();

        info!(
            "Node {} starting election for term {}",
            self.id, self.hard.term
        );

        if self.roster.is_quorum(self.votes.iter()) {
            return Some(Campaign::Won(self.become_leader()));
        }

        let request = RequestVoteRequest {
            term: self.hard.term,
            candidate_id: self.id.clone(),
            last_log_index: self.store.last_index(),
            last_log_term: self.store.last_term(),
        };
        let peers = self
            .roster
            .iter()
            .filter(|m| m.id != self.id)
            .cloned()
            .collect();
        Some(Campaign::Requests { request, peers })
    }

    /// A current leader was heard from recently enough that an election
    /// would only be disruptive
    fn leader_is_fresh(&self) -> bool {
        if self.role == NodeRole::Leader {
            return true;
        }
        self.leader_id.is_some()
            && self
                .last_leader_contact
                .is_some_and(|t| t.elapsed() < self.config.election_timeout_min)
    }

    /// Handle a RequestVote RPC request
    pub(super) fn handle_request_vote(&mut self, req: RequestVoteRequest) -> RequestVoteResponse {
        let reject = |term: Term| RequestVoteResponse {
            term,
            vote_granted: false,
        };

        if self.stopped || self.storage_fault.is_some() || req.term < self.hard.term {
            return reject(self.hard.term);
        }
        if req.term > self.hard.term && self.leader_is_fresh() {
            debug!(
                "Ignoring vote request from {} for term {}: leader is alive",
                req.candidate_id, req.term
            );
            return reject(self.hard.term);
        }
        if req.term > self.hard.term {
            self.become_follower(req.term, None);
            if self.storage_fault.is_some() {
                return reject(self.hard.term);
            }
        }

        let ours = (self.store.last_term(), self.store.last_index());
        let theirs = (req.last_log_term, req.last_log_index);
        let up_to_date = theirs >= ours;
        let available = match &self.hard.voted_for {
            None => true,
            Some(voted) => *voted == req.candidate_id,
        };

        if !(available && up_to_date) {
            debug!(
                "Denied vote to {} for term {} (available: {}, up to date: {})",
                req.candidate_id, req.term, available, up_to_date
            );
            return reject(self.hard.term);
        }

        if self.hard.voted_for.is_none() {
            let next = HardState {
                voted_for: Some(req.candidate_id.clone()),
                ..self.hard.clone()
            };
            if self.persist_hard_state(next).is_err() {
                return reject(self.hard.term);
            }
        }
        self.reset_election_timer();
        info!(
            "Granted vote to candidate {} for term {}",
            req.candidate_id, req.term
        );
        RequestVoteResponse {
            term: self.hard.term,
            vote_granted: true,
        }
    }

    /// Count a vote; returns replication tasks to spawn if this vote won
    pub(super) fn handle_vote_response(
        &mut self,
        from: &MemberId,
        term: Term,
        resp: RequestVoteResponse,
    ) -> Vec<Replicator> {
        if resp.term > self.hard.term {
            debug!("Vote reply from {} carries newer term {}", from, resp.term);
            self.become_follower(resp.term, None);
            return Vec::new();
        }
        if self.role != NodeRole::Candidate || self.hard.term != term || !resp.vote_granted {
            return Vec::new();
        }

        self.votes.insert(from.clone());
        debug!(
            "Received vote from {} for term {} ({}/{})",
            from,
            term,
            self.votes.len(),
            self.roster.quorum()
        );
        if self.roster.is_quorum(self.votes.iter()) {
            return self.become_leader();
        }
        Vec::new()
    }

    /// Take leadership of the current term
    pub(super) fn become_leader(&mut self) -> Vec<Replicator> {
        let last_index = self.store.last_index();

        // An uncommitted membership entry is still in flight; its new
        // members need the log too.
        let mut pending_membership = None;
        let mut joining: Vec<Member> = Vec::new();
        for entry in self.store.entries(self.commit_index + 1, last_index + 1) {
            if let EntryPayload::Membership(roster) = &entry.payload {
                pending_membership = Some(entry.index);
                joining = roster
                    .iter()
                    .filter(|m| !self.roster.contains(&m.id))
                    .cloned()
                    .collect();
            }
        }

        self.votes.clear();
        self.leader = Some(LeaderState {
            progress: HashMap::new(),
            pending_membership,
        });
        self.observe_leader(Some(self.id.clone()));
        self.set_role(NodeRole::Leader);
        info!(
            "Node {} became leader for term {}",
            self.id, self.hard.term
        );

        if last_index > self.commit_index && self.append_local(EntryPayload::Noop).is_err() {
            return Vec::new();
        }

        let members: Vec<Member> = self.roster.iter().cloned().chain(joining).collect();
        let replicators = members
            .into_iter()
            .filter_map(|m| self.track_follower(m, last_index + 1))
            .collect();
        self.advance_commit();
        replicators
    }
}

impl Shared {
    /// Election timer. Runs until shutdown; resets are plain writes to the
    /// deadline, so they never race the critical section.
    pub(super) async fn run_election_timer(self: Arc<Self>) {
        loop {
            let deadline = self.core.lock().election_deadline;
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {}
            }
            self.election_tick();
        }
    }

    fn election_tick(self: &Arc<Self>) {
        let campaign = {
            let mut core = self.core.lock();
            if core.stopped || Instant::now() < core.election_deadline {
                return;
            }
            core.reset_election_timer();
            if core.storage_fault.is_some() {
                core.check_storage();
                return;
            }
            if core.role == NodeRole::Leader || !core.can_campaign() {
                return;
            }
            core.start_election()
        };

        match campaign {
            Some(Campaign::Won(replicators)) => self.spawn_replicators(replicators),
            Some(Campaign::Requests { request, peers }) => {
                for peer in peers {
                    let shared = self.clone();
                    let request = request.clone();
                    self.spawn(async move { shared.request_vote(peer, request).await });
                }
            }
            None => {}
        }
    }

    async fn request_vote(self: Arc<Self>, peer: Member, request: RequestVoteRequest) {
        let term = request.term;
        let result = self
            .rpc(self.transport.request_vote(&peer, request))
            .await;
        match result {
            Ok(resp) => {
                let replicators = {
                    let mut core = self.core.lock();
                    core.handle_vote_response(&peer.id, term, resp)
                };
                self.spawn_replicators(replicators);
            }
            Err(e) => debug!("RequestVote to {} failed: {}", peer.id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::state::testing::*;
    use super::*;
    use crate::log::{LogEntry, LogStore};
    use std::sync::atomic::Ordering;

    fn vote_request(core: &Core) -> RequestVoteRequest {
        RequestVoteRequest {
            term: core.term(),
            candidate_id: core.id.clone(),
            last_log_index: core.store.last_index(),
            last_log_term: core.store.last_term(),
        }
    }

    #[test]
    fn test_start_election_becomes_candidate() {
        let mut node = new_core(1, 3);
        let campaign = node.start_election().unwrap();

        assert_eq!(node.role, NodeRole::Candidate);
        assert_eq!(node.term(), 1);
        assert_eq!(node.hard.voted_for, Some(MemberId::from("node1")));
        assert_eq!(node.store.hard_state().term, 1);
        match campaign {
            Campaign::Requests { request, peers } => {
                assert_eq!(request.term, 1);
                assert_eq!(peers.len(), 2);
            }
            Campaign::Won(_) => panic!("three-node cluster cannot win alone"),
        }
    }

    #[test]
    fn test_single_node_wins_immediately() {
        let mut node = new_core(1, 1);
        let campaign = node.start_election().unwrap();
        assert!(matches!(campaign, Campaign::Won(ref r) if r.is_empty()));
        assert_eq!(node.role, NodeRole::Leader);
        assert_eq!(node.leader_id, Some(MemberId::from("node1")));
    }

    #[test]
    fn test_majority_vote_elects_leader() {
        let mut a = new_core(1, 3);
        let mut b = new_core(2, 3);
        a.start_election();
        let resp = b.handle_request_vote(vote_request(&a));
        assert!(resp.vote_granted);
        let replicators = a.handle_vote_response(&b.id, 1, resp);
        assert_eq!(a.role, NodeRole::Leader);
        assert_eq!(replicators.len(), 2);
    }

    #[test]
    fn test_votes_at_most_once_per_term() {
        let mut a = new_core(1, 3);
        let mut b = new_core(2, 3);
        let mut c = new_core(3, 3);
        a.start_election();
        b.start_election();

        assert!(c.handle_request_vote(vote_request(&a)).vote_granted);
        assert!(!c.handle_request_vote(vote_request(&b)).vote_granted);
        // A duplicate of the granted request is still granted.
        assert!(c.handle_request_vote(vote_request(&a)).vote_granted);
    }

    #[test]
    fn test_vote_is_granted_only_once_saved() {
        let mut a = new_core(1, 3);
        let mut b = new_core(2, 3);
        let (store, failing) = FlakyStore::with_switch();
        let mut c = new_core_with_store(3, 3, Box::new(store));
        a.start_election();
        b.start_election();
        c.become_follower(1, None);

        failing.store(true, Ordering::SeqCst);
        assert!(!c.handle_request_vote(vote_request(&a)).vote_granted);
        assert_eq!(c.hard.voted_for, None);
        assert!(c.storage_fault.is_some());

        failing.store(false, Ordering::SeqCst);
        c.check_storage();
        assert!(c.storage_fault.is_none());

        assert!(c.handle_request_vote(vote_request(&a)).vote_granted);
        assert_eq!(c.store.hard_state().voted_for, Some(MemberId::from("node1")));
        assert_eq!(c.store.hard_state().term, 1);
        assert!(!c.handle_request_vote(vote_request(&b)).vote_granted);
    }

    #[test]
    fn test_failed_save_leaves_term_unchanged() {
        let (store, failing) = FlakyStore::with_switch();
        let mut node = new_core_with_store(1, 3, Box::new(store));
        failing.store(true, Ordering::SeqCst);

        assert!(node.start_election().is_none());
        assert_eq!(node.term(), 0);
        assert_eq!(node.hard.voted_for, None);
        assert_eq!(node.role, NodeRole::Follower);

        node.become_follower(4, None);
        assert_eq!(node.term(), 0);
        assert_eq!(node.store.hard_state(), HardState::default());
    }

    #[test]
    fn test_rejects_candidate_with_stale_log() {
        let mut a = new_core(1, 3);
        let mut b = new_core(2, 3);
        b.store
            .append(&[LogEntry::new(1, 1, EntryPayload::Noop)])
            .unwrap();
        b.hard.term = 1;

        a.hard.term = 1;
        a.start_election();
        let resp = b.handle_request_vote(vote_request(&a));
        assert!(!resp.vote_granted);
        // The higher term was still adopted.
        assert_eq!(b.term(), 2);
    }

    #[test]
    fn test_rejects_lower_term() {
        let mut a = new_core(1, 3);
        let mut b = new_core(2, 3);
        b.hard.term = 5;
        a.start_election();
        let resp = b.handle_request_vote(vote_request(&a));
        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 5);
    }

    #[test]
    fn test_higher_term_reply_demotes_candidate() {
        let mut a = new_core(1, 3);
        a.start_election();
        a.handle_vote_response(
            &MemberId::from("node2"),
            1,
            RequestVoteResponse {
                term: 4,
                vote_granted: false,
            },
        );
        assert_eq!(a.role, NodeRole::Follower);
        assert_eq!(a.term(), 4);
    }

    #[test]
    fn test_fresh_leader_contact_blocks_disruptive_votes() {
        let mut b = new_core(2, 3);
        b.hard.term = 1;
        b.observe_leader(Some(MemberId::from("node1")));
        b.last_leader_contact = Some(Instant::now());

        let mut c = new_core(3, 3);
        c.hard.term = 1;
        c.start_election();
        let resp = b.handle_request_vote(vote_request(&c));
        assert!(!resp.vote_granted);
        assert_eq!(b.term(), 1);
    }

    #[test]
    fn test_split_vote_resolves_in_later_term() {
        // Four members: a and b split the vote 2-2 in term 1.
        let mut a = new_core(1, 4);
        let mut b = new_core(2, 4);
        let mut c = new_core(3, 4);
        let mut d = new_core(4, 4);

        a.start_election();
        b.start_election();
        let ra = c.handle_request_vote(vote_request(&a));
        let rb = d.handle_request_vote(vote_request(&b));
        a.handle_vote_response(&c.id, 1, ra);
        b.handle_vote_response(&d.id, 1, rb);
        let denied = b.handle_request_vote(vote_request(&a));
        assert!(!denied.vote_granted);
        assert!(a.handle_vote_response(&b.id, 1, denied).is_empty());
        assert_eq!(a.role, NodeRole::Candidate);
        assert_eq!(b.role, NodeRole::Candidate);

        // a times out first and retries with a higher term.
        a.start_election();
        assert_eq!(a.term(), 2);
        let rb = b.handle_request_vote(vote_request(&a));
        assert_eq!(b.role, NodeRole::Follower);
        assert!(rb.vote_granted);
        let rc = c.handle_request_vote(vote_request(&a));
        a.handle_vote_response(&b.id, 2, rb);
        a.handle_vote_response(&c.id, 2, rc);

        assert_eq!(a.role, NodeRole::Leader);
        assert_eq!(b.role, NodeRole::Follower);
        assert_eq!(c.term(), 2);
    }

    #[test]
    fn test_new_leader_appends_noop_only_for_uncommitted_tail() {
        let mut fresh = new_core(1, 1);
        fresh.start_election();
        assert_eq!(fresh.store.last_index(), 0);

        let mut store = crate::log::MemoryLogStore::new();
        store
            .append(&[LogEntry::new(1, 1, EntryPayload::Command(vec![1]))])
            .unwrap();
        let mut inherited = new_core_with_store(1, 3, Box::new(store));
        inherited.hard.term = 1;
        inherited.start_election();
        inherited.become_leader();
        assert_eq!(inherited.store.last_index(), 2);
        assert_eq!(inherited.store.get(2).unwrap().payload, EntryPayload::Noop);
        assert_eq!(inherited.store.get(2).unwrap().term, 2);
    }
}
