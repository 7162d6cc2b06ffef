//! Member roster
//!
//! The roster is the ordered set of members counted toward quorum. It only
//! changes through committed membership entries in the replicated log.

use crate::types::{LogIndex, Member, MemberId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordered set of voting members
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    members: BTreeMap<MemberId, Member>,
}

impl Roster {
    /// Build a roster from a list of members. Later duplicates replace earlier ones.
    pub fn new(members: impl IntoIterator<Item = Member>) -> Self {
        Self {
            members: members.into_iter().map(|m| (m.id.clone(), m)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: &MemberId) -> bool {
        self.members.contains_key(id)
    }

    pub fn get(&self, id: &MemberId) -> Option<&Member> {
        self.members.get(id)
    }

    /// Iterate over members in id order
    pub fn iter(&self) -> impl Iterator<Item = &Member> + '_ {
        self.members.values()
    }

    /// Iterate over member ids in order
    pub fn ids(&self) -> impl Iterator<Item = &MemberId> + '_ {
        self.members.keys()
    }

    /// Number of members that make a majority
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Check whether the given voters form a majority of this roster.
    /// Voters outside the roster are not counted.
    pub fn is_quorum<'a>(&self, voters: impl IntoIterator<Item = &'a MemberId>) -> bool {
        if self.members.is_empty() {
            return false;
        }
        let count = voters
            .into_iter()
            .filter(|id| self.members.contains_key(*id))
            .count();
        count >= self.quorum()
    }

    /// Highest log index replicated on a majority, given each member's
    /// match index.
    pub fn quorum_index(&self, match_index: impl Fn(&MemberId) -> LogIndex) -> LogIndex {
        if self.members.is_empty() {
            return 0;
        }
        let mut indexes: Vec<LogIndex> = self.members.keys().map(match_index).collect();
        indexes.sort_unstable_by(|a, b| b.cmp(a));
        indexes[self.quorum() - 1]
    }

    /// Copy of this roster with one member added (or its address replaced)
    pub fn with_member(&self, member: Member) -> Self {
        let mut members = self.members.clone();
        members.insert(member.id.clone(), member);
        Self { members }
    }

    /// Copy of this roster with one member removed
    pub fn without_member(&self, id: &MemberId) -> Self {
        let mut members = self.members.clone();
        members.remove(id);
        Self { members }
    }

    /// Members present in `next` but not in `self`, and members present in
    /// `self` but not in `next`.
    pub fn diff(&self, next: &Roster) -> (Vec<Member>, Vec<Member>) {
        let added = next
            .iter()
            .filter(|m| !self.contains(&m.id))
            .cloned()
            .collect();
        let removed = self
            .iter()
            .filter(|m| !next.contains(&m.id))
            .cloned()
            .collect();
        (added, removed)
    }
}

impl FromIterator<Member> for Roster {
    fn from_iter<T: IntoIterator<Item = Member>>(iter: T) -> Self {
        Self::new(iter)
    }
}
