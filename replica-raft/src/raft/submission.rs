//! Client submissions

use super::state::{Core, Pending};
use crate::log::EntryPayload;
use replica_core::{LogIndex, ReplicaError, Result, Term};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;

/// A command appended to the leader's log, resolving once its entry is
/// applied (with the state machine's output) or known to be lost.
#[derive(Debug)]
pub struct PendingSubmission {
    index: LogIndex,
    term: Term,
    rx: oneshot::Receiver<Result<Vec<u8>>>,
}

impl PendingSubmission {
    /// Log index assigned to the command
    pub fn index(&self) -> LogIndex {
        self.index
    }

    /// Term the command was appended in
    pub fn term(&self) -> Term {
        self.term
    }
}

impl Future for PendingSubmission {
    type Output = Result<Vec<u8>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let index = self.index;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(ReplicaError::NotCommitted { index })))
    }
}

impl Core {
    /// Append `payload` as a new entry and track its outcome
    pub(super) fn propose(&mut self, payload: EntryPayload) -> Result<PendingSubmission> {
        self.ensure_writable()?;
        let entry = self.append_local(payload)?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            entry.index,
            Pending {
                term: entry.term,
                tx,
            },
        );
        debug!(
            "Appended entry {} in term {}",
            entry.index, entry.term
        );

        self.wake_replicators();
        // A single-member roster commits on its own.
        self.advance_commit();

        Ok(PendingSubmission {
            index: entry.index,
            term: entry.term,
            rx,
        })
    }
}
