//! Session bookkeeping shared by the transport and the orchestrator.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};
use crate::position::Position;
use crate::protocol::{CommandKind, StateId};

/// Lifecycle of a verifier session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Process running, handshake not yet answered.
    Starting,
    /// Nothing in flight.
    Ready,
    /// A request of this kind has been written and its reply is awaited.
    AwaitingAck(CommandKind),
    /// Process gone; every further request fails.
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::AwaitingAck(kind) => write!(f, "awaiting {kind}"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// One accepted unit in the verifier's edit history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub state_id: StateId,
    pub start: Position,
    pub end: Position,
}

/// The client's mirror of the verifier's edit history.
///
/// `root` is the state returned by the handshake; commits stack on top of it
/// in script order, so their end positions increase strictly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditStack {
    root: Option<StateId>,
    commits: Vec<Commit>,
}

impl EditStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_root(&mut self, root: StateId) {
        self.root = Some(root);
        self.commits.clear();
    }

    pub fn root(&self) -> Option<StateId> {
        self.root
    }

    /// State the next request applies to: the last commit, or the root.
    pub fn tip(&self) -> Option<StateId> {
        self.commits.last().map(|c| c.state_id).or(self.root)
    }

    pub fn push(&mut self, commit: Commit) {
        self.commits.push(commit);
    }

    /// Remove the last `steps` commits, most recent first.
    pub fn pop(&mut self, steps: usize) -> Result<Vec<Commit>> {
        if steps > self.commits.len() {
            return Err(Error::rewind_inconsistent(steps, self.commits.len()));
        }
        let keep = self.commits.len() - steps;
        let mut popped = self.commits.split_off(keep);
        popped.reverse();
        Ok(popped)
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn commits(&self) -> &[Commit] {
        &self.commits
    }

    /// End of the last accepted unit (the committed frontier).
    pub fn frontier(&self) -> Position {
        self.commits.last().map_or(Position::ORIGIN, |c| c.end)
    }
}

/// A request that has been submitted but not yet answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub seq: u64,
    pub kind: CommandKind,
    pub start: Position,
    /// For commits, where the next unit starts once this one is accepted.
    pub end: Position,
    pub text: String,
}
