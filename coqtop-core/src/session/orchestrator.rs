//! Proof session orchestration.
//!
//! [`ProofSession`] turns editor intents (step forward, step back, jump to
//! the cursor, run a query) into transport requests. It keeps no ledger of
//! its own: committed spans are the transport's edit history and running
//! spans are its pending commit entries, so the two never disagree.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::coqtop::{
    Commit, CoqtopConfig, PendingEntry, SessionState, Submission, Ticket, Transport,
};
use crate::error::{Error, Result};
use crate::position::{Position, TextSource};
use crate::protocol::{CommandKind, Goals, QueryKind, Response, StateId, Status, Value};
use crate::scanner::{scan_all, Unit};
use crate::session::sink::SessionSink;

/// Where a [`ProofSession::jump_to`] left the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Movement {
    Stayed,
    /// This many units were submitted.
    Advanced(usize),
    /// This many commits were rewound.
    Rewound(usize),
}

/// Serializable view of a session, for debugging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub verifier_version: String,
    pub root: Option<StateId>,
    pub commits: Vec<Commit>,
    pub pending: Vec<PendingEntry>,
    pub committed_frontier: Position,
    pub running_frontier: Position,
}

impl SessionSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// An interactive proof session over one verifier process.
pub struct ProofSession {
    transport: Transport,
}

impl ProofSession {
    /// Launch a verifier and complete the handshake.
    pub fn spawn(config: &CoqtopConfig, sink: Arc<dyn SessionSink>) -> Result<Self> {
        Ok(Self::from_transport(Transport::spawn(config, sink)?))
    }

    /// Wrap a transport whose handshake has completed.
    pub fn from_transport(transport: Transport) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn state(&self) -> Result<SessionState> {
        self.transport.state()
    }

    /// End of the last accepted unit.
    pub fn committed_frontier(&self) -> Result<Position> {
        self.transport.committed_frontier()
    }

    /// End of the last unit sent or queued, else the committed frontier.
    ///
    /// Scanning for the next unit starts here.
    pub fn running_frontier(&self) -> Result<Position> {
        Ok(self.transport.frontier_epoch()?.0)
    }

    /// Submit the next unit after the running frontier, followed by a goals
    /// refresh. Comments are stepped over, not sent.
    ///
    /// Returns `None` when no complete unit remains. Fails with
    /// [`Error::Cancelled`] if the running batch was dropped while the unit
    /// was being scanned.
    pub fn advance<T: TextSource + ?Sized>(&self, text: &T) -> Result<Option<Unit>> {
        let (from, epoch) = self.transport.frontier_epoch()?;
        let Some(unit) = scan_all(text, from).find(Unit::is_sentence) else {
            return Ok(None);
        };
        self.submit_unit(epoch, text, &unit)?;
        Ok(Some(unit))
    }

    /// Step back `n` commits. Clamped to the history; returns how many were
    /// rewound.
    pub fn undo(&self, n: usize) -> Result<usize> {
        if n < 1 || self.transport.commits()?.is_empty() {
            return Ok(0);
        }
        self.settle()?;
        let steps = n.min(self.transport.commits()?.len());
        self.rewind(steps)?;
        Ok(steps)
    }

    /// Move the session so the committed region ends at or before `target`:
    /// rewind the commits ending past it, or advance while the next unit ends
    /// at or before it.
    pub fn jump_to<T: TextSource + ?Sized>(&self, text: &T, target: Position) -> Result<Movement> {
        if target < self.running_frontier()? {
            self.settle()?;
        }

        let committed = self.transport.committed_frontier()?;
        if target <= committed {
            let steps = self.count_commits(|end| end > target)?;
            if steps == 0 {
                return Ok(Movement::Stayed);
            }
            self.rewind(steps)?;
            return Ok(Movement::Rewound(steps));
        }

        let (from, epoch) = self.transport.frontier_epoch()?;
        let mut sent = 0;
        for unit in scan_all(text, from) {
            if unit.end > target {
                break;
            }
            if !unit.is_sentence() {
                continue;
            }
            match self.submit_unit(epoch, text, &unit) {
                Ok(()) => sent += 1,
                Err(Error::Cancelled) => {
                    debug!(sent, at = %unit.start, "batch dropped while submitting");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(match sent {
            0 => Movement::Stayed,
            n => Movement::Advanced(n),
        })
    }

    /// Interrupt outstanding work. Returns whether anything was pending.
    pub fn cancel(&self) -> Result<bool> {
        if self.transport.pending()?.is_empty() {
            return Ok(false);
        }
        self.transport.interrupt()?;
        Ok(true)
    }

    /// The buffer changed at `position`: rewind every commit the edit
    /// touches (those ending at or after it) and drop running work past it.
    pub fn on_edit(&self, position: Position) -> Result<usize> {
        if position <= self.running_frontier()? {
            self.settle()?;
        }
        let steps = self.count_commits(|end| end >= position)?;
        if steps > 0 {
            debug!(%position, steps, "edit inside the committed region");
            self.rewind(steps)?;
        }
        Ok(steps)
    }

    /// Run a query; its output goes to the sink's info channel.
    pub fn query(&self, kind: QueryKind, terms: &str) -> Result<Ticket> {
        self.transport
            .submit(Submission::new(CommandKind::Query(kind)).with_text(kind.sentence(terms)))
    }

    /// Run a query and return its output text.
    pub fn query_sync(&self, kind: QueryKind, terms: &str) -> Result<String> {
        let reply = self.query(kind, terms)?.wait()?;
        match reply.response {
            Response::Rejected(info) => Err(Error::Rejected(info)),
            _ => Ok(reply.output_text()),
        }
    }

    /// Ask for the current goals; they arrive through the sink.
    pub fn refresh_goals(&self) -> Result<Ticket> {
        self.transport
            .submit(Submission::new(CommandKind::Goals { after_commit: false }))
    }

    /// Fetch the current goals. `None` means no proof is open.
    pub fn goals(&self) -> Result<Option<Goals>> {
        match self.refresh_goals()?.wait()?.response {
            Response::GoalsReport(goals) => Ok(goals),
            Response::Rejected(info) => Err(Error::Rejected(info)),
            other => Err(Error::decode(format!("unexpected goals answer: {other:?}"))),
        }
    }

    pub fn status(&self) -> Result<Status> {
        let reply = self.transport.request(Submission::new(CommandKind::Status))?;
        match reply.response {
            Response::Acknowledged(Value::Status(status)) => Ok(status),
            Response::Rejected(info) => Err(Error::Rejected(info)),
            other => Err(Error::decode(format!("unexpected status answer: {other:?}"))),
        }
    }

    /// Block until nothing is queued or in flight.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> Result<SessionState> {
        self.transport.wait_idle(timeout)
    }

    pub fn snapshot(&self) -> Result<SessionSnapshot> {
        Ok(SessionSnapshot {
            state: self.transport.state()?,
            verifier_version: self.transport.dialect().version.to_string(),
            root: self.transport.root()?,
            commits: self.transport.commits()?,
            pending: self.transport.pending()?,
            committed_frontier: self.transport.committed_frontier()?,
            running_frontier: self.running_frontier()?,
        })
    }

    /// Terminate the verifier. The session is unusable afterwards.
    pub fn stop(&self) -> Result<()> {
        self.transport.kill()
    }

    /// Queue a unit and the goals refresh that follows it, both in `epoch`.
    fn submit_unit<T: TextSource + ?Sized>(&self, epoch: u64, text: &T, unit: &Unit) -> Result<()> {
        let origin = unit.start.to_wire(text);
        debug!(start = %unit.start, kind = %unit.kind, "submitting unit");
        self.transport.submit_in(
            epoch,
            Submission::new(CommandKind::Commit(unit.kind))
                .with_text(unit.content.clone())
                .with_span(unit.start, unit.end, origin),
        )?;
        self.transport.submit_in(
            epoch,
            Submission::new(CommandKind::Goals { after_commit: true }),
        )?;
        Ok(())
    }

    /// Drop queued work, interrupt a query in flight, and wait for the
    /// in-flight request to finish.
    fn settle(&self) -> Result<()> {
        self.transport.interrupt_for_rewind()?;
        match self.transport.wait_idle(None)? {
            SessionState::Stopped => Err(Error::process_exited("session is stopped")),
            _ => Ok(()),
        }
    }

    fn rewind(&self, steps: usize) -> Result<()> {
        self.transport.rewind(steps)?.wait()?;
        self.refresh_goals()?;
        Ok(())
    }

    fn count_commits(&self, past: impl Fn(Position) -> bool) -> Result<usize> {
        Ok(self
            .transport
            .commits()?
            .iter()
            .rev()
            .take_while(|c| past(c.end))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coqtop::testing::{fake_session, FakeHandle, FakeOptions};
    use crate::position::TextSnapshot;
    use crate::protocol::CoqVersion;
    use crate::session::sink::RecordingSink;
    use pretty_assertions::assert_eq;
    use std::thread;
    use std::time::Instant;

    const SCRIPT: &str = "Lemma a : True.\nProof.\nexact I.\nQed.\n";
    const IDLE: Option<Duration> = Some(Duration::from_secs(5));

    fn session_with(options: FakeOptions) -> (ProofSession, FakeHandle, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let fake = fake_session(Arc::clone(&sink) as Arc<dyn SessionSink>, options);
        fake.transport.init().unwrap();
        let (transport, handle) = fake.into_parts();
        (ProofSession::from_transport(transport), handle, sink)
    }

    fn session() -> (ProofSession, FakeHandle, Arc<RecordingSink>) {
        session_with(FakeOptions::default())
    }

    fn commit_ends(session: &ProofSession) -> Vec<Position> {
        session.transport().commits().unwrap().iter().map(|c| c.end).collect()
    }

    #[test]
    fn test_advance_commits_and_refreshes_goals() {
        let (session, fake, sink) = session();
        let text = TextSnapshot::from(SCRIPT);
        let first = session.advance(&text).unwrap().unwrap();
        let second = session.advance(&text).unwrap().unwrap();
        assert_eq!(first.content, "Lemma a : True.");
        assert_eq!(second.start, Position::new(1, 0));
        assert_eq!(session.wait_idle(IDLE).unwrap(), SessionState::Ready);

        assert_eq!(commit_ends(&session), vec![Position::new(0, 15), Position::new(1, 6)]);
        assert_eq!(session.committed_frontier().unwrap(), Position::new(1, 6));
        assert!(matches!(sink.last_goals(), Some(Some(_))));
        assert_eq!(
            fake.calls(),
            vec!["Init", "Add Lemma a : True. @1", "Goal", "Add Proof. @2", "Goal"]
        );
    }

    #[test]
    fn test_advance_steps_over_comments() {
        let (session, fake, _sink) = session();
        let text = TextSnapshot::from("(* intro *)\n  Lemma a : True.");
        let unit = session.advance(&text).unwrap().unwrap();
        assert_eq!(unit.start, Position::new(1, 2));
        session.wait_idle(IDLE).unwrap();
        assert!(fake.calls().iter().all(|c| !c.contains("intro")));
    }

    #[test]
    fn test_advance_at_end_of_buffer() {
        let (session, _fake, _sink) = session();
        let text = TextSnapshot::from("Lemma a : True.\nProof");
        assert!(session.advance(&text).unwrap().is_some());
        assert!(session.advance(&text).unwrap().is_none());
        session.wait_idle(IDLE).unwrap();
        assert_eq!(session.transport().commits().unwrap().len(), 1);
    }

    #[test]
    fn test_rejected_unit_stops_the_batch() {
        let (session, fake, sink) = session();
        let text = TextSnapshot::from("Lemma a : True.\nCheck bad.\nexact I.\n");
        let hold = fake.hold_next_add();
        let moved = session.jump_to(&text, Position::new(3, 0)).unwrap();
        assert_eq!(moved, Movement::Advanced(3));
        hold.release();
        session.wait_idle(IDLE).unwrap();

        assert_eq!(commit_ends(&session), vec![Position::new(0, 15)]);
        let errors = sink.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].location,
            Some((Position::new(1, 6), Position::new(1, 9)))
        );
        assert!(!fake.calls().iter().any(|c| c.starts_with("Add exact")));
        // the running region is gone; the next advance retries the bad unit
        assert_eq!(session.running_frontier().unwrap(), Position::new(0, 15));
    }

    #[test]
    fn test_rejection_during_long_jump_stops_the_batch() {
        let (session, fake, sink) = session_with(FakeOptions {
            queue_capacity: 2,
            ..FakeOptions::default()
        });
        let mut script = String::from("Lemma a : True.\nCheck bad.\n");
        for _ in 0..60 {
            script.push_str("exact I.\n");
        }
        let text = TextSnapshot::from(script.as_str());

        // the queue fills long before the batch is submitted, so the
        // rejection lands while jump_to is still submitting
        let moved = session.jump_to(&text, Position::new(62, 0)).unwrap();
        assert!(matches!(moved, Movement::Advanced(n) if n >= 2));
        assert_eq!(session.wait_idle(IDLE).unwrap(), SessionState::Ready);

        assert_eq!(commit_ends(&session), vec![Position::new(0, 15)]);
        assert_eq!(sink.errors().len(), 1);
        assert!(!fake.calls().iter().any(|c| c.starts_with("Add exact")));
        assert_eq!(session.running_frontier().unwrap(), Position::new(0, 15));
    }

    #[test]
    fn test_goals_failure_mid_jump_rewinds_that_unit() {
        let (session, fake, sink) = session();
        let text = TextSnapshot::from("Lemma a : True.\nbreakgoals.\nexact I.\n");
        let hold = fake.hold_next_add();
        assert_eq!(
            session.jump_to(&text, Position::new(3, 0)).unwrap(),
            Movement::Advanced(3)
        );
        hold.release();
        assert_eq!(session.wait_idle(IDLE).unwrap(), SessionState::Ready);

        assert_eq!(commit_ends(&session), vec![Position::new(0, 15)]);
        assert!(sink.infos().iter().any(|m| m == "Goals unavailable."));
        assert_eq!(
            fake.calls(),
            vec![
                "Init",
                "Add Lemma a : True. @1",
                "Goal",
                "Add breakgoals. @2",
                "Goal",
                "Edit_at @2",
                "Goal",
            ]
        );
    }

    #[test]
    fn test_undo_interrupts_query_in_flight() {
        let (session, fake, _sink) = session();
        let text = TextSnapshot::from(SCRIPT);
        session.advance(&text).unwrap();
        session.wait_idle(IDLE).unwrap();

        let hold = fake.hold_next_query();
        let ticket = session.query(QueryKind::Raw, "hold").unwrap();
        hold.wait_started();

        thread::scope(|scope| {
            let undo = scope.spawn(|| session.undo(1));
            let deadline = Instant::now() + Duration::from_secs(5);
            while fake.control.interrupts() == 0 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            let signalled = fake.control.interrupts();
            hold.release();
            assert_eq!(signalled, 1);
            assert_eq!(undo.join().unwrap().unwrap(), 1);
        });

        assert!(ticket.wait().is_ok());
        assert!(session.transport().commits().unwrap().is_empty());
    }

    #[test]
    fn test_undo_rewinds_and_clamps() {
        let (session, fake, _sink) = session();
        let text = TextSnapshot::from(SCRIPT);
        assert_eq!(session.jump_to(&text, Position::new(2, 8)).unwrap(), Movement::Advanced(3));
        session.wait_idle(IDLE).unwrap();

        assert_eq!(session.undo(0).unwrap(), 0);
        assert_eq!(session.undo(2).unwrap(), 2);
        assert_eq!(commit_ends(&session), vec![Position::new(0, 15)]);
        assert!(fake.calls().iter().any(|c| c == "Edit_at @2"));

        assert_eq!(session.undo(10).unwrap(), 1);
        assert!(session.transport().commits().unwrap().is_empty());
        assert_eq!(session.undo(1).unwrap(), 0);
        assert_eq!(session.wait_idle(IDLE).unwrap(), SessionState::Ready);
    }

    #[test]
    fn test_jump_backward_rewinds_commits_past_target() {
        let (session, _fake, _sink) = session();
        let text = TextSnapshot::from(SCRIPT);
        session.jump_to(&text, Position::new(9, 0)).unwrap();
        session.wait_idle(IDLE).unwrap();
        assert_eq!(session.transport().commits().unwrap().len(), 4);

        assert_eq!(session.jump_to(&text, Position::new(1, 0)).unwrap(), Movement::Rewound(3));
        assert_eq!(commit_ends(&session), vec![Position::new(0, 15)]);
        assert_eq!(session.jump_to(&text, Position::new(0, 15)).unwrap(), Movement::Stayed);
    }

    #[test]
    fn test_jump_forward_stops_before_target() {
        let (session, _fake, _sink) = session();
        let text = TextSnapshot::from(SCRIPT);
        // inside "exact I." on line 2
        assert_eq!(session.jump_to(&text, Position::new(2, 3)).unwrap(), Movement::Advanced(2));
        session.wait_idle(IDLE).unwrap();
        assert_eq!(session.committed_frontier().unwrap(), Position::new(1, 6));
    }

    #[test]
    fn test_on_edit_rewinds_touched_commits() {
        let (session, _fake, _sink) = session();
        let text = TextSnapshot::from(SCRIPT);
        session.jump_to(&text, Position::new(2, 8)).unwrap();
        session.wait_idle(IDLE).unwrap();

        // editing right after the dot of "Proof." touches that unit
        assert_eq!(session.on_edit(Position::new(1, 6)).unwrap(), 2);
        assert_eq!(commit_ends(&session), vec![Position::new(0, 15)]);
        assert_eq!(session.on_edit(Position::new(3, 0)).unwrap(), 0);
    }

    #[test]
    fn test_cancel_only_when_pending() {
        let (session, fake, _sink) = session();
        assert!(!session.cancel().unwrap());
        assert_eq!(fake.control.interrupts(), 0);

        let hold = fake.hold_next_query();
        let ticket = session.query(QueryKind::Raw, "hold").unwrap();
        hold.wait_started();
        assert!(session.cancel().unwrap());
        assert_eq!(fake.control.interrupts(), 1);
        hold.release();
        assert!(ticket.wait().is_ok());
    }

    #[test]
    fn test_query_status_and_goals() {
        let (session, _fake, sink) = session();
        assert_eq!(
            session.query_sync(QueryKind::Check, "nat").unwrap(),
            "answer: Check nat."
        );
        assert_eq!(sink.infos(), vec!["answer: Check nat."]);
        assert_eq!(session.status().unwrap().path, vec!["Top".to_string()]);
        let goals = session.goals().unwrap().unwrap();
        assert_eq!(goals.focused[0].conclusion, "True");
    }

    #[test]
    fn test_located_dialect_with_multibyte_text() {
        let (session, fake, sink) = session_with(FakeOptions {
            version: CoqVersion::new(8, 16, 0),
            ..FakeOptions::default()
        });
        let text = TextSnapshot::from("Lemma α : True.\nCheck (α, bad).\n");
        session.jump_to(&text, Position::new(2, 0)).unwrap();
        session.wait_idle(IDLE).unwrap();

        assert_eq!(commit_ends(&session), vec![Position::new(0, 15)]);
        assert!(fake.calls().iter().any(|c| c == "Add Lemma α : True. @1"));
        // "Check (α, " is 11 bytes and 10 characters
        assert_eq!(
            sink.errors()[0].location,
            Some((Position::new(1, 10), Position::new(1, 13)))
        );
    }

    #[test]
    fn test_snapshot_serializes() {
        let (session, _fake, _sink) = session();
        let text = TextSnapshot::from(SCRIPT);
        session.advance(&text).unwrap();
        session.wait_idle(IDLE).unwrap();
        let snapshot = session.snapshot().unwrap();
        assert_eq!(snapshot.root, Some(StateId(1)));
        assert_eq!(snapshot.verifier_version, "8.8.2");
        let json = snapshot.to_json().unwrap();
        assert!(json.contains("\"committed_frontier\""));
        assert!(json.contains("\"ready\""));
    }

    #[test]
    fn test_stop_ends_session() {
        let (session, _fake, _sink) = session();
        session.stop().unwrap();
        assert_eq!(session.state().unwrap(), SessionState::Stopped);
        let text = TextSnapshot::from(SCRIPT);
        assert!(matches!(
            session.advance(&text),
            Err(Error::ProcessExited { .. })
        ));
    }

    #[test]
    #[ignore = "requires a real coqidetop (COQTOP_BIN)"]
    fn test_real_verifier_round_trip() {
        let config = CoqtopConfig::from_env().unwrap();
        let sink = Arc::new(RecordingSink::new());
        let session = ProofSession::spawn(&config, Arc::clone(&sink) as Arc<dyn SessionSink>).unwrap();
        let text = TextSnapshot::from("Lemma a : True.\nProof.\nexact I.\nQed.\n");
        session.jump_to(&text, Position::new(4, 0)).unwrap();
        assert_eq!(session.wait_idle(Some(Duration::from_secs(60))).unwrap(), SessionState::Ready);
        assert_eq!(session.transport().commits().unwrap().len(), 4);
        assert!(sink.errors().is_empty());
        assert_eq!(session.undo(1).unwrap(), 1);
        session.stop().unwrap();
    }
}
