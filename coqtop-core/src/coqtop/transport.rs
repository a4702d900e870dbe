//! Verifier subprocess transport.
//!
//! Requests go through a bounded FIFO channel to a dispatcher thread, which
//! sends them one at a time: encode against the current tip, write, wait for
//! the reply, route it, then take the next. A reader thread turns the
//! verifier's output into replies. Session state (edit history, pending
//! entries, lifecycle) lives behind one mutex; a condvar signals every change
//! so callers can wait for the session to go idle.

use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStderr, Command, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::config::CoqtopConfig;
use super::reader::{route_feedback, spawn_reader_thread, ReaderEvent};
use super::types::{Commit, EditStack, PendingEntry, SessionState};
use crate::error::{Error, Result};
use crate::position::{Position, WirePosition};
use crate::protocol::{
    CommandKind, EncodeContext, ErrorInfo, ProtocolDialect, Reply, Response, StateId,
    WireMessage,
};
use crate::session::sink::SessionSink;

/// Out-of-band control over the verifier process.
pub trait ProcessControl: Send + Sync {
    /// Ask the verifier to abandon its current computation.
    fn interrupt(&self) -> Result<()>;

    /// Terminate the verifier.
    fn kill(&self) -> Result<()>;

    /// OS process id, if there is a process.
    fn id(&self) -> Option<u32> {
        None
    }
}

/// [`ProcessControl`] for a spawned child process.
#[derive(Debug)]
pub struct ChildControl {
    pid: u32,
    child: Mutex<Option<Child>>,
}

impl ChildControl {
    pub fn new(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: Mutex::new(Some(child)),
        }
    }
}

impl ProcessControl for ChildControl {
    fn interrupt(&self) -> Result<()> {
        send_interrupt(self.pid)
    }

    fn kill(&self) -> Result<()> {
        if let Some(mut child) = self.child.lock()?.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        Ok(())
    }

    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }
}

#[cfg(unix)]
fn send_interrupt(pid: u32) -> Result<()> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGINT) };
    if rc != 0 {
        return Err(Error::subprocess(
            &format!("sending SIGINT to pid {pid}"),
            std::io::Error::last_os_error(),
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_interrupt(pid: u32) -> Result<()> {
    warn!(pid, "interrupt requested, but signals are unsupported on this platform");
    Ok(())
}

/// A request as the caller describes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub kind: CommandKind,
    /// Sentence text for commits and queries.
    pub text: String,
    pub start: Position,
    pub end: Position,
    /// `start` in wire (byte-column) form.
    pub origin: WirePosition,
}

impl Submission {
    /// A request with no text attached.
    pub fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            text: String::new(),
            start: Position::ORIGIN,
            end: Position::ORIGIN,
            origin: WirePosition::default(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Attach the script span the request covers.
    pub fn with_span(mut self, start: Position, end: Position, origin: WirePosition) -> Self {
        self.start = start;
        self.end = end;
        self.origin = origin;
        self
    }
}

/// Handle on the eventual reply to one submission.
///
/// Dropping a ticket does not cancel the request.
#[derive(Debug)]
pub struct Ticket {
    seq: u64,
    reply: Receiver<Result<Reply>>,
}

impl Ticket {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Block until the request is answered, cancelled, or the session ends.
    pub fn wait(self) -> Result<Reply> {
        self.reply
            .recv()
            .map_err(|_| Error::process_exited("session ended before the reply arrived"))?
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Reply>> {
        self.reply.recv_timeout(timeout).ok()
    }
}

#[derive(Debug)]
struct Request {
    seq: u64,
    epoch: u64,
    kind: CommandKind,
    text: String,
    start: Position,
    end: Position,
    origin: WirePosition,
    reply_to: Sender<Result<Reply>>,
}

#[derive(Debug)]
struct SessionCore {
    state: SessionState,
    edits: EditStack,
    pending: VecDeque<PendingEntry>,
    epoch: u64,
    next_seq: u64,
    in_flight: Option<(u64, CommandKind)>,
}

impl SessionCore {
    fn new() -> Self {
        Self {
            state: SessionState::Starting,
            edits: EditStack::new(),
            pending: VecDeque::new(),
            epoch: 0,
            next_seq: 0,
            in_flight: None,
        }
    }

    fn remove_pending(&mut self, seq: u64) {
        self.pending.retain(|entry| entry.seq != seq);
    }

    /// Cancel everything not yet written; the in-flight entry stays.
    fn drain(&mut self) -> usize {
        self.epoch += 1;
        let keep = self.in_flight.map(|(seq, _)| seq);
        let before = self.pending.len();
        self.pending.retain(|entry| Some(entry.seq) == keep);
        before - self.pending.len()
    }

    fn settle(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }
        self.state = match self.in_flight {
            Some((_, kind)) => SessionState::AwaitingAck(kind),
            None if self.edits.root().is_some() => SessionState::Ready,
            None => SessionState::Starting,
        };
    }

    fn is_idle(&self) -> bool {
        match self.state {
            SessionState::Stopped => true,
            SessionState::AwaitingAck(_) => false,
            SessionState::Starting | SessionState::Ready => self.pending.is_empty(),
        }
    }

    fn running_frontier(&self) -> Option<Position> {
        self.pending
            .iter()
            .rev()
            .find(|entry| entry.kind.is_commit())
            .map(|entry| entry.end)
    }

    fn stop(&mut self) {
        self.state = SessionState::Stopped;
        self.pending.clear();
        self.in_flight = None;
        self.epoch += 1;
    }
}

struct Shared {
    core: Mutex<SessionCore>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, SessionCore>> {
        Ok(self.core.lock()?)
    }
}

/// Handle to a running verifier session.
pub struct Transport {
    shared: Arc<Shared>,
    requests: Sender<Request>,
    control: Arc<dyn ProcessControl>,
    dialect: ProtocolDialect,
}

impl Transport {
    /// Spawn the verifier described by `config` and complete the handshake.
    pub fn spawn(config: &CoqtopConfig, sink: Arc<dyn SessionSink>) -> Result<Self> {
        let coqtop = config.resolve_binary()?;
        let dialect = ProtocolDialect::detect(&coqtop)?;
        let binary = dialect.launch_binary(&coqtop);
        let args = dialect.launch_args(&config.include_paths, &config.extra_args);

        info!(
            binary = %binary.display(),
            version = %dialect.version,
            "starting verifier"
        );

        let mut cmd = Command::new(&binary);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref dir) = config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::subprocess(&format!("spawning {}", binary.display()), e))?;

        let stdin = child.stdin.take().ok_or_else(|| {
            Error::SubprocessComm("Failed to get stdin handle for coqtop".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            Error::SubprocessComm("Failed to get stdout handle for coqtop".to_string())
        })?;
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_thread(stderr, Arc::clone(&sink));
        }

        let control = Arc::new(ChildControl::new(child));
        let transport = Self::start(stdout, stdin, control, dialect, config, sink);
        if let Err(e) = transport.init() {
            let _ = transport.kill();
            return Err(e);
        }
        Ok(transport)
    }

    /// Start the worker threads over an existing byte stream.
    ///
    /// No handshake is performed; call [`init`](Self::init) first.
    pub fn start<R, W>(
        source: R,
        sink_to_verifier: W,
        control: Arc<dyn ProcessControl>,
        dialect: ProtocolDialect,
        config: &CoqtopConfig,
        sink: Arc<dyn SessionSink>,
    ) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let (requests, queue) = bounded(config.queue_capacity.max(1));
        let (event_tx, events) = unbounded();
        let shared = Arc::new(Shared {
            core: Mutex::new(SessionCore::new()),
            changed: Condvar::new(),
        });

        spawn_reader_thread(source, event_tx, config.max_decode_retries, config.verbose);

        let dispatcher = Dispatcher {
            shared: Arc::clone(&shared),
            queue,
            events,
            writer: sink_to_verifier,
            dialect: dialect.clone(),
            sink,
            control: Arc::clone(&control),
            verbose: config.verbose,
            split_reply_grace: config.split_reply_grace,
        };
        thread::spawn(move || dispatcher.run());

        Self {
            shared,
            requests,
            control,
            dialect,
        }
    }

    /// Perform the `Init` handshake and return the root state.
    pub fn init(&self) -> Result<StateId> {
        let reply = self.submit(Submission::new(CommandKind::Init))?.wait()?;
        match reply.response {
            Response::Accepted(root) => Ok(root),
            Response::Rejected(info) => Err(Error::Rejected(info)),
            other => Err(Error::decode(format!("unexpected handshake answer: {other:?}"))),
        }
    }

    /// Queue a request. Blocks only while the queue is full.
    pub fn submit(&self, submission: Submission) -> Result<Ticket> {
        self.enqueue(None, submission)
    }

    /// Queue a request that belongs to `epoch`, as read by
    /// [`frontier_epoch`](Self::frontier_epoch).
    ///
    /// Fails with [`Error::Cancelled`] once a rejection or interrupt has
    /// dropped that epoch's batch, so a batch never continues past a unit
    /// the verifier refused.
    pub fn submit_in(&self, epoch: u64, submission: Submission) -> Result<Ticket> {
        self.enqueue(Some(epoch), submission)
    }

    fn enqueue(&self, epoch: Option<u64>, submission: Submission) -> Result<Ticket> {
        let (reply_to, reply) = bounded(1);
        let request = {
            let mut core = self.shared.lock()?;
            if core.state == SessionState::Stopped {
                return Err(Error::process_exited("session is stopped"));
            }
            if epoch.is_some_and(|epoch| epoch != core.epoch) {
                return Err(Error::Cancelled);
            }
            let seq = core.next_seq;
            core.next_seq += 1;
            core.pending.push_back(PendingEntry {
                seq,
                kind: submission.kind,
                start: submission.start,
                end: submission.end,
                text: submission.text.clone(),
            });
            Request {
                seq,
                epoch: core.epoch,
                kind: submission.kind,
                text: submission.text,
                start: submission.start,
                end: submission.end,
                origin: submission.origin,
                reply_to,
            }
        };
        let seq = request.seq;
        if self.requests.send(request).is_err() {
            let mut core = self.shared.lock()?;
            core.remove_pending(seq);
            return Err(Error::process_exited("dispatcher has stopped"));
        }
        Ok(Ticket { seq, reply })
    }

    /// Queue a request and wait for its reply.
    pub fn request(&self, submission: Submission) -> Result<Reply> {
        self.submit(submission)?.wait()
    }

    /// Queue a rewind of the last `steps` commits.
    pub fn rewind(&self, steps: usize) -> Result<Ticket> {
        self.submit(Submission::new(CommandKind::Rewind { steps }))
    }

    /// Drop queued requests and interrupt the in-flight one if it is safe
    /// to do so (goals, status and queries; never commits or rewinds).
    pub fn interrupt(&self) -> Result<()> {
        self.drain_and_signal(CommandKind::is_interruptible)
    }

    /// Like [`interrupt`](Self::interrupt), but a goals refresh that follows
    /// a commit is left to finish: a failed refresh rewinds its commit, which
    /// must not race a rewind the caller is about to queue.
    pub fn interrupt_for_rewind(&self) -> Result<()> {
        self.drain_and_signal(|kind| {
            kind.is_interruptible() && *kind != CommandKind::Goals { after_commit: true }
        })
    }

    fn drain_and_signal(&self, signal: impl Fn(&CommandKind) -> bool) -> Result<()> {
        let in_flight = {
            let mut core = self.shared.lock()?;
            let dropped = core.drain();
            debug!(dropped, "interrupt: drained queued requests");
            core.in_flight.map(|(_, kind)| kind)
        };
        self.shared.changed.notify_all();
        match in_flight {
            Some(kind) if signal(&kind) => {
                debug!(%kind, "interrupting in-flight request");
                self.control.interrupt()
            }
            _ => Ok(()),
        }
    }

    /// Block until nothing is queued or in flight, or `timeout` passes.
    ///
    /// Returns the state observed last.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> Result<SessionState> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut core = self.shared.lock()?;
        while !core.is_idle() {
            core = match deadline {
                None => self.shared.changed.wait(core)?,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    self.shared.changed.wait_timeout(core, deadline - now)?.0
                }
            };
        }
        Ok(core.state)
    }

    /// Stop the session and terminate the verifier.
    pub fn kill(&self) -> Result<()> {
        {
            let mut core = self.shared.lock()?;
            if core.state != SessionState::Stopped {
                info!("stopping verifier session");
            }
            core.stop();
        }
        self.shared.changed.notify_all();
        self.control.kill()
    }

    pub fn state(&self) -> Result<SessionState> {
        Ok(self.shared.lock()?.state)
    }

    /// Accepted commits, oldest first.
    pub fn commits(&self) -> Result<Vec<Commit>> {
        Ok(self.shared.lock()?.edits.commits().to_vec())
    }

    pub fn root(&self) -> Result<Option<StateId>> {
        Ok(self.shared.lock()?.edits.root())
    }

    /// End of the last accepted commit.
    pub fn committed_frontier(&self) -> Result<Position> {
        Ok(self.shared.lock()?.edits.frontier())
    }

    /// Outstanding requests in submission order.
    pub fn pending(&self) -> Result<Vec<PendingEntry>> {
        Ok(self.shared.lock()?.pending.iter().cloned().collect())
    }

    /// End of the last queued or in-flight commit, if any.
    pub fn running_frontier(&self) -> Result<Option<Position>> {
        Ok(self.shared.lock()?.running_frontier())
    }

    /// Where the next unit starts (the running frontier, else the committed
    /// one) together with the current epoch, read atomically.
    pub fn frontier_epoch(&self) -> Result<(Position, u64)> {
        let core = self.shared.lock()?;
        let frontier = core
            .running_frontier()
            .unwrap_or_else(|| core.edits.frontier());
        Ok((frontier, core.epoch))
    }

    pub fn dialect(&self) -> &ProtocolDialect {
        &self.dialect
    }

    pub fn process_id(&self) -> Option<u32> {
        self.control.id()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let _ = self.kill();
    }
}

fn spawn_stderr_thread(stderr: ChildStderr, sink: Arc<dyn SessionSink>) {
    thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            match line {
                Ok(line) => sink.on_debug(&format!("coqtop stderr: {line}")),
                Err(_) => break,
            }
        }
    });
}

enum Step {
    Dispatch(Request),
    Feedback(Vec<Response>),
    Stray(Reply),
    Fatal(Error),
    Hangup,
}

struct Dispatcher<W> {
    shared: Arc<Shared>,
    queue: Receiver<Request>,
    events: Receiver<ReaderEvent>,
    writer: W,
    dialect: ProtocolDialect,
    sink: Arc<dyn SessionSink>,
    control: Arc<dyn ProcessControl>,
    verbose: bool,
    split_reply_grace: Duration,
}

impl<W: Write> Dispatcher<W> {
    fn run(mut self) {
        loop {
            let step = select! {
                recv(self.queue) -> msg => match msg {
                    Ok(request) => Step::Dispatch(request),
                    Err(_) => Step::Hangup,
                },
                recv(self.events) -> event => match event {
                    Ok(ReaderEvent::Feedback(items)) => Step::Feedback(items),
                    Ok(ReaderEvent::Reply(reply)) => Step::Stray(reply),
                    Ok(ReaderEvent::Failed(e)) => Step::Fatal(e),
                    Err(_) => Step::Fatal(Error::process_exited("reader thread ended")),
                },
            };
            match step {
                Step::Dispatch(request) => {
                    if let Err(e) = self.dispatch(request) {
                        self.abort(e);
                        break;
                    }
                }
                Step::Feedback(items) => route_feedback(self.sink.as_ref(), &items),
                Step::Stray(reply) => {
                    warn!(response = ?reply.response, "reply with nothing in flight");
                    route_feedback(self.sink.as_ref(), &reply.feedback);
                }
                Step::Fatal(e) => {
                    self.abort(e);
                    break;
                }
                Step::Hangup => break,
            }
        }
        debug!("dispatcher exiting");
    }

    /// Send one request and route its reply. Errors are fatal.
    fn dispatch(&mut self, request: Request) -> Result<()> {
        let tip = {
            let mut core = self.shared.lock()?;
            if request.epoch != core.epoch || core.state == SessionState::Stopped {
                core.remove_pending(request.seq);
                drop(core);
                self.shared.changed.notify_all();
                debug!(seq = request.seq, kind = %request.kind, "discarding cancelled request");
                let _ = request.reply_to.send(Err(Error::Cancelled));
                return Ok(());
            }

            if let CommandKind::Rewind { steps } = request.kind {
                let available = core.edits.len();
                if core.edits.pop(steps).is_err() {
                    drop(core);
                    let _ = request
                        .reply_to
                        .send(Err(Error::rewind_inconsistent(steps, available)));
                    return Err(Error::rewind_inconsistent(steps, available));
                }
            }

            let tip = match (request.kind, core.edits.tip()) {
                (_, Some(tip)) => tip,
                (CommandKind::Init, None) => StateId(0),
                (kind, None) => {
                    core.remove_pending(request.seq);
                    drop(core);
                    self.shared.changed.notify_all();
                    let _ = request.reply_to.send(Err(Error::NotReady(format!(
                        "{kind} before the handshake completed"
                    ))));
                    return Ok(());
                }
            };
            core.in_flight = Some((request.seq, request.kind));
            core.settle();
            tip
        };
        self.shared.changed.notify_all();

        let ctx = EncodeContext {
            dialect: &self.dialect,
            tip,
            origin: request.origin,
        };
        let wire = request.kind.encode(&request.text, &ctx);

        let outcome = self
            .write(&wire)
            .and_then(|()| self.await_reply(request.kind))
            .and_then(|reply| self.route(&request, reply));

        match outcome {
            Ok(reply) => {
                self.finish(request.seq)?;
                let _ = request.reply_to.send(Ok(reply));
                Ok(())
            }
            Err(e) => {
                let _ = request
                    .reply_to
                    .send(Err(Error::process_exited(format!("session aborted: {e}"))));
                Err(e)
            }
        }
    }

    fn finish(&self, seq: u64) -> Result<()> {
        {
            let mut core = self.shared.lock()?;
            core.remove_pending(seq);
            core.in_flight = None;
            core.settle();
        }
        self.shared.changed.notify_all();
        Ok(())
    }

    fn write(&mut self, wire: &WireMessage) -> Result<()> {
        if self.verbose {
            debug!("coqtop request: {}", wire);
        }
        self.writer
            .write_all(wire.as_bytes())
            .map_err(|e| Error::subprocess("writing to coqtop", e))?;
        self.writer
            .flush()
            .map_err(|e| Error::subprocess("flushing coqtop stdin", e))
    }

    /// Wait for the reply to the request just written.
    ///
    /// Feedback that arrives first is folded into the reply and forwarded to
    /// the sink with it. Query output is not forwarded here; the router
    /// reports it as one block.
    fn await_reply(&mut self, kind: CommandKind) -> Result<Reply> {
        let mut collected = Vec::new();
        let mut reply = loop {
            match self.events.recv() {
                Ok(ReaderEvent::Feedback(items)) => collected.extend(items),
                Ok(ReaderEvent::Reply(reply)) => break reply,
                Ok(ReaderEvent::Failed(e)) => return Err(e),
                Err(_) => return Err(Error::process_exited("reader thread ended")),
            }
        };
        collected.append(&mut reply.feedback);
        reply.feedback = collected;
        if kind.is_commit() {
            reply = self.complete_commit_reply(reply)?;
        }

        let rejected = match reply.response {
            Response::Rejected(ref info) => Some(info.message.as_str()),
            _ => None,
        };
        let forward: Vec<Response> = reply
            .feedback
            .iter()
            .filter(|item| match item {
                Response::InfoMessage(text) => {
                    !matches!(kind, CommandKind::Query(_)) && Some(text.as_str()) != rejected
                }
                _ => true,
            })
            .cloned()
            .collect();
        route_feedback(self.sink.as_ref(), &forward);
        Ok(reply)
    }

    /// A commit answered by a value without a state id may still have its
    /// authoritative value on the way in a later write. Wait for it, up to
    /// the grace period, folding in whatever arrives meanwhile.
    fn complete_commit_reply(&mut self, mut reply: Reply) -> Result<Reply> {
        let deadline = Instant::now() + self.split_reply_grace;
        while matches!(reply.response, Response::Acknowledged(_)) {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            match self.events.recv_timeout(left) {
                Ok(ReaderEvent::Feedback(items)) => reply.feedback.extend(items),
                Ok(ReaderEvent::Reply(next)) => {
                    debug!(response = ?next.response, "commit answer completed by a later value");
                    reply.feedback.extend(next.feedback);
                    reply.response = next.response;
                }
                Ok(ReaderEvent::Failed(e)) => return Err(e),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::process_exited("reader thread ended"))
                }
            }
        }
        Ok(reply)
    }

    /// Apply a reply to the session. Errors are fatal.
    fn route(&mut self, request: &Request, mut reply: Reply) -> Result<Reply> {
        match (request.kind, &reply.response) {
            (CommandKind::Init, Response::Accepted(root)) => {
                let root = *root;
                let mut core = self.shared.lock()?;
                core.edits.set_root(root);
                info!(%root, "verifier ready");
            }
            (CommandKind::Init, other) => {
                return Err(Error::Aborted(format!("handshake refused: {other:?}")));
            }

            (CommandKind::Commit(_), Response::Accepted(state_id)) => {
                let commit = Commit {
                    state_id: *state_id,
                    start: request.start,
                    end: request.end,
                };
                let mut core = self.shared.lock()?;
                core.remove_pending(request.seq);
                core.edits.push(commit);
            }
            (CommandKind::Commit(_), Response::Rejected(info)) => {
                let located = info.clone().locate(request.start, &request.text);
                let dropped = {
                    let mut core = self.shared.lock()?;
                    core.remove_pending(request.seq);
                    core.drain()
                };
                debug!(dropped, "commit rejected: dropped the rest of the batch");
                self.sink.on_error(&located);
                reply.response = Response::Rejected(located);
            }
            (CommandKind::Commit(_), other) => {
                return Err(Error::Aborted(format!(
                    "commit answered without a state id: {other:?}"
                )));
            }

            (CommandKind::Goals { .. }, Response::GoalsReport(goals)) => {
                self.sink.on_goals(goals.as_ref());
            }
            (CommandKind::Goals { after_commit: true }, Response::Rejected(info)) => {
                let message = info.message.clone();
                {
                    let mut core = self.shared.lock()?;
                    core.pending.retain(|entry| entry.seq == request.seq);
                    core.epoch += 1;
                }
                self.sink.on_info(&message);
                self.resync_last_commit()?;
            }
            (CommandKind::Goals { .. } | CommandKind::Status, Response::Rejected(info)) => {
                self.sink.on_info(&info.message);
            }

            (CommandKind::Query(_), Response::Rejected(info)) => {
                self.sink.on_info(&info.message);
            }
            (CommandKind::Query(_), _) => {
                let text = reply.output_text();
                if !text.is_empty() {
                    self.sink.on_info(&text);
                }
            }

            (CommandKind::Rewind { .. }, Response::Rejected(info)) => {
                return Err(Error::Aborted(format!("rewind refused: {}", info.message)));
            }

            (kind, response) => {
                debug!(%kind, ?response, "reply needs no routing");
            }
        }
        Ok(reply)
    }

    /// Undo the commit whose goals could not be fetched, then refresh goals.
    fn resync_last_commit(&mut self) -> Result<()> {
        let tip = {
            let mut core = self.shared.lock()?;
            core.edits.pop(1)?;
            core.edits
                .tip()
                .ok_or_else(|| Error::Aborted("edit history has no root".to_string()))?
        };
        let dialect = self.dialect.clone();
        let ctx = EncodeContext {
            dialect: &dialect,
            tip,
            origin: WirePosition::default(),
        };

        let rewind = CommandKind::Rewind { steps: 1 };
        self.write(&rewind.encode("", &ctx))?;
        if let Response::Rejected(info) = self.await_reply(rewind)?.response {
            return Err(Error::Aborted(format!("rewind refused: {}", info.message)));
        }

        let goals = CommandKind::Goals {
            after_commit: false,
        };
        self.write(&goals.encode("", &ctx))?;
        match self.await_reply(goals)?.response {
            Response::GoalsReport(goals) => self.sink.on_goals(goals.as_ref()),
            Response::Rejected(info) => self.sink.on_info(&info.message),
            other => debug!(?other, "unexpected goals answer after resync"),
        }
        Ok(())
    }

    /// Stop the session after a fatal error, reporting it once.
    fn abort(&self, err: Error) {
        let already_stopped = match self.shared.core.lock() {
            Ok(mut core) => {
                let stopped = core.state == SessionState::Stopped;
                core.stop();
                stopped
            }
            Err(_) => false,
        };
        self.shared.changed.notify_all();
        if already_stopped {
            debug!(error = %err, "dispatcher stopping after kill");
            return;
        }
        error!(error = %err, "verifier session aborted");
        self.sink.on_error(&ErrorInfo::new(err.to_string()));
        if let Err(e) = self.control.kill() {
            warn!(error = %e, "failed to kill verifier");
        }
    }
}
