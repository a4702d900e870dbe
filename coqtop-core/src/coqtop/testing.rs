//! In-process stand-in for the verifier, for tests.
//!
//! The fake speaks just enough of the protocol to exercise the transport:
//! `Init` answers state 1, each `Add` gets the next id (or fails when the
//! sentence contains `bad`), `Goal` fails when the last commit contains
//! `breakgoals`, `Query die.` closes the output, and `Edit_at` trims the
//! fake's own history. An `Add` whose sentence contains `split` is answered
//! with a bare value first and the state id in a second write.

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use quick_xml::escape::escape;
use std::io::{self, Read, Write};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::config::CoqtopConfig;
use super::transport::{ProcessControl, Transport};
use crate::error::Result;
use crate::protocol::{
    decode_value, encode_value, parse_fragment, CoqVersion, Goal, Goals, ProtocolDialect,
    StateId, Status, Value,
};
use crate::session::sink::SessionSink;

/// Write half of an in-memory pipe.
pub(crate) struct PipeWriter(Sender<Vec<u8>>);

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read half of an in-memory pipe; reads 0 bytes once the writer is gone.
pub(crate) struct PipeReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

pub(crate) fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = unbounded();
    (
        PipeWriter(tx),
        PipeReader {
            rx,
            pending: Vec::new(),
        },
    )
}

/// Counts interrupts; kill stops the fake verifier.
pub(crate) struct FakeControl {
    interrupts: AtomicUsize,
    killed: AtomicBool,
    kill_tx: Sender<()>,
}

impl FakeControl {
    pub(crate) fn interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub(crate) fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

impl ProcessControl for FakeControl {
    fn interrupt(&self) -> Result<()> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn kill(&self) -> Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        let _ = self.kill_tx.send(());
        Ok(())
    }
}

/// Keeps the fake from answering a call until released.
pub(crate) struct Hold {
    started: Receiver<()>,
    release: Sender<()>,
}

impl Hold {
    /// Block until the held call has reached the fake.
    pub(crate) fn wait_started(&self) {
        let _ = self.started.recv_timeout(Duration::from_secs(5));
    }

    pub(crate) fn release(&self) {
        let _ = self.release.send(());
    }
}

struct Gate {
    started: Sender<()>,
    release: Receiver<()>,
}

#[derive(Default)]
struct FakeState {
    calls: Mutex<Vec<String>>,
    query_gate: Mutex<Option<Gate>>,
    add_gate: Mutex<Option<Gate>>,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeOptions {
    pub version: CoqVersion,
    pub queue_capacity: usize,
}

impl Default for FakeOptions {
    fn default() -> Self {
        Self {
            version: CoqVersion::new(8, 8, 2),
            queue_capacity: CoqtopConfig::default().queue_capacity,
        }
    }
}

/// Test-side view of the fake: its control and the calls it has seen.
pub(crate) struct FakeHandle {
    pub control: Arc<FakeControl>,
    state: Arc<FakeState>,
}

impl FakeHandle {
    /// Calls the fake has received, rendered as `Add <text> @<tip>`,
    /// `Edit_at @<id>`, `Query <text>` or the bare call name.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Hold the next `Query hold.` until released.
    pub(crate) fn hold_next_query(&self) -> Hold {
        arm(&self.state.query_gate)
    }

    /// Hold the next `Add` until released.
    pub(crate) fn hold_next_add(&self) -> Hold {
        arm(&self.state.add_gate)
    }
}

/// A transport wired to the fake verifier.
pub(crate) struct FakeSession {
    pub transport: Transport,
    handle: FakeHandle,
}

impl FakeSession {
    pub(crate) fn into_parts(self) -> (Transport, FakeHandle) {
        (self.transport, self.handle)
    }
}

impl Deref for FakeSession {
    type Target = FakeHandle;

    fn deref(&self) -> &FakeHandle {
        &self.handle
    }
}

fn arm(slot: &Mutex<Option<Gate>>) -> Hold {
    let (started_tx, started) = unbounded();
    let (release, release_rx) = unbounded();
    if let Ok(mut slot) = slot.lock() {
        *slot = Some(Gate {
            started: started_tx,
            release: release_rx,
        });
    }
    Hold { started, release }
}

/// Start a transport against a fresh fake verifier. No handshake is done.
pub(crate) fn fake_session(sink: Arc<dyn SessionSink>, options: FakeOptions) -> FakeSession {
    let (to_fake, from_transport) = pipe();
    let (to_transport, from_fake) = pipe();
    let (kill_tx, kill_rx) = unbounded();
    let control = Arc::new(FakeControl {
        interrupts: AtomicUsize::new(0),
        killed: AtomicBool::new(false),
        kill_tx,
    });
    let state = Arc::new(FakeState::default());

    let fake = FakeVerifier {
        state: Arc::clone(&state),
        out: to_transport,
        kill: kill_rx,
        history: Vec::new(),
        next_id: 2,
    };
    thread::spawn(move || fake.run(from_transport.rx));

    let dialect = ProtocolDialect::for_version(options.version).expect("supported version");
    let transport = Transport::start(
        from_fake,
        to_fake,
        Arc::clone(&control) as Arc<dyn ProcessControl>,
        dialect,
        &CoqtopConfig::default().with_queue_capacity(options.queue_capacity),
        sink,
    );
    FakeSession {
        transport,
        handle: FakeHandle { control, state },
    }
}

struct FakeVerifier {
    state: Arc<FakeState>,
    out: PipeWriter,
    kill: Receiver<()>,
    history: Vec<(u64, String)>,
    next_id: u64,
}

impl FakeVerifier {
    fn run(mut self, input: Receiver<Vec<u8>>) {
        let mut buffered = String::new();
        loop {
            select! {
                recv(input) -> chunk => match chunk {
                    Ok(bytes) => buffered.push_str(&String::from_utf8_lossy(&bytes)),
                    Err(_) => return,
                },
                recv(self.kill) -> _ => return,
            }
            while let Some(end) = buffered.find("</call>") {
                let call: String = buffered.drain(..end + "</call>".len()).collect();
                if !self.answer(&call) {
                    return;
                }
            }
        }
    }

    fn record(&self, call: &str) {
        if let Ok(mut calls) = self.state.calls.lock() {
            calls.push(call.to_string());
        }
    }

    /// Wait on an armed gate; false if killed meanwhile.
    fn pass(&self, slot: &Mutex<Option<Gate>>) -> bool {
        let gate = slot.lock().ok().and_then(|mut g| g.take());
        let Some(gate) = gate else { return true };
        let _ = gate.started.send(());
        select! {
            recv(gate.release) -> _ => true,
            recv(self.kill) -> _ => false,
        }
    }

    fn send(&mut self, reply: String) {
        let _ = self.out.write_all(reply.as_bytes());
    }

    fn tip(&self) -> u64 {
        self.history.last().map_or(1, |(id, _)| *id)
    }

    fn answer(&mut self, call: &str) -> bool {
        let nodes = parse_fragment(call).expect("well-formed call");
        let node = &nodes[0];
        let name = node.attr("val").unwrap_or_default().to_string();
        let argument = node
            .elements()
            .next()
            .map(|payload| decode_value(payload).expect("decodable argument"))
            .unwrap_or(Value::Unit);

        match name.as_str() {
            "Init" => {
                self.record(&name);
                self.send(good(&Value::StateId(StateId(1))));
            }
            "Add" => {
                let (text, tip) = add_parts(&argument).expect("Add argument");
                self.record(&format!("Add {text} @{}", tip.0));
                if !self.pass(&self.state.add_gate) {
                    return false;
                }
                if let Some(at) = text.find("bad") {
                    self.send(fail("Syntax error near bad.", tip.0, Some((at, at + 3))));
                } else {
                    let id = self.next_id;
                    self.next_id += 1;
                    let split = text.contains("split");
                    self.history.push((id, text));
                    if split {
                        self.send(good(&Value::Unit));
                        thread::sleep(Duration::from_millis(20));
                    }
                    self.send(good(&Value::pair(
                        Value::StateId(StateId(id)),
                        Value::pair(Value::Inl(Box::new(Value::Unit)), Value::string("")),
                    )));
                }
            }
            "Goal" => {
                self.record(&name);
                let broken = self
                    .history
                    .last()
                    .is_some_and(|(_, text)| text.contains("breakgoals"));
                if broken {
                    self.send(fail("Goals unavailable.", self.tip(), None));
                } else {
                    let goals = Goals {
                        focused: vec![Goal::new("1", "True").with_hypothesis("n : nat")],
                        ..Goals::default()
                    };
                    self.send(good(&Value::some(Value::Goals(goals))));
                }
            }
            "Status" => {
                self.record(&name);
                self.send(good(&Value::Status(Status {
                    path: vec!["Top".to_string()],
                    ..Status::default()
                })));
            }
            "Query" => {
                let text = query_text(&argument).expect("Query argument");
                self.record(&format!("Query {text}"));
                if text == "die." {
                    return false;
                }
                if text == "hold." && !self.pass(&self.state.query_gate) {
                    return false;
                }
                let reply = format!(
                    "{}{}",
                    message_feedback(self.tip(), &format!("answer: {text}")),
                    good(&Value::string(""))
                );
                self.send(reply);
            }
            "Edit_at" => {
                let target = argument.state_id().expect("Edit_at target").0;
                self.record(&format!("Edit_at @{target}"));
                self.history.retain(|(id, _)| *id <= target);
                self.send(good(&Value::Inl(Box::new(Value::Unit))));
            }
            other => {
                self.record(other);
                self.send(fail("unknown call", self.tip(), None));
            }
        }
        true
    }
}

fn add_parts(argument: &Value) -> Option<(String, StateId)> {
    let Value::Pair(first, second) = argument else {
        return None;
    };
    match (first.as_ref(), second.as_ref()) {
        (Value::Pair(text, _), Value::Pair(tip, _)) if text.as_text().is_some() => {
            Some((text.as_text()?.to_string(), tip.state_id()?))
        }
        // located layout wraps the classic argument
        (Value::Pair(classic, _), _) => add_parts(classic),
        _ => None,
    }
}

fn query_text(argument: &Value) -> Option<String> {
    let Value::Pair(_, rest) = argument else {
        return None;
    };
    let Value::Pair(text, _) = rest.as_ref() else {
        return None;
    };
    text.as_text().map(str::to_string)
}

fn good(payload: &Value) -> String {
    format!(r#"<value val="good">{}</value>"#, encode_value(payload))
}

fn fail(message: &str, tip: u64, span: Option<(usize, usize)>) -> String {
    let loc = span
        .map(|(s, e)| format!(r#" loc_s="{s}" loc_e="{e}""#))
        .unwrap_or_default();
    format!(
        r#"<value val="fail"{loc}><state_id val="{tip}"/><richpp><_>{}</_></richpp></value>"#,
        escape(message)
    )
}

fn message_feedback(tip: u64, text: &str) -> String {
    format!(
        concat!(
            r#"<feedback object="state" route="0"><state_id val="{}"/>"#,
            r#"<feedback_content val="message"><message><message_level val="notice"/>"#,
            r#"<option val="none"/><richpp><_>{}</_></richpp></message></feedback_content></feedback>"#
        ),
        tip,
        escape(text)
    )
}
