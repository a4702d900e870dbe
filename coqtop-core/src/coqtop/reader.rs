//! Incremental assembly of verifier output into replies.
//!
//! The verifier's stdout is a byte stream with no framing: a reply is
//! complete when everything buffered so far parses as a sequence of closed
//! elements. Until then, bytes accumulate and each new chunk triggers another
//! parse attempt.

use crossbeam_channel::Sender;
use std::io::{ErrorKind, Read};
use std::thread;

use crate::error::{Error, Result};
use crate::protocol::{
    decode_feedback, decode_response, parse_fragment, predecode_entities, Reply, Response,
    XmlNode,
};
use crate::session::sink::SessionSink;

/// Bytes requested from the pipe per read.
pub const READ_CHUNK: usize = 0x4000;

/// Something the assembler completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    /// Feedback that arrived outside any reply.
    Feedback(Vec<Response>),
    /// A reply carrying a `value` element.
    Reply(Reply),
}

/// Buffers raw output until it parses.
#[derive(Debug)]
pub struct ReplyAssembler {
    buffer: Vec<u8>,
    failed_attempts: usize,
    max_retries: usize,
}

impl ReplyAssembler {
    pub fn new(max_retries: usize) -> Self {
        Self {
            buffer: Vec::new(),
            failed_attempts: 0,
            max_retries,
        }
    }

    /// Bytes buffered and not yet assembled.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Add a chunk and return whatever is now complete.
    ///
    /// Fails once `max_retries` consecutive chunks have left the buffer
    /// unparseable; the buffer is discarded at that point.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Assembled>> {
        self.buffer.extend_from_slice(chunk);

        let text = match std::str::from_utf8(&self.buffer) {
            Ok(text) => text,
            // a multi-byte character split across reads
            Err(e) if e.error_len().is_none() => {
                return self.retry(format!("partial UTF-8 sequence at byte {}", e.valid_up_to()))
            }
            Err(e) => {
                self.buffer.clear();
                return Err(Error::decode(format!("verifier output is not UTF-8: {e}")));
            }
        };

        let trimmed = text.trim_end();
        if !trimmed.is_empty() && !trimmed.ends_with('>') {
            return self.retry("output ends mid-element".to_string());
        }

        match parse_fragment(&predecode_entities(text)) {
            Ok(nodes) => {
                self.buffer.clear();
                self.failed_attempts = 0;
                assemble(&nodes).map(|done| done.into_iter().collect())
            }
            Err(e) => self.retry(e.to_string()),
        }
    }

    fn retry(&mut self, reason: String) -> Result<Vec<Assembled>> {
        self.failed_attempts += 1;
        if self.failed_attempts > self.max_retries {
            let buffered = self.buffer.len();
            self.buffer.clear();
            self.failed_attempts = 0;
            return Err(Error::decode(format!(
                "gave up on {buffered} buffered byte(s) after {} attempts: {reason}",
                self.max_retries
            )));
        }
        Ok(Vec::new())
    }
}

fn assemble(nodes: &[XmlNode]) -> Result<Option<Assembled>> {
    if nodes.iter().any(|n| n.tag == "value") {
        return decode_response(nodes).map(|reply| Some(Assembled::Reply(reply)));
    }
    let feedback: Vec<Response> = nodes
        .iter()
        .filter_map(|node| match node.tag.as_str() {
            "feedback" => decode_feedback(node),
            "message" => Some(Response::InfoMessage(node.inner_text())),
            _ => None,
        })
        .collect();
    Ok((!feedback.is_empty()).then_some(Assembled::Feedback(feedback)))
}

/// What the reader thread tells the dispatcher.
#[derive(Debug)]
pub enum ReaderEvent {
    /// Feedback outside any reply.
    Feedback(Vec<Response>),
    Reply(Reply),
    /// The stream can no longer be trusted or has ended.
    Failed(Error),
}

/// Forward feedback items to the sink.
pub fn route_feedback(sink: &dyn SessionSink, feedback: &[Response]) {
    for item in feedback {
        match item {
            Response::InfoMessage(text) => sink.on_info(text),
            Response::WorkerStatus(text) => sink.on_debug(text),
            other => tracing::debug!(?other, "unexpected feedback item"),
        }
    }
}

/// Continuously read verifier output and publish what completes.
///
/// The thread exits on EOF, on a read error, or when the dispatcher hangs
/// up.
pub fn spawn_reader_thread<R>(
    mut source: R,
    events: Sender<ReaderEvent>,
    max_retries: usize,
    verbose: bool,
) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut assembler = ReplyAssembler::new(max_retries);
        let mut buffer = vec![0u8; READ_CHUNK];
        loop {
            let n = match source.read(&mut buffer) {
                Ok(0) => {
                    let _ = events.send(ReaderEvent::Failed(Error::process_exited(
                        "verifier closed its output",
                    )));
                    break;
                }
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    let _ = events.send(ReaderEvent::Failed(Error::subprocess(
                        "reading verifier output",
                        e,
                    )));
                    break;
                }
            };

            let chunk = buffer.get(..n).unwrap_or(&[]);
            if verbose {
                tracing::debug!("coqtop output: {}", String::from_utf8_lossy(chunk));
            }

            match assembler.feed(chunk) {
                Ok(done) => {
                    for item in done {
                        let event = match item {
                            Assembled::Feedback(feedback) => ReaderEvent::Feedback(feedback),
                            Assembled::Reply(reply) => ReaderEvent::Reply(reply),
                        };
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = events.send(ReaderEvent::Failed(e));
                    break;
                }
            }
        }
    })
}
