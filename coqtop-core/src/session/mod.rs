//! Editor-facing session layer: the proof session and its output sinks.

pub mod orchestrator;
pub mod sink;

pub use orchestrator::{Movement, ProofSession, SessionSnapshot};
pub use sink::{NullSink, RecordingSink, SessionSink, SinkEvent, TracingSink};
