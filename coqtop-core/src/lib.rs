//! # coqtop-core
//!
//! An interactive proof session engine for the coqtop / coqidetop XML
//! protocol.
//!
//! ## Core Components
//!
//! - **Scanner**: splits a proof script into sentences, bullets and comments
//! - **Protocol**: the tagged-value model, its XML codec and per-version dialects
//! - **Coqtop**: the verifier subprocess, request queue and reply routing
//! - **Session**: advance / undo / jump / query on top of the transport
//!
//! ## Example
//!
//! ```rust,ignore
//! use coqtop_core::{CoqtopConfig, Position, ProofSession, TextSnapshot, TracingSink};
//! use std::sync::Arc;
//!
//! let session = ProofSession::spawn(&CoqtopConfig::from_env()?, Arc::new(TracingSink))?;
//! let script = TextSnapshot::from("Lemma a : True.\nProof.\nexact I.\nQed.\n");
//!
//! session.jump_to(&script, Position::new(4, 0))?;
//! session.wait_idle(None)?;
//! println!("committed up to {}", session.committed_frontier()?);
//! ```

pub mod coqtop;
pub mod error;
pub mod position;
pub mod protocol;
pub mod scanner;
pub mod session;

// Re-exports for convenience
pub use coqtop::{
    Commit, CoqtopConfig, EditStack, PendingEntry, ProcessControl, SessionState, Submission,
    Ticket, Transport,
};
pub use error::{Error, Result};
pub use position::{Position, TextSnapshot, TextSource, WirePosition};
pub use protocol::{
    CommandKind, CoqVersion, ErrorInfo, Goal, Goals, ProtocolDialect, QueryKind, Reply, Response,
    StateId, Status, Value,
};
pub use scanner::{scan_all, scan_next, Unit, UnitKind};
pub use session::{
    Movement, NullSink, ProofSession, RecordingSink, SessionSink, SessionSnapshot, TracingSink,
};
