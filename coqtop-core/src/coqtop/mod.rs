//! The verifier subprocess: launch configuration, output assembly, and the
//! request transport.
//!
//! ```rust,ignore
//! use coqtop_core::coqtop::{CoqtopConfig, Submission, Transport};
//! use coqtop_core::protocol::CommandKind;
//! use coqtop_core::session::TracingSink;
//! use std::sync::Arc;
//!
//! let transport = Transport::spawn(&CoqtopConfig::from_env()?, Arc::new(TracingSink))?;
//! let status = transport.request(Submission::new(CommandKind::Status))?;
//! ```

pub mod config;
pub mod reader;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::CoqtopConfig;
pub use reader::{ReaderEvent, ReplyAssembler};
pub use transport::{ChildControl, ProcessControl, Submission, Ticket, Transport};
pub use types::{Commit, EditStack, PendingEntry, SessionState};
