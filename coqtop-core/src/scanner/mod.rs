//! Sentence scanner for proof scripts.
//!
//! Splits script text into the units the verifier consumes one at a time:
//! dot-terminated commands, focusing bullets, and comments. The scanner is a
//! pure function of a text snapshot and a start position; it is re-run on
//! demand rather than cached across edits.

pub mod parser;
pub mod types;

pub use parser::{scan_all, scan_next, Units};
pub use types::{Unit, UnitKind};
