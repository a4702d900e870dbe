//! The requests a session can make, and their wire encoding.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::codec::{encode_call, WireMessage};
use super::dialect::{AddLayout, ProtocolDialect};
use super::types::{StateId, Value};
use crate::position::WirePosition;
use crate::scanner::UnitKind;

/// Canned query forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryKind {
    Check,
    Print,
    Locate,
    Search,
    SearchAbout,
    /// The terms are the whole sentence.
    Raw,
}

impl QueryKind {
    /// Build the vernacular sentence for `terms`.
    pub fn sentence(&self, terms: &str) -> String {
        let terms = terms.trim().trim_end_matches('.');
        match self {
            Self::Check => format!("Check {terms}."),
            Self::Print => format!("Print {terms}."),
            Self::Locate => format!("Locate {terms}."),
            Self::Search => format!("Search {terms}."),
            Self::SearchAbout => format!("SearchAbout {terms}."),
            Self::Raw => format!("{terms}."),
        }
    }
}

/// A request kind as tracked by the session.
///
/// Each kind carries what it needs beyond the sentence text; the encoding
/// for all of them lives in [`CommandKind::encode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    /// Session handshake; answered with the root state.
    Init,
    /// Add a scanned unit to the edit history.
    Commit(UnitKind),
    /// Fetch goals; `after_commit` marks the refresh that follows a commit.
    Goals { after_commit: bool },
    Status,
    Query(QueryKind),
    /// Drop the last `steps` commits.
    Rewind { steps: usize },
}

/// Per-dispatch inputs to encoding.
#[derive(Debug, Clone, Copy)]
pub struct EncodeContext<'a> {
    pub dialect: &'a ProtocolDialect,
    /// Current edit-history tip; for rewinds, the state to return to.
    pub tip: StateId,
    /// Where the sentence starts in the script.
    pub origin: WirePosition,
}

impl CommandKind {
    /// Protocol call name.
    pub fn call_name(&self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::Commit(_) => "Add",
            Self::Goals { .. } => "Goal",
            Self::Status => "Status",
            Self::Query(_) => "Query",
            Self::Rewind { .. } => "Edit_at",
        }
    }

    pub fn is_commit(&self) -> bool {
        matches!(self, Self::Commit(_))
    }

    /// Whether an in-flight request of this kind may be interrupted by
    /// signal. Commits and rewinds must run to completion.
    pub fn is_interruptible(&self) -> bool {
        matches!(self, Self::Goals { .. } | Self::Status | Self::Query(_))
    }

    /// Encode the call. `text` is the sentence for commits and queries and
    /// is ignored by the other kinds.
    pub fn encode(&self, text: &str, ctx: &EncodeContext<'_>) -> WireMessage {
        let argument = match self {
            Self::Init => Value::none(),
            Self::Commit(_) => add_argument(text, ctx),
            Self::Goals { .. } => Value::Unit,
            Self::Status => Value::Bool(false),
            Self::Query(_) => Value::pair(
                Value::RouteId(0),
                Value::pair(Value::string(text), Value::StateId(ctx.tip)),
            ),
            Self::Rewind { .. } => Value::StateId(ctx.tip),
        };
        encode_call(self.call_name(), &argument)
    }
}

fn add_argument(text: &str, ctx: &EncodeContext<'_>) -> Value {
    let classic = Value::pair(
        Value::pair(Value::string(text), Value::Int(-1)),
        Value::pair(Value::StateId(ctx.tip), Value::Bool(true)),
    );
    match ctx.dialect.add_layout {
        AddLayout::Classic => classic,
        // Offsets stay sentence-relative (bp = 0) so error spans need no
        // rebasing; only the line number is real.
        AddLayout::Located => Value::pair(
            Value::pair(classic, Value::Int(0)),
            Value::pair(
                Value::Int(ctx.origin.line as i64 + 1),
                Value::Int(0),
            ),
        ),
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Commit(kind) => write!(f, "Add({kind})"),
            Self::Goals { after_commit: true } => write!(f, "Goal(after add)"),
            Self::Query(kind) => write!(f, "Query({kind:?})"),
            Self::Rewind { steps } => write!(f, "Edit_at(-{steps})"),
            other => f.write_str(other.call_name()),
        }
    }
}
