//! Units produced by the sentence scanner.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::position::Position;

/// What kind of protocol unit a span of script text is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    /// A vernacular sentence terminated by a dot.
    Command,
    /// A balanced `(* ... *)` comment.
    Comment,
    /// A focusing token: `-`, `+`, `*` runs, `{`, `}`, or a goal selector.
    Bullet,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command => write!(f, "command"),
            Self::Comment => write!(f, "comment"),
            Self::Bullet => write!(f, "bullet"),
        }
    }
}

/// One scanned sentence, comment or bullet.
///
/// `end` is exclusive: it is the position just past the last character, and
/// the position the next scan starts from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub start: Position,
    pub end: Position,
    pub content: String,
    pub kind: UnitKind,
}

impl Unit {
    /// Whether the unit is sent to the verifier (comments are not).
    pub fn is_sentence(&self) -> bool {
        !matches!(self.kind, UnitKind::Comment)
    }
}
