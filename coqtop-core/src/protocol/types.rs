//! Typed value model of the coqtop XML protocol.
//!
//! These types mirror the tagged elements the verifier exchanges over its
//! main channel: scalar values, containers, and a handful of records (goals,
//! status, option state).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::position::Position;

/// Verifier-issued handle on a point of its edit history.
///
/// Ordered by issuance on the server; the numeric value carries no meaning
/// for the client beyond identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateId(pub u64);

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state#{}", self.0)
    }
}

/// A decoded protocol value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Unit,
    Bool(bool),
    Str(String),
    Int(i64),
    StateId(StateId),
    RouteId(u64),
    List(Vec<Value>),
    Option(Option<Box<Value>>),
    Pair(Box<Value>, Box<Value>),
    /// `union val="in_l"`
    Inl(Box<Value>),
    /// `union val="in_r"`
    Inr(Box<Value>),
    Goals(Goals),
    Goal(Goal),
    Status(Status),
    OptionState(OptionState),
    OptionValue(OptionValue),
    /// Pretty-printed text (`richpp` / `xml`), flattened to its characters.
    RichText(String),
}

impl Value {
    pub fn pair(first: Value, second: Value) -> Self {
        Self::Pair(Box::new(first), Box::new(second))
    }

    pub fn some(value: Value) -> Self {
        Self::Option(Some(Box::new(value)))
    }

    pub fn none() -> Self {
        Self::Option(None)
    }

    pub fn string(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    /// The state id this value carries, looking one level into containers.
    pub fn state_id(&self) -> Option<StateId> {
        match self {
            Self::StateId(id) => Some(*id),
            Self::Pair(first, second) => first.direct_state_id().or_else(|| second.direct_state_id()),
            Self::List(items) => items.iter().find_map(Value::direct_state_id),
            _ => None,
        }
    }

    fn direct_state_id(&self) -> Option<StateId> {
        match self {
            Self::StateId(id) => Some(*id),
            _ => None,
        }
    }

    /// Plain text carried by a string or rich text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Str(s) | Self::RichText(s) => Some(s),
            _ => None,
        }
    }
}

/// Proof obligations reported by a `Goal` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goals {
    pub focused: Vec<Goal>,
    pub unfocused_count: usize,
    pub shelved_count: usize,
    pub given_up_count: usize,
}

impl Goals {
    /// Whether nothing remains to prove, focused or not.
    pub fn is_complete(&self) -> bool {
        self.focused.is_empty()
            && self.unfocused_count == 0
            && self.shelved_count == 0
            && self.given_up_count == 0
    }

    /// Render the goals the way an IDE goal panel shows them.
    ///
    /// Hypotheses are printed only for the first focused goal.
    pub fn render(&self) -> String {
        let count = self.focused.len();
        let mut out = format!(
            "{} subgoal{} ({} unfocused)\n",
            count,
            if count == 1 { "" } else { "s" },
            self.unfocused_count
        );
        for (idx, goal) in self.focused.iter().enumerate() {
            if idx == 0 {
                for hyp in &goal.hypotheses {
                    out.push_str(hyp);
                    out.push('\n');
                }
            }
            out.push_str(&format!("\n======================== ( {} / {} )\n", idx + 1, count));
            out.push_str(&goal.conclusion);
            out.push('\n');
        }
        out
    }
}

/// One focused goal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub hypotheses: Vec<String>,
    pub conclusion: String,
}

impl Goal {
    pub fn new(id: impl Into<String>, conclusion: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hypotheses: Vec::new(),
            conclusion: conclusion.into(),
        }
    }

    pub fn with_hypothesis(mut self, hypothesis: impl Into<String>) -> Self {
        self.hypotheses.push(hypothesis.into());
        self
    }
}

/// Answer to a `Status` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub path: Vec<String>,
    pub proof_name: Option<String>,
    pub all_proofs: Vec<String>,
    pub proof_number: i64,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module {}", self.path.join("."))?;
        if let Some(ref name) = self.proof_name {
            write!(f, ", proving {name}")?;
        }
        if !self.all_proofs.is_empty() {
            write!(f, " (open: {})", self.all_proofs.join(", "))?;
        }
        Ok(())
    }
}

/// Value of a verifier option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionValue {
    Bool(bool),
    Int(Option<i64>),
    String(String),
    StringOption(Option<String>),
}

/// Description of a verifier option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionState {
    pub sync: bool,
    pub deprecated: bool,
    pub name: String,
    pub value: OptionValue,
}

/// Failure details reported with a `fail` value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    /// Byte offsets into the sentence text, as sent by the verifier.
    pub span: Option<(usize, usize)>,
    /// `span` resolved to script positions, once the sentence is known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<(Position, Position)>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            span: None,
            location: None,
        }
    }

    pub fn with_span(mut self, start: usize, end: usize) -> Self {
        self.span = Some((start, end));
        self
    }

    /// Resolve the byte span against the sentence that produced it.
    pub fn locate(mut self, sentence_start: Position, sentence: &str) -> Self {
        if let Some((start, end)) = self.span {
            self.location = Some((
                Position::advance_bytes(sentence_start, sentence, start),
                Position::advance_bytes(sentence_start, sentence, end),
            ));
        }
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.location {
            Some((start, end)) => write!(f, "{start}-{end}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// One routed outcome or asynchronous notice from the verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// A `good` value carrying the new state id.
    Accepted(StateId),
    /// A `good` value with neither state id nor goals (Edit_at, Query, Status).
    Acknowledged(Value),
    /// A `fail` value.
    Rejected(ErrorInfo),
    /// Answer to a `Goal` call; `None` when no proof is open.
    GoalsReport(Option<Goals>),
    /// Text of a `message` feedback.
    InfoMessage(String),
    /// Text of a `workerstatus` feedback.
    WorkerStatus(String),
}

impl Response {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// A complete verifier answer: the authoritative value plus the feedback
/// that arrived with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub response: Response,
    pub feedback: Vec<Response>,
}

impl Reply {
    pub fn new(response: Response) -> Self {
        Self {
            response,
            feedback: Vec::new(),
        }
    }

    /// Texts of the message feedback, in arrival order.
    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.feedback.iter().filter_map(|r| match r {
            Response::InfoMessage(text) => Some(text.as_str()),
            _ => None,
        })
    }

    /// Everything the verifier printed for this request, joined by newlines.
    pub fn output_text(&self) -> String {
        let mut parts: Vec<&str> = self.messages().collect();
        if let Response::Acknowledged(ref value) = self.response {
            if let Some(text) = value.as_text().filter(|t| !t.is_empty()) {
                parts.push(text);
            }
        }
        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_id_lookup() {
        let add_reply = Value::pair(
            Value::StateId(StateId(4)),
            Value::pair(Value::Inl(Box::new(Value::Unit)), Value::string("")),
        );
        assert_eq!(add_reply.state_id(), Some(StateId(4)));
        assert_eq!(Value::StateId(StateId(1)).state_id(), Some(StateId(1)));
        // nested too deep: not the payload's own state id
        let focus = Value::Inr(Box::new(Value::pair(Value::StateId(StateId(2)), Value::Unit)));
        assert_eq!(focus.state_id(), None);
    }

    #[test]
    fn test_goals_render() {
        let goals = Goals {
            focused: vec![
                Goal::new("1", "n + 0 = n").with_hypothesis("n : nat"),
                Goal::new("2", "0 = 0"),
            ],
            unfocused_count: 1,
            ..Default::default()
        };
        let text = goals.render();
        assert!(text.starts_with("2 subgoals (1 unfocused)"));
        assert!(text.contains("n : nat"));
        assert!(text.contains("( 2 / 2 )"));
        assert!(!goals.is_complete());
    }

    #[test]
    fn test_error_locate_multibyte() {
        let info = ErrorInfo::new("bad").with_span(6, 9).locate(Position::new(2, 4), "Check ∀.");
        assert_eq!(
            info.location,
            Some((Position::new(2, 10), Position::new(2, 11)))
        );
    }

    #[test]
    fn test_reply_output_text() {
        let reply = Reply {
            response: Response::Acknowledged(Value::string("done")),
            feedback: vec![
                Response::InfoMessage("nat : Set".to_string()),
                Response::WorkerStatus("proof: Idle".to_string()),
            ],
        };
        assert_eq!(reply.output_text(), "nat : Set\ndone");
    }
}
