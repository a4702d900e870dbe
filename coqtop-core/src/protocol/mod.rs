//! The coqtop XML protocol: value model, codec, and version dialects.
//!
//! Requests are `call` elements written to the verifier's stdin; replies are
//! a stream of `feedback`, `message` and `value` elements on its stdout. This
//! module knows nothing about processes or sessions.

pub mod codec;
pub mod command;
pub mod dialect;
pub mod types;
pub mod xml;

pub use codec::{decode_feedback, decode_response, decode_value, encode_call, encode_value, WireMessage};
pub use command::{CommandKind, EncodeContext, QueryKind};
pub use dialect::{AddLayout, CoqVersion, ProtocolDialect};
pub use types::{
    ErrorInfo, Goal, Goals, OptionState, OptionValue, Reply, Response, StateId, Status, Value,
};
pub use xml::{parse_fragment, predecode_entities, XmlNode};
