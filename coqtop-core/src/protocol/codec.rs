//! Encoding and decoding of tagged protocol values.
//!
//! Encoding writes element text directly; decoding walks the element tree
//! produced by [`parse_fragment`](super::xml::parse_fragment).

use quick_xml::escape::escape;
use tracing::debug;

use super::types::{
    ErrorInfo, Goal, Goals, OptionState, OptionValue, Reply, Response, StateId, Status, Value,
};
use super::xml::XmlNode;
use crate::error::{Error, Result};

/// A serialized `call` element, ready to be written to the verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage(String);

impl WireMessage {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for WireMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wrap an encoded argument in a `call` element.
pub fn encode_call(name: &str, argument: &Value) -> WireMessage {
    WireMessage(format!(
        r#"<call val="{}">{}</call>"#,
        escape(name),
        encode_value(argument)
    ))
}

/// Serialize a value to its tagged element form.
pub fn encode_value(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Unit => out.push_str("<unit/>"),
        Value::Bool(b) => out.push_str(&format!(r#"<bool val="{b}"/>"#)),
        Value::Str(s) => write_string(out, s),
        Value::Int(i) => out.push_str(&format!("<int>{i}</int>")),
        Value::StateId(id) => out.push_str(&format!(r#"<state_id val="{}"/>"#, id.0)),
        Value::RouteId(id) => out.push_str(&format!(r#"<route_id val="{id}"/>"#)),
        Value::List(items) => {
            out.push_str("<list>");
            for item in items {
                write_value(out, item);
            }
            out.push_str("</list>");
        }
        Value::Option(None) => out.push_str(r#"<option val="none"/>"#),
        Value::Option(Some(inner)) => {
            out.push_str(r#"<option val="some">"#);
            write_value(out, inner);
            out.push_str("</option>");
        }
        Value::Pair(first, second) => {
            out.push_str("<pair>");
            write_value(out, first);
            write_value(out, second);
            out.push_str("</pair>");
        }
        Value::Inl(inner) => {
            out.push_str(r#"<union val="in_l">"#);
            write_value(out, inner);
            out.push_str("</union>");
        }
        Value::Inr(inner) => {
            out.push_str(r#"<union val="in_r">"#);
            write_value(out, inner);
            out.push_str("</union>");
        }
        Value::Goals(goals) => write_goals(out, goals),
        Value::Goal(goal) => write_goal(out, goal),
        Value::Status(status) => {
            out.push_str("<status><list>");
            for segment in &status.path {
                write_string(out, segment);
            }
            out.push_str("</list>");
            match status.proof_name {
                Some(ref name) => {
                    out.push_str(r#"<option val="some">"#);
                    write_string(out, name);
                    out.push_str("</option>");
                }
                None => out.push_str(r#"<option val="none"/>"#),
            }
            out.push_str("<list>");
            for proof in &status.all_proofs {
                write_string(out, proof);
            }
            out.push_str(&format!("</list><int>{}</int></status>", status.proof_number));
        }
        Value::OptionState(state) => {
            out.push_str(&format!(
                r#"<option_state><bool val="{}"/><bool val="{}"/>"#,
                state.sync, state.deprecated
            ));
            write_string(out, &state.name);
            write_option_value(out, &state.value);
            out.push_str("</option_state>");
        }
        Value::OptionValue(v) => write_option_value(out, v),
        Value::RichText(text) => {
            out.push_str("<richpp>");
            out.push_str(&escape(text.as_str()));
            out.push_str("</richpp>");
        }
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push_str("<string>");
    out.push_str(&escape(s));
    out.push_str("</string>");
}

fn write_goal(out: &mut String, goal: &Goal) {
    out.push_str("<goal>");
    write_string(out, &goal.id);
    out.push_str("<list>");
    for hyp in &goal.hypotheses {
        write_value(out, &Value::RichText(hyp.clone()));
    }
    out.push_str("</list>");
    write_value(out, &Value::RichText(goal.conclusion.clone()));
    out.push_str("</goal>");
}

/// Counts travel as lists of placeholder goals; background goals as a
/// single (before, after) pair.
fn write_goals(out: &mut String, goals: &Goals) {
    let placeholders = |n: usize| -> String {
        let mut list = String::from("<list>");
        for _ in 0..n {
            write_goal(&mut list, &Goal::default());
        }
        list.push_str("</list>");
        list
    };

    out.push_str("<goals><list>");
    for goal in &goals.focused {
        write_goal(out, goal);
    }
    out.push_str("</list><list>");
    if goals.unfocused_count > 0 {
        out.push_str("<pair>");
        out.push_str(&placeholders(goals.unfocused_count));
        out.push_str("<list/></pair>");
    }
    out.push_str("</list>");
    out.push_str(&placeholders(goals.shelved_count));
    out.push_str(&placeholders(goals.given_up_count));
    out.push_str("</goals>");
}

fn write_option_value(out: &mut String, value: &OptionValue) {
    match value {
        OptionValue::Bool(b) => out.push_str(&format!(
            r#"<option_value val="boolvalue"><bool val="{b}"/></option_value>"#
        )),
        OptionValue::Int(i) => {
            out.push_str(r#"<option_value val="intvalue">"#);
            write_value(out, &i.map_or_else(Value::none, |i| Value::some(Value::Int(i))));
            out.push_str("</option_value>");
        }
        OptionValue::String(s) => {
            out.push_str(r#"<option_value val="stringvalue">"#);
            write_string(out, s);
            out.push_str("</option_value>");
        }
        OptionValue::StringOption(s) => {
            out.push_str(r#"<option_value val="stringoptionvalue">"#);
            write_value(
                out,
                &s.as_ref()
                    .map_or_else(Value::none, |s| Value::some(Value::string(s.as_str()))),
            );
            out.push_str("</option_value>");
        }
    }
}

/// Decode a single tagged element into a value.
///
/// Unknown tags and malformed payloads are decode errors.
pub fn decode_value(node: &XmlNode) -> Result<Value> {
    match node.tag.as_str() {
        "unit" => Ok(Value::Unit),
        "bool" => decode_bool(node).map(Value::Bool),
        "string" => Ok(Value::Str(node.text())),
        "int" => decode_int(node).map(Value::Int),
        "state_id" => Ok(Value::StateId(StateId(attr_number(node)?))),
        "route_id" => Ok(Value::RouteId(attr_number(node)?)),
        "list" => node
            .elements()
            .map(decode_value)
            .collect::<Result<Vec<_>>>()
            .map(Value::List),
        "option" => match node.attr("val") {
            Some("none") => Ok(Value::none()),
            Some("some") => Ok(Value::some(decode_value(single_child(node)?)?)),
            other => Err(bad_attr(node, other)),
        },
        "pair" => {
            let [first, second] = exact_children::<2>(node)?;
            Ok(Value::pair(decode_value(first)?, decode_value(second)?))
        }
        "union" => {
            let inner = Box::new(decode_value(single_child(node)?)?);
            match node.attr("val") {
                Some("in_l") => Ok(Value::Inl(inner)),
                Some("in_r") => Ok(Value::Inr(inner)),
                other => Err(bad_attr(node, other)),
            }
        }
        "goals" => decode_goals(node).map(Value::Goals),
        "goal" => decode_goal(node).map(Value::Goal),
        "status" => decode_status(node).map(Value::Status),
        "option_state" => {
            let [sync, depr, name, value] = exact_children::<4>(node)?;
            Ok(Value::OptionState(OptionState {
                sync: decode_bool(sync)?,
                deprecated: decode_bool(depr)?,
                name: text_of(name)?,
                value: decode_option_value(value)?,
            }))
        }
        "option_value" => decode_option_value(node).map(Value::OptionValue),
        "richpp" | "xml" => Ok(Value::RichText(node.inner_text())),
        other => Err(Error::decode(format!("unknown tag <{other}>"))),
    }
}

fn decode_bool(node: &XmlNode) -> Result<bool> {
    match node.attr("val") {
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        other => Err(bad_attr(node, other)),
    }
}

fn decode_int(node: &XmlNode) -> Result<i64> {
    let text = node.text();
    text.trim()
        .parse()
        .map_err(|_| Error::decode(format!("<{}> holds non-integer {text:?}", node.tag)))
}

fn attr_number(node: &XmlNode) -> Result<u64> {
    let raw = node
        .attr("val")
        .ok_or_else(|| Error::decode(format!("<{}> without val", node.tag)))?;
    raw.parse()
        .map_err(|_| Error::decode(format!("<{}> with non-numeric val {raw:?}", node.tag)))
}

fn bad_attr(node: &XmlNode, value: Option<&str>) -> Error {
    Error::decode(format!("<{}> with unexpected val {:?}", node.tag, value))
}

fn single_child(node: &XmlNode) -> Result<&XmlNode> {
    let [child] = exact_children::<1>(node)?;
    Ok(child)
}

fn exact_children<const N: usize>(node: &XmlNode) -> Result<[&XmlNode; N]> {
    let children: Vec<&XmlNode> = node.elements().collect();
    let found = children.len();
    children.try_into().map_err(|_| {
        Error::decode(format!(
            "<{}> expects {N} child element(s), found {found}",
            node.tag
        ))
    })
}

/// Text of a string or rich text element.
fn text_of(node: &XmlNode) -> Result<String> {
    match node.tag.as_str() {
        "string" => Ok(node.text()),
        "richpp" | "xml" => Ok(node.inner_text()),
        other => Err(Error::decode(format!("expected text, found <{other}>"))),
    }
}

fn decode_goal(node: &XmlNode) -> Result<Goal> {
    let children: Vec<&XmlNode> = node.elements().collect();
    // newer verifiers append an optional goal name
    if children.len() < 3 {
        return Err(Error::decode(format!(
            "<goal> expects at least 3 child elements, found {}",
            children.len()
        )));
    }
    let hypotheses = children[1]
        .elements()
        .map(text_of)
        .collect::<Result<Vec<_>>>()?;
    Ok(Goal {
        id: text_of(children[0])?,
        hypotheses,
        conclusion: text_of(children[2])?,
    })
}

fn decode_goals(node: &XmlNode) -> Result<Goals> {
    let children: Vec<&XmlNode> = node.elements().collect();
    let Some(focused) = children.first() else {
        return Err(Error::decode("<goals> without a focused list"));
    };
    let focused = focused
        .elements()
        .map(decode_goal)
        .collect::<Result<Vec<_>>>()?;
    let count_at = |idx: usize| children.get(idx).map_or(0, |n| count_goals(n));
    Ok(Goals {
        focused,
        unfocused_count: count_at(1),
        shelved_count: count_at(2),
        given_up_count: count_at(3),
    })
}

/// Number of `goal` elements anywhere under `node`.
fn count_goals(node: &XmlNode) -> usize {
    node.elements()
        .map(|child| {
            if child.tag == "goal" {
                1
            } else {
                count_goals(child)
            }
        })
        .sum()
}

fn decode_status(node: &XmlNode) -> Result<Status> {
    let [path, name, proofs, number] = exact_children::<4>(node)?;
    let strings = |list: &XmlNode| list.elements().map(text_of).collect::<Result<Vec<_>>>();
    let proof_name = match decode_value(name)? {
        Value::Option(None) => None,
        Value::Option(Some(inner)) => inner.as_text().map(str::to_string),
        _ => return Err(Error::decode("<status> proof name is not an option")),
    };
    Ok(Status {
        path: strings(path)?,
        proof_name,
        all_proofs: strings(proofs)?,
        proof_number: decode_int(number)?,
    })
}

fn decode_option_value(node: &XmlNode) -> Result<OptionValue> {
    let payload = decode_value(single_child(node)?)?;
    let value = match (node.attr("val"), payload) {
        (Some("boolvalue"), Value::Bool(b)) => OptionValue::Bool(b),
        (Some("intvalue"), Value::Option(inner)) => OptionValue::Int(match inner.as_deref() {
            Some(Value::Int(i)) => Some(*i),
            None => None,
            Some(_) => return Err(Error::decode("intvalue holds a non-integer")),
        }),
        (Some("stringvalue"), Value::Str(s)) => OptionValue::String(s),
        (Some("stringoptionvalue"), Value::Option(inner)) => {
            OptionValue::StringOption(inner.as_deref().and_then(Value::as_text).map(str::to_string))
        }
        (val, _) => return Err(bad_attr(node, val)),
    };
    Ok(value)
}

/// Decode one complete reply: the authoritative `value` plus any feedback
/// and messages that came with it.
///
/// When several `value` elements are present, the one carrying a state id
/// wins (the last such, if more than one does); otherwise the last value is
/// used.
pub fn decode_response(nodes: &[XmlNode]) -> Result<Reply> {
    let mut feedback = Vec::new();
    let mut values = Vec::new();
    for node in nodes {
        match node.tag.as_str() {
            "value" => values.push(node),
            "feedback" => feedback.extend(decode_feedback(node)),
            "message" => feedback.extend(message_text(node).map(Response::InfoMessage)),
            other => debug!(tag = other, "ignoring top-level element"),
        }
    }

    let authoritative = values
        .iter()
        .rev()
        .find(|node| value_state_id(node))
        .or_else(|| values.last())
        .ok_or_else(|| Error::decode("reply carries no <value> element"))?;

    let response = match authoritative.attr("val") {
        Some("good") => classify_good(authoritative)?,
        Some("fail") => Response::Rejected(decode_failure(authoritative, &feedback)),
        other => return Err(bad_attr(authoritative, other)),
    };
    Ok(Reply { response, feedback })
}

fn value_state_id(node: &XmlNode) -> bool {
    match node.attr("val") {
        Some("good") => node
            .elements()
            .next()
            .and_then(|payload| decode_value(payload).ok())
            .and_then(|value| value.state_id())
            .is_some(),
        Some("fail") => node.child("state_id").is_some(),
        _ => false,
    }
}

fn classify_good(node: &XmlNode) -> Result<Response> {
    let payload = match node.elements().next() {
        Some(payload) => decode_value(payload)?,
        None => Value::Unit,
    };
    if let Some(id) = payload.state_id() {
        return Ok(Response::Accepted(id));
    }
    Ok(match payload {
        Value::Goals(goals) => Response::GoalsReport(Some(goals)),
        Value::Option(None) => Response::GoalsReport(None),
        Value::Option(Some(inner)) => match *inner {
            Value::Goals(goals) => Response::GoalsReport(Some(goals)),
            other => Response::Acknowledged(Value::some(other)),
        },
        other => Response::Acknowledged(other),
    })
}

fn decode_failure(node: &XmlNode, feedback: &[Response]) -> ErrorInfo {
    let message = node
        .elements()
        .find(|child| matches!(child.tag.as_str(), "richpp" | "xml" | "string"))
        .map(XmlNode::inner_text)
        .filter(|text| !text.trim().is_empty())
        .unwrap_or_else(|| {
            feedback
                .iter()
                .filter_map(|r| match r {
                    Response::InfoMessage(text) => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n")
        });
    let span = node
        .attr("loc_s")
        .zip(node.attr("loc_e"))
        .and_then(|(s, e)| Some((s.parse().ok()?, e.parse().ok()?)));
    ErrorInfo {
        message,
        span,
        location: None,
    }
}

/// Decode a `feedback` element into an info or worker-status notice.
///
/// Feedback kinds the session has no use for decode to `None`.
pub fn decode_feedback(node: &XmlNode) -> Option<Response> {
    let content = node.child("feedback_content")?;
    match content.attr("val")? {
        "message" => message_text(content.child("message")?).map(Response::InfoMessage),
        "workerstatus" => {
            let pair = content.child("pair")?;
            let parts: Vec<String> = pair.elements().filter_map(|n| text_of(n).ok()).collect();
            Some(Response::WorkerStatus(parts.join(": ")))
        }
        _ => None,
    }
}

fn message_text(message: &XmlNode) -> Option<String> {
    message
        .elements()
        .filter(|child| matches!(child.tag.as_str(), "richpp" | "xml" | "string"))
        .last()
        .map(XmlNode::inner_text)
}
