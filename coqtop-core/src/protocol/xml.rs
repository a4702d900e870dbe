//! Minimal element tree over `quick-xml` events.
//!
//! The verifier writes a stream of top-level elements with no enclosing
//! document, so replies are parsed as fragments: zero or more sibling
//! elements, each of which must be closed before the fragment counts as
//! complete.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{Error, Result};

/// An element with its attributes and mixed content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlNode {
    pub tag: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlChild>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlChild {
    Element(XmlNode),
    Text(String),
}

impl XmlNode {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Child elements, skipping text.
    pub fn elements(&self) -> impl Iterator<Item = &XmlNode> {
        self.children.iter().filter_map(|child| match child {
            XmlChild::Element(node) => Some(node),
            XmlChild::Text(_) => None,
        })
    }

    /// First child element with the given tag.
    pub fn child(&self, tag: &str) -> Option<&XmlNode> {
        self.elements().find(|node| node.tag == tag)
    }

    /// Text directly under this element.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|child| match child {
                XmlChild::Text(text) => Some(text.as_str()),
                XmlChild::Element(_) => None,
            })
            .collect()
    }

    /// All text under this element, in document order.
    pub fn inner_text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        for child in &self.children {
            match child {
                XmlChild::Text(text) => out.push_str(text),
                XmlChild::Element(node) => node.collect_text(out),
            }
        }
    }
}

/// Replace the HTML entities the verifier emits but XML does not define.
///
/// `&lt;` (and the other XML entities) are left for the XML reader.
pub fn predecode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    raw.replace("&nbsp;", " ")
        .replace("&apos;", "'")
        .replace("&gt;", ">")
}

/// Parse a sequence of top-level elements.
///
/// Fails when the input is malformed or ends inside an open element, which
/// for a streaming reader usually means more bytes are on the way.
pub fn parse_fragment(input: &str) -> Result<Vec<XmlNode>> {
    let mut reader = Reader::from_str(input);
    let mut stack: Vec<XmlNode> = Vec::new();
    let mut roots = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => stack.push(open_element(&start)?),
            Ok(Event::Empty(start)) => {
                let node = open_element(&start)?;
                attach(&mut stack, &mut roots, node);
            }
            Ok(Event::End(_)) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| Error::decode("closing tag without an open element"))?;
                attach(&mut stack, &mut roots, node);
            }
            Ok(Event::Text(text)) => {
                let text = text
                    .unescape()
                    .map_err(|e| Error::decode(format!("bad text content: {e}")))?;
                if let Some(top) = stack.last_mut() {
                    top.children.push(XmlChild::Text(text.into_owned()));
                }
            }
            Ok(Event::CData(data)) => {
                if let Some(top) = stack.last_mut() {
                    let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    top.children.push(XmlChild::Text(text));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(Error::decode(format!(
                    "malformed XML at byte {}: {e}",
                    reader.buffer_position()
                )))
            }
        }
    }

    if !stack.is_empty() {
        return Err(Error::decode(format!(
            "incomplete fragment: {} open element(s)",
            stack.len()
        )));
    }
    Ok(roots)
}

fn open_element(start: &BytesStart<'_>) -> Result<XmlNode> {
    let mut node = XmlNode::new(String::from_utf8_lossy(start.name().as_ref()));
    for attr in start.attributes() {
        let attr = attr.map_err(|e| Error::decode(format!("bad attribute: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| Error::decode(format!("bad attribute value: {e}")))?
            .into_owned();
        node.attributes.push((key, value));
    }
    Ok(node)
}

fn attach(stack: &mut [XmlNode], roots: &mut Vec<XmlNode>, node: XmlNode) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(XmlChild::Element(node)),
        None => roots.push(node),
    }
}
