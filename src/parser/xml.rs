//! Owned element tree built from `quick-xml` events.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::ParsingError;

/// An XML element with its attributes, child elements and the text directly
/// inside it.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    /// Concatenated text and CDATA, trimmed at the edges by the reader
    pub text: String,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Self, ParsingError> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| ParsingError::MalformedXml(format!("<{}>: {}", name, e)))?;
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| ParsingError::MalformedXml(format!("<{}>: {}", name, e)))?
                .into_owned();
            attributes.push((key, value));
        }
        Ok(Element {
            name,
            attributes,
            children: Vec::new(),
            text: String::new(),
        })
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First descendant with the given name, depth-first in document order.
    pub fn find(&self, name: &str) -> Option<&Element> {
        for child in &self.children {
            if child.name == name {
                return Some(child);
            }
            if let Some(found) = child.find(name) {
                return Some(found);
            }
        }
        None
    }

    /// All descendants with the given name, in document order.
    pub fn descendants<'a>(&'a self, name: &str) -> Vec<&'a Element> {
        let mut found = Vec::new();
        self.collect_descendants(name, &mut found);
        found
    }

    fn collect_descendants<'a>(&'a self, name: &str, found: &mut Vec<&'a Element>) {
        for child in &self.children {
            if child.name == name {
                found.push(child);
            }
            child.collect_descendants(name, found);
        }
    }
}

/// Fetch a required descendant element, failing with the missing tag and
/// the name of the node that was searched.
pub fn get_required<'a>(node: &'a Element, tag: &str) -> Result<&'a Element, ParsingError> {
    node.find(tag).ok_or_else(|| ParsingError::MissingElement {
        tag: tag.to_string(),
        node: node.name.clone(),
    })
}

/// Parse a fragment into its root element.
///
/// The fragment must be a single well-formed document: exactly one root,
/// balanced tags, and no stray text outside the root.
pub fn parse_document(fragment: &[u8]) -> Result<Element, ParsingError> {
    let text = std::str::from_utf8(fragment)
        .map_err(|e| ParsingError::MalformedXml(format!("invalid UTF-8: {}", e)))?;

    let mut reader = Reader::from_str(text);
    reader.trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let event = reader.read_event().map_err(|e| {
            ParsingError::MalformedXml(format!("at byte {}: {}", reader.buffer_position(), e))
        })?;
        match event {
            Event::Start(ref e) => {
                if root.is_some() {
                    return Err(ParsingError::MalformedXml(
                        "content after the root element".to_string(),
                    ));
                }
                stack.push(Element::from_start(e)?);
            }
            Event::Empty(ref e) => {
                if root.is_some() {
                    return Err(ParsingError::MalformedXml(
                        "content after the root element".to_string(),
                    ));
                }
                let element = Element::from_start(e)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Event::End(_) => {
                let element = stack.pop().ok_or_else(|| {
                    ParsingError::MalformedXml("closing tag without an open element".to_string())
                })?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Event::Text(ref e) => match stack.last_mut() {
                Some(open) => {
                    let content = e
                        .unescape()
                        .map_err(|err| ParsingError::MalformedXml(format!("<{}>: {}", open.name, err)))?;
                    open.text.push_str(&content);
                }
                None => {
                    let content = String::from_utf8_lossy(e);
                    if !content.trim().is_empty() {
                        return Err(ParsingError::MalformedXml(format!(
                            "text outside the root element: {:?}",
                            truncate(content.trim(), 40)
                        )));
                    }
                }
            },
            Event::CData(e) => match stack.last_mut() {
                Some(open) => open.text.push_str(&String::from_utf8_lossy(&e.into_inner())),
                None => {
                    return Err(ParsingError::MalformedXml(
                        "CDATA outside the root element".to_string(),
                    ));
                }
            },
            Event::Eof => break,
            Event::Comment(_) | Event::Decl(_) | Event::PI(_) | Event::DocType(_) => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(ParsingError::MalformedXml(format!(
            "unexpected end of document, <{}> is not closed",
            open.name
        )));
    }
    root.ok_or_else(|| ParsingError::MalformedXml("no element found".to_string()))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
