//! Minimal XML tree used by the model-document and SBML readers.
//!
//! Both input formats are small, element-and-attribute shaped documents, so
//! the readers work on a fully materialized tree instead of streaming
//! events. Namespace prefixes are stripped; the readers match on local
//! names only.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use stochcell_core::{AttrMap, ModelError, Result};

/// One XML element: local name, attributes, child elements and text
/// content.
///
/// Text is kept as one segment per text run, so content interleaved with
/// child elements (MathML's `<cn>2<sep/>-3</cn>`) stays separable.
#[derive(Debug, Clone, Default)]
pub struct XmlNode {
    pub name: String,
    pub attrs: AttrMap,
    pub children: Vec<XmlNode>,
    pub texts: Vec<String>,
}

impl XmlNode {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    /// All text content joined together.
    pub fn text(&self) -> String {
        self.texts.concat()
    }

    /// First child element with the given local name.
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All child elements with the given local name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.children.iter().filter(move |c| c.name == name)
    }
}

fn local_name(raw: &[u8]) -> String {
    let raw = match raw.iter().position(|&b| b == b':') {
        Some(colon) => &raw[colon + 1..],
        None => raw,
    };
    String::from_utf8_lossy(raw).into_owned()
}

fn element_from(start: &BytesStart) -> Result<XmlNode> {
    let mut node = XmlNode {
        name: local_name(start.name().as_ref()),
        ..XmlNode::default()
    };
    for attr in start.attributes() {
        let attr = attr.map_err(|e| ModelError::Document(e.to_string()))?;
        let key = local_name(attr.key.as_ref());
        let value = attr
            .unescape_value()
            .map_err(|e| ModelError::Document(e.to_string()))?
            .into_owned();
        node.attrs.insert(key, value);
    }
    Ok(node)
}

/// Parse a document and return its root element.
pub fn parse(input: &str) -> Result<XmlNode> {
    let mut reader = Reader::from_str(input);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;
    loop {
        match reader
            .read_event()
            .map_err(|e| ModelError::Document(e.to_string()))?
        {
            Event::Start(start) => stack.push(element_from(&start)?),
            Event::Empty(start) => {
                let node = element_from(&start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None if root.is_none() => root = Some(node),
                    None => {
                        return Err(ModelError::Document(
                            "multiple root elements".to_string(),
                        ))
                    }
                }
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| ModelError::Document("unbalanced end tag".to_string()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(node),
                    None if root.is_none() => root = Some(node),
                    None => {
                        return Err(ModelError::Document(
                            "multiple root elements".to_string(),
                        ))
                    }
                }
            }
            Event::Text(text) => {
                if let Some(top) = stack.last_mut() {
                    let text = text
                        .unescape()
                        .map_err(|e| ModelError::Document(e.to_string()))?;
                    top.texts.push(text.into_owned());
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if !stack.is_empty() {
        return Err(ModelError::Document("unclosed element".to_string()));
    }
    root.ok_or_else(|| ModelError::Document("no root element".to_string()))
}
