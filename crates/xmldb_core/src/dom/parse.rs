//! Parsing XML text into a document tree.

use super::{QName, Tree, TreeBuilder, XML_NAMESPACE};
use crate::error::{CoreError, CoreResult};
use quick_xml::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::borrow::Cow;

/// Parses `xml` into a tree rooted at a document node.
///
/// Namespace declarations are resolved into element and attribute names and
/// do not appear as attributes. Whitespace-only text is dropped unless
/// `preserve_whitespace` is set.
///
/// # Errors
///
/// Returns `XmlParse` for malformed input, undeclared prefixes, or a document
/// without exactly one root element, and `NameCollision` for duplicate
/// attributes.
pub fn parse_document(xml: &str, preserve_whitespace: bool) -> CoreResult<Tree> {
    parse(xml, preserve_whitespace, false)
}

/// Parses XML content that may hold any number of top-level nodes, such as
/// `<a/>text<b/>`, into a tree whose document node holds those nodes.
///
/// Used for content inserted into stored documents.
///
/// # Errors
///
/// As [`parse_document`], except that any number of root elements and
/// top-level text are accepted.
pub fn parse_fragment(xml: &str, preserve_whitespace: bool) -> CoreResult<Tree> {
    parse(xml, preserve_whitespace, true)
}

fn parse(xml: &str, preserve_whitespace: bool, fragment: bool) -> CoreResult<Tree> {
    let mut reader = Reader::from_str(xml);
    let mut builder = TreeBuilder::document();
    let mut scopes = NamespaceScopes::default();
    let mut pending = String::new();
    let mut depth = 0usize;
    let mut roots = 0usize;

    loop {
        let event = reader.read_event().map_err(|e| {
            CoreError::xml_parse(format!("at byte {}: {e}", reader.buffer_position()))
        })?;

        match event {
            Event::Text(text) => pending.push_str(&unescape(&String::from_utf8_lossy(&text))?),
            Event::CData(data) => pending.push_str(&String::from_utf8_lossy(&data)),
            Event::GeneralRef(reference) => {
                let name = String::from_utf8_lossy(&reference);
                pending.push_str(&unescape(&format!("&{name};"))?);
            }
            Event::Eof => break,
            other => {
                flush_text(&mut builder, &mut pending, depth, preserve_whitespace, fragment)?;
                let is_empty = matches!(other, Event::Empty(_));
                match other {
                    Event::Start(start) | Event::Empty(start) => {
                        if depth == 0 {
                            roots += 1;
                        }
                        open_element(&mut builder, &mut scopes, &start)?;
                        if is_empty {
                            builder.end_element()?;
                            scopes.pop();
                        } else {
                            depth += 1;
                        }
                    }
                    Event::End(_) => {
                        builder.end_element()?;
                        scopes.pop();
                        depth = depth.saturating_sub(1);
                    }
                    Event::Comment(comment) => {
                        builder.comment(&String::from_utf8_lossy(&comment))?;
                    }
                    Event::PI(pi) => {
                        let raw = String::from_utf8_lossy(&pi).into_owned();
                        let (target, data) = raw
                            .split_once(char::is_whitespace)
                            .unwrap_or((raw.as_str(), ""));
                        builder.processing_instruction(target, data)?;
                    }
                    _ => {}
                }
            }
        }
    }
    flush_text(&mut builder, &mut pending, depth, preserve_whitespace, fragment)?;

    if !fragment && roots != 1 {
        return Err(CoreError::xml_parse(format!(
            "expected exactly one root element, found {roots}"
        )));
    }
    builder.finish()
}

fn flush_text(
    builder: &mut TreeBuilder,
    pending: &mut String,
    depth: usize,
    preserve_whitespace: bool,
    fragment: bool,
) -> CoreResult<()> {
    if pending.is_empty() {
        return Ok(());
    }
    let text = std::mem::take(pending);
    let blank = text.chars().all(char::is_whitespace);
    if depth == 0 && !fragment {
        if !blank {
            return Err(CoreError::xml_parse("text outside the root element"));
        }
        return Ok(());
    }
    if blank && !preserve_whitespace {
        return Ok(());
    }
    builder.text(&text)
}

fn open_element(
    builder: &mut TreeBuilder,
    scopes: &mut NamespaceScopes,
    start: &quick_xml::events::BytesStart<'_>,
) -> CoreResult<()> {
    let mut declared = Vec::new();
    let mut attributes = Vec::new();
    // Duplicates are reported by the builder as name collisions.
    for attr in start.attributes().with_checks(false) {
        let attr = attr.map_err(|e| CoreError::xml_parse(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = unescape(&String::from_utf8_lossy(&attr.value))?;
        if key == "xmlns" {
            declared.push((String::new(), value));
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            declared.push((prefix.to_string(), value));
        } else {
            attributes.push((key, value));
        }
    }
    scopes.push(declared);

    let raw_name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    builder.start_element(scopes.resolve(&raw_name, true)?)?;
    for (key, value) in attributes {
        builder.attribute(scopes.resolve(&key, false)?, value)?;
    }
    Ok(())
}

/// In-scope namespace declarations, innermost last.
#[derive(Debug, Default)]
struct NamespaceScopes {
    frames: Vec<Vec<(String, String)>>,
}

impl NamespaceScopes {
    fn push(&mut self, declared: Vec<(String, String)>) {
        self.frames.push(declared);
    }

    fn pop(&mut self) {
        self.frames.pop();
    }

    fn lookup(&self, prefix: &str) -> Option<&str> {
        if prefix == "xml" {
            return Some(XML_NAMESPACE);
        }
        self.frames
            .iter()
            .rev()
            .flat_map(|frame| frame.iter().rev())
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| uri.as_str())
    }

    fn resolve(&self, raw: &str, is_element: bool) -> CoreResult<QName> {
        match raw.split_once(':') {
            Some((prefix, local)) => {
                let uri = self.lookup(prefix).filter(|uri| !uri.is_empty()).ok_or_else(|| {
                    CoreError::xml_parse(format!("undeclared namespace prefix '{prefix}'"))
                })?;
                Ok(QName::namespaced(uri, local).with_prefix(prefix))
            }
            None if is_element => Ok(match self.lookup("") {
                Some(uri) if !uri.is_empty() => QName::namespaced(uri, raw),
                _ => QName::local(raw),
            }),
            None => Ok(QName::local(raw)),
        }
    }
}

/// Replaces the predefined entities and character references in `raw`.
pub(crate) fn unescape(raw: &str) -> CoreResult<String> {
    escape::unescape(raw)
        .map(Cow::into_owned)
        .map_err(|e| CoreError::xml_parse(e.to_string()))
}
