//! Serializing nodes back to XML text.

use super::{NodeKind, NodeRef, QName, XML_NAMESPACE};
use crate::error::{CoreError, CoreResult};
use quick_xml::events::{BytesEnd, BytesPI, BytesStart, BytesText, Event};
use quick_xml::Writer;

/// Serializes a node and its subtree.
///
/// Namespace declarations are emitted where a name's binding is not already
/// in scope. A standalone attribute serializes to its value.
///
/// # Errors
///
/// Returns `XmlParse` if the writer rejects the output.
pub fn serialize_node(node: &NodeRef) -> CoreResult<String> {
    if node.kind() == NodeKind::Attribute {
        return Ok(node.raw_value().to_string());
    }
    let mut out = Serializer {
        writer: Writer::new(Vec::new()),
        scopes: Vec::new(),
    };
    out.node(node)?;
    String::from_utf8(out.writer.into_inner()).map_err(|e| CoreError::xml_parse(e.to_string()))
}

/// Serializes several nodes back to back.
///
/// # Errors
///
/// Returns the first serialization error.
pub fn serialize_sequence<'a>(nodes: impl IntoIterator<Item = &'a NodeRef>) -> CoreResult<String> {
    let mut out = String::new();
    for node in nodes {
        out.push_str(&serialize_node(node)?);
    }
    Ok(out)
}

struct Serializer {
    writer: Writer<Vec<u8>>,
    /// Prefix bindings declared by each open element.
    scopes: Vec<Vec<(String, String)>>,
}

impl Serializer {
    fn write(&mut self, event: Event<'_>) -> CoreResult<()> {
        self.writer
            .write_event(event)
            .map_err(|e| CoreError::xml_parse(e.to_string()))
    }

    fn bound(&self, prefix: &str) -> Option<&str> {
        if prefix == "xml" {
            return Some(XML_NAMESPACE);
        }
        self.scopes
            .iter()
            .rev()
            .flat_map(|frame| frame.iter())
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| uri.as_str())
    }

    /// Declares `name`'s namespace on `frame` if needed and returns its
    /// lexical form.
    fn declare(
        &self,
        frame: &mut Vec<(String, String)>,
        name: &QName,
        is_element: bool,
        generated: &mut usize,
    ) -> String {
        let uri = name.namespace_uri();
        let prefix = match (&name.prefix, uri.is_empty()) {
            (_, true) => {
                if is_element && self.lookup(frame, "").is_some_and(|u| !u.is_empty()) {
                    frame.push((String::new(), String::new()));
                }
                return name.local.clone();
            }
            (Some(prefix), false) if !prefix.is_empty() => prefix.clone(),
            // Unprefixed attributes in a namespace need a prefix.
            _ if !is_element => {
                *generated += 1;
                format!("ns{generated}")
            }
            _ => String::new(),
        };
        if self.lookup(frame, &prefix) != Some(uri) {
            frame.push((prefix.clone(), uri.to_string()));
        }
        if prefix.is_empty() {
            name.local.clone()
        } else {
            format!("{prefix}:{}", name.local)
        }
    }

    fn lookup<'s>(&'s self, frame: &'s [(String, String)], prefix: &str) -> Option<&'s str> {
        frame
            .iter()
            .rev()
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| uri.as_str())
            .or_else(|| self.bound(prefix))
    }

    fn node(&mut self, node: &NodeRef) -> CoreResult<()> {
        match node.kind() {
            NodeKind::Document => {
                for child in node.children() {
                    self.node(&child)?;
                }
                Ok(())
            }
            NodeKind::Element => self.element(node),
            NodeKind::Attribute => Ok(()),
            NodeKind::Text => self.write(Event::Text(BytesText::new(node.raw_value()))),
            NodeKind::Comment => {
                self.write(Event::Comment(BytesText::from_escaped(node.raw_value())))
            }
            NodeKind::ProcessingInstruction => {
                let target = node.name().map(|n| n.local.as_str()).unwrap_or_default();
                let content = if node.raw_value().is_empty() {
                    target.to_string()
                } else {
                    format!("{target} {}", node.raw_value())
                };
                self.write(Event::PI(BytesPI::new(content)))
            }
        }
    }

    fn element(&mut self, node: &NodeRef) -> CoreResult<()> {
        let name = node.name().cloned().unwrap_or_else(|| QName::local(""));
        let mut frame = Vec::new();
        let mut generated = 0;
        let tag = self.declare(&mut frame, &name, true, &mut generated);

        let mut attributes = Vec::new();
        for attr in node.attributes() {
            if let Some(attr_name) = attr.name() {
                let key = self.declare(&mut frame, attr_name, false, &mut generated);
                attributes.push((key, attr.raw_value().to_string()));
            }
        }

        let mut start = BytesStart::new(tag.as_str());
        for (prefix, uri) in &frame {
            let key = if prefix.is_empty() {
                "xmlns".to_string()
            } else {
                format!("xmlns:{prefix}")
            };
            start.push_attribute((key.as_str(), uri.as_str()));
        }
        for (key, value) in &attributes {
            start.push_attribute((key.as_str(), value.as_str()));
        }

        let children = node.children();
        if children.is_empty() {
            return self.write(Event::Empty(start));
        }
        self.write(Event::Start(start))?;
        self.scopes.push(frame);
        for child in &children {
            self.node(child)?;
        }
        self.scopes.pop();
        self.write(Event::End(BytesEnd::new(tag.as_str())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::parse_document;

    fn round_trip(xml: &str) -> String {
        let doc = NodeRef::constructed(parse_document(xml, false).unwrap());
        serialize_node(&doc).unwrap()
    }

    #[test]
    fn serializes_mixed_content() {
        let xml = r#"<root a="1"><x>t &amp; u</x><!-- c --><?pi data?><y/></root>"#;
        assert_eq!(round_trip(xml), xml);
    }

    #[test]
    fn emits_namespace_declarations_once() {
        let xml = r#"<p:a xmlns:p="urn:p"><p:b/></p:a>"#;
        assert_eq!(round_trip(xml), xml);
    }

    #[test]
    fn attribute_serializes_to_value() {
        let doc = NodeRef::constructed(parse_document(r#"<a k="v"/>"#, false).unwrap());
        let attr = &doc.children()[0].attributes()[0];
        assert_eq!(serialize_node(attr).unwrap(), "v");
    }

    #[test]
    fn sequence_concatenates() {
        let doc = NodeRef::constructed(parse_document("<a><b/><c/></a>", false).unwrap());
        let children = doc.children()[0].children();
        assert_eq!(serialize_sequence(&children).unwrap(), "<b/><c/>");
    }
}
