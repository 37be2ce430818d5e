//! Tree construction with the data-model construction rules.

use super::tree::{NodeData, Tree};
use super::{NodeKind, NodeRef, QName};
use crate::error::{CoreError, CoreResult};

/// Builds a [`Tree`] in document order.
///
/// - attribute names must be unique per element (`NameCollision` otherwise)
/// - attributes must precede any child content of their element (`XQTY0024`)
/// - adjacent text is merged and empty text is dropped
///
/// ```rust
/// use xmldb_core::dom::{QName, TreeBuilder};
///
/// let mut b = TreeBuilder::fragment();
/// b.start_element(QName::local("item")).unwrap();
/// b.attribute(QName::local("id"), "1").unwrap();
/// assert!(b.attribute(QName::local("id"), "2").is_err());
/// ```
#[derive(Debug)]
pub struct TreeBuilder {
    nodes: Vec<NodeData>,
    open: Vec<u32>,
    is_document: bool,
}

impl TreeBuilder {
    /// Starts a tree rooted at a document node.
    #[must_use]
    pub fn document() -> Self {
        Self {
            nodes: vec![NodeData::new(NodeKind::Document, None, String::new(), None)],
            open: vec![0],
            is_document: true,
        }
    }

    /// Starts a tree rooted at whatever single node is added first.
    #[must_use]
    pub fn fragment() -> Self {
        Self {
            nodes: Vec::new(),
            open: Vec::new(),
            is_document: false,
        }
    }

    /// Returns true if no node has been added beyond an implicit document root.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= usize::from(self.is_document)
    }

    fn push(&mut self, kind: NodeKind, name: Option<QName>, value: String) -> CoreResult<u32> {
        let parent = self.open.last().copied();
        if parent.is_none() && !self.nodes.is_empty() {
            return Err(CoreError::invalid_operation(
                "a fragment has exactly one top-level node",
            ));
        }

        let pos = self.nodes.len() as u32;
        self.nodes.push(NodeData::new(kind, name, value, parent));
        if let Some(parent) = parent {
            let parent = &mut self.nodes[parent as usize];
            if kind == NodeKind::Attribute {
                parent.attributes.push(pos);
            } else {
                parent.children.push(pos);
            }
        }
        Ok(pos)
    }

    /// Opens an element; content added next goes inside it.
    ///
    /// # Errors
    ///
    /// Fails if a fragment already has its top-level node.
    pub fn start_element(&mut self, name: QName) -> CoreResult<()> {
        let pos = self.push(NodeKind::Element, Some(name), String::new())?;
        self.open.push(pos);
        Ok(())
    }

    /// Closes the innermost open element.
    ///
    /// # Errors
    ///
    /// Fails if no element is open.
    pub fn end_element(&mut self) -> CoreResult<()> {
        match self.open.last() {
            Some(&pos) if self.nodes[pos as usize].kind == NodeKind::Element => {
                self.open.pop();
                Ok(())
            }
            _ => Err(CoreError::invalid_operation("no open element to close")),
        }
    }

    /// Adds an attribute to the innermost open element, or makes it the root
    /// of an empty fragment.
    ///
    /// # Errors
    ///
    /// - `NameCollision` if the element already has an attribute with this name
    /// - `XQTY0024` if the element already has child content
    /// - `XPTY0004` if the innermost open node is a document
    pub fn attribute(&mut self, name: QName, value: impl Into<String>) -> CoreResult<()> {
        if let Some(&owner) = self.open.last() {
            let element = &self.nodes[owner as usize];
            if element.kind != NodeKind::Element {
                return Err(CoreError::evaluation(
                    "XPTY0004",
                    format!("attribute {} cannot be added to a document node", name.lexical()),
                ));
            }
            if !element.children.is_empty() {
                return Err(CoreError::evaluation(
                    "XQTY0024",
                    format!(
                        "attribute {} follows child content of element {}",
                        name.lexical(),
                        element.name.as_ref().map(QName::lexical).unwrap_or_default()
                    ),
                ));
            }
            let collides = element
                .attributes
                .iter()
                .any(|&a| self.nodes[a as usize].name.as_ref() == Some(&name));
            if collides {
                return Err(CoreError::NameCollision {
                    name: name.lexical(),
                });
            }
        }
        self.push(NodeKind::Attribute, Some(name), value.into())?;
        Ok(())
    }

    /// Adds text, merging it into a directly preceding text node.
    ///
    /// # Errors
    ///
    /// Fails if a fragment already has its top-level node.
    pub fn text(&mut self, value: &str) -> CoreResult<()> {
        if value.is_empty() {
            return Ok(());
        }
        if let Some(&parent) = self.open.last() {
            if let Some(&last) = self.nodes[parent as usize].children.last() {
                let last = &mut self.nodes[last as usize];
                if last.kind == NodeKind::Text {
                    last.value.push_str(value);
                    return Ok(());
                }
            }
        }
        self.push(NodeKind::Text, None, value.to_string())?;
        Ok(())
    }

    /// Adds a comment.
    ///
    /// # Errors
    ///
    /// `XQDY0072` if the comment contains `--` or ends with `-`.
    pub fn comment(&mut self, value: &str) -> CoreResult<()> {
        if value.contains("--") || value.ends_with('-') {
            return Err(CoreError::evaluation(
                "XQDY0072",
                "comment content must not contain '--' or end with '-'",
            ));
        }
        self.push(NodeKind::Comment, None, value.to_string())?;
        Ok(())
    }

    /// Adds a processing instruction.
    ///
    /// # Errors
    ///
    /// `XQDY0026` if the data contains `?>`, `XQDY0064` for an `xml` target.
    pub fn processing_instruction(&mut self, target: &str, data: &str) -> CoreResult<()> {
        if target.eq_ignore_ascii_case("xml") {
            return Err(CoreError::evaluation(
                "XQDY0064",
                "processing instruction target must not be 'xml'",
            ));
        }
        if data.contains("?>") {
            return Err(CoreError::evaluation(
                "XQDY0026",
                "processing instruction data must not contain '?>'",
            ));
        }
        self.push(
            NodeKind::ProcessingInstruction,
            Some(QName::local(target)),
            data.trim_start().to_string(),
        )?;
        Ok(())
    }

    /// Deep-copies `node` into the current position.
    ///
    /// Copying a document node copies its children. Copying an attribute is
    /// subject to the same rules as [`Self::attribute`].
    ///
    /// # Errors
    ///
    /// Propagates the construction errors of the copied content.
    pub fn copy(&mut self, node: &NodeRef) -> CoreResult<()> {
        match node.kind() {
            NodeKind::Document => {
                for child in node.children() {
                    self.copy(&child)?;
                }
                Ok(())
            }
            NodeKind::Element => {
                let name = node.name().cloned().unwrap_or_else(|| QName::local(""));
                self.start_element(name)?;
                for attr in node.attributes() {
                    self.copy(&attr)?;
                }
                for child in node.children() {
                    self.copy(&child)?;
                }
                self.end_element()
            }
            NodeKind::Attribute => {
                let name = node.name().cloned().unwrap_or_else(|| QName::local(""));
                self.attribute(name, node.raw_value())
            }
            NodeKind::Text => self.text(node.raw_value()),
            NodeKind::Comment => self.comment(node.raw_value()),
            NodeKind::ProcessingInstruction => {
                let target = node.name().map(|n| n.local.clone()).unwrap_or_default();
                self.processing_instruction(&target, node.raw_value())
            }
        }
    }

    /// Finishes the tree.
    ///
    /// # Errors
    ///
    /// Fails if elements are still open or a fragment is empty.
    pub fn finish(mut self) -> CoreResult<Tree> {
        let still_open = self.open.len() - usize::from(self.is_document);
        if still_open > 0 {
            return Err(CoreError::invalid_operation(format!(
                "{still_open} element(s) left open"
            )));
        }
        if self.nodes.is_empty() {
            return Err(CoreError::invalid_operation("empty fragment"));
        }

        for pos in (0..self.nodes.len()).rev() {
            let node = &self.nodes[pos];
            let end = match (node.children.last(), node.attributes.last()) {
                (Some(&child), _) => self.nodes[child as usize].end,
                (None, Some(&attr)) => attr,
                (None, None) => pos as u32,
            };
            self.nodes[pos].end = end;
        }

        Ok(Tree { nodes: self.nodes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element_with(attrs: &[(&str, &str)]) -> CoreResult<Tree> {
        let mut b = TreeBuilder::fragment();
        b.start_element(QName::local("e"))?;
        for (name, value) in attrs {
            b.attribute(QName::local(*name), *value)?;
        }
        b.end_element()?;
        b.finish()
    }

    #[test]
    fn duplicate_attribute_is_a_name_collision() {
        let err = element_with(&[("a", "1"), ("a", "2")]).unwrap_err();
        assert!(matches!(err, CoreError::NameCollision { ref name } if name == "a"));
    }

    #[test]
    fn distinct_attributes_keep_declaration_order() {
        let tree = element_with(&[("b", "1"), ("a", "2")]).unwrap();
        let root = NodeRef::constructed(tree);
        let names: Vec<String> = root
            .attributes()
            .iter()
            .map(|a| a.name().unwrap().lexical())
            .collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn attribute_after_content_is_rejected() {
        let mut b = TreeBuilder::fragment();
        b.start_element(QName::local("e")).unwrap();
        b.text("content").unwrap();
        let err = b.attribute(QName::local("late"), "x").unwrap_err();
        assert_eq!(err.query_code(), Some("XQTY0024"));
    }

    #[test]
    fn adjacent_text_is_merged() {
        let mut b = TreeBuilder::fragment();
        b.start_element(QName::local("e")).unwrap();
        b.text("a").unwrap();
        b.text("").unwrap();
        b.text("b").unwrap();
        b.end_element().unwrap();
        let root = NodeRef::constructed(b.finish().unwrap());
        assert_eq!(root.children().len(), 1);
        assert_eq!(root.string_value(), "ab");
    }

    #[test]
    fn copy_of_document_copies_children() {
        let mut src = TreeBuilder::document();
        src.start_element(QName::local("x")).unwrap();
        src.attribute(QName::local("k"), "v").unwrap();
        src.end_element().unwrap();
        let src = NodeRef::constructed(src.finish().unwrap());

        let mut b = TreeBuilder::fragment();
        b.start_element(QName::local("wrap")).unwrap();
        b.copy(&src).unwrap();
        b.end_element().unwrap();
        let copy = NodeRef::constructed(b.finish().unwrap());

        let x = &copy.children()[0];
        assert_eq!(x.name().unwrap().local, "x");
        assert_eq!(x.attributes()[0].raw_value(), "v");
    }

    #[test]
    fn unclosed_element_fails_finish() {
        let mut b = TreeBuilder::document();
        b.start_element(QName::local("open")).unwrap();
        assert!(b.finish().is_err());
    }
}
