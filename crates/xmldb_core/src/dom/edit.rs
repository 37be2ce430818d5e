//! Node-level changes to stored trees.
//!
//! Trees are immutable, so an update produces a new tree: the old one is
//! walked in document order and re-emitted through a [`TreeBuilder`], with
//! the change made at the target position. The builder's construction rules
//! apply to the result, so a rename onto an existing attribute name fails
//! with `NameCollision` just as a constructor would.

use super::{NodeKind, NodeRef, QName, Tree, TreeBuilder};
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

/// Where inserted content goes relative to the target node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InsertPosition {
    /// As preceding siblings of the target.
    Before,
    /// As following siblings of the target.
    After,
    /// As the last children of the target element.
    Into,
}

/// A change to one node of a tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeUpdate {
    /// Insert the children of a fragment tree.
    Insert {
        /// Placement relative to the target.
        position: InsertPosition,
        /// Content, as parsed by `parse_fragment`.
        content: Tree,
    },
    /// Replace the node with the children of a fragment tree.
    Replace {
        /// Content, as parsed by `parse_fragment`.
        content: Tree,
    },
    /// Set the value: an element's content becomes one text node.
    Value(String),
    /// Change the name of an element, attribute or processing instruction.
    Rename(QName),
    /// Remove the node and its subtree.
    Remove,
}

impl NodeUpdate {
    /// Returns true if the update leaves every other node at its position.
    ///
    /// Only then can index entries be refreshed node by node.
    #[must_use]
    pub fn keeps_positions(&self, before: &Tree, after: &Tree) -> bool {
        matches!(self, Self::Value(_) | Self::Rename(_)) && before.len() == after.len()
    }
}

/// Checks that `update` makes sense for the node at `target`.
///
/// # Errors
///
/// - `InvalidOperation` for the document node, for inserting next to an
///   attribute or into a non-element, and for renaming text or comments
pub fn check_update(node: &NodeRef, update: &NodeUpdate) -> CoreResult<()> {
    let kind = node.kind();
    let refused = match (update, kind) {
        (_, NodeKind::Document) => Some("the document node cannot be updated"),
        (NodeUpdate::Insert { position: InsertPosition::Into, .. }, other)
            if other != NodeKind::Element =>
        {
            Some("content can only be inserted into an element")
        }
        (NodeUpdate::Insert { .. } | NodeUpdate::Replace { .. }, NodeKind::Attribute) => {
            Some("an attribute can only be renamed, removed or given a new value")
        }
        (NodeUpdate::Rename(_), NodeKind::Text | NodeKind::Comment) => {
            Some("text and comment nodes have no name")
        }
        _ => None,
    };
    match refused {
        Some(reason) => Err(CoreError::invalid_operation(format!(
            "{reason} ({} at position {})",
            kind.test_name(),
            node.position()
        ))),
        None => Ok(()),
    }
}

/// Returns `tree` with `update` applied to the node at `target`.
///
/// The result must still be a document with exactly one root element.
///
/// # Errors
///
/// - `InvalidOperation` from [`check_update`], or if the root element
///   would be removed or duplicated
/// - `NameCollision` and the other construction errors of [`TreeBuilder`]
pub fn apply_update(tree: &Tree, target: u32, update: &NodeUpdate) -> CoreResult<Tree> {
    let root = NodeRef::constructed(tree.clone());
    let node = root
        .sibling_at(target)
        .ok_or_else(|| CoreError::invalid_operation(format!("no node at position {target}")))?;
    check_update(&node, update)?;

    let mut builder = TreeBuilder::document();
    for child in root.children() {
        rebuild(&mut builder, &child, target, update)?;
    }
    let updated = builder.finish()?;

    let roots = NodeRef::constructed(updated.clone())
        .children()
        .iter()
        .filter(|c| c.kind() == NodeKind::Element)
        .count();
    if roots != 1 {
        return Err(CoreError::invalid_operation(format!(
            "update would leave the document with {roots} root elements"
        )));
    }
    Ok(updated)
}

fn rebuild(
    b: &mut TreeBuilder,
    node: &NodeRef,
    target: u32,
    update: &NodeUpdate,
) -> CoreResult<()> {
    if node.position() == target {
        return apply_at(b, node, update);
    }
    if !node.spans(target) || node.kind() != NodeKind::Element {
        return b.copy(node);
    }
    b.start_element(element_name(node))?;
    for attr in node.attributes() {
        rebuild(b, &attr, target, update)?;
    }
    for child in node.children() {
        rebuild(b, &child, target, update)?;
    }
    b.end_element()
}

fn apply_at(b: &mut TreeBuilder, node: &NodeRef, update: &NodeUpdate) -> CoreResult<()> {
    match update {
        NodeUpdate::Insert { position, content } => match position {
            InsertPosition::Before => {
                insert(b, content)?;
                b.copy(node)
            }
            InsertPosition::After => {
                b.copy(node)?;
                insert(b, content)
            }
            InsertPosition::Into => {
                b.start_element(element_name(node))?;
                copy_content(b, node)?;
                insert(b, content)?;
                b.end_element()
            }
        },
        NodeUpdate::Replace { content } => insert(b, content),
        NodeUpdate::Remove => Ok(()),
        NodeUpdate::Value(value) => match node.kind() {
            NodeKind::Element => {
                b.start_element(element_name(node))?;
                for attr in node.attributes() {
                    b.copy(&attr)?;
                }
                b.text(value)?;
                b.end_element()
            }
            NodeKind::Attribute => b.attribute(element_name(node), value.as_str()),
            NodeKind::Text => b.text(value),
            NodeKind::Comment => b.comment(value),
            NodeKind::ProcessingInstruction => b.processing_instruction(&pi_target(node), value),
            NodeKind::Document => b.copy(node),
        },
        NodeUpdate::Rename(name) => match node.kind() {
            NodeKind::Element => {
                b.start_element(name.clone())?;
                copy_content(b, node)?;
                b.end_element()
            }
            NodeKind::Attribute => b.attribute(name.clone(), node.raw_value()),
            NodeKind::ProcessingInstruction => {
                b.processing_instruction(&name.local, node.raw_value())
            }
            _ => b.copy(node),
        },
    }
}

fn insert(b: &mut TreeBuilder, content: &Tree) -> CoreResult<()> {
    b.copy(&NodeRef::constructed(content.clone()))
}

fn copy_content(b: &mut TreeBuilder, element: &NodeRef) -> CoreResult<()> {
    for attr in element.attributes() {
        b.copy(&attr)?;
    }
    for child in element.children() {
        b.copy(&child)?;
    }
    Ok(())
}

fn element_name(node: &NodeRef) -> QName {
    node.name().cloned().unwrap_or_else(|| QName::local(""))
}

fn pi_target(node: &NodeRef) -> String {
    node.name().map(|n| n.local.clone()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{parse_document, parse_fragment, serialize_node};

    const XML: &str = r#"<list><item id="1">one</item><item id="2">two</item><?sort asc?></list>"#;

    fn position_of(tree: &Tree, test: impl Fn(&NodeRef) -> bool) -> u32 {
        let root = NodeRef::constructed(tree.clone());
        root.descendants(true)
            .into_iter()
            .flat_map(|n| {
                let mut all = n.attributes();
                all.insert(0, n);
                all
            })
            .find(|n| test(n))
            .map(|n| n.position())
            .unwrap()
    }

    fn second_item(tree: &Tree) -> u32 {
        position_of(tree, |n| n.name() == Some(&QName::local("item")) && n.string_value() == "two")
    }

    fn xml(tree: Tree) -> String {
        serialize_node(&NodeRef::constructed(tree)).unwrap()
    }

    #[test]
    fn insert_before_after_and_into() {
        let tree = parse_document(XML, false).unwrap();
        let target = second_item(&tree);
        let content = |s| parse_fragment(s, false).unwrap();

        let before = NodeUpdate::Insert {
            position: InsertPosition::Before,
            content: content("<new/>"),
        };
        assert_eq!(
            xml(apply_update(&tree, target, &before).unwrap()),
            r#"<list><item id="1">one</item><new/><item id="2">two</item><?sort asc?></list>"#
        );

        let after = NodeUpdate::Insert {
            position: InsertPosition::After,
            content: content("<x/>tail"),
        };
        assert_eq!(
            xml(apply_update(&tree, target, &after).unwrap()),
            r#"<list><item id="1">one</item><item id="2">two</item><x/>tail<?sort asc?></list>"#
        );

        let into = NodeUpdate::Insert {
            position: InsertPosition::Into,
            content: content("<sub/>"),
        };
        assert_eq!(
            xml(apply_update(&tree, target, &into).unwrap()),
            r#"<list><item id="1">one</item><item id="2">two<sub/></item><?sort asc?></list>"#
        );
    }

    #[test]
    fn value_rename_and_remove() {
        let tree = parse_document(XML, false).unwrap();
        let id = position_of(&tree, |n| n.kind() == NodeKind::Attribute && n.raw_value() == "2");

        let renamed = apply_update(&tree, id, &NodeUpdate::Rename(QName::local("key"))).unwrap();
        assert_eq!(renamed.len(), tree.len());
        assert!(NodeUpdate::Rename(QName::local("key")).keeps_positions(&tree, &renamed));

        let valued = apply_update(&tree, id, &NodeUpdate::Value("22".into())).unwrap();
        assert!(xml(valued).contains(r#"<item id="22">two</item>"#));

        let removed = apply_update(&tree, second_item(&tree), &NodeUpdate::Remove).unwrap();
        assert_eq!(xml(removed), r#"<list><item id="1">one</item><?sort asc?></list>"#);

        let pi = position_of(&tree, |n| n.kind() == NodeKind::ProcessingInstruction);
        let renamed = apply_update(&tree, pi, &NodeUpdate::Rename(QName::local("order"))).unwrap();
        assert!(xml(renamed).ends_with("<?order asc?></list>"));
    }

    #[test]
    fn element_value_replaces_children_but_keeps_attributes() {
        let tree = parse_document(r#"<a k="v"><b/>x<c/></a>"#, false).unwrap();
        let a = position_of(&tree, |n| n.name() == Some(&QName::local("a")));
        let updated = apply_update(&tree, a, &NodeUpdate::Value("plain".into())).unwrap();
        assert_eq!(xml(updated), r#"<a k="v">plain</a>"#);
    }

    #[test]
    fn construction_rules_still_apply() {
        let tree = parse_document(r#"<a x="1" y="2"/>"#, false).unwrap();
        let y = position_of(&tree, |n| n.name() == Some(&QName::local("y")));
        let err = apply_update(&tree, y, &NodeUpdate::Rename(QName::local("x"))).unwrap_err();
        assert!(matches!(err, CoreError::NameCollision { .. }), "{err:?}");

        let a = position_of(&tree, |n| n.name() == Some(&QName::local("a")));
        let err = apply_update(&tree, a, &NodeUpdate::Remove).unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));
        let twin = NodeUpdate::Insert {
            position: InsertPosition::After,
            content: parse_fragment("<b/>", false).unwrap(),
        };
        assert!(apply_update(&tree, a, &twin).is_err());

        let into_attr = NodeUpdate::Insert {
            position: InsertPosition::Into,
            content: parse_fragment("<b/>", false).unwrap(),
        };
        assert!(apply_update(&tree, y, &into_attr).is_err());
        assert!(apply_update(&tree, 0, &NodeUpdate::Remove).is_err());
    }
}
