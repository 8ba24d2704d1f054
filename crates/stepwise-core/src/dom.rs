//! In-memory document tree
//!
//! Nodes are stored flat in document order, so [`NodeId`] ordering is document
//! ordering. Trees are built from a [`NodeSpec`], which is also the JSON fixture
//! format used by the CLI:
//!
//! ```json
//! { "tag": "button", "attrs": { "id": "go" }, "text": "Go", "children": [] }
//! ```

use crate::element::{ElementInfo, NodeId};
use crate::environment::Document;
use crate::error::Result;
use crate::locator::LocatorKind;
use crate::selector;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "ordered_attrs")]
    pub attrs: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeSpec>,
}

impl NodeSpec {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Vec::new(),
            text: None,
            children: Vec::new(),
        }
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((name.into(), value.into()));
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn child(mut self, child: NodeSpec) -> Self {
        self.children.push(child);
        self
    }
}

// Attributes are a JSON object on the wire but keep their source order in memory.
mod ordered_attrs {
    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(attrs: &[(String, String)], s: S) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(attrs.len()))?;
        for (k, v) in attrs {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<(String, String)>, D::Error> {
        struct AttrVisitor;

        impl<'de> Visitor<'de> for AttrVisitor {
            type Value = Vec<(String, String)>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of attribute names to string values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut out = Vec::new();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    out.push((k, v));
                }
                Ok(out)
            }
        }

        d.deserialize_map(AttrVisitor)
    }
}

#[derive(Debug, Clone)]
struct Node {
    element: ElementInfo,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Debug, Clone, Default)]
pub struct DomTree {
    nodes: Vec<Node>,
}

impl DomTree {
    pub fn build(spec: NodeSpec) -> Self {
        let mut tree = Self::default();
        tree.push(spec, None);
        tree
    }

    fn push(&mut self, spec: NodeSpec, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        let mut element = ElementInfo::new(spec.tag);
        element.attributes = spec.attrs;
        element.text = spec.text;
        self.nodes.push(Node {
            element,
            parent,
            children: Vec::new(),
        });
        for child in spec.children {
            let child_id = self.push(child, Some(id));
            self.nodes[id.0].children.push(child_id);
        }
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// First match of a CSS selector, mostly for tests and tooling.
    pub fn find(&self, css: &str) -> Option<NodeId> {
        self.query(LocatorKind::Css, css).ok()?.into_iter().next()
    }

    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) {
        let Some(n) = self.nodes.get_mut(node.0) else {
            return;
        };
        match n.element.attributes.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value.to_string(),
            None => n.element.attributes.push((name.to_string(), value.to_string())),
        }
    }

    pub fn remove_attribute(&mut self, node: NodeId, name: &str) {
        if let Some(n) = self.nodes.get_mut(node.0) {
            n.element.attributes.retain(|(k, _)| k != name);
        }
    }
}

impl Document for DomTree {
    fn root(&self) -> Option<NodeId> {
        (!self.nodes.is_empty()).then_some(NodeId(0))
    }

    fn element(&self, node: NodeId) -> Option<ElementInfo> {
        self.nodes.get(node.0).map(|n| n.element.clone())
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node.0).and_then(|n| n.parent)
    }

    fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.nodes
            .get(node.0)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    fn text_content(&self, node: NodeId) -> String {
        let mut out = String::new();
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            let Some(n) = self.nodes.get(id.0) else {
                continue;
            };
            if let Some(text) = &n.element.text {
                out.push_str(text);
            }
            stack.extend(n.children.iter().rev());
        }
        out
    }

    fn query(&self, kind: LocatorKind, value: &str) -> Result<Vec<NodeId>> {
        selector::select(self, kind, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_follow_document_order() {
        let tree = DomTree::build(
            NodeSpec::new("html")
                .child(NodeSpec::new("head"))
                .child(NodeSpec::new("body").child(NodeSpec::new("p").text("hi"))),
        );
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.element(NodeId(3)).unwrap().tag, "p");
        assert_eq!(tree.parent(NodeId(3)), Some(NodeId(2)));
        assert_eq!(tree.children(NodeId(0)), vec![NodeId(1), NodeId(2)]);
    }

    #[test]
    fn text_content_concatenates_descendants() {
        let tree = DomTree::build(
            NodeSpec::new("div")
                .text("a")
                .child(NodeSpec::new("span").text("b"))
                .child(NodeSpec::new("span").text("c")),
        );
        assert_eq!(tree.text_content(NodeId(0)), "abc");
    }

    #[test]
    fn fixture_json_keeps_attribute_order() {
        let spec: NodeSpec = serde_json::from_str(
            r#"{"tag":"div","attrs":{"data-z":"1","data-a":"2"},"children":[{"tag":"span","text":"x"}]}"#,
        )
        .unwrap();
        assert_eq!(spec.attrs[0].0, "data-z");
        let tree = DomTree::build(spec);
        assert_eq!(tree.count("div > span"), 1);
    }

    #[test]
    fn attributes_can_change() {
        let mut tree = DomTree::build(NodeSpec::new("input").attr("id", "q"));
        let node = tree.find("#q").unwrap();
        tree.set_attribute(node, "id", "search");
        assert!(tree.find("#q").is_none());
        assert_eq!(tree.find("#search"), Some(node));
        tree.remove_attribute(node, "id");
        assert!(tree.find("#search").is_none());
    }
}
