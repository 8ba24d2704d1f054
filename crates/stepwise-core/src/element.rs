//! Element snapshots handed out by a [`Document`](crate::environment::Document)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Handle to a node of a live document. Ids are assigned in document order,
/// so comparing two ids compares their position in the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// Read-only view of one element: its tag, attributes (in document order)
/// and the text it directly owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementInfo {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attributes: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ElementInfo {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into().to_ascii_lowercase(),
            attributes: Vec::new(),
            text: None,
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Non-empty `id` attribute.
    pub fn id(&self) -> Option<&str> {
        self.attribute("id").filter(|id| !id.trim().is_empty())
    }

    pub fn classes(&self) -> Vec<&str> {
        self.attribute("class")
            .map(|c| c.split_whitespace().collect())
            .unwrap_or_default()
    }

    pub fn data_attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes
            .iter()
            .filter(|(k, _)| k.starts_with("data-"))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Links, buttons and anything announcing itself as a button.
    pub fn is_interactive(&self) -> bool {
        self.tag == "a" || self.tag == "button" || self.attribute("role") == Some("button")
    }

    pub fn attribute_map(&self) -> BTreeMap<String, String> {
        self.attributes.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn button() -> ElementInfo {
        let mut e = ElementInfo::new("BUTTON");
        e.attributes = vec![
            ("class".into(), "btn  primary".into()),
            ("data-test".into(), "go".into()),
            ("id".into(), "  ".into()),
        ];
        e
    }

    #[test]
    fn tag_is_lowercased() {
        assert_eq!(button().tag, "button");
    }

    #[test]
    fn blank_id_is_no_id() {
        assert_eq!(button().id(), None);
    }

    #[test]
    fn classes_and_data_attributes() {
        let e = button();
        assert_eq!(e.classes(), vec!["btn", "primary"]);
        assert_eq!(e.data_attributes().collect::<Vec<_>>(), vec![("data-test", "go")]);
        assert!(e.is_interactive());
    }
}
