//! Locator - robust targets that keep working across small page changes
//!
//! [`generate`] turns a live element into a primary selector plus ordered
//! fallbacks; [`resolve`] turns a locator back into a live element.

use crate::element::{ElementInfo, NodeId};
use crate::environment::Document;
use crate::error::{Error, Result};
use crate::selector::{escape_ident, nth_of_type, quote};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Interactive targets with text at least this long get no text fallback.
const MAX_TEXT_FALLBACK_LEN: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocatorKind {
    Css,
    Xpath,
    Text,
    #[serde(alias = "ai")]
    Semantic,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    #[serde(rename = "type")]
    pub kind: LocatorKind,
    pub value: String,
    /// CSS selectors tried in order when `value` fails, most specific first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<String>,
}

impl Locator {
    pub fn new(kind: LocatorKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
            fallbacks: Vec::new(),
        }
    }

    pub fn css(value: impl Into<String>) -> Self {
        Self::new(LocatorKind::Css, value)
    }

    pub fn with_fallbacks(mut self, fallbacks: Vec<String>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    /// Primary candidate followed by the fallbacks.
    pub fn candidates(&self) -> impl Iterator<Item = (LocatorKind, &str)> {
        std::iter::once((self.kind, self.value.as_str()))
            .chain(self.fallbacks.iter().map(|f| (LocatorKind::Css, f.as_str())))
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.value)?;
        if !self.fallbacks.is_empty() {
            write!(f, " (+{} fallbacks)", self.fallbacks.len())?;
        }
        Ok(())
    }
}

/// Build a locator for `node`.
///
/// An id wins outright, then the first `data-*` attribute that is unique in the
/// document. Otherwise the unique class combination, the ancestor path and, for
/// links and buttons, a text match are collected in that order; the first is the
/// primary and the rest become fallbacks.
pub fn generate<D: Document + ?Sized>(doc: &D, node: NodeId) -> Result<Locator> {
    let element = doc
        .element(node)
        .ok_or_else(|| Error::target_not_found(&format!("node {}", node.0)))?;

    if let Some(id) = element.id() {
        return Ok(Locator::css(format!("#{}", escape_ident(id))));
    }

    for (name, value) in element.data_attributes() {
        let candidate = format!("{}[{}={}]", element.tag, name, quote(value));
        if doc.count(&candidate) == 1 {
            return Ok(Locator::css(candidate));
        }
    }

    let mut selectors = Vec::new();

    let classes = element.classes();
    if !classes.is_empty() {
        let candidate = classes
            .iter()
            .fold(element.tag.clone(), |acc, c| format!("{}.{}", acc, escape_ident(c)));
        if doc.count(&candidate) == 1 {
            selectors.push(candidate);
        }
    }

    selectors.push(path_selector(doc, node, &element));

    if element.is_interactive() {
        let text = doc.text_content(node);
        let text = text.trim();
        if !text.is_empty() && text.chars().count() < MAX_TEXT_FALLBACK_LEN {
            selectors.push(format!("{}:contains({})", element.tag, quote(text)));
        }
    }

    let primary = selectors.remove(0);
    tracing::trace!(primary = %primary, fallbacks = selectors.len(), "generated locator");
    Ok(Locator::css(primary).with_fallbacks(selectors))
}

/// `tag:nth-of-type(k) > ...` from the nearest ancestor with an id (or the
/// child of the `html` root) down to `node`.
fn path_selector<D: Document + ?Sized>(doc: &D, node: NodeId, element: &ElementInfo) -> String {
    let mut path: Vec<String> = Vec::new();
    let mut current = Some((node, element.clone()));

    while let Some((id, el)) = current {
        if el.tag == "html" {
            break;
        }
        if let Some(ident) = el.id() {
            path.push(format!("{}#{}", el.tag, escape_ident(ident)));
            break;
        }

        let mut segment = el.tag.clone();
        if let Some(parent) = doc.parent(id) {
            let same_tag = doc
                .children(parent)
                .into_iter()
                .filter(|c| doc.element(*c).is_some_and(|e| e.tag == el.tag))
                .count();
            if same_tag > 1 {
                segment.push_str(&format!(":nth-of-type({})", nth_of_type(doc, id, &el.tag)));
            }
        }
        path.push(segment);

        current = doc
            .parent(id)
            .and_then(|p| doc.element(p).map(|e| (p, e)));
    }

    path.reverse();
    path.join(" > ")
}

/// Find the live element a locator points at.
///
/// Candidates are tried in order and the first with exactly one match wins. If
/// none is unique, the first match of the first candidate that matched anything
/// is returned; uniqueness is only guaranteed at generation time.
pub fn resolve<D: Document + ?Sized>(doc: &D, locator: &Locator) -> Result<NodeId> {
    let mut first_ambiguous: Option<NodeId> = None;

    for (i, (kind, value)) in locator.candidates().enumerate() {
        let matches = match doc.query(kind, value) {
            Ok(m) => m,
            Err(e) if i == 0 && locator.fallbacks.is_empty() => return Err(e),
            Err(e) => {
                tracing::debug!(candidate = value, error = %e, "skipping invalid candidate");
                continue;
            }
        };
        match matches.as_slice() {
            [only] => {
                if i > 0 {
                    tracing::debug!(locator = %locator.value, fallback = value, "resolved via fallback");
                }
                return Ok(*only);
            }
            [first, ..] if first_ambiguous.is_none() => first_ambiguous = Some(*first),
            _ => {}
        }
    }

    first_ambiguous.ok_or_else(|| not_found(locator))
}

/// Every match of the first candidate that matches anything.
pub fn resolve_all<D: Document + ?Sized>(doc: &D, locator: &Locator) -> Result<Vec<NodeId>> {
    for (kind, value) in locator.candidates() {
        match doc.query(kind, value) {
            Ok(matches) if !matches.is_empty() => return Ok(matches),
            Ok(_) => {}
            Err(e) => tracing::debug!(candidate = value, error = %e, "skipping invalid candidate"),
        }
    }
    Err(not_found(locator))
}

fn not_found(locator: &Locator) -> Error {
    let mut tried = vec![locator.value.clone()];
    tried.extend(locator.fallbacks.iter().cloned());
    Error::target_not_found(&locator.to_string())
        .with_context(serde_json::json!({ "tried": tried }))
        .with_suggestions(vec![
            "Re-record the step against the current page".to_string(),
            "Add a fallback selector".to_string(),
        ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{DomTree, NodeSpec};
    use crate::error::ErrorCode;

    fn page() -> DomTree {
        DomTree::build(
            NodeSpec::new("html").child(
                NodeSpec::new("body")
                    .child(NodeSpec::new("button").attr("id", "submit-btn").text("Submit"))
                    .child(
                        NodeSpec::new("div")
                            .attr("class", "card")
                            .child(NodeSpec::new("span").attr("data-role", "price").text("10"))
                            .child(NodeSpec::new("a").attr("class", "more").text("Details")),
                    )
                    .child(
                        NodeSpec::new("div")
                            .attr("class", "card")
                            .child(NodeSpec::new("span").attr("data-role", "price").attr("data-sku", "b").text("12"))
                            .child(NodeSpec::new("a").attr("class", "more").text("Details")),
                    )
                    .child(
                        NodeSpec::new("section")
                            .attr("id", "footer")
                            .child(NodeSpec::new("button").attr("class", "link solo").text("Contact us")),
                    ),
            ),
        )
    }

    #[test]
    fn id_wins_without_fallbacks() {
        let doc = page();
        let node = doc.find("button").unwrap();
        let loc = generate(&doc, node).unwrap();
        assert_eq!(loc, Locator::css("#submit-btn"));
        let json = serde_json::to_value(&loc).unwrap();
        assert_eq!(json, serde_json::json!({"type": "css", "value": "#submit-btn"}));
    }

    #[test]
    fn unique_data_attribute_is_used() {
        let doc = page();
        let node = doc.find("span[data-sku]").unwrap();
        let loc = generate(&doc, node).unwrap();
        // data-role is shared by both cards, data-sku is not
        assert_eq!(loc.value, "span[data-sku=\"b\"]");
        assert!(loc.fallbacks.is_empty());
    }

    #[test]
    fn path_and_text_fallbacks() {
        let doc = page();
        let node = doc.find("div:nth-of-type(2) > a").unwrap();
        let loc = generate(&doc, node).unwrap();
        // a.more is not unique, so the path is primary
        assert_eq!(loc.value, "body > div:nth-of-type(2) > a");
        assert_eq!(loc.fallbacks, vec!["a:contains(\"Details\")".to_string()]);
        assert_eq!(resolve(&doc, &loc).unwrap(), node);
    }

    #[test]
    fn class_combination_then_path_stops_at_id() {
        let doc = page();
        let node = doc.find("section button").unwrap();
        let loc = generate(&doc, node).unwrap();
        assert_eq!(loc.value, "button.link.solo");
        assert_eq!(
            loc.fallbacks,
            vec![
                "section#footer > button".to_string(),
                "button:contains(\"Contact us\")".to_string()
            ]
        );
    }

    #[test]
    fn generation_is_idempotent() {
        let doc = page();
        for css in ["span[data-sku]", "div:nth-of-type(1) > a", "section button"] {
            let node = doc.find(css).unwrap();
            assert_eq!(generate(&doc, node).unwrap(), generate(&doc, node).unwrap());
        }
    }

    #[test]
    fn long_text_gets_no_text_fallback() {
        let long = "x".repeat(MAX_TEXT_FALLBACK_LEN);
        let doc = DomTree::build(
            NodeSpec::new("html").child(
                NodeSpec::new("body")
                    .child(NodeSpec::new("a").text(long))
                    .child(NodeSpec::new("a").text("short")),
            ),
        );
        let node = doc.find("a").unwrap();
        let loc = generate(&doc, node).unwrap();
        assert_eq!(loc.value, "body > a:nth-of-type(1)");
        assert!(loc.fallbacks.is_empty());
    }

    #[test]
    fn fallback_rescues_changed_page() {
        let mut doc = page();
        let node = doc.find("section button").unwrap();
        let loc = generate(&doc, node).unwrap();
        doc.set_attribute(node, "class", "link");
        assert_eq!(resolve(&doc, &loc).unwrap(), node);
    }

    #[test]
    fn ambiguous_primary_falls_back_then_first_match() {
        let doc = page();
        let loc = Locator::css("a.more").with_fallbacks(vec!["div:nth-of-type(2) > a".into()]);
        let second = doc.find("div:nth-of-type(2) > a").unwrap();
        assert_eq!(resolve(&doc, &loc).unwrap(), second);

        let loc = Locator::css("a.more");
        let first = doc.find("a.more").unwrap();
        assert_eq!(resolve(&doc, &loc).unwrap(), first);
    }

    #[test]
    fn not_found_names_locator() {
        let doc = page();
        let err = resolve(&doc, &Locator::css("#missing").with_fallbacks(vec!["nav".into()])).unwrap_err();
        assert_eq!(err.code, ErrorCode::TargetNotFound);
        assert!(err.message.contains("#missing"));
    }

    #[test]
    fn invalid_primary_alone_is_selector_error() {
        let doc = page();
        let err = resolve(&doc, &Locator::css("div[")).unwrap_err();
        assert_eq!(err.code, ErrorCode::SelectorInvalid);
    }

    #[test]
    fn resolve_all_returns_every_match() {
        let doc = page();
        let all = resolve_all(&doc, &Locator::css("span[data-role=\"price\"]")).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn semantic_alias_parses() {
        let loc: Locator = serde_json::from_str(r#"{"type":"ai","value":"Search box"}"#).unwrap();
        assert_eq!(loc.kind, LocatorKind::Semantic);
    }
}
