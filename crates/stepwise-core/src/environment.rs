//! Capability interfaces supplied by whatever environment executes steps
//!
//! The locator, recorder and executor only ever see these traits, so they can be
//! driven by a real page bridge or by the in-memory [`DomTree`](crate::dom::DomTree).

use crate::element::{ElementInfo, NodeId};
use crate::error::Result;
use crate::locator::LocatorKind;
use crate::step::WaitUntil;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Structural read access to a live document.
pub trait Document: Send + Sync {
    fn root(&self) -> Option<NodeId>;

    fn element(&self, node: NodeId) -> Option<ElementInfo>;

    fn parent(&self, node: NodeId) -> Option<NodeId>;

    fn children(&self, node: NodeId) -> Vec<NodeId>;

    /// Own text plus the text of every descendant, in document order.
    fn text_content(&self, node: NodeId) -> String;

    /// All matches of `value` interpreted as `kind`, in document order.
    fn query(&self, kind: LocatorKind, value: &str) -> Result<Vec<NodeId>>;

    /// Uniqueness probe: how many elements a CSS candidate matches right now.
    /// Invalid candidates match nothing.
    fn count(&self, css: &str) -> usize {
        self.query(LocatorKind::Css, css)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

/// Change notifications raised on an element after its value is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Signal {
    Input,
    Change,
    KeyDown { key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScrollPosition {
    Top,
    Bottom,
}

/// A live page the step executor can act on.
#[async_trait]
pub trait Environment: Document {
    fn url(&self) -> Option<String>;

    /// Trigger navigation and resolve once `until` is observed. Callers bound
    /// the wait with their own deadline.
    async fn navigate(&self, url: &str, until: WaitUntil) -> Result<()>;

    /// Number of navigations completed so far. Never decreases.
    fn navigation_count(&self) -> u64;

    /// Resolve once a navigation started after `since` (a prior
    /// [`navigation_count`](Self::navigation_count)) reaches `until`.
    async fn wait_for_navigation(&self, since: u64, until: WaitUntil) -> Result<()>;

    fn scroll_into_view(&self, node: NodeId) -> Result<()>;

    /// Visible feedback only; must not change page behaviour.
    fn highlight(&self, node: NodeId, duration: Duration);

    fn click(&self, node: NodeId) -> Result<()>;

    fn focus(&self, node: NodeId) -> Result<()>;

    fn value(&self, node: NodeId) -> Option<String>;

    fn set_value(&self, node: NodeId, value: &str) -> Result<()>;

    fn dispatch(&self, node: NodeId, signal: Signal) -> Result<()>;

    fn scroll_by(&self, dx: i64, dy: i64);

    fn scroll_to(&self, position: ScrollPosition);

    /// Encoded capture of the current viewport, when the environment can take one.
    fn screenshot(&self) -> Option<String> {
        None
    }

    /// Stop signal from the controller. In-flight work is not interrupted.
    fn stop(&self) {}
}
