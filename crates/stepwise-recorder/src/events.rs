//! Recorded event types
//!
//! Every event carries a ready-to-replay [`Locator`] for its target, so a
//! recording can be turned into steps without the original page.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use stepwise_core::{Locator, NodeId};

/// A finished recording session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingExport {
    pub session_id: String,
    pub events: Vec<RecordedEvent>,
    pub event_count: usize,
}

impl RecordingExport {
    pub fn new(session_id: impl Into<String>, events: Vec<RecordedEvent>) -> Self {
        Self {
            session_id: session_id.into(),
            event_count: events.len(),
            events,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Click,
    Input,
    Keypress,
    Scroll,
    Navigation,
    Change,
    Submit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedEvent {
    #[serde(rename = "type")]
    pub kind: EventType,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub target: EventTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<EventData>,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport: Option<Viewport>,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTarget {
    pub locator: Locator,
    pub tag_name: String,
    #[serde(default)]
    pub text_content: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl EventTarget {
    /// Pseudo target for scroll events
    pub fn window() -> Self {
        Self::pseudo("window", "window")
    }

    /// Pseudo target for navigation events
    pub fn document() -> Self {
        Self::pseudo("", "document")
    }

    fn pseudo(locator: &str, tag: &str) -> Self {
        Self {
            locator: Locator::css(locator),
            tag_name: tag.to_string(),
            text_content: String::new(),
            value: String::new(),
            attributes: BTreeMap::new(),
        }
    }
}

/// Per-kind payload. Variant order matters for untagged decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventData {
    #[serde(rename_all = "camelCase")]
    Pointer { client_x: f64, client_y: f64, button: u8 },
    #[serde(rename_all = "camelCase")]
    Key {
        key: String,
        code: String,
        #[serde(flatten)]
        modifiers: Modifiers,
    },
    #[serde(rename_all = "camelCase")]
    Scroll { scroll_x: f64, scroll_y: f64 },
    Value { value: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Modifiers {
    #[serde(default)]
    pub ctrl_key: bool,
    #[serde(default)]
    pub shift_key: bool,
    #[serde(default)]
    pub alt_key: bool,
    #[serde(default)]
    pub meta_key: bool,
}

impl Modifiers {
    pub fn any(&self) -> bool {
        self.ctrl_key || self.shift_key || self.alt_key || self.meta_key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// A raw observation from an [`InteractionSource`](crate::InteractionSource),
/// before its target is converted to a locator.
#[derive(Debug, Clone, PartialEq)]
pub struct Interaction {
    pub kind: EventType,
    /// `None` for window and document level signals
    pub target: Option<NodeId>,
    /// Current value of the target, for form controls
    pub value: Option<String>,
    pub data: Option<EventData>,
    pub url: String,
    pub viewport: Option<Viewport>,
}

impl Interaction {
    fn on(kind: EventType, target: Option<NodeId>, url: impl Into<String>) -> Self {
        Self {
            kind,
            target,
            value: None,
            data: None,
            url: url.into(),
            viewport: None,
        }
    }

    pub fn click(node: NodeId, x: f64, y: f64, url: impl Into<String>, viewport: Viewport) -> Self {
        Self {
            data: Some(EventData::Pointer {
                client_x: x,
                client_y: y,
                button: 0,
            }),
            viewport: Some(viewport),
            ..Self::on(EventType::Click, Some(node), url)
        }
    }

    pub fn input(node: NodeId, value: impl Into<String>, url: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            data: Some(EventData::Value { value: value.clone() }),
            value: Some(value),
            ..Self::on(EventType::Input, Some(node), url)
        }
    }

    pub fn change(node: NodeId, value: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            kind: EventType::Change,
            ..Self::input(node, value, url)
        }
    }

    pub fn key(node: NodeId, key: impl Into<String>, code: impl Into<String>, modifiers: Modifiers, url: impl Into<String>) -> Self {
        Self {
            data: Some(EventData::Key {
                key: key.into(),
                code: code.into(),
                modifiers,
            }),
            ..Self::on(EventType::Keypress, Some(node), url)
        }
    }

    pub fn submit(form: NodeId, url: impl Into<String>) -> Self {
        Self::on(EventType::Submit, Some(form), url)
    }

    pub fn scroll(x: f64, y: f64, url: impl Into<String>) -> Self {
        Self {
            data: Some(EventData::Scroll {
                scroll_x: x,
                scroll_y: y,
            }),
            ..Self::on(EventType::Scroll, None, url)
        }
    }

    /// Navigation completed on `url`
    pub fn navigation(url: impl Into<String>) -> Self {
        Self::on(EventType::Navigation, None, url)
    }
}
