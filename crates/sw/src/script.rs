//! Fixture pages for `sw run` and scripted sessions for `sw capture`

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use stepwise::prelude::*;
use stepwise::recorder::Interaction;

/// Pages served to the replay driver, keyed by absolute URL.
#[derive(Debug, Deserialize)]
pub struct Fixture {
    pub pages: BTreeMap<String, NodeSpec>,
    /// Served for any URL not listed in `pages`
    #[serde(default)]
    pub fallback: Option<NodeSpec>,
}

impl Fixture {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing fixture {}", path.display()))
    }

    pub fn into_page(self) -> SimulatedPage {
        let page = SimulatedPage::new();
        for (url, spec) in self.pages {
            page.add_page(url, spec);
        }
        if let Some(spec) = self.fallback {
            page.set_fallback(spec);
        }
        page
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Action {
    Click {
        selector: String,
    },
    Input {
        selector: String,
        value: String,
    },
    Change {
        selector: String,
        value: String,
    },
    Key {
        selector: String,
        key: String,
        #[serde(default)]
        code: Option<String>,
        #[serde(flatten)]
        modifiers: Modifiers,
    },
    Submit {
        selector: String,
    },
    Scroll {
        #[serde(default)]
        x: f64,
        y: f64,
    },
    Navigate {
        url: String,
    },
}

/// A page plus the interactions to perform on it, in order.
#[derive(Debug, Deserialize)]
pub struct Script {
    pub url: String,
    #[serde(default = "default_viewport")]
    pub viewport: Viewport,
    pub page: NodeSpec,
    pub actions: Vec<Action>,
}

fn default_viewport() -> Viewport {
    Viewport {
        width: 1280,
        height: 800,
    }
}

impl Script {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing script {}", path.display()))
    }

    /// Play the actions through a scripted source while `recorder` is
    /// recording and return what it captured.
    pub fn record(
        &self,
        recorder: &EventRecorder,
        source: &ScriptedSource,
        session: Option<String>,
    ) -> Result<RecordingExport> {
        let doc = DomTree::build(self.page.clone());
        let mut url = self.url.clone();
        recorder.start(session)?;

        for (i, action) in self.actions.iter().enumerate() {
            let find = |selector: &str| {
                doc.find(selector)
                    .ok_or_else(|| anyhow!("action {}: no element matches `{}`", i, selector))
            };
            let interaction = match action {
                Action::Click { selector } => {
                    let node = find(selector)?;
                    Interaction::click(node, 0.0, 0.0, url.as_str(), self.viewport)
                }
                Action::Input { selector, value } => Interaction::input(find(selector)?, value.as_str(), url.as_str()),
                Action::Change { selector, value } => Interaction::change(find(selector)?, value.as_str(), url.as_str()),
                Action::Key {
                    selector,
                    key,
                    code,
                    modifiers,
                } => {
                    let code = code.clone().unwrap_or_else(|| key.clone());
                    Interaction::key(find(selector)?, key.as_str(), code, *modifiers, url.as_str())
                }
                Action::Submit { selector } => Interaction::submit(find(selector)?, url.as_str()),
                Action::Scroll { x, y } => Interaction::scroll(*x, *y, url.as_str()),
                Action::Navigate { url: next } => {
                    url = next.clone();
                    Interaction::navigation(url.as_str())
                }
            };
            if !source.emit(&doc, interaction) {
                tracing::debug!(action = i, "interaction dropped by the recorder");
            }
        }

        Ok(recorder.stop()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn script_records_locators() {
        let script: Script = serde_json::from_value(json!({
            "url": "https://shop.test/",
            "page": {"tag": "html", "children": [{"tag": "body", "children": [
                {"tag": "input", "attrs": {"id": "q"}},
                {"tag": "button", "attrs": {"id": "submit-btn"}, "text": "Go"}
            ]}]},
            "actions": [
                {"action": "input", "selector": "#q", "value": "pears"},
                {"action": "key", "selector": "#q", "key": "Enter", "shiftKey": true},
                {"action": "click", "selector": "button"},
                {"action": "navigate", "url": "https://shop.test/search"},
                {"action": "scroll", "y": 400}
            ]
        }))
        .unwrap();

        let source = Arc::new(ScriptedSource::new());
        let recorder = EventRecorder::new(source.clone());
        let export = script.record(&recorder, &source, Some("demo".into())).unwrap();

        assert_eq!(export.session_id, "demo");
        assert_eq!(export.event_count, export.events.len());
        let kinds: Vec<EventType> = export.events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds[0], EventType::Input);
        assert!(kinds.contains(&EventType::Click));
        assert!(kinds.contains(&EventType::Navigation));

        let click = export.events.iter().find(|e| e.kind == EventType::Click).unwrap();
        assert_eq!(click.target.locator, Locator::css("#submit-btn"));
        assert_eq!(click.url, "https://shop.test/");
        assert!(!recorder.is_recording());
    }

    #[test]
    fn unknown_selector_is_an_error() {
        let script: Script = serde_json::from_value(json!({
            "url": "https://shop.test/",
            "page": {"tag": "html"},
            "actions": [{"action": "click", "selector": "#nope"}]
        }))
        .unwrap();
        let source = Arc::new(ScriptedSource::new());
        let recorder = EventRecorder::new(source.clone());
        let err = script.record(&recorder, &source, None).unwrap_err();
        assert!(err.to_string().contains("#nope"));
    }

    #[test]
    fn fixture_serves_listed_pages() {
        let fixture: Fixture = serde_json::from_value(json!({
            "pages": {"https://shop.test/": {"tag": "html", "children": [{"tag": "h1", "text": "Shop"}]}}
        }))
        .unwrap();
        let page = fixture.into_page();
        page.open("https://shop.test/").unwrap();
        assert_eq!(page.current_url().as_deref(), Some("https://shop.test/"));
        assert!(page.open("https://elsewhere.test/").is_err());
    }
}
