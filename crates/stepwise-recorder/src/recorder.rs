//! Event recorder: turns live interactions into locator-backed events
//!
//! An [`InteractionSource`] pushes raw observations into an [`EventSink`]. The
//! sink converts each one on arrival, while the target is still in the
//! document, and buffers it until [`EventRecorder::stop`].

use crate::events::*;
pub use crossbeam_channel::{Receiver, Sender};
use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stepwise_core::{locator, Document};
use thiserror::Error;

/// Recorder configuration
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Max characters of target text kept per event
    pub max_text_len: usize,
    /// Record individual key presses
    pub capture_keypresses: bool,
    /// Scroll sampling - record only after moving at least this many pixels
    pub scroll_threshold: f64,
    /// Max buffered events; later ones are dropped
    pub max_buffer: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_text_len: 100,
            capture_keypresses: true,
            scroll_threshold: 0.0,
            max_buffer: 10000,
        }
    }
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("not recording")]
    NotRecording,
    #[error("could not attach to interaction source: {0}")]
    Attach(#[source] anyhow::Error),
}

/// Something that can report interactions on a live page.
///
/// `attach` starts delivering observations to the sink for pointer, input,
/// key, change, submit, scroll and navigation signals. `detach` stops it.
pub trait InteractionSource: Send + Sync {
    fn attach(&self, sink: EventSink) -> anyhow::Result<()>;
    fn detach(&self);
}

struct SinkInner {
    session_id: String,
    config: RecorderConfig,
    active: AtomicBool,
    events: Mutex<Vec<RecordedEvent>>,
    last_scroll: Mutex<Option<(f64, f64)>>,
    subscribers: Arc<Mutex<Vec<Sender<RecordedEvent>>>>,
}

/// Receiving end handed to an [`InteractionSource`]. Cheap to clone.
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<SinkInner>,
}

impl EventSink {
    fn new(session_id: String, config: RecorderConfig, subscribers: Arc<Mutex<Vec<Sender<RecordedEvent>>>>) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                session_id,
                config,
                active: AtomicBool::new(true),
                events: Mutex::new(Vec::new()),
                last_scroll: Mutex::new(None),
                subscribers,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Convert and buffer one interaction. Returns whether it was recorded;
    /// after the session stops everything is dropped.
    pub fn observe(&self, doc: &dyn Document, interaction: Interaction) -> bool {
        if !self.is_active() {
            return false;
        }
        let Some(event) = self.convert(doc, interaction) else {
            return false;
        };

        {
            let mut events = self.inner.events.lock();
            if events.len() >= self.inner.config.max_buffer {
                tracing::warn!(session = %self.inner.session_id, "event buffer full, dropping event");
                return false;
            }
            events.push(event.clone());
        }

        self.inner
            .subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
        true
    }

    fn convert(&self, doc: &dyn Document, interaction: Interaction) -> Option<RecordedEvent> {
        let config = &self.inner.config;
        match interaction.kind {
            EventType::Keypress if !config.capture_keypresses => return None,
            EventType::Scroll => {
                if let Some(EventData::Scroll { scroll_x, scroll_y }) = &interaction.data {
                    let mut last = self.inner.last_scroll.lock();
                    if let Some((x, y)) = *last {
                        let moved = (scroll_x - x).abs().max((scroll_y - y).abs());
                        if moved < config.scroll_threshold {
                            return None;
                        }
                    }
                    *last = Some((*scroll_x, *scroll_y));
                }
            }
            _ => {}
        }

        let target = match (interaction.kind, interaction.target) {
            (EventType::Scroll, _) => EventTarget::window(),
            (EventType::Navigation, _) | (_, None) => EventTarget::document(),
            (_, Some(node)) => {
                let element = doc.element(node)?;
                let locator = match locator::generate(doc, node) {
                    Ok(l) => l,
                    Err(e) => {
                        tracing::warn!(error = %e, "could not build locator, dropping event");
                        return None;
                    }
                };
                let text: String = doc
                    .text_content(node)
                    .trim()
                    .chars()
                    .take(config.max_text_len)
                    .collect();
                EventTarget {
                    locator,
                    tag_name: element.tag.clone(),
                    text_content: text,
                    value: interaction.value.clone().unwrap_or_default(),
                    attributes: element.attribute_map(),
                }
            }
        };

        Some(RecordedEvent {
            kind: interaction.kind,
            timestamp: chrono::Utc::now().timestamp_millis(),
            target,
            data: interaction.data,
            url: interaction.url,
            viewport: interaction.viewport,
            session_id: self.inner.session_id.clone(),
        })
    }

    fn close(&self) -> Vec<RecordedEvent> {
        self.inner.active.store(false, Ordering::SeqCst);
        std::mem::take(&mut *self.inner.events.lock())
    }
}

/// An [`InteractionSource`] driven by explicit calls, for scripted sessions
/// and tests.
#[derive(Default)]
pub struct ScriptedSource {
    sink: Mutex<Option<EventSink>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_attached(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Deliver an interaction. Returns false when nobody is listening.
    pub fn emit(&self, doc: &dyn Document, interaction: Interaction) -> bool {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => sink.observe(doc, interaction),
            None => false,
        }
    }
}

impl InteractionSource for ScriptedSource {
    fn attach(&self, sink: EventSink) -> anyhow::Result<()> {
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn detach(&self) {
        self.sink.lock().take();
    }
}

/// The recorder. Idle until [`start`](Self::start), recording until
/// [`stop`](Self::stop).
pub struct EventRecorder {
    config: RecorderConfig,
    source: Arc<dyn InteractionSource>,
    session: Mutex<Option<EventSink>>,
    subscribers: Arc<Mutex<Vec<Sender<RecordedEvent>>>>,
}

impl EventRecorder {
    pub fn new(source: Arc<dyn InteractionSource>) -> Self {
        Self::with_config(source, RecorderConfig::default())
    }

    pub fn with_config(source: Arc<dyn InteractionSource>, config: RecorderConfig) -> Self {
        Self {
            config,
            source,
            session: Mutex::new(None),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Begin a session. Starting while already recording keeps the current
    /// session and returns its id.
    pub fn start(&self, session_id: Option<String>) -> Result<String, RecorderError> {
        let mut session = self.session.lock();
        if let Some(sink) = session.as_ref() {
            tracing::debug!(session = sink.session_id(), "already recording");
            return Ok(sink.session_id().to_string());
        }

        let id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let sink = EventSink::new(id.clone(), self.config.clone(), self.subscribers.clone());
        self.source.attach(sink.clone()).map_err(RecorderError::Attach)?;
        *session = Some(sink);
        tracing::info!(session = %id, "recording started");
        Ok(id)
    }

    /// End the session and hand out everything it captured.
    pub fn stop(&self) -> Result<RecordingExport, RecorderError> {
        let sink = self.session.lock().take().ok_or(RecorderError::NotRecording)?;
        self.source.detach();
        let events = sink.close();
        tracing::info!(session = sink.session_id(), events = events.len(), "recording stopped");
        Ok(RecordingExport::new(sink.session_id(), events))
    }

    /// Events buffered in the current session, 0 when idle.
    pub fn event_count(&self) -> usize {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.inner.events.lock().len())
            .unwrap_or(0)
    }

    /// Live stream of converted events across sessions.
    pub fn subscribe(&self) -> Receiver<RecordedEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_core::{DomTree, NodeSpec};

    const URL: &str = "https://shop.test/";

    fn page() -> DomTree {
        DomTree::build(
            NodeSpec::new("html").child(
                NodeSpec::new("body")
                    .child(NodeSpec::new("button").attr("id", "submit-btn").text("  Submit  "))
                    .child(
                        NodeSpec::new("form")
                            .attr("class", "search")
                            .child(NodeSpec::new("input").attr("name", "q").attr("data-test", "query")),
                    )
                    .child(NodeSpec::new("p").text("x".repeat(150))),
            ),
        )
    }

    fn recorder() -> (Arc<ScriptedSource>, EventRecorder) {
        let source = Arc::new(ScriptedSource::new());
        let recorder = EventRecorder::new(source.clone());
        (source, recorder)
    }

    #[test]
    fn click_on_id_target() {
        let doc = page();
        let (source, recorder) = recorder();
        let session = recorder.start(None).unwrap();
        let button = doc.find("#submit-btn").unwrap();

        let viewport = Viewport { width: 1024, height: 768 };
        assert!(source.emit(&doc, Interaction::click(button, 5.0, 6.0, URL, viewport)));
        assert_eq!(recorder.event_count(), 1);

        let export = recorder.stop().unwrap();
        assert_eq!(export.session_id, session);
        assert_eq!(export.event_count, 1);
        let event = &export.events[0];
        assert_eq!(event.kind, EventType::Click);
        assert_eq!(event.target.locator.value, "#submit-btn");
        assert!(event.target.locator.fallbacks.is_empty());
        assert_eq!(event.target.tag_name, "button");
        assert_eq!(event.target.text_content, "Submit");
        assert_eq!(event.url, URL);
        assert_eq!(event.viewport, Some(viewport));
    }

    #[test]
    fn input_uses_data_attribute_and_value() {
        let doc = page();
        let (source, recorder) = recorder();
        recorder.start(Some("s1".into())).unwrap();
        let input = doc.find("input").unwrap();
        source.emit(&doc, Interaction::input(input, "shoes", URL));
        let export = recorder.stop().unwrap();
        let target = &export.events[0].target;
        assert_eq!(target.locator.value, r#"input[data-test="query"]"#);
        assert_eq!(target.value, "shoes");
        assert_eq!(target.attributes.get("name").map(String::as_str), Some("q"));
        assert_eq!(export.events[0].session_id, "s1");
    }

    #[test]
    fn text_is_truncated() {
        let doc = page();
        let (source, recorder) = recorder();
        recorder.start(None).unwrap();
        source.emit(&doc, Interaction::click(doc.find("p").unwrap(), 0.0, 0.0, URL, Viewport { width: 1, height: 1 }));
        let export = recorder.stop().unwrap();
        assert_eq!(export.events[0].target.text_content.chars().count(), 100);
    }

    #[test]
    fn window_and_document_targets() {
        let doc = page();
        let (source, recorder) = recorder();
        recorder.start(None).unwrap();
        source.emit(&doc, Interaction::scroll(0.0, 400.0, URL));
        source.emit(&doc, Interaction::navigation("https://shop.test/cart"));
        let export = recorder.stop().unwrap();
        assert_eq!(export.events[0].target.tag_name, "window");
        assert_eq!(export.events[1].kind, EventType::Navigation);
        assert_eq!(export.events[1].target.locator.value, "");
        assert_eq!(export.events[1].url, "https://shop.test/cart");
    }

    #[test]
    fn start_while_recording_is_a_noop() {
        let doc = page();
        let (source, recorder) = recorder();
        let first = recorder.start(None).unwrap();
        source.emit(&doc, Interaction::submit(doc.find("form").unwrap(), URL));
        let second = recorder.start(Some("other".into())).unwrap();
        assert_eq!(first, second);
        assert_eq!(recorder.event_count(), 1);
    }

    #[test]
    fn stop_while_idle_errors_and_late_events_drop() {
        let doc = page();
        let (source, recorder) = recorder();
        assert!(matches!(recorder.stop(), Err(RecorderError::NotRecording)));

        recorder.start(None).unwrap();
        recorder.stop().unwrap();
        assert!(!source.is_attached());
        assert!(!source.emit(&doc, Interaction::navigation(URL)));
        assert_eq!(recorder.event_count(), 0);
    }

    #[test]
    fn stopped_sink_ignores_stragglers() {
        let doc = page();
        let (source, recorder) = recorder();
        recorder.start(None).unwrap();
        let sink = source.sink.lock().clone().unwrap();
        recorder.stop().unwrap();
        assert!(!sink.observe(&doc, Interaction::navigation(URL)));
    }

    #[test]
    fn subscribers_see_events_live() {
        let doc = page();
        let (source, recorder) = recorder();
        let rx = recorder.subscribe();
        recorder.start(None).unwrap();
        source.emit(&doc, Interaction::navigation(URL));
        assert_eq!(rx.try_recv().unwrap().kind, EventType::Navigation);
    }

    #[test]
    fn config_filters_keys_and_small_scrolls() {
        let doc = page();
        let source = Arc::new(ScriptedSource::new());
        let config = RecorderConfig {
            capture_keypresses: false,
            scroll_threshold: 100.0,
            ..Default::default()
        };
        let recorder = EventRecorder::with_config(source.clone(), config);
        recorder.start(None).unwrap();
        let input = doc.find("input").unwrap();
        assert!(!source.emit(&doc, Interaction::key(input, "a", "KeyA", Modifiers::default(), URL)));
        assert!(source.emit(&doc, Interaction::scroll(0.0, 0.0, URL)));
        assert!(!source.emit(&doc, Interaction::scroll(0.0, 50.0, URL)));
        assert!(source.emit(&doc, Interaction::scroll(0.0, 150.0, URL)));
        assert_eq!(recorder.event_count(), 2);
    }
}
