//! # STEPWISE
//!
//! Capture what a user does on a page, replay it as a workflow a human can
//! supervise.
//!
//! ## Features
//!
//! - **Recording**: turn clicks, typing and navigation into events with robust locators
//! - **Workflows**: validated step documents with branches, loops and variables
//! - **Replay**: a controller that pauses, retries and waits for approval
//! - **Transport**: controller and driver only exchange serde messages
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stepwise::prelude::*;
//!
//! # async fn demo() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let workflow = Workflow::from_json(&std::fs::read_to_string("checkout.json")?)?;
//!
//! let page = Arc::new(SimulatedPage::new());
//! let (transport, end) = in_process();
//! Driver::new(StepExecutor::new(page), end).spawn();
//! let (controller, _) = Controller::new(transport, Arc::new(MemoryRunStore::new())).spawn();
//!
//! controller.start(workflow).await?;
//! loop {
//!     let snap = controller.wait_until(|s| s.in_flight.is_none()).await?;
//!     match snap.status() {
//!         Some(RunStatus::Paused) => controller.resume().await?,
//!         _ => break,
//!     }
//! }
//! # Ok(())
//! # }
//! ```

// Re-export the step model and locators
pub use stepwise_core::*;

pub use stepwise_recorder as recorder;
pub use stepwise_replay as replay;

pub use stepwise_recorder::{
    EventRecorder, EventType, RecordedEvent, RecorderConfig, RecordingExport, RecordingStorage, ScriptedSource,
};
pub use stepwise_replay::{
    Controller, ControllerConfig, ControllerError, ControllerHandle, Driver, ExecutorConfig, FileRunStore,
    MemoryRunStore, RunStore, SimulatedPage, Snapshot, StepExecutor,
};

/// Prelude - import everything you need
pub mod prelude {
    pub use stepwise_core::prelude::*;
    pub use stepwise_recorder::prelude::*;
    pub use stepwise_replay::prelude::*;
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use super::recorder::Interaction;
    use serde_json::json;
    use std::sync::Arc;

    const URL: &str = "https://shop.test/";

    fn page() -> NodeSpec {
        NodeSpec::new("html").child(
            NodeSpec::new("body")
                .child(NodeSpec::new("input").attr("id", "q").attr("name", "q"))
                .child(NodeSpec::new("button").attr("id", "submit-btn").text("Search")),
        )
    }

    /// Record two interactions, hand-build the matching steps from the
    /// recorded locators, and replay them.
    #[tokio::test(start_paused = true)]
    async fn recorded_locators_replay() {
        let doc = DomTree::build(page());
        let source = Arc::new(ScriptedSource::new());
        let recorder = EventRecorder::new(source.clone());
        recorder.start(None).unwrap();

        let q = doc.find("#q").unwrap();
        let button = doc.find("button").unwrap();
        source.emit(&doc, Interaction::input(q, "pears", URL));
        source.emit(
            &doc,
            Interaction::click(button, 10.0, 10.0, URL, Viewport { width: 1280, height: 800 }),
        );
        let export = recorder.stop().unwrap();
        assert_eq!(export.event_count, 2);
        let click = &export.events[1];
        assert_eq!(click.target.locator, Locator::css("#submit-btn"));

        let workflow = Workflow::parse(&json!({
            "name": "replayed",
            "settings": {"supervisedMode": false},
            "steps": [
                {"id": "open", "type": "goto", "url": URL},
                {"id": "type", "type": "type", "selector": export.events[0].target.locator, "text": "pears"},
                {"id": "click", "type": "click", "selector": click.target.locator}
            ]
        }))
        .unwrap();

        let sim = Arc::new(SimulatedPage::new().with_page(URL, page()));
        let (transport, end) = in_process();
        Driver::new(StepExecutor::new(sim.clone()), end).spawn();
        let (controller, _) = Controller::new(transport, Arc::new(MemoryRunStore::new())).spawn();
        controller.start(workflow).await.unwrap();
        let run = controller.wait_for_end().await.unwrap();

        assert_eq!(run.status(), RunStatus::Completed);
        assert_eq!(sim.clicks(), vec![button]);
    }
}
