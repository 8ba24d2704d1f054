//! stepwise-replay - Supervised replay of step workflows
//!
//! Two actors split the work:
//!
//! - the [`Controller`] owns the [`Run`](stepwise_core::Run) and decides
//!   pause, resume, retry and termination
//! - the [`Driver`] hosts a [`StepExecutor`] next to the live environment and
//!   only ever executes what it is told
//!
//! They talk over a [`Transport`] / [`DriverChannel`] pair carrying serde
//! messages, so the in-process channels here can be swapped for any byte
//! transport.
//!
//! ```no_run
//! use std::sync::Arc;
//! use stepwise_replay::prelude::*;
//!
//! # async fn demo(workflow: stepwise_core::Workflow) -> Result<(), Box<dyn std::error::Error>> {
//! let page = Arc::new(SimulatedPage::new());
//! let (transport, end) = in_process();
//! Driver::new(StepExecutor::new(page), end).spawn();
//! let (controller, _) = Controller::new(transport, Arc::new(MemoryRunStore::new())).spawn();
//!
//! controller.start(workflow).await?;
//! let run = controller.wait_for_end().await?;
//! println!("{:?}", run.status());
//! # Ok(())
//! # }
//! ```

pub mod controller;
pub mod driver;
pub mod executor;
pub mod sim;
pub mod store;
pub mod transport;

pub use controller::{Controller, ControllerConfig, ControllerError, ControllerHandle, Snapshot};
pub use driver::Driver;
pub use executor::{ExecutorConfig, StepExecutor, StepOutput};
pub use sim::SimulatedPage;
pub use store::{FileRunStore, MemoryRunStore, RunRecord, RunStore, StoreError, StoredRun};
pub use transport::{
    in_process, ChannelDriverEnd, ChannelTransport, ControlSignal, DriverChannel, DriverMessage, DriverResponse,
    DriverState, Transport, TransportError,
};

pub mod prelude {
    pub use crate::controller::{Controller, ControllerConfig, ControllerHandle, Snapshot};
    pub use crate::driver::Driver;
    pub use crate::executor::{ExecutorConfig, StepExecutor};
    pub use crate::sim::SimulatedPage;
    pub use crate::store::{FileRunStore, MemoryRunStore, RunStore};
    pub use crate::transport::in_process;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::tests::shop;
    use serde_json::json;
    use std::sync::Arc;
    use stepwise_core::{LogLevel, RunStatus, Workflow};

    fn wire(page: Arc<SimulatedPage>, store: Arc<dyn RunStore>) -> ControllerHandle {
        let (transport, end) = in_process();
        Driver::new(StepExecutor::new(page), end).spawn();
        Controller::new(transport, store).spawn().0
    }

    #[tokio::test(start_paused = true)]
    async fn replays_a_workflow_against_a_page() {
        let page = Arc::new(shop());
        let store = Arc::new(MemoryRunStore::new());
        let controller = wire(page.clone(), store.clone());

        let workflow = Workflow::parse(&json!({
            "name": "search the shop",
            "settings": {"supervisedMode": false},
            "steps": [
                {"id": "open", "type": "goto", "url": "https://shop.test/"},
                {"id": "names", "type": "extract", "selector": {"type": "css", "value": "li.item"}, "multiple": true, "storeAs": "names"},
                {"id": "search", "type": "type", "selector": {"type": "css", "value": "#q"}, "text": "pear", "pressEnter": true},
                {"id": "heading", "type": "extract", "selector": {"type": "css", "value": "h1"}, "storeAs": "heading"}
            ]
        }))
        .unwrap();
        let run_id = controller.start(workflow).await.unwrap();
        let run = controller.wait_for_end().await.unwrap();

        assert_eq!(run.status(), RunStatus::Completed);
        assert_eq!(run.current_step_index(), 4);
        assert_eq!(run.variables()["names"], json!(["Apple", "Pear"]));
        assert_eq!(run.variables()["heading"], json!("Results"));
        assert!(run.logs().iter().all(|l| l.level == LogLevel::Success));
        assert_eq!(page.current_url().as_deref(), Some("https://shop.test/search"));
        assert_eq!(store.get(run_id).unwrap().status, RunStatus::Completed);

        let state = controller.driver_state().await.unwrap();
        assert_eq!(state.completed, 4);
        assert_eq!(state.executing, None);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_target_pauses_with_a_screenshot() {
        let page = Arc::new(shop());
        let controller = wire(page, Arc::new(MemoryRunStore::new()));

        let workflow = Workflow::parse(&json!({
            "name": "broken",
            "settings": {"supervisedMode": false, "maxRetries": 0},
            "steps": [
                {"id": "open", "type": "goto", "url": "https://shop.test/"},
                {"id": "go", "type": "click", "selector": {"type": "css", "value": "#go"}, "timeout": 1000},
                {"id": "settle", "type": "wait", "waitType": "time", "value": 200}
            ]
        }))
        .unwrap();
        controller.start(workflow).await.unwrap();
        let snap = controller
            .wait_until(|s| s.status() == Some(RunStatus::Paused))
            .await
            .unwrap();

        let run = snap.run.unwrap();
        assert_eq!(run.current_step_index(), 1);
        let error = run.logs().last().unwrap();
        assert_eq!(error.level, LogLevel::Error);
        assert_eq!(error.step_id, "go");
        assert!(error.screenshot.is_some());
    }
}
