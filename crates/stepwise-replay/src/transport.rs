//! Execution transport between the controller and the driver
//!
//! Messages are plain serde values tagged by `type`, so the same contract can
//! be carried by the in-process channel pair here or by any byte transport.

use crate::executor::StepOutput;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stepwise_core::{Error, Step, Variables};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

/// Controller to driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DriverMessage {
    #[serde(rename_all = "camelCase")]
    Execute {
        run_id: Uuid,
        index: usize,
        step: Step,
        /// Steps the dispatched step runs inline
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        scope: Vec<Step>,
        #[serde(default)]
        variables: Variables,
        #[serde(default)]
        screenshot_on_error: bool,
    },
    /// Out-of-band signal, handled even while a step is executing
    Control { signal: ControlSignal },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ControlSignal {
    Pause,
    Resume,
    Stop,
    GetState,
}

/// Driver to controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DriverResponse {
    #[serde(rename_all = "camelCase")]
    StepCompleted {
        run_id: Uuid,
        index: usize,
        #[serde(default)]
        output: StepOutput,
    },
    #[serde(rename_all = "camelCase")]
    StepFailed {
        run_id: Uuid,
        index: usize,
        error: Error,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        screenshot: Option<String>,
    },
    State { state: DriverState },
}

/// Reply to [`ControlSignal::GetState`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverState {
    /// Run and index of the step currently executing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executing: Option<(Uuid, usize)>,
    /// Most recently dispatched step, finished or not
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<(Uuid, usize)>,
    pub paused: bool,
    pub stopped: bool,
    pub url: Option<String>,
    /// Steps finished since the driver started
    pub completed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
}

/// Controller side. `recv` must be cancel safe: the controller polls it
/// inside `select!`.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, message: DriverMessage) -> Result<(), TransportError>;

    /// `None` once the driver side is gone.
    async fn recv(&mut self) -> Option<DriverResponse>;
}

/// Driver side. `recv` must be cancel safe.
#[async_trait]
pub trait DriverChannel: Send {
    async fn recv(&mut self) -> Option<DriverMessage>;

    async fn send(&mut self, response: DriverResponse) -> Result<(), TransportError>;
}

pub struct ChannelTransport {
    tx: UnboundedSender<DriverMessage>,
    rx: UnboundedReceiver<DriverResponse>,
}

pub struct ChannelDriverEnd {
    tx: UnboundedSender<DriverResponse>,
    rx: UnboundedReceiver<DriverMessage>,
}

/// Unbounded in-process channel pair.
pub fn in_process() -> (ChannelTransport, ChannelDriverEnd) {
    let (message_tx, message_rx) = unbounded_channel();
    let (response_tx, response_rx) = unbounded_channel();
    (
        ChannelTransport {
            tx: message_tx,
            rx: response_rx,
        },
        ChannelDriverEnd {
            tx: response_tx,
            rx: message_rx,
        },
    )
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, message: DriverMessage) -> Result<(), TransportError> {
        self.tx.send(message).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<DriverResponse> {
        self.rx.recv().await
    }
}

impl ChannelDriverEnd {
    /// Non-blocking receive, mostly for tests.
    pub fn try_recv(&mut self) -> Option<DriverMessage> {
        self.rx.try_recv().ok()
    }
}

#[async_trait]
impl DriverChannel for ChannelDriverEnd {
    async fn recv(&mut self) -> Option<DriverMessage> {
        self.rx.recv().await
    }

    async fn send(&mut self, response: DriverResponse) -> Result<(), TransportError> {
        self.tx.send(response).map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_format() {
        let run_id = Uuid::nil();
        let step = Step::parse(&json!({"id": "g", "type": "goto", "url": "https://x.test"})).unwrap();
        let msg = DriverMessage::Execute {
            run_id,
            index: 0,
            step,
            scope: Vec::new(),
            variables: Variables::new(),
            screenshot_on_error: true,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "execute");
        assert_eq!(v["runId"], run_id.to_string());
        assert_eq!(v["step"]["type"], "goto");
        assert_eq!(v["screenshotOnError"], true);
        assert!(v.get("scope").is_none());
        assert_eq!(serde_json::from_value::<DriverMessage>(v).unwrap(), msg);

        let control = serde_json::to_value(DriverMessage::Control { signal: ControlSignal::GetState }).unwrap();
        assert_eq!(control, json!({"type": "control", "signal": "getState"}));

        let failed = DriverResponse::StepFailed {
            run_id,
            index: 1,
            error: Error::target_not_found("#go"),
            screenshot: None,
        };
        let v = serde_json::to_value(&failed).unwrap();
        assert_eq!(v["type"], "stepFailed");
        assert_eq!(v["error"]["code"], "TARGET_NOT_FOUND");
        assert_eq!(serde_json::from_value::<DriverResponse>(v).unwrap(), failed);
    }

    #[tokio::test]
    async fn channel_pair_carries_both_ways() {
        let (mut transport, mut driver) = in_process();
        transport
            .send(DriverMessage::Control { signal: ControlSignal::Pause })
            .await
            .unwrap();
        assert_eq!(
            driver.recv().await,
            Some(DriverMessage::Control { signal: ControlSignal::Pause })
        );
        driver
            .send(DriverResponse::State { state: DriverState::default() })
            .await
            .unwrap();
        assert!(matches!(transport.recv().await, Some(DriverResponse::State { .. })));

        drop(driver);
        assert_eq!(transport.recv().await, None);
        assert_eq!(
            transport.send(DriverMessage::Control { signal: ControlSignal::Stop }).await,
            Err(TransportError::Closed)
        );
    }
}
