//! Replay controller: the run state machine
//!
//! The controller is an actor. It owns the [`Run`] outright, talks to the
//! driver only through a [`Transport`], and is steered through a cloneable
//! [`ControllerHandle`]. Every state change is published as a [`Snapshot`].
//!
//! At most one step is in flight. Step failures never escape the actor; they
//! become log lines and transitions according to the workflow [`Settings`].
//!
//! [`Settings`]: stepwise_core::Settings

use crate::executor::StepOutput;
use crate::store::RunStore;
use crate::transport::{ControlSignal, DriverMessage, DriverResponse, DriverState, Transport, TransportError};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use stepwise_core::{Error, LogEntry, LogLevel, Run, RunStatus, ValidationError, Workflow};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Pause before re-dispatching a step that failed with a retryable error
    pub retry_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("run {0} is still active")]
    RunActive(Uuid),
    #[error("no run has been started")]
    NoRun,
    #[error("run is not paused")]
    NotPaused,
    #[error("run is not running")]
    NotRunning,
    #[error("step {0} is still in flight")]
    StepInFlight(usize),
    #[error("run is already {0:?}")]
    Terminal(RunStatus),
    #[error("invalid workflow: {0}")]
    Invalid(#[from] ValidationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("controller has shut down")]
    Stopped,
}

/// What the controller looks like right now.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub run: Option<Run>,
    pub step_count: usize,
    pub in_flight: Option<usize>,
}

impl Snapshot {
    pub fn status(&self) -> Option<RunStatus> {
        self.run.as_ref().map(Run::status)
    }

    pub fn current_step_index(&self) -> Option<usize> {
        self.run.as_ref().map(Run::current_step_index)
    }

    // Variables only change together with a log line, so this covers them.
    fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            run: self.run.as_ref().map(run_key),
            step_count: self.step_count,
            in_flight: self.in_flight,
        }
    }
}

fn run_key(run: &Run) -> (Uuid, RunStatus, usize, usize) {
    (run.id, run.status(), run.current_step_index(), run.logs().len())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    run: Option<(Uuid, RunStatus, usize, usize)>,
    step_count: usize,
    in_flight: Option<usize>,
}

type Reply<T> = oneshot::Sender<Result<T, ControllerError>>;

enum Command {
    Start { workflow: Box<Workflow>, reply: Reply<Uuid> },
    Pause { reply: Reply<()> },
    Resume { reply: Reply<()> },
    NextStep { reply: Reply<()> },
    Cancel { reply: Reply<()> },
    DriverState { reply: Reply<DriverState> },
    Shutdown,
}

#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<Snapshot>,
}

impl ControllerHandle {
    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| ControllerError::Stopped)?;
        rx.await.map_err(|_| ControllerError::Stopped)?
    }

    /// Begin a new run at index 0.
    pub async fn start(&self, workflow: Workflow) -> Result<Uuid, ControllerError> {
        self.request(|reply| Command::Start {
            workflow: Box::new(workflow),
            reply,
        })
        .await
    }

    pub async fn pause(&self) -> Result<(), ControllerError> {
        self.request(|reply| Command::Pause { reply }).await
    }

    /// Continue from the current index.
    pub async fn resume(&self) -> Result<(), ControllerError> {
        self.request(|reply| Command::Resume { reply }).await
    }

    /// Run exactly one step, then pause again.
    pub async fn next_step(&self) -> Result<(), ControllerError> {
        self.request(|reply| Command::NextStep { reply }).await
    }

    pub async fn cancel(&self) -> Result<(), ControllerError> {
        self.request(|reply| Command::Cancel { reply }).await
    }

    /// Ask the driver what it is doing.
    pub async fn driver_state(&self) -> Result<DriverState, ControllerError> {
        self.request(|reply| Command::DriverState { reply }).await
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// Wait for the first snapshot matching `predicate`, the current one included.
    pub async fn wait_until(&self, predicate: impl FnMut(&Snapshot) -> bool) -> Result<Snapshot, ControllerError> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx.wait_for(predicate).await.map_err(|_| ControllerError::Stopped)?;
        Ok(snapshot.clone())
    }

    /// Wait until the run reaches a terminal status.
    pub async fn wait_for_end(&self) -> Result<Run, ControllerError> {
        let snapshot = self
            .wait_until(|s| s.run.as_ref().is_some_and(Run::is_terminal))
            .await?;
        snapshot.run.ok_or(ControllerError::NoRun)
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

pub struct Controller<T> {
    transport: T,
    store: Arc<dyn RunStore>,
    config: ControllerConfig,
    workflow: Option<Workflow>,
    owned: HashSet<String>,
    run: Option<Run>,
    in_flight: Option<usize>,
    /// Failed attempts of the step at the current index
    attempts: u32,
    retry_at: Option<Instant>,
    /// Set by `nextStep`: pause again once the dispatched step settles
    single_step: bool,
    driver_alive: bool,
    state_requests: VecDeque<Reply<DriverState>>,
    snapshot: watch::Sender<Snapshot>,
}

impl<T: Transport + 'static> Controller<T> {
    pub fn new(transport: T, store: Arc<dyn RunStore>) -> Self {
        let (snapshot, _) = watch::channel(Snapshot::default());
        Self {
            transport,
            store,
            config: ControllerConfig::default(),
            workflow: None,
            owned: HashSet::new(),
            run: None,
            in_flight: None,
            attempts: 0,
            retry_at: None,
            single_step: false,
            driver_alive: true,
            state_requests: VecDeque::new(),
            snapshot,
        }
    }

    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn spawn(self) -> (ControllerHandle, JoinHandle<()>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = ControllerHandle {
            commands,
            snapshot: self.snapshot.subscribe(),
        };
        (handle, tokio::spawn(self.serve(rx)))
    }

    async fn serve(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(Command::Shutdown) => break,
                    Some(command) => self.handle(command).await,
                },
                response = self.transport.recv(), if self.driver_alive => match response {
                    Some(response) => self.on_response(response).await,
                    None => self.on_disconnect().await,
                },
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    self.on_retry().await;
                }
            }
            self.publish();
        }
        tracing::debug!("controller stopped");
    }

    fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            run: self.run.as_ref().map(run_key),
            step_count: self.workflow.as_ref().map_or(0, |w| w.steps.len()),
            in_flight: self.in_flight,
        }
    }

    /// Replace the published snapshot if anything observable changed.
    fn publish(&self) {
        let current = self.fingerprint();
        self.snapshot.send_if_modified(|snapshot| {
            if snapshot.fingerprint() == current {
                return false;
            }
            *snapshot = Snapshot {
                run: self.run.clone(),
                step_count: current.step_count,
                in_flight: self.in_flight,
            };
            true
        });
    }

    /// Publish before answering so a caller never sees a stale snapshot.
    fn answer<R>(&self, reply: Reply<R>, result: Result<R, ControllerError>) {
        self.publish();
        let _ = reply.send(result);
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Start { workflow, reply } => {
                let result = self.start(*workflow).await;
                self.answer(reply, result);
            }
            Command::Pause { reply } => {
                let result = self.pause().await;
                self.answer(reply, result);
            }
            Command::Resume { reply } => {
                let result = self.resume().await;
                self.answer(reply, result);
            }
            Command::NextStep { reply } => {
                let result = self.next_step().await;
                self.answer(reply, result);
            }
            Command::Cancel { reply } => {
                let result = self.cancel().await;
                self.answer(reply, result);
            }
            Command::DriverState { reply } => {
                match self.transport.send(DriverMessage::Control { signal: ControlSignal::GetState }).await {
                    Ok(()) => self.state_requests.push_back(reply),
                    Err(e) => self.answer(reply, Err(e.into())),
                }
            }
            Command::Shutdown => {}
        }
    }

    /// The current run, if it can still change.
    fn live_run(&self) -> Result<&Run, ControllerError> {
        let run = self.run.as_ref().ok_or(ControllerError::NoRun)?;
        if run.is_terminal() {
            return Err(ControllerError::Terminal(run.status()));
        }
        Ok(run)
    }

    async fn start(&mut self, workflow: Workflow) -> Result<Uuid, ControllerError> {
        if let Some(run) = self.run.as_ref().filter(|r| !r.is_terminal()) {
            return Err(ControllerError::RunActive(run.id));
        }
        workflow.validate()?;

        let run_id = match self.store.create_run(&workflow.id, &workflow.variables).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(error = %e, workflow = %workflow.id, "run store unavailable, using a local run id");
                Uuid::new_v4()
            }
        };
        let mut run = Run::new(run_id, workflow.id.clone(), workflow.variables.clone());
        run.set_status(RunStatus::Running).ok();

        tracing::info!(%run_id, workflow = %workflow.id, steps = workflow.steps.len(), "run started");
        self.owned = workflow.owned_ids().into_iter().map(str::to_string).collect();
        self.workflow = Some(workflow);
        self.run = Some(run);
        self.in_flight = None;
        self.attempts = 0;
        self.retry_at = None;
        self.single_step = false;
        self.persist_status().await;

        self.skip_owned();
        if self.at_end() {
            self.complete().await;
        } else {
            self.dispatch().await;
        }
        Ok(run_id)
    }

    async fn pause(&mut self) -> Result<(), ControllerError> {
        if self.live_run()?.status() != RunStatus::Running {
            return Err(ControllerError::NotRunning);
        }
        self.retry_at = None;
        self.attempts = 0;
        self.single_step = false;
        self.enter_pause().await;
        self.signal(ControlSignal::Pause).await;
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), ControllerError> {
        if self.live_run()?.status() != RunStatus::Paused {
            return Err(ControllerError::NotPaused);
        }
        self.attempts = 0;
        self.single_step = false;
        self.leave_pause().await;
        self.signal(ControlSignal::Resume).await;
        // a step paused mid-flight carries on when it lands
        if self.in_flight.is_none() {
            self.dispatch().await;
        }
        Ok(())
    }

    async fn next_step(&mut self) -> Result<(), ControllerError> {
        if self.live_run()?.status() != RunStatus::Paused {
            return Err(ControllerError::NotPaused);
        }
        if let Some(index) = self.in_flight {
            return Err(ControllerError::StepInFlight(index));
        }
        self.attempts = 0;
        self.single_step = true;
        self.leave_pause().await;
        self.dispatch().await;
        Ok(())
    }

    async fn cancel(&mut self) -> Result<(), ControllerError> {
        self.live_run()?;
        if let Some(run) = self.run.as_mut() {
            run.set_status(RunStatus::Cancelled).ok();
            tracing::info!(run_id = %run.id, index = run.current_step_index(), "run cancelled");
        }
        self.in_flight = None;
        self.retry_at = None;
        self.single_step = false;
        // cooperative: the driver is told, nobody waits for it
        self.signal(ControlSignal::Stop).await;
        self.persist_status().await;
        Ok(())
    }

    async fn signal(&mut self, signal: ControlSignal) {
        if self.transport.send(DriverMessage::Control { signal }).await.is_err() {
            tracing::debug!(?signal, "driver gone, control signal dropped");
        }
    }

    fn at_end(&self) -> bool {
        match (&self.run, &self.workflow) {
            (Some(run), Some(workflow)) => run.current_step_index() >= workflow.steps.len(),
            _ => true,
        }
    }

    /// Move past steps that a conditional or loop runs inline.
    fn skip_owned(&mut self) {
        let (Some(run), Some(workflow)) = (self.run.as_mut(), self.workflow.as_ref()) else {
            return;
        };
        let mut index = run.current_step_index();
        while let Some(step) = workflow.steps.get(index) {
            if !self.owned.contains(step.id()) {
                break;
            }
            tracing::info!(run_id = %run.id, index, step = step.id(), "skipping step run by a branch or loop");
            index += 1;
        }
        run.advance_to(index).ok();
    }

    async fn dispatch(&mut self) {
        let (Some(run), Some(workflow)) = (self.run.as_ref(), self.workflow.as_ref()) else {
            return;
        };
        let index = run.current_step_index();
        let Some(step) = workflow.steps.get(index) else {
            return;
        };
        let message = DriverMessage::Execute {
            run_id: run.id,
            index,
            step: step.clone(),
            scope: workflow.scope(index),
            variables: run.variables().clone(),
            screenshot_on_error: workflow.settings.screenshot_on_error,
        };
        let run_id = run.id;
        let step_id = step.id().to_string();
        tracing::debug!(%run_id, index, step = %step_id, attempt = self.attempts + 1, "dispatching step");

        self.in_flight = Some(index);
        if !self.driver_alive || self.transport.send(message).await.is_err() {
            self.driver_alive = false;
            let error = Error::action_failed(&step_id, "driver is not connected");
            self.on_failed(run_id, index, error, None).await;
        }
    }

    async fn on_response(&mut self, response: DriverResponse) {
        match response {
            DriverResponse::StepCompleted { run_id, index, output } => self.on_completed(run_id, index, output).await,
            DriverResponse::StepFailed {
                run_id,
                index,
                error,
                screenshot,
            } => self.on_failed(run_id, index, error, screenshot).await,
            DriverResponse::State { state } => match self.state_requests.pop_front() {
                Some(reply) => {
                    let _ = reply.send(Ok(state));
                }
                None => tracing::debug!("unsolicited driver state"),
            },
        }
    }

    async fn on_disconnect(&mut self) {
        tracing::warn!("driver disconnected");
        self.driver_alive = false;
        for reply in self.state_requests.drain(..) {
            let _ = reply.send(Err(TransportError::Closed.into()));
        }
        let in_flight = self.in_flight.zip(self.run.as_ref().map(|r| r.id));
        if let Some((index, run_id)) = in_flight {
            let step_id = self.step_id(index);
            let error = Error::action_failed(&step_id, "driver disconnected mid-step");
            self.on_failed(run_id, index, error, None).await;
        }
    }

    async fn on_retry(&mut self) {
        let running = self.run.as_ref().is_some_and(|r| r.status() == RunStatus::Running);
        if running && self.in_flight.is_none() {
            self.dispatch().await;
        }
    }

    /// Whether a response belongs to the step in flight.
    fn accepts(&self, run_id: Uuid, index: usize) -> bool {
        let current = self.run.as_ref().filter(|r| r.id == run_id && !r.is_terminal());
        if current.is_none() || self.in_flight != Some(index) {
            tracing::warn!(%run_id, index, in_flight = ?self.in_flight, "discarding stale driver response");
            return false;
        }
        true
    }

    fn step_id(&self, index: usize) -> String {
        self.workflow
            .as_ref()
            .and_then(|w| w.steps.get(index))
            .map(|s| s.id().to_string())
            .unwrap_or_default()
    }

    async fn on_completed(&mut self, run_id: Uuid, index: usize, output: StepOutput) {
        if !self.accepts(run_id, index) {
            return;
        }
        self.in_flight = None;
        self.attempts = 0;

        let description = self
            .workflow
            .as_ref()
            .and_then(|w| w.steps.get(index))
            .map(|s| s.describe())
            .unwrap_or_default();
        let entry = LogEntry::new(self.step_id(index), LogLevel::Success, format!("{} succeeded", description))
            .with_screenshot(output.screenshot);
        if let Some(run) = self.run.as_mut() {
            for (name, value) in output.variables {
                run.set_variable(name, value).ok();
            }
            run.advance_to(index + 1).ok();
        }
        self.log(entry).await;
        self.skip_owned();

        if self.at_end() {
            self.complete().await;
            return;
        }
        self.persist_status().await;

        let paused = self.run.as_ref().is_some_and(|r| r.status() == RunStatus::Paused);
        let supervised = self.workflow.as_ref().is_some_and(|w| w.settings.supervised_mode);
        if paused {
            self.single_step = false;
        } else if std::mem::take(&mut self.single_step) || supervised {
            self.enter_pause().await;
        } else {
            self.dispatch().await;
        }
    }

    async fn on_failed(&mut self, run_id: Uuid, index: usize, error: Error, screenshot: Option<String>) {
        if !self.accepts(run_id, index) {
            return;
        }
        self.in_flight = None;
        self.attempts += 1;

        let Some(settings) = self.workflow.as_ref().map(|w| w.settings.clone()) else {
            return;
        };
        let entry = LogEntry::new(
            self.step_id(index),
            LogLevel::Error,
            format!("attempt {}/{} failed: {}", self.attempts, settings.max_retries + 1, error),
        )
        .with_screenshot(screenshot);
        self.log(entry).await;

        if self.run.as_ref().is_some_and(|r| r.status() == RunStatus::Paused) {
            // paused while in flight: the operator decides what happens next
            self.single_step = false;
            self.attempts = 0;
            return;
        }
        if error.is_retryable() && self.attempts <= settings.max_retries {
            tracing::info!(%run_id, index, attempt = self.attempts, code = ?error.code, "retrying step");
            self.retry_at = Some(Instant::now() + self.config.retry_delay);
            return;
        }

        self.attempts = 0;
        self.single_step = false;
        if settings.pause_on_error {
            self.enter_pause().await;
        } else {
            if let Some(run) = self.run.as_mut() {
                run.fail(error.to_string()).ok();
                tracing::info!(%run_id, index, "run failed");
            }
            self.persist_status().await;
        }
    }

    async fn complete(&mut self) {
        if let Some(run) = self.run.as_mut() {
            run.set_status(RunStatus::Completed).ok();
            tracing::info!(run_id = %run.id, "run completed");
        }
        self.persist_status().await;
    }

    async fn enter_pause(&mut self) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if run.set_status(RunStatus::Paused).is_err() {
            return;
        }
        let run_id = run.id;
        tracing::info!(%run_id, index = run.current_step_index(), "run paused");
        self.persist_status().await;
        if let Err(e) = self.store.pause_run(run_id).await {
            tracing::warn!(%run_id, error = %e, "failed to persist pause");
        }
    }

    async fn leave_pause(&mut self) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        if run.set_status(RunStatus::Running).is_err() {
            return;
        }
        let run_id = run.id;
        tracing::info!(%run_id, index = run.current_step_index(), "run resumed");
        self.persist_status().await;
        if let Err(e) = self.store.resume_run(run_id).await {
            tracing::warn!(%run_id, error = %e, "failed to persist resume");
        }
    }

    async fn log(&mut self, entry: LogEntry) {
        let Some(run) = self.run.as_mut() else {
            return;
        };
        let run_id = run.id;
        if run.push_log(entry.clone()).is_err() {
            return;
        }
        if let Err(e) = self.store.append_log(run_id, &entry, None).await {
            tracing::warn!(%run_id, error = %e, "failed to persist log line");
        }
    }

    async fn persist_status(&mut self) {
        let Some(run) = self.run.as_ref() else {
            return;
        };
        if let Err(e) = self
            .store
            .update_run_status(run.id, run.status(), Some(run.current_step_index()), run.error())
            .await
        {
            tracing::warn!(run_id = %run.id, error = %e, "failed to persist run status");
        }
    }
}
