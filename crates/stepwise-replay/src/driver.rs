//! Driver: hosts the step executor and answers the controller
//!
//! The driver has no say over run state. It executes what it is sent, one step
//! at a time, and reports back. Each step runs on its own task so control
//! signals are handled while it executes.

use crate::executor::{StepExecutor, StepOutput};
use crate::transport::{ControlSignal, DriverChannel, DriverMessage, DriverResponse, DriverState};
use std::sync::Arc;
use stepwise_core::{Environment, Error, Result, Step, Variables};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use uuid::Uuid;

struct Finished {
    seq: u64,
    run_id: Uuid,
    index: usize,
    result: Result<StepOutput>,
    screenshot: Option<String>,
}

struct Job {
    run_id: Uuid,
    index: usize,
    step: Step,
    scope: Vec<Step>,
    variables: Variables,
    screenshot_on_error: bool,
}

pub struct Driver<E: ?Sized, C> {
    executor: Arc<StepExecutor<E>>,
    channel: C,
    state: DriverState,
    done_tx: UnboundedSender<Finished>,
    done_rx: UnboundedReceiver<Finished>,
    next_seq: u64,
    /// Task owning the executing step
    running: Option<u64>,
    /// Stopped task still acting on the environment
    draining: Option<u64>,
    /// Accepted while draining; starts once the stopped task is done
    queued: Option<Job>,
}

impl<E, C> Driver<E, C>
where
    E: Environment + ?Sized + 'static,
    C: DriverChannel + 'static,
{
    pub fn new(executor: StepExecutor<E>, channel: C) -> Self {
        let (done_tx, done_rx) = unbounded_channel();
        Self {
            executor: Arc::new(executor),
            channel,
            state: DriverState::default(),
            done_tx,
            done_rx,
            next_seq: 0,
            running: None,
            draining: None,
            queued: None,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Serve until the controller side goes away.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                message = self.channel.recv() => {
                    let Some(message) = message else {
                        tracing::debug!("controller gone, driver exiting");
                        break;
                    };
                    match message {
                        DriverMessage::Execute { run_id, index, step, scope, variables, screenshot_on_error } => {
                            if let Some((busy_run, busy_index)) = self.state.executing {
                                let violation = Error::protocol_violation(format!(
                                    "execute for step {} while step {} of run {} is in flight",
                                    index, busy_index, busy_run
                                ));
                                tracing::warn!(error = %violation, "ignoring execute");
                                continue;
                            }
                            self.state.executing = Some((run_id, index));
                            self.state.last = Some((run_id, index));
                            self.state.stopped = false;
                            let job = Job { run_id, index, step, scope, variables, screenshot_on_error };
                            if self.draining.is_some() {
                                tracing::debug!(%run_id, index, "stopped step still running, queueing");
                                self.queued = Some(job);
                            } else {
                                self.launch(job);
                            }
                        }
                        DriverMessage::Control { signal } => self.control(signal).await,
                    }
                }
                Some(finished) = self.done_rx.recv() => self.finish(finished).await,
            }
        }
    }

    fn launch(&mut self, job: Job) {
        let Job { run_id, index, step, scope, variables, screenshot_on_error } = job;
        tracing::debug!(%run_id, index, step = step.id(), "executing step");
        let seq = self.next_seq;
        self.next_seq += 1;
        self.running = Some(seq);

        let executor = self.executor.clone();
        let done = self.done_tx.clone();
        tokio::spawn(async move {
            let result = executor.execute(&step, &scope, &variables).await;
            let screenshot = match &result {
                Err(_) if screenshot_on_error => executor.environment().screenshot(),
                _ => None,
            };
            let _ = done.send(Finished { seq, run_id, index, result, screenshot });
        });
    }

    async fn control(&mut self, signal: ControlSignal) {
        tracing::debug!(?signal, "control signal");
        match signal {
            ControlSignal::Pause => self.state.paused = true,
            ControlSignal::Resume => self.state.paused = false,
            ControlSignal::Stop => {
                self.executor.environment().stop();
                self.state.stopped = true;
                self.state.executing = None;
                self.queued = None;
                // its result is dropped, but it keeps the environment until it ends
                if let Some(seq) = self.running.take() {
                    self.draining = Some(seq);
                }
            }
            ControlSignal::GetState => {
                let mut state = self.state.clone();
                state.url = self.executor.environment().url();
                if self.channel.send(DriverResponse::State { state }).await.is_err() {
                    tracing::debug!("state reply dropped, controller gone");
                }
            }
        }
    }

    async fn finish(&mut self, finished: Finished) {
        let Finished { seq, run_id, index, result, screenshot } = finished;
        if self.draining == Some(seq) {
            tracing::debug!(%run_id, index, "dropping result of a stopped step");
            self.draining = None;
            if let Some(job) = self.queued.take() {
                self.launch(job);
            }
            return;
        }
        if self.running != Some(seq) {
            tracing::debug!(%run_id, index, "dropping result of an unknown task");
            return;
        }
        self.running = None;
        self.state.executing = None;
        let response = match result {
            Ok(output) => {
                self.state.completed += 1;
                DriverResponse::StepCompleted { run_id, index, output }
            }
            Err(error) => {
                tracing::debug!(%run_id, index, %error, "step failed");
                DriverResponse::StepFailed { run_id, index, error, screenshot }
            }
        };
        if self.channel.send(response).await.is_err() {
            tracing::debug!("result dropped, controller gone");
        }
    }
}
