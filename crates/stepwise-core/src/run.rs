//! Run state: one execution attempt of a workflow
//!
//! A [`Run`] is owned by a single controller. Once it reaches a terminal status
//! every mutator returns [`RunError::Terminal`].

use crate::step::Variables;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }

    fn can_become(self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (Pending, Running) | (Running, Paused) | (Paused, Running) => true,
            (from, Completed | Failed | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub step_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

impl LogEntry {
    pub fn new(step_id: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            timestamp: Utc::now(),
            level,
            message: message.into(),
            screenshot: None,
        }
    }

    pub fn with_screenshot(mut self, screenshot: Option<String>) -> Self {
        self.screenshot = screenshot;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("run is {0:?} and can no longer change")]
    Terminal(RunStatus),
    #[error("cannot move run from {from:?} to {to:?}")]
    Transition { from: RunStatus, to: RunStatus },
    #[error("step index may not move backwards ({current} -> {requested})")]
    IndexBackwards { current: usize, requested: usize },
    #[error("run is still {0:?}")]
    NotTerminal(RunStatus),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: Uuid,
    pub workflow_id: String,
    status: RunStatus,
    current_step_index: usize,
    variables: Variables,
    logs: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// New pending run with its own copy of the workflow's variables.
    pub fn new(id: Uuid, workflow_id: impl Into<String>, variables: Variables) -> Self {
        Self {
            id,
            workflow_id: workflow_id.into(),
            status: RunStatus::Pending,
            current_step_index: 0,
            variables,
            logs: Vec::new(),
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn current_step_index(&self) -> usize {
        self.current_step_index
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn guard(&self) -> Result<(), RunError> {
        if self.status.is_terminal() {
            return Err(RunError::Terminal(self.status));
        }
        Ok(())
    }

    pub fn set_status(&mut self, status: RunStatus) -> Result<(), RunError> {
        self.guard()?;
        if status == self.status {
            return Ok(());
        }
        if !self.status.can_become(status) {
            return Err(RunError::Transition {
                from: self.status,
                to: status,
            });
        }
        if status == RunStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = status;
        Ok(())
    }

    /// Terminal failure with a reason.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), RunError> {
        self.guard()?;
        self.error = Some(error.into());
        self.set_status(RunStatus::Failed)
    }

    pub fn advance_to(&mut self, index: usize) -> Result<(), RunError> {
        self.guard()?;
        if index < self.current_step_index {
            return Err(RunError::IndexBackwards {
                current: self.current_step_index,
                requested: index,
            });
        }
        self.current_step_index = index;
        Ok(())
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: serde_json::Value) -> Result<(), RunError> {
        self.guard()?;
        self.variables.insert(name.into(), value);
        Ok(())
    }

    pub fn push_log(&mut self, entry: LogEntry) -> Result<(), RunError> {
        self.guard()?;
        self.logs.push(entry);
        Ok(())
    }

    /// Hand out a finished run for storage or reporting.
    pub fn archive(self) -> Result<Run, RunError> {
        if !self.status.is_terminal() {
            return Err(RunError::NotTerminal(self.status));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run() -> Run {
        Run::new(Uuid::new_v4(), "wf", Variables::new())
    }

    #[test]
    fn lifecycle_sets_timestamps() {
        let mut r = run();
        assert_eq!(r.status(), RunStatus::Pending);
        r.set_status(RunStatus::Running).unwrap();
        assert!(r.started_at().is_some());
        r.set_status(RunStatus::Paused).unwrap();
        r.set_status(RunStatus::Running).unwrap();
        r.set_status(RunStatus::Completed).unwrap();
        assert!(r.completed_at().is_some());
    }

    #[test]
    fn terminal_runs_reject_every_mutation() {
        let mut r = run();
        r.set_status(RunStatus::Running).unwrap();
        r.fail("boom").unwrap();
        assert_eq!(r.error(), Some("boom"));
        let before = r.clone();

        assert_eq!(r.set_status(RunStatus::Running), Err(RunError::Terminal(RunStatus::Failed)));
        assert!(r.advance_to(3).is_err());
        assert!(r.set_variable("x", json!(1)).is_err());
        assert!(r.push_log(LogEntry::new("s", LogLevel::Info, "late")).is_err());
        assert!(r.fail("again").is_err());
        assert_eq!(r, before);
        assert!(r.archive().is_ok());
    }

    #[test]
    fn index_is_monotonic() {
        let mut r = run();
        r.advance_to(2).unwrap();
        assert!(matches!(r.advance_to(1), Err(RunError::IndexBackwards { .. })));
        assert_eq!(r.current_step_index(), 2);
    }

    #[test]
    fn invalid_transitions() {
        let mut r = run();
        assert!(r.set_status(RunStatus::Paused).is_err());
        assert!(run().archive().is_err());
    }

    #[test]
    fn serializes_camel_case() {
        let mut r = run();
        r.push_log(LogEntry::new("s1", LogLevel::Success, "ok")).unwrap();
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["status"], "pending");
        assert_eq!(v["currentStepIndex"], 0);
        assert_eq!(v["logs"][0]["stepId"], "s1");
        assert_eq!(v["logs"][0]["level"], "success");
    }
}
