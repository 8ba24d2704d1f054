//! Run persistence contract
//!
//! The controller reports every transition and log line here. Stores are
//! best effort from the controller's point of view: a failed write is logged
//! and the run carries on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use stepwise_core::{LogEntry, RunStatus, Variables};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run not found: {0}")]
    NotFound(Uuid),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, workflow_id: &str, variables: &Variables) -> Result<Uuid, StoreError>;

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        current_step_index: Option<usize>,
        error: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn append_log(&self, run_id: Uuid, entry: &LogEntry, metadata: Option<&Value>) -> Result<(), StoreError>;

    async fn pause_run(&self, run_id: Uuid) -> Result<(), StoreError>;

    async fn resume_run(&self, run_id: Uuid) -> Result<(), StoreError>;
}

/// What a store knows about one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRun {
    pub id: Uuid,
    pub workflow_id: String,
    pub variables: Variables,
    pub status: RunStatus,
    pub current_step_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub logs: Vec<LogEntry>,
    pub pauses: u32,
    pub resumes: u32,
}

impl StoredRun {
    fn new(id: Uuid, workflow_id: &str, variables: &Variables) -> Self {
        Self {
            id,
            workflow_id: workflow_id.to_string(),
            variables: variables.clone(),
            status: RunStatus::Pending,
            current_step_index: 0,
            error: None,
            logs: Vec::new(),
            pauses: 0,
            resumes: 0,
        }
    }

    fn apply(&mut self, record: &RunRecord) {
        match record {
            RunRecord::Created { .. } => {}
            RunRecord::Status { status, current_step_index, error, .. } => {
                self.status = *status;
                if let Some(i) = current_step_index {
                    self.current_step_index = *i;
                }
                if error.is_some() {
                    self.error = error.clone();
                }
            }
            RunRecord::Log { entry, .. } => self.logs.push(entry.clone()),
            RunRecord::Paused { .. } => self.pauses += 1,
            RunRecord::Resumed { .. } => self.resumes += 1,
        }
    }
}

#[derive(Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<Uuid, StoredRun>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, run_id: Uuid) -> Option<StoredRun> {
        self.runs.lock().get(&run_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.lock().is_empty()
    }

    fn with_run(&self, run_id: Uuid, f: impl FnOnce(&mut StoredRun)) -> Result<(), StoreError> {
        let mut runs = self.runs.lock();
        let run = runs.get_mut(&run_id).ok_or(StoreError::NotFound(run_id))?;
        f(run);
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, workflow_id: &str, variables: &Variables) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        self.runs.lock().insert(id, StoredRun::new(id, workflow_id, variables));
        Ok(id)
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        current_step_index: Option<usize>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.with_run(run_id, |run| {
            run.apply(&RunRecord::Status {
                at: Utc::now(),
                status,
                current_step_index,
                error: error.map(str::to_string),
            })
        })
    }

    async fn append_log(&self, run_id: Uuid, entry: &LogEntry, _metadata: Option<&Value>) -> Result<(), StoreError> {
        self.with_run(run_id, |run| run.logs.push(entry.clone()))
    }

    async fn pause_run(&self, run_id: Uuid) -> Result<(), StoreError> {
        self.with_run(run_id, |run| run.pauses += 1)
    }

    async fn resume_run(&self, run_id: Uuid) -> Result<(), StoreError> {
        self.with_run(run_id, |run| run.resumes += 1)
    }
}

/// One line of a run file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum RunRecord {
    #[serde(rename_all = "camelCase")]
    Created {
        at: DateTime<Utc>,
        run_id: Uuid,
        workflow_id: String,
        variables: Variables,
    },
    #[serde(rename_all = "camelCase")]
    Status {
        at: DateTime<Utc>,
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_step_index: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Log {
        entry: LogEntry,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    Paused { at: DateTime<Utc> },
    Resumed { at: DateTime<Utc> },
}

/// JSON lines, one file per run, one record per line.
pub struct FileRunStore {
    dir: PathBuf,
}

impl FileRunStore {
    /// `$HOME/.stepwise/runs`
    pub fn new() -> Result<Self, StoreError> {
        let home = std::env::var("HOME").map_err(|_| StoreError::Other("HOME not set".into()))?;
        Self::with_dir(PathBuf::from(home).join(".stepwise").join("runs"))
    }

    pub fn with_dir(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn file(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.jsonl", run_id))
    }

    async fn append(&self, run_id: Uuid, record: &RunRecord, create: bool) -> Result<(), StoreError> {
        let path = self.file(run_id);
        if !create && !tokio::fs::try_exists(&path).await? {
            return Err(StoreError::NotFound(run_id));
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// Every record written for a run, in order.
    pub async fn records(&self, run_id: Uuid) -> Result<Vec<RunRecord>, StoreError> {
        let path = self.file(run_id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(StoreError::NotFound(run_id)),
            Err(e) => return Err(e.into()),
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(StoreError::from))
            .collect()
    }

    /// Replay a run file into its latest state.
    pub async fn load(&self, run_id: Uuid) -> Result<StoredRun, StoreError> {
        let records = self.records(run_id).await?;
        let mut run = match records.first() {
            Some(RunRecord::Created { run_id, workflow_id, variables, .. }) => {
                StoredRun::new(*run_id, workflow_id, variables)
            }
            _ => return Err(StoreError::Other(format!("run file for {} has no header", run_id))),
        };
        for record in &records[1..] {
            run.apply(record);
        }
        Ok(run)
    }

    /// Ids of every stored run.
    pub fn list(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            if let Some(id) = name
                .to_str()
                .and_then(|s| s.strip_suffix(".jsonl"))
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl RunStore for FileRunStore {
    async fn create_run(&self, workflow_id: &str, variables: &Variables) -> Result<Uuid, StoreError> {
        let run_id = Uuid::new_v4();
        let record = RunRecord::Created {
            at: Utc::now(),
            run_id,
            workflow_id: workflow_id.to_string(),
            variables: variables.clone(),
        };
        self.append(run_id, &record, true).await?;
        Ok(run_id)
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        current_step_index: Option<usize>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let record = RunRecord::Status {
            at: Utc::now(),
            status,
            current_step_index,
            error: error.map(str::to_string),
        };
        self.append(run_id, &record, false).await
    }

    async fn append_log(&self, run_id: Uuid, entry: &LogEntry, metadata: Option<&Value>) -> Result<(), StoreError> {
        let record = RunRecord::Log {
            entry: entry.clone(),
            metadata: metadata.cloned(),
        };
        self.append(run_id, &record, false).await
    }

    async fn pause_run(&self, run_id: Uuid) -> Result<(), StoreError> {
        self.append(run_id, &RunRecord::Paused { at: Utc::now() }, false).await
    }

    async fn resume_run(&self, run_id: Uuid) -> Result<(), StoreError> {
        self.append(run_id, &RunRecord::Resumed { at: Utc::now() }, false).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_core::LogLevel;

    fn vars() -> Variables {
        let mut v = Variables::new();
        v.insert("q".into(), json!("rust"));
        v
    }

    #[tokio::test]
    async fn memory_store_tracks_a_run() {
        let store = MemoryRunStore::new();
        let id = store.create_run("wf", &vars()).await.unwrap();
        store.update_run_status(id, RunStatus::Running, Some(0), None).await.unwrap();
        store
            .append_log(id, &LogEntry::new("s1", LogLevel::Success, "ok"), None)
            .await
            .unwrap();
        store.pause_run(id).await.unwrap();
        store.update_run_status(id, RunStatus::Failed, Some(1), Some("boom")).await.unwrap();

        let run = store.get(id).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.current_step_index, 1);
        assert_eq!(run.error.as_deref(), Some("boom"));
        assert_eq!(run.logs.len(), 1);
        assert_eq!(run.pauses, 1);

        let missing = store.pause_run(Uuid::new_v4()).await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRunStore::with_dir(dir.path()).unwrap();
        let id = store.create_run("wf", &vars()).await.unwrap();
        store.update_run_status(id, RunStatus::Running, Some(0), None).await.unwrap();
        store
            .append_log(id, &LogEntry::new("s1", LogLevel::Error, "nope"), Some(&json!({"attempt": 1})))
            .await
            .unwrap();
        store.pause_run(id).await.unwrap();
        store.resume_run(id).await.unwrap();
        store.update_run_status(id, RunStatus::Completed, Some(2), None).await.unwrap();

        let records = store.records(id).await.unwrap();
        assert_eq!(records.len(), 6);
        assert!(matches!(records[0], RunRecord::Created { .. }));

        let run = store.load(id).await.unwrap();
        assert_eq!(run.workflow_id, "wf");
        assert_eq!(run.variables, vars());
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.current_step_index, 2);
        assert_eq!((run.pauses, run.resumes), (1, 1));
        assert_eq!(run.logs[0].level, LogLevel::Error);
        assert_eq!(store.list().unwrap(), vec![id]);

        let stranger = Uuid::new_v4();
        assert!(matches!(
            store.update_run_status(stranger, RunStatus::Running, None, None).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
