//! Recording storage - JSON lines, metadata first

use crate::events::{RecordedEvent, RecordingExport};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Meta {
    session_id: String,
    event_count: usize,
    saved_at: chrono::DateTime<chrono::Utc>,
}

pub struct RecordingStorage {
    dir: PathBuf,
}

impl RecordingStorage {
    /// `$HOME/.stepwise/recordings`
    pub fn new() -> Result<Self> {
        let home = std::env::var("HOME").context("HOME not set")?;
        Self::with_dir(PathBuf::from(home).join(".stepwise").join("recordings"))
    }

    pub fn with_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating recordings dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// Write one metadata line, then one event per line. Returns the file path.
    pub fn save(&self, export: &RecordingExport) -> Result<PathBuf> {
        let ts = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let filename = format!("{}_{}.jsonl", sanitize(&export.session_id), ts);
        let path = self.dir.join(&filename);

        let file = File::create(&path)?;
        let mut w = BufWriter::new(file);

        let meta = Meta {
            session_id: export.session_id.clone(),
            event_count: export.events.len(),
            saved_at: chrono::Utc::now(),
        };
        serde_json::to_writer(&mut w, &meta)?;
        writeln!(w)?;

        for e in &export.events {
            serde_json::to_writer(&mut w, e)?;
            writeln!(w)?;
        }

        w.flush()?;
        tracing::debug!(path = %path.display(), events = export.events.len(), "recording saved");
        Ok(path)
    }

    pub fn load(&self, filename: &str) -> Result<RecordingExport> {
        let path = self.resolve(filename)?;
        let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
        let mut lines = BufReader::new(file).lines();

        let meta_line = lines.next().context("Empty file")??;
        let meta: Meta = serde_json::from_str(&meta_line).context("bad metadata line")?;

        let mut events = Vec::new();
        for (n, line) in lines.enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let e: RecordedEvent = serde_json::from_str(&line)
                .with_context(|| format!("bad event on line {}", n + 2))?;
            events.push(e);
        }

        if events.len() != meta.event_count {
            tracing::warn!(
                expected = meta.event_count,
                found = events.len(),
                "recording event count mismatch"
            );
        }
        Ok(RecordingExport::new(meta.session_id, events))
    }

    /// Saved recordings, oldest name first
    pub fn list(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(s) = entry.file_name().to_str() {
                if s.ends_with(".jsonl") {
                    files.push(s.to_string());
                }
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn delete(&self, filename: &str) -> Result<()> {
        let path = self.resolve(filename)?;
        fs::remove_file(&path).with_context(|| format!("deleting {}", path.display()))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    // Names only, never paths out of the storage dir
    fn resolve(&self, filename: &str) -> Result<PathBuf> {
        if filename.is_empty() || filename.contains(['/', '\\']) || filename.starts_with('.') {
            bail!("invalid recording name: {}", filename);
        }
        Ok(self.dir.join(filename))
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventData, EventTarget, EventType};

    fn export() -> RecordingExport {
        let event = |kind, data| RecordedEvent {
            kind,
            timestamp: 1,
            target: EventTarget::window(),
            data,
            url: "https://a.test/".into(),
            viewport: None,
            session_id: "sess/1".into(),
        };
        RecordingExport::new(
            "sess/1",
            vec![
                event(EventType::Scroll, Some(EventData::Scroll { scroll_x: 0.0, scroll_y: 10.0 })),
                event(EventType::Navigation, None),
            ],
        )
    }

    #[test]
    fn save_load_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RecordingStorage::with_dir(dir.path()).unwrap();
        let original = export();

        let path = storage.save(&original).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("sess_1_"));

        let first_line = fs::read_to_string(&path).unwrap().lines().next().unwrap().to_string();
        let meta: serde_json::Value = serde_json::from_str(&first_line).unwrap();
        assert_eq!(meta["eventCount"], 2);

        assert_eq!(storage.list().unwrap(), vec![name.clone()]);
        assert_eq!(storage.load(&name).unwrap(), original);

        storage.delete(&name).unwrap();
        assert!(storage.list().unwrap().is_empty());
    }

    #[test]
    fn rejects_paths() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RecordingStorage::with_dir(dir.path()).unwrap();
        assert!(storage.load("../etc/passwd").is_err());
        assert!(storage.delete("").is_err());
    }
}
