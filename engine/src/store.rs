use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Context;
use tasktree_orchestrator::{RunSummary, TaskTreeObserver};
use tokio::io::AsyncWriteExt;

/// Append-only run log: one `RunSummary` JSON document per line.
pub struct JsonlRunStore {
    path: PathBuf,
}

impl JsonlRunStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, summary: &RunSummary) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(summary).context("serializing run summary")?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening run log {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("writing run log {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }

    /// Stored summaries in append order. Lines that fail to parse are skipped.
    pub fn load(&self) -> anyhow::Result<Vec<RunSummary>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)
            .with_context(|| format!("opening run log {}", self.path.display()))?;

        let mut runs = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("reading run log {}", self.path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunSummary>(&line) {
                Ok(summary) => runs.push(summary),
                Err(err) => tracing::warn!(line = index + 1, "skipping unreadable run log entry: {err}"),
            }
        }
        Ok(runs)
    }
}

#[async_trait::async_trait]
impl TaskTreeObserver for JsonlRunStore {
    fn name(&self) -> &str {
        "jsonl_run_store"
    }

    async fn on_persist(&self, summary: &RunSummary) -> anyhow::Result<()> {
        self.append(summary).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasktree_orchestrator::{RunStatus, TaskState};

    fn summary(run_id: &str, status: RunStatus) -> RunSummary {
        RunSummary {
            run_id: run_id.to_string(),
            status,
            source: "test".to_string(),
            correlation_id: None,
            created_at_ms: 1,
            finished_at_ms: 2,
            steps: Vec::new(),
            context: Default::default(),
            task_state: TaskState::default(),
        }
    }

    #[tokio::test]
    async fn append_then_load_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlRunStore::new(dir.path().join("nested").join("runs.jsonl"));
        store.append(&summary("a", RunStatus::Completed)).await.unwrap();
        store.append(&summary("b", RunStatus::Blocked)).await.unwrap();

        let runs = store.load().unwrap();
        let ids: Vec<&str> = runs.iter().map(|run| run.run_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(runs[1].status, RunStatus::Blocked);
    }

    #[test]
    fn missing_log_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlRunStore::new(dir.path().join("runs.jsonl"));
        assert!(store.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let store = JsonlRunStore::new(&path);
        store.append(&summary("good", RunStatus::Failed)).await.unwrap();
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{not json\n\n");
        std::fs::write(&path, raw).unwrap();
        store.append(&summary("later", RunStatus::Completed)).await.unwrap();

        let runs = store.load().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, "good");
        assert_eq!(runs[1].run_id, "later");
    }
}
