//! Queue, dedupe window, and current-job bookkeeping behind the task tree lock.

use std::collections::{HashMap, VecDeque};

use crate::model::{JobStatus, RunContext, StageOutcome};
use crate::snapshot::{CurrentJobView, QueuedJobView, TaskTreeSnapshot};

#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub run_id: String,
    pub dedupe_key: Option<String>,
    pub enqueued_at_ms: u64,
    pub status: JobStatus,
    pub context: RunContext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DedupeEntry {
    pub run_id: String,
    pub expires_at_ms: u64,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct TreeState {
    pub queue: VecDeque<Job>,
    pub dedupe: HashMap<String, DedupeEntry>,
    pub processing: bool,
    pub current: Option<CurrentJobView>,
}

impl TreeState {
    pub fn sweep_dedupe(&mut self, now_ms: u64) {
        self.dedupe.retain(|_, entry| entry.expires_at_ms > now_ms);
    }

    /// Live dedupe entry for `key`. Call `sweep_dedupe` first.
    pub fn dedupe_hit(&self, key: &str) -> Option<&DedupeEntry> {
        self.dedupe.get(key)
    }

    /// Drop jobs from the head until at most `max_depth` remain.
    pub fn trim_overflow(&mut self, max_depth: usize) -> Vec<Job> {
        let overflow = self.queue.len().saturating_sub(max_depth);
        self.queue.drain(..overflow).collect()
    }

    pub fn begin(&mut self, job: &Job) {
        self.current = Some(CurrentJobView {
            run_id: job.run_id.clone(),
            status: JobStatus::Running,
            stage: None,
            stage_started_at_ms: None,
            context: job.context.clone(),
            last_step: None,
        });
    }

    pub fn enter_stage(&mut self, stage: &str, started_at_ms: u64, context: &RunContext) {
        if let Some(current) = self.current.as_mut() {
            current.stage = Some(stage.to_string());
            current.stage_started_at_ms = Some(started_at_ms);
            current.context = context.clone();
        }
    }

    pub fn finish_stage(&mut self, outcome: &StageOutcome, context: &RunContext) {
        if let Some(current) = self.current.as_mut() {
            current.last_step = Some(outcome.clone());
            current.context = context.clone();
        }
    }

    pub fn snapshot(&self, now_ms: u64) -> TaskTreeSnapshot {
        TaskTreeSnapshot {
            updated_at_ms: now_ms,
            processing: self.processing,
            queue_depth: self.queue.len(),
            queue: self
                .queue
                .iter()
                .map(|job| QueuedJobView {
                    run_id: job.run_id.clone(),
                    status: job.status,
                    enqueued_at_ms: job.enqueued_at_ms,
                    dedupe_key: job.dedupe_key.clone(),
                    context: job.context.clone(),
                })
                .collect(),
            current: self.current.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EnqueueRequest;

    fn job(run_id: &str) -> Job {
        Job {
            run_id: run_id.to_string(),
            dedupe_key: None,
            enqueued_at_ms: 0,
            status: JobStatus::Queued,
            context: EnqueueRequest::new("test").into_context(run_id.to_string(), 0),
        }
    }

    #[test]
    fn sweep_drops_only_expired_entries() {
        let mut state = TreeState::default();
        for (key, expires_at_ms) in [("old", 100), ("edge", 200), ("new", 300)] {
            state.dedupe.insert(
                key.to_string(),
                DedupeEntry {
                    run_id: format!("run-{key}"),
                    expires_at_ms,
                    correlation_id: None,
                },
            );
        }
        state.sweep_dedupe(200);
        assert!(state.dedupe_hit("old").is_none());
        assert!(state.dedupe_hit("edge").is_none());
        assert_eq!(state.dedupe_hit("new").unwrap().run_id, "run-new");
    }

    #[test]
    fn trim_overflow_drops_oldest_jobs() {
        let mut state = TreeState::default();
        for id in ["a", "b", "c", "d", "e"] {
            state.queue.push_back(job(id));
        }
        let dropped: Vec<String> = state
            .trim_overflow(3)
            .into_iter()
            .map(|job| job.run_id)
            .collect();
        assert_eq!(dropped, vec!["a", "b"]);
        let remaining: Vec<&str> = state.queue.iter().map(|j| j.run_id.as_str()).collect();
        assert_eq!(remaining, vec!["c", "d", "e"]);
        assert!(state.trim_overflow(3).is_empty());
    }

    #[test]
    fn snapshot_projects_queue_and_current_job() {
        let mut state = TreeState::default();
        let running = job("running");
        state.begin(&running);
        state.enter_stage("decide", 42, &running.context);
        state.queue.push_back(job("waiting"));
        state.processing = true;

        let snapshot = state.snapshot(99);
        assert_eq!(snapshot.updated_at_ms, 99);
        assert!(snapshot.processing);
        assert_eq!(snapshot.queue_depth, 1);
        assert_eq!(snapshot.queue[0].run_id, "waiting");
        assert_eq!(snapshot.queue[0].status, JobStatus::Queued);
        let current = snapshot.current.unwrap();
        assert_eq!(current.run_id, "running");
        assert_eq!(current.status, JobStatus::Running);
        assert_eq!(current.stage.as_deref(), Some("decide"));
        assert_eq!(current.stage_started_at_ms, Some(42));
    }
}
