use serde::{Deserialize, Serialize};

use crate::model::{JobStatus, RunContext, StageOutcome};

/// Read-only projection of the orchestrator for live observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTreeSnapshot {
    pub updated_at_ms: u64,
    pub processing: bool,
    pub queue_depth: usize,
    #[serde(default)]
    pub queue: Vec<QueuedJobView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<CurrentJobView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJobView {
    pub run_id: String,
    pub status: JobStatus,
    pub enqueued_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    pub context: RunContext,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentJobView {
    pub run_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_started_at_ms: Option<u64>,
    pub context: RunContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_step: Option<StageOutcome>,
}
