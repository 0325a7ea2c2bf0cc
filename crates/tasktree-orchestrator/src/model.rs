use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const NOTE_NO_HANDLER: &str = "no_handler";
pub const NOTE_RESUME_SKIP: &str = "resume_skip";
pub const NOTE_HALT: &str = "halt";
pub const CODE_TIMEOUT: &str = "timeout";

/// Key under which the most recent stage outcome is mirrored into the data bag.
pub const LAST_STEP_KEY: &str = "last_step";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Failed,
    Skipped,
    Blocked,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
            StageStatus::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Blocked,
    Skipped,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Blocked => "blocked",
            RunStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
}

/// What a stage handler returns for one attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub ok: bool,
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl StageResult {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn retryable(error: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::failed(error)
        }
    }

    pub fn skipped(note: impl Into<String>) -> Self {
        Self {
            ok: true,
            skip: true,
            note: Some(note.into()),
            ..Self::default()
        }
    }

    /// A skip that stops the run.
    pub fn halt() -> Self {
        Self::skipped(NOTE_HALT)
    }

    pub fn blocked(code: impl Into<String>) -> Self {
        Self {
            ok: false,
            blocked: true,
            code: Some(code.into()),
            ..Self::default()
        }
    }

    pub(crate) fn timed_out(limit_ms: u64) -> Self {
        Self {
            code: Some(CODE_TIMEOUT.to_string()),
            ..Self::retryable(format!("stage timed out after {limit_ms}ms"))
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_retry_after_ms(mut self, delay_ms: u64) -> Self {
        self.retry_after_ms = Some(delay_ms);
        self
    }
}

/// Final record of one stage execution within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: String,
    pub status: StageStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub started_at_ms: u64,
    #[serde(default)]
    pub finished_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl StageOutcome {
    pub(crate) fn no_handler(stage: &str) -> Self {
        let now = now_ms();
        Self {
            stage: stage.to_string(),
            status: StageStatus::Skipped,
            attempts: 0,
            retries: 0,
            started_at_ms: now,
            finished_at_ms: now,
            error: None,
            note: Some(NOTE_NO_HANDLER.to_string()),
            code: None,
            data: None,
        }
    }

    /// Stand-in for a stage that finished in an earlier run.
    pub(crate) fn resumed(stage: &str, prior: Option<&StageOutcome>) -> Self {
        let now = now_ms();
        match prior {
            Some(prior) => Self {
                note: Some(NOTE_RESUME_SKIP.to_string()),
                ..prior.clone()
            },
            None => Self {
                stage: stage.to_string(),
                status: StageStatus::Skipped,
                attempts: 0,
                retries: 0,
                started_at_ms: now,
                finished_at_ms: now,
                error: None,
                note: Some(NOTE_RESUME_SKIP.to_string()),
                code: None,
                data: None,
            },
        }
    }

    pub fn is_halt(&self) -> bool {
        self.status == StageStatus::Skipped && self.note.as_deref() == Some(NOTE_HALT)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_index: Option<usize>,
}

/// Per-run checkpoint: the last outcome recorded for each stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    #[serde(default)]
    pub steps: BTreeMap<String, StageOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<StageOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<ResumePoint>,
}

impl TaskState {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.last.is_none() && self.resume.is_none()
    }

    /// Index of the first stage that still has to run.
    ///
    /// Explicit resume metadata wins; otherwise the first stage whose recorded
    /// status is neither completed nor skipped (or which has no record).
    pub fn resume_index(&self, stages: &[String]) -> usize {
        if self.is_empty() {
            return 0;
        }
        if let Some(resume) = &self.resume {
            if let Some(index) = resume
                .stage
                .as_deref()
                .and_then(|name| stages.iter().position(|stage| stage == name))
            {
                return index;
            }
            if let Some(index) = resume.stage_index {
                return index.min(stages.len());
            }
        }
        stages
            .iter()
            .position(|stage| {
                !matches!(
                    self.steps.get(stage).map(|outcome| outcome.status),
                    Some(StageStatus::Completed) | Some(StageStatus::Skipped)
                )
            })
            .unwrap_or(stages.len())
    }

    /// Record the outcome of the stage at `stage_index`. Resume metadata that
    /// names this stage, or points at or before its index, is cleared.
    pub(crate) fn record(&mut self, outcome: &StageOutcome, stage_index: usize) {
        self.steps.insert(outcome.stage.clone(), outcome.clone());
        self.last = Some(outcome.clone());
        let stale = self.resume.as_ref().is_some_and(|resume| {
            resume.stage.as_deref() == Some(outcome.stage.as_str())
                || resume.stage_index.is_some_and(|index| stage_index >= index)
        });
        if stale {
            self.resume = None;
        }
    }

    /// Keep a stand-in for a stage passed over by resume, unless a record
    /// from an earlier run already exists.
    pub(crate) fn backfill(&mut self, outcome: &StageOutcome) {
        self.steps
            .entry(outcome.stage.clone())
            .or_insert_with(|| outcome.clone());
    }
}

/// Free-form values shared between the stages of one run.
///
/// Stage outputs are merged with a shallow overwrite: each top-level key in
/// the patch replaces the key already present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataBag(Map<String, Value>);

impl DataBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn merge(&mut self, patch: Map<String, Value>) {
        for (key, value) in patch {
            self.0.insert(key, value);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for DataBag {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watcher_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// State threaded through every stage of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: String,
    pub created_at_ms: u64,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub domain: DomainFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watcher: Option<Value>,
    #[serde(default)]
    pub data: DataBag,
    #[serde(default)]
    pub task_state: TaskState,
}

impl RunContext {
    pub(crate) fn record_outcome(&mut self, outcome: &StageOutcome, stage_index: usize) {
        self.task_state.record(outcome, stage_index);
        if let Ok(value) = serde_json::to_value(outcome) {
            self.data.insert(LAST_STEP_KEY, value);
        }
    }
}

/// A unit of work handed to `TaskTree::enqueue`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub source: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub domain: DomainFields,
    #[serde(default)]
    pub signal: Option<Value>,
    #[serde(default)]
    pub watcher: Option<Value>,
    #[serde(default)]
    pub dedupe_key: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
    #[serde(default)]
    pub task_state: Option<TaskState>,
}

impl EnqueueRequest {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn symbol(mut self, symbol: impl Into<String>) -> Self {
        self.domain.symbol = Some(symbol.into());
        self
    }

    pub fn timeframe(mut self, timeframe: impl Into<String>) -> Self {
        self.domain.timeframe = Some(timeframe.into());
        self
    }

    pub fn strategy(mut self, strategy: impl Into<String>) -> Self {
        self.domain.strategy = Some(strategy.into());
        self
    }

    pub fn watcher_id(mut self, watcher_id: impl Into<String>) -> Self {
        self.domain.watcher_id = Some(watcher_id.into());
        self
    }

    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.domain.mode = Some(mode.into());
        self
    }

    pub fn signal(mut self, signal: Value) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn watcher(mut self, watcher: Value) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn data(mut self, data: Map<String, Value>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn task_state(mut self, state: TaskState) -> Self {
        self.task_state = Some(state);
        self
    }

    pub(crate) fn normalized_dedupe_key(&self) -> Option<String> {
        self.dedupe_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
    }

    pub(crate) fn into_context(self, run_id: String, created_at_ms: u64) -> RunContext {
        let source = match self.source.trim() {
            "" => "unknown".to_string(),
            trimmed => trimmed.to_string(),
        };
        RunContext {
            run_id,
            created_at_ms,
            source,
            correlation_id: self.correlation_id,
            domain: self.domain,
            signal: self.signal,
            watcher: self.watcher,
            data: self.data.map(DataBag::from).unwrap_or_default(),
            task_state: self.task_state.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueReceipt {
    pub run_id: String,
    pub queued: bool,
}

/// Terminal record of a run, handed to observers once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub created_at_ms: u64,
    pub finished_at_ms: u64,
    pub steps: Vec<StageOutcome>,
    #[serde(default)]
    pub context: DomainFields,
    #[serde(default)]
    pub task_state: TaskState,
}

impl RunSummary {
    pub fn step(&self, stage: &str) -> Option<&StageOutcome> {
        self.steps.iter().find(|outcome| outcome.stage == stage)
    }
}

pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stages() -> Vec<String> {
        ["observe", "evaluate", "decide"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn outcome(stage: &str, status: StageStatus) -> StageOutcome {
        StageOutcome {
            stage: stage.to_string(),
            status,
            attempts: 1,
            retries: 0,
            started_at_ms: 1,
            finished_at_ms: 2,
            error: None,
            note: None,
            code: None,
            data: None,
        }
    }

    #[test]
    fn data_bag_merge_overwrites_top_level_keys() {
        let mut bag = DataBag::new();
        bag.insert("quote", json!({"bid": 1.0, "ask": 1.1}));
        bag.insert("keep", json!(true));
        let mut patch = Map::new();
        patch.insert("quote".to_string(), json!({"bid": 2.0}));
        bag.merge(patch);
        assert_eq!(bag.get("quote"), Some(&json!({"bid": 2.0})));
        assert_eq!(bag.get("keep"), Some(&json!(true)));
        assert_eq!(bag.len(), 2);
    }

    #[test]
    fn resume_index_is_zero_without_state() {
        assert_eq!(TaskState::default().resume_index(&stages()), 0);
    }

    #[test]
    fn resume_index_scans_for_first_unfinished_stage() {
        let mut state = TaskState::default();
        state.record(&outcome("observe", StageStatus::Completed), 0);
        state.record(&outcome("evaluate", StageStatus::Skipped), 1);
        assert_eq!(state.resume_index(&stages()), 2);

        state.record(&outcome("evaluate", StageStatus::Failed), 1);
        assert_eq!(state.resume_index(&stages()), 1);
    }

    #[test]
    fn resume_index_prefers_explicit_metadata() {
        let mut state = TaskState::default();
        state.record(&outcome("observe", StageStatus::Completed), 0);
        state.resume = Some(ResumePoint {
            stage: Some("decide".to_string()),
            stage_index: None,
        });
        assert_eq!(state.resume_index(&stages()), 2);

        state.resume = Some(ResumePoint {
            stage: Some("missing".to_string()),
            stage_index: Some(9),
        });
        assert_eq!(state.resume_index(&stages()), 3);
    }

    #[test]
    fn recording_a_stage_clears_its_resume_point() {
        let mut state = TaskState {
            resume: Some(ResumePoint {
                stage: Some("evaluate".to_string()),
                stage_index: None,
            }),
            ..TaskState::default()
        };
        state.record(&outcome("observe", StageStatus::Completed), 0);
        assert!(state.resume.is_some());
        state.record(&outcome("evaluate", StageStatus::Completed), 1);
        assert!(state.resume.is_none());
        assert_eq!(state.last.as_ref().map(|o| o.stage.as_str()), Some("evaluate"));
    }

    #[test]
    fn recording_at_or_past_a_resume_index_clears_it() {
        let mut state = TaskState {
            resume: Some(ResumePoint {
                stage: None,
                stage_index: Some(2),
            }),
            ..TaskState::default()
        };
        state.record(&outcome("evaluate", StageStatus::Completed), 1);
        assert!(state.resume.is_some());
        state.record(&outcome("decide", StageStatus::Completed), 2);
        assert!(state.resume.is_none());
    }

    #[test]
    fn backfill_keeps_existing_records() {
        let mut state = TaskState::default();
        state.record(&outcome("observe", StageStatus::Completed), 0);
        state.backfill(&StageOutcome::resumed("observe", None));
        state.backfill(&StageOutcome::resumed("evaluate", None));
        assert_eq!(state.steps["observe"].status, StageStatus::Completed);
        assert_eq!(state.steps["evaluate"].status, StageStatus::Skipped);
        assert_eq!(state.last.as_ref().map(|o| o.stage.as_str()), Some("observe"));
        assert_eq!(state.resume_index(&stages()), 2);
    }

    #[test]
    fn resumed_outcome_keeps_prior_status() {
        let prior = outcome("observe", StageStatus::Completed);
        let resumed = StageOutcome::resumed("observe", Some(&prior));
        assert_eq!(resumed.status, StageStatus::Completed);
        assert_eq!(resumed.note.as_deref(), Some(NOTE_RESUME_SKIP));

        let synthesized = StageOutcome::resumed("evaluate", None);
        assert_eq!(synthesized.status, StageStatus::Skipped);
        assert_eq!(synthesized.attempts, 0);
    }

    #[test]
    fn enqueue_request_normalizes_source_and_dedupe_key() {
        let request = EnqueueRequest::new("  ").dedupe_key("   ");
        assert!(request.normalized_dedupe_key().is_none());
        let context = request.into_context("run-1".to_string(), 10);
        assert_eq!(context.source, "unknown");
        assert!(context.task_state.is_empty());
    }

    #[test]
    fn run_context_serializes_domain_fields_flat() {
        let context = EnqueueRequest::new("watcher")
            .symbol("EURUSD")
            .timeframe("H1")
            .into_context("run-2".to_string(), 5);
        let value = serde_json::to_value(&context).unwrap();
        assert_eq!(value["symbol"], "EURUSD");
        assert_eq!(value["timeframe"], "H1");
        assert_eq!(value["source"], "watcher");
    }

    #[test]
    fn stage_result_deserializes_with_missing_flags() {
        let result: StageResult =
            serde_json::from_value(json!({"ok": false, "code": "broker_not_connected"})).unwrap();
        assert!(!result.retryable);
        assert!(!result.blocked);
        assert_eq!(result.code.as_deref(), Some("broker_not_connected"));
    }
}
