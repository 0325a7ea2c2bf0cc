use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::TaskTreeError;

pub const DEFAULT_STAGES: [&str; 7] = [
    "observe", "evaluate", "decide", "verify", "execute", "monitor", "review",
];
pub const DEFAULT_DEDUPE_WINDOW_MS: u64 = 60_000;
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 200;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_QUEUE_BUDGET_NAME: &str = "task_tree.queue";
pub const DEFAULT_QUEUE_TTL_MULTIPLIER: u64 = 4;

/// Outcome codes that mean an external dependency is unavailable.
///
/// A stage reporting one of these is recorded as blocked instead of failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyCode {
    BrokerNotConnected,
    TradingDisabled,
    AutopilotDisabled,
    AutopilotKillswitch,
    BacktesterUnavailable,
    ChartUnavailable,
    AgentNotFound,
    AgentToolsDenied,
    AgentBrokerDenied,
    RiskExceedsCap,
    ConfirmationRequired,
}

impl DependencyCode {
    pub const ALL: [DependencyCode; 11] = [
        DependencyCode::BrokerNotConnected,
        DependencyCode::TradingDisabled,
        DependencyCode::AutopilotDisabled,
        DependencyCode::AutopilotKillswitch,
        DependencyCode::BacktesterUnavailable,
        DependencyCode::ChartUnavailable,
        DependencyCode::AgentNotFound,
        DependencyCode::AgentToolsDenied,
        DependencyCode::AgentBrokerDenied,
        DependencyCode::RiskExceedsCap,
        DependencyCode::ConfirmationRequired,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DependencyCode::BrokerNotConnected => "broker_not_connected",
            DependencyCode::TradingDisabled => "trading_disabled",
            DependencyCode::AutopilotDisabled => "autopilot_disabled",
            DependencyCode::AutopilotKillswitch => "autopilot_killswitch",
            DependencyCode::BacktesterUnavailable => "backtester_unavailable",
            DependencyCode::ChartUnavailable => "chart_unavailable",
            DependencyCode::AgentNotFound => "agent_not_found",
            DependencyCode::AgentToolsDenied => "agent_tools_denied",
            DependencyCode::AgentBrokerDenied => "agent_broker_denied",
            DependencyCode::RiskExceedsCap => "risk_exceeds_cap",
            DependencyCode::ConfirmationRequired => "confirmation_required",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        let code = code.trim();
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(code))
    }
}

impl std::fmt::Display for DependencyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskTreeConfig {
    /// Ordered pipeline stage names.
    pub stages: Vec<String>,
    /// How long a dedupe key keeps coalescing enqueues.
    pub dedupe_window_ms: u64,
    pub max_queue_depth: usize,
    /// Retries per stage under the default retry policy.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub dependency_codes: Vec<DependencyCode>,
    /// Cache name the queue is registered under in the budget manager.
    pub queue_budget_name: String,
    /// Queued jobs older than `dedupe_window_ms * queue_ttl_multiplier` are pruned.
    pub queue_ttl_multiplier: u64,
}

impl Default for TaskTreeConfig {
    fn default() -> Self {
        Self {
            stages: DEFAULT_STAGES.iter().map(|s| s.to_string()).collect(),
            dedupe_window_ms: DEFAULT_DEDUPE_WINDOW_MS,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            max_retries: 0,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            dependency_codes: DependencyCode::ALL.to_vec(),
            queue_budget_name: DEFAULT_QUEUE_BUDGET_NAME.to_string(),
            queue_ttl_multiplier: DEFAULT_QUEUE_TTL_MULTIPLIER,
        }
    }
}

impl TaskTreeConfig {
    /// Defaults, then the JSON file at `path` (if any), then `TASKTREE_*` env vars.
    /// Load the JSON file (or defaults), overlay `TASKTREE_*` environment
    /// variables, and validate.
    pub async fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_with(path, |name| std::env::var(name).ok()).await
    }

    /// Same as `load`, reading overrides through `lookup` instead of the
    /// process environment.
    pub async fn load_with<F>(path: Option<&Path>, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => {
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("reading task tree config {}", path.display()))?;
                serde_json::from_str::<Self>(&raw)
                    .with_context(|| format!("parsing task tree config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_overrides_from(lookup);
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = clamped(&lookup, "TASKTREE_DEDUPE_WINDOW_MS", 0, 86_400_000) {
            self.dedupe_window_ms = value;
        }
        if let Some(value) = clamped(&lookup, "TASKTREE_MAX_QUEUE_DEPTH", 1, 10_000) {
            self.max_queue_depth = value as usize;
        }
        if let Some(value) = clamped(&lookup, "TASKTREE_MAX_RETRIES", 0, 20) {
            self.max_retries = value as u32;
        }
        if let Some(value) = clamped(&lookup, "TASKTREE_RETRY_BASE_DELAY_MS", 0, 600_000) {
            self.retry_base_delay_ms = value;
        }
        if let Some(raw) = lookup("TASKTREE_STAGES") {
            let stages: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|stage| !stage.is_empty())
                .map(str::to_string)
                .collect();
            if !stages.is_empty() {
                self.stages = stages;
            }
        }
    }

    pub fn validate(&self) -> Result<(), TaskTreeError> {
        if self.stages.is_empty() {
            return Err(TaskTreeError::EmptyStageList);
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.trim().is_empty() {
                return Err(TaskTreeError::InvalidConfig(
                    "stage names must not be blank".to_string(),
                ));
            }
            if !seen.insert(stage.as_str()) {
                return Err(TaskTreeError::DuplicateStage(stage.clone()));
            }
        }
        if self.max_queue_depth == 0 {
            return Err(TaskTreeError::InvalidConfig(
                "max_queue_depth must be at least 1".to_string(),
            ));
        }
        if self.queue_budget_name.trim().is_empty() {
            return Err(TaskTreeError::InvalidConfig(
                "queue_budget_name must not be blank".to_string(),
            ));
        }
        Ok(())
    }

    pub fn dependency_code_set(&self) -> HashSet<DependencyCode> {
        self.dependency_codes.iter().copied().collect()
    }

    pub(crate) fn queue_max_age_ms(&self) -> Option<u64> {
        let age = self
            .dedupe_window_ms
            .saturating_mul(self.queue_ttl_multiplier);
        (age > 0).then_some(age)
    }
}

fn clamped<F>(lookup: &F, name: &str, min: u64, max: u64) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(name)?;
    let value = raw.trim().parse::<i64>().ok()?;
    Some((value.max(0) as u64).clamp(min, max))
}
