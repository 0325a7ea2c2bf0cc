//! The task tree orchestrator.
//!
//! Jobs are drained one at a time by a dedicated worker task, and every job
//! runs the configured stages in order. `enqueue` never blocks and never runs
//! a job on the caller's stack: it only appends to the queue and, when the
//! tree was idle, wakes the worker.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tasktree_budget::{BudgetManager, BudgetTelemetry, EvictionReason};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::config::{DependencyCode, TaskTreeConfig};
use crate::error::{TaskTreeError, TaskTreeResult};
use crate::handler::StageHandler;
use crate::hooks::{
    AuditEvent, AuditEventType, AuditLevel, ObserverMessage, ObserverSet, TaskTreeObserver,
    TracingObserver,
};
use crate::model::{
    now_ms, EnqueueReceipt, EnqueueRequest, JobStatus, RunContext, RunStatus, RunSummary,
    StageOutcome, StageResult, StageStatus,
};
use crate::policy::{
    classify, default_retry_decision, retry_delay, RetryDecision, RetryInput, RetryPolicyFn,
    TimeoutResolverFn,
};
use crate::queue::{DedupeEntry, Job, TreeState};
use crate::snapshot::TaskTreeSnapshot;

pub struct TaskTreeBuilder {
    config: TaskTreeConfig,
    budget: Option<Arc<BudgetManager>>,
    observers: Vec<Arc<dyn TaskTreeObserver>>,
    handlers: HashMap<String, Arc<dyn StageHandler>>,
    timeout: Option<TimeoutResolverFn>,
    retry_policy: Option<RetryPolicyFn>,
    tracing: bool,
}

impl TaskTreeBuilder {
    pub fn new(config: TaskTreeConfig) -> Self {
        Self {
            config,
            budget: None,
            observers: Vec::new(),
            handlers: HashMap::new(),
            timeout: None,
            retry_policy: None,
            tracing: true,
        }
    }

    /// Share a budget manager (for example `tasktree_budget::global_budget()`).
    pub fn budget(mut self, budget: Arc<BudgetManager>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn TaskTreeObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn handler(mut self, stage: impl Into<String>, handler: impl StageHandler + 'static) -> Self {
        self.handlers.insert(stage.into(), Arc::new(handler));
        self
    }

    /// Per-attempt timeout. A resolver that panics leaves the attempt unbounded.
    pub fn timeout_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&str, &RunContext, u32) -> Option<Duration> + Send + Sync + 'static,
    {
        self.timeout = Some(Arc::new(resolver));
        self
    }

    /// Replaces the default retry decision and is not capped by `max_retries`.
    /// A policy that panics is treated as a stop.
    pub fn retry_policy<F>(mut self, policy: F) -> Self
    where
        F: Fn(&RetryInput<'_>) -> RetryDecision + Send + Sync + 'static,
    {
        self.retry_policy = Some(Arc::new(policy));
        self
    }

    /// Skip the built-in observer that logs audit events through `tracing`.
    pub fn without_tracing(mut self) -> Self {
        self.tracing = false;
        self
    }

    /// Must be called from within a tokio runtime.
    pub fn build(self) -> TaskTreeResult<TaskTree> {
        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|_| TaskTreeError::NoRuntime)?;
        for stage in self.handlers.keys() {
            if !self.config.stages.contains(stage) {
                return Err(TaskTreeError::UnknownStage(stage.clone()));
            }
        }

        let budget = self
            .budget
            .unwrap_or_else(|| Arc::new(BudgetManager::new()));
        budget.register(
            &self.config.queue_budget_name,
            Some(self.config.max_queue_depth),
            self.config.queue_max_age_ms(),
        );

        let mut observers: Vec<Arc<dyn TaskTreeObserver>> = Vec::new();
        if self.tracing {
            observers.push(Arc::new(TracingObserver));
        }
        observers.extend(self.observers);

        let (observer_tx, observer_rx) = mpsc::unbounded_channel();
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let (processing_tx, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            dependency_codes: self.config.dependency_code_set(),
            config: self.config,
            handlers: RwLock::new(self.handlers),
            state: Mutex::new(TreeState::default()),
            budget,
            timeout: self.timeout,
            retry_policy: self.retry_policy,
            observer_tx,
            wake_tx,
            processing_tx,
            runtime: runtime.clone(),
        });

        runtime.spawn(ObserverSet::new(observers).pump(observer_rx));
        runtime.spawn(run_worker(Arc::downgrade(&inner), wake_rx));

        Ok(TaskTree { inner })
    }
}

struct Inner {
    config: TaskTreeConfig,
    dependency_codes: HashSet<DependencyCode>,
    handlers: RwLock<HashMap<String, Arc<dyn StageHandler>>>,
    state: Mutex<TreeState>,
    budget: Arc<BudgetManager>,
    timeout: Option<TimeoutResolverFn>,
    retry_policy: Option<RetryPolicyFn>,
    observer_tx: mpsc::UnboundedSender<ObserverMessage>,
    wake_tx: mpsc::UnboundedSender<()>,
    processing_tx: watch::Sender<bool>,
    runtime: Handle,
}

impl Inner {
    fn queue_budget(&self) -> &str {
        &self.config.queue_budget_name
    }

    fn audit(&self, event: AuditEvent) {
        let _ = self.observer_tx.send(ObserverMessage::Audit(event));
    }

    fn publish_state(&self, snapshot: TaskTreeSnapshot) {
        let _ = self.observer_tx.send(ObserverMessage::State(snapshot));
    }

    fn persist(&self, summary: RunSummary) {
        let _ = self.observer_tx.send(ObserverMessage::Persist(summary));
    }

    fn snapshot(&self) -> TaskTreeSnapshot {
        self.state.lock().snapshot(now_ms())
    }

    fn with_state<F>(&self, update: F)
    where
        F: FnOnce(&mut TreeState),
    {
        let snapshot = {
            let mut state = self.state.lock();
            update(&mut state);
            state.snapshot(now_ms())
        };
        self.publish_state(snapshot);
    }
}

/// Handle to a running task tree. Clones share the same queue and worker.
#[derive(Clone)]
pub struct TaskTree {
    inner: Arc<Inner>,
}

impl TaskTree {
    pub fn builder(config: TaskTreeConfig) -> TaskTreeBuilder {
        TaskTreeBuilder::new(config)
    }

    pub fn config(&self) -> &TaskTreeConfig {
        &self.inner.config
    }

    /// Replace the whole handler set. Stages left out run as `no_handler` skips.
    pub fn set_handlers<I>(&self, handlers: I) -> TaskTreeResult<()>
    where
        I: IntoIterator<Item = (String, Arc<dyn StageHandler>)>,
    {
        let handlers: HashMap<String, Arc<dyn StageHandler>> = handlers.into_iter().collect();
        if let Some(unknown) = handlers
            .keys()
            .find(|stage| !self.inner.config.stages.contains(stage))
        {
            return Err(TaskTreeError::UnknownStage(unknown.clone()));
        }
        *self.inner.handlers.write() = handlers;
        Ok(())
    }

    pub fn set_handler(
        &self,
        stage: &str,
        handler: impl StageHandler + 'static,
    ) -> TaskTreeResult<()> {
        if !self.inner.config.stages.iter().any(|name| name == stage) {
            return Err(TaskTreeError::UnknownStage(stage.to_string()));
        }
        self.inner
            .handlers
            .write()
            .insert(stage.to_string(), Arc::new(handler));
        Ok(())
    }

    pub fn enqueue(&self, request: EnqueueRequest) -> EnqueueReceipt {
        let inner = &self.inner;
        let budget_name = inner.queue_budget();
        let now = now_ms();
        let mut events = Vec::new();

        let mut state = inner.state.lock();
        state.sweep_dedupe(now);

        let dedupe_key = request.normalized_dedupe_key();
        if let Some(key) = dedupe_key.as_deref() {
            let hit = state.dedupe_hit(key).cloned();
            if let Some(existing) = hit {
                drop(state);
                inner.audit(
                    AuditEvent::new(AuditEventType::Deduped, existing.run_id.clone())
                        .correlation_id(
                            request
                                .correlation_id
                                .clone()
                                .or(existing.correlation_id.clone()),
                        )
                        .payload(json!({
                            "dedupe_key": key,
                            "source": request.source,
                            "expires_at_ms": existing.expires_at_ms,
                        })),
                );
                return EnqueueReceipt {
                    run_id: existing.run_id,
                    queued: false,
                };
            }
        }

        let run_id = request
            .run_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let context = request.into_context(run_id.clone(), now);
        let correlation_id = context.correlation_id.clone();

        if let Some(key) = dedupe_key.as_deref() {
            state.dedupe.insert(
                key.to_string(),
                DedupeEntry {
                    run_id: run_id.clone(),
                    expires_at_ms: now.saturating_add(inner.config.dedupe_window_ms),
                    correlation_id: correlation_id.clone(),
                },
            );
        }

        events.push(
            AuditEvent::new(AuditEventType::Enqueued, run_id.clone())
                .correlation_id(correlation_id.clone())
                .payload(json!({
                    "source": context.source,
                    "dedupe_key": dedupe_key,
                })),
        );
        state.queue.push_back(Job {
            run_id: run_id.clone(),
            dedupe_key,
            enqueued_at_ms: now,
            status: JobStatus::Queued,
            context,
        });
        inner.budget.note_set(budget_name, &run_id);

        let trimmed = state.trim_overflow(inner.config.max_queue_depth);
        if !trimmed.is_empty() {
            inner
                .budget
                .note_eviction(budget_name, trimmed.len() as u64, EvictionReason::Lru);
            let dropped: Vec<&str> = trimmed.iter().map(|job| job.run_id.as_str()).collect();
            tracing::warn!(
                dropped = trimmed.len(),
                max_queue_depth = inner.config.max_queue_depth,
                "task tree queue overflow, dropping oldest jobs"
            );
            events.push(
                AuditEvent::new(AuditEventType::QueueTrimmed, run_id.clone())
                    .correlation_id(correlation_id.clone())
                    .level(AuditLevel::Warn)
                    .payload(json!({
                        "dropped": trimmed.len(),
                        "dropped_run_ids": dropped,
                        "max_queue_depth": inner.config.max_queue_depth,
                    })),
            );
        }

        let mut live: HashMap<String, u64> = state
            .queue
            .iter()
            .map(|job| (job.run_id.clone(), job.enqueued_at_ms))
            .collect();
        let pruned = inner
            .budget
            .apply_with_age(budget_name, &mut live, |enqueued_at| Some(*enqueued_at));
        if !pruned.is_empty() {
            state.queue.retain(|job| live.contains_key(&job.run_id));
            events.push(
                AuditEvent::new(AuditEventType::QueueTtlPruned, run_id.clone())
                    .correlation_id(correlation_id.clone())
                    .level(AuditLevel::Warn)
                    .payload(json!({
                        "pruned": pruned.len(),
                        "pruned_run_ids": pruned,
                    })),
            );
        }
        inner.budget.set_size(budget_name, state.queue.len());

        let start = !state.processing;
        if start {
            state.processing = true;
            inner.processing_tx.send_replace(true);
        }
        let snapshot = state.snapshot(now);
        drop(state);

        for event in events {
            inner.audit(event);
        }
        inner.publish_state(snapshot);
        if start {
            let _ = inner.wake_tx.send(());
        }

        EnqueueReceipt {
            run_id,
            queued: true,
        }
    }

    pub fn get_snapshot(&self) -> TaskTreeSnapshot {
        self.inner.snapshot()
    }

    pub fn is_processing(&self) -> bool {
        *self.inner.processing_tx.borrow()
    }

    /// Resolves once the queue is drained and no job is running.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.processing_tx.subscribe();
        let _ = rx.wait_for(|processing| !*processing).await;
    }

    /// Resolves once observers have seen every message emitted before the call.
    pub async fn flush_observers(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .inner
            .observer_tx
            .send(ObserverMessage::Flush(done_tx))
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }

    pub fn queue_telemetry(&self) -> Option<BudgetTelemetry> {
        self.inner.budget.telemetry_for(self.inner.queue_budget())
    }

    pub fn budget(&self) -> Arc<BudgetManager> {
        self.inner.budget.clone()
    }
}

async fn run_worker(inner: Weak<Inner>, mut wake_rx: mpsc::UnboundedReceiver<()>) {
    while wake_rx.recv().await.is_some() {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        drain(&inner).await;
    }
    tracing::debug!("task tree worker stopped");
}

async fn drain(inner: &Inner) {
    loop {
        tokio::task::yield_now().await;

        let (job, snapshot) = {
            let mut state = inner.state.lock();
            let job = state.queue.pop_front();
            match &job {
                Some(job) => {
                    state.begin(job);
                    inner.budget.forget(inner.queue_budget(), &job.run_id);
                }
                None => {
                    state.processing = false;
                    state.current = None;
                    inner.processing_tx.send_replace(false);
                }
            }
            inner.budget.set_size(inner.queue_budget(), state.queue.len());
            (job, state.snapshot(now_ms()))
        };
        inner.publish_state(snapshot);

        match job {
            Some(job) => run_job(inner, job).await,
            None => break,
        }
    }
}

async fn run_job(inner: &Inner, job: Job) {
    let Job {
        run_id,
        mut context,
        ..
    } = job;
    let stages = inner.config.stages.clone();
    let start_index = context.task_state.resume_index(&stages);

    inner.audit(
        AuditEvent::new(AuditEventType::RunStart, run_id.clone())
            .correlation_id(context.correlation_id.clone())
            .payload(json!({
                "source": context.source,
                "resume_from": stages.get(start_index),
                "resume_index": start_index,
            })),
    );

    let mut steps = Vec::with_capacity(stages.len());
    let mut halted = None;

    for (index, stage) in stages.iter().enumerate() {
        if index < start_index {
            let resumed = StageOutcome::resumed(stage, context.task_state.steps.get(stage));
            context.task_state.backfill(&resumed);
            steps.push(resumed);
            continue;
        }

        let handler = inner.handlers.read().get(stage).cloned();
        let outcome = match handler {
            Some(handler) => run_stage(inner, stage, handler, &mut context).await,
            None => StageOutcome::no_handler(stage),
        };

        context.record_outcome(&outcome, index);
        inner.with_state(|state| state.finish_stage(&outcome, &context));

        let level = match outcome.status {
            StageStatus::Failed => AuditLevel::Error,
            StageStatus::Blocked => AuditLevel::Warn,
            _ => AuditLevel::Info,
        };
        inner.audit(
            AuditEvent::new(AuditEventType::StepFinish, run_id.clone())
                .stage(stage.clone())
                .status(outcome.status.as_str())
                .error(outcome.error.clone())
                .note(outcome.note.clone())
                .correlation_id(context.correlation_id.clone())
                .level(level)
                .payload(json!({
                    "attempts": outcome.attempts,
                    "retries": outcome.retries,
                    "code": outcome.code,
                })),
        );

        halted = match outcome.status {
            StageStatus::Failed => Some(RunStatus::Failed),
            StageStatus::Blocked => Some(RunStatus::Blocked),
            StageStatus::Skipped if outcome.is_halt() => Some(RunStatus::Skipped),
            _ => None,
        };
        steps.push(outcome);
        if halted.is_some() {
            break;
        }
    }

    let status = halted.unwrap_or(RunStatus::Completed);
    let summary = RunSummary {
        run_id: run_id.clone(),
        status,
        source: context.source.clone(),
        correlation_id: context.correlation_id.clone(),
        created_at_ms: context.created_at_ms,
        finished_at_ms: now_ms(),
        steps,
        context: context.domain.clone(),
        task_state: context.task_state.clone(),
    };

    tracing::debug!(run_id = %run_id, status = status.as_str(), "task tree run finished");
    inner.audit(
        AuditEvent::new(AuditEventType::RunFinish, run_id)
            .status(status.as_str())
            .correlation_id(context.correlation_id.clone())
            .level(match status {
                RunStatus::Failed => AuditLevel::Error,
                RunStatus::Blocked => AuditLevel::Warn,
                _ => AuditLevel::Info,
            }),
    );
    inner.persist(summary);
    inner.with_state(|state| {
        if let Some(current) = state.current.as_mut() {
            current.status = JobStatus::Finished;
        }
    });
}

async fn run_stage(
    inner: &Inner,
    stage: &str,
    handler: Arc<dyn StageHandler>,
    context: &mut RunContext,
) -> StageOutcome {
    let mut attempts: u32 = 0;
    let mut retries: u32 = 0;

    loop {
        attempts += 1;
        let started_at_ms = now_ms();
        inner.with_state(|state| state.enter_stage(stage, started_at_ms, context));
        inner.audit(
            AuditEvent::new(AuditEventType::StepStart, context.run_id.clone())
                .stage(stage)
                .correlation_id(context.correlation_id.clone())
                .payload(json!({ "attempt": attempts })),
        );

        let timeout = inner
            .timeout
            .as_ref()
            .and_then(|resolve| resolve_timeout(resolve, stage, context, attempts));
        let result = invoke(&inner.runtime, handler.clone(), context.clone(), timeout).await;

        if let Some(data) = &result.data {
            context.data.merge(data.clone());
        }

        let outcome = StageOutcome {
            stage: stage.to_string(),
            status: classify(&result, &inner.dependency_codes),
            attempts,
            retries,
            started_at_ms,
            finished_at_ms: now_ms(),
            error: result.error.clone(),
            note: result.note.clone(),
            code: result.code.clone(),
            data: result.data.clone(),
        };

        let input = RetryInput {
            stage,
            context,
            outcome: &outcome,
            result: &result,
            attempt: attempts,
            retries,
            max_retries: inner.config.max_retries,
        };
        let decision = match &inner.retry_policy {
            Some(policy) => decide_retry(policy, &input),
            None => default_retry_decision(&input),
        };
        if !decision.retry {
            return outcome;
        }

        retries += 1;
        let delay = retry_delay(&decision, &result, inner.config.retry_base_delay_ms);
        tokio::time::sleep(delay).await;
        inner.audit(
            AuditEvent::new(AuditEventType::StepRetry, context.run_id.clone())
                .stage(stage)
                .status(outcome.status.as_str())
                .error(outcome.error.clone())
                .correlation_id(context.correlation_id.clone())
                .level(AuditLevel::Warn)
                .payload(json!({
                    "attempt": attempts,
                    "retries": retries,
                    "delay_ms": delay.as_millis() as u64,
                    "code": outcome.code,
                })),
        );
    }
}

/// A panicking resolver counts as "no timeout" for this attempt.
fn resolve_timeout(
    resolve: &TimeoutResolverFn,
    stage: &str,
    context: &RunContext,
    attempt: u32,
) -> Option<Duration> {
    match catch_unwind(AssertUnwindSafe(|| resolve(stage, context, attempt))) {
        Ok(timeout) => timeout,
        Err(_) => {
            tracing::warn!(run_id = %context.run_id, stage, attempt, "timeout resolver panicked");
            None
        }
    }
}

/// A panicking retry policy stops retrying the stage.
fn decide_retry(policy: &RetryPolicyFn, input: &RetryInput<'_>) -> RetryDecision {
    match catch_unwind(AssertUnwindSafe(|| policy(input))) {
        Ok(decision) => decision,
        Err(_) => {
            tracing::warn!(
                run_id = %input.context.run_id,
                stage = input.stage,
                attempt = input.attempt,
                "retry policy panicked"
            );
            RetryDecision::stop()
        }
    }
}

/// Run one handler attempt on its own task. A timeout discards the result but
/// leaves the handler task running.
async fn invoke(
    runtime: &Handle,
    handler: Arc<dyn StageHandler>,
    context: RunContext,
    timeout: Option<Duration>,
) -> StageResult {
    let task = runtime.spawn(async move { handler.run(context).await });
    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, task).await {
            Ok(joined) => joined,
            Err(_) => return StageResult::timed_out(limit.as_millis() as u64),
        },
        None => task.await,
    };
    match joined {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => StageResult::failed(format!("{err:#}")),
        Err(err) if err.is_panic() => StageResult::failed("stage handler panicked"),
        Err(_) => StageResult::failed("stage handler cancelled"),
    }
}
