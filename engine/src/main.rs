mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tasktree_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, redact_text,
    ObservabilityEvent, ProcessKind,
};
use tasktree_orchestrator::{EnqueueReceipt, EnqueueRequest, TaskTree, TaskTreeConfig};
use tracing::info;

use crate::store::JsonlRunStore;

const LOG_RETENTION_DAYS: u64 = 14;
const RUN_LOG_FILE: &str = "runs.jsonl";

#[derive(Parser, Debug)]
#[command(name = "tasktree-engine")]
#[command(about = "Headless task tree runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enqueue runs, wait for the pipeline to drain, and print queue telemetry.
    Run(RunArgs),
    /// List stored run summaries.
    Runs {
        #[arg(long)]
        state_dir: Option<String>,
    },
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    state_dir: Option<String>,
    #[arg(long, default_value = "cli")]
    source: String,
    #[arg(long)]
    symbol: Option<String>,
    #[arg(long)]
    timeframe: Option<String>,
    #[arg(long, default_value_t = 1)]
    count: usize,
    #[arg(long)]
    dedupe_key: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => {
            let state_dir = resolve_state_dir(args.state_dir.clone());
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, log_info) =
                init_process_logging(ProcessKind::Engine, &logs_dir, LOG_RETENTION_DAYS)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "engine.main",
                    status: Some("ok"),
                    detail: Some("engine jsonl logging initialized"),
                    ..Default::default()
                },
            );
            info!("engine logging initialized: {:?}", log_info);

            let config = TaskTreeConfig::load(args.config.as_deref().map(Path::new)).await?;
            let report = run_batch(config, &state_dir, &args).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Runs { state_dir } => {
            let store = JsonlRunStore::new(resolve_state_dir(state_dir).join(RUN_LOG_FILE));
            for run in store.load()? {
                println!(
                    "{}\t{}\t{}\t{} steps",
                    run.run_id,
                    run.status.as_str(),
                    run.source,
                    run.steps.len()
                );
            }
        }
    }

    Ok(())
}

async fn run_batch(
    config: TaskTreeConfig,
    state_dir: &Path,
    args: &RunArgs,
) -> anyhow::Result<serde_json::Value> {
    let store = Arc::new(JsonlRunStore::new(state_dir.join(RUN_LOG_FILE)));
    let tree = TaskTree::builder(config)
        .observer(store.clone())
        .build()
        .context("building task tree")?;
    info!(
        stages = tree.config().stages.len(),
        run_log = %store.path().display(),
        "task tree ready"
    );

    let receipts: Vec<EnqueueReceipt> = (0..args.count)
        .map(|_| tree.enqueue(build_request(args)))
        .collect();
    for receipt in &receipts {
        info!(
            run_id = %receipt.run_id,
            queued = receipt.queued,
            dedupe_key = %args.dedupe_key.as_deref().map(redact_text).unwrap_or_default(),
            "run enqueued"
        );
    }

    tree.wait_idle().await;
    tree.flush_observers().await;

    Ok(json!({
        "enqueued": receipts.iter().filter(|receipt| receipt.queued).count(),
        "deduped": receipts.iter().filter(|receipt| !receipt.queued).count(),
        "run_log": store.path().display().to_string(),
        "budget": tree.budget().get_telemetry(),
    }))
}

fn build_request(args: &RunArgs) -> EnqueueRequest {
    let mut request = EnqueueRequest::new(args.source.clone());
    if let Some(symbol) = &args.symbol {
        request = request.symbol(symbol.clone());
    }
    if let Some(timeframe) = &args.timeframe {
        request = request.timeframe(timeframe.clone());
    }
    if let Some(key) = &args.dedupe_key {
        request = request.dedupe_key(key.clone());
    }
    request
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    resolve_state_dir_from(flag, std::env::var("TASKTREE_STATE_DIR").ok())
}

fn resolve_state_dir_from(flag: Option<String>, env: Option<String>) -> PathBuf {
    if let Some(dir) = flag.filter(|dir| !dir.trim().is_empty()) {
        return PathBuf::from(dir);
    }
    if let Some(dir) = env.filter(|dir| !dir.trim().is_empty()) {
        return PathBuf::from(dir);
    }
    PathBuf::from(".tasktree")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasktree_orchestrator::RunStatus;

    fn args(count: usize, dedupe_key: Option<&str>) -> RunArgs {
        RunArgs {
            config: None,
            state_dir: None,
            source: "cli".to_string(),
            symbol: Some("EURUSD".to_string()),
            timeframe: Some("M15".to_string()),
            count,
            dedupe_key: dedupe_key.map(str::to_string),
        }
    }

    #[test]
    fn state_dir_prefers_flag_then_env() {
        assert_eq!(
            resolve_state_dir_from(Some("/tmp/a".to_string()), Some("/tmp/b".to_string())),
            PathBuf::from("/tmp/a")
        );
        assert_eq!(
            resolve_state_dir_from(Some("  ".to_string()), Some("/tmp/b".to_string())),
            PathBuf::from("/tmp/b")
        );
        assert_eq!(resolve_state_dir_from(None, None), PathBuf::from(".tasktree"));
    }

    #[test]
    fn build_request_copies_cli_fields() {
        let request = build_request(&args(1, Some("EURUSD:M15")));
        assert_eq!(request.source, "cli");
        assert_eq!(request.domain.symbol.as_deref(), Some("EURUSD"));
        assert_eq!(request.domain.timeframe.as_deref(), Some("M15"));
        assert_eq!(request.dedupe_key.as_deref(), Some("EURUSD:M15"));
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "tasktree-engine",
            "run",
            "--symbol",
            "XAUUSD",
            "--count",
            "3",
            "--dedupe-key",
            "k",
        ])
        .unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.symbol.as_deref(), Some("XAUUSD"));
                assert_eq!(args.count, 3);
                assert_eq!(args.source, "cli");
                assert_eq!(args.dedupe_key.as_deref(), Some("k"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_batch_persists_every_queued_run() {
        let dir = tempfile::tempdir().unwrap();
        let report = run_batch(TaskTreeConfig::default(), dir.path(), &args(3, None))
            .await
            .unwrap();
        assert_eq!(report["enqueued"], 3);
        assert_eq!(report["deduped"], 0);
        assert_eq!(report["budget"]["task_tree.queue"]["size"], 0);

        let runs = JsonlRunStore::new(dir.path().join(RUN_LOG_FILE))
            .load()
            .unwrap();
        assert_eq!(runs.len(), 3);
        assert!(runs.iter().all(|run| run.status == RunStatus::Completed));
        assert!(runs
            .iter()
            .all(|run| run.context.symbol.as_deref() == Some("EURUSD")));
    }

    #[tokio::test]
    async fn run_batch_dedupes_repeated_key() {
        let dir = tempfile::tempdir().unwrap();
        let report = run_batch(TaskTreeConfig::default(), dir.path(), &args(4, Some("same")))
            .await
            .unwrap();
        assert_eq!(report["enqueued"], 1);
        assert_eq!(report["deduped"], 3);
        let runs = JsonlRunStore::new(dir.path().join(RUN_LOG_FILE))
            .load()
            .unwrap();
        assert_eq!(runs.len(), 1);
    }
}
