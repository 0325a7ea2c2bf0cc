//! Stage handlers.
//!
//! A handler receives its own copy of the run context and reports back
//! through `StageResult`; anything it wants later stages to see goes in
//! `StageResult::data`, which is shallow-merged into the run's data bag.
//!
//! Closures `Fn(RunContext) -> impl Future<Output = anyhow::Result<StageResult>>`
//! implement `StageHandler` directly:
//!
//! ```rust,ignore
//! tree.set_handler("observe", |ctx: RunContext| async move {
//!     let quote = fetch_quote(ctx.domain.symbol.as_deref()).await?;
//!     let mut data = serde_json::Map::new();
//!     data.insert("quote".into(), quote);
//!     Ok(StageResult::ok().with_data(data))
//! })?;
//! ```

use std::future::Future;

use crate::model::{RunContext, StageResult};

#[async_trait::async_trait]
pub trait StageHandler: Send + Sync {
    async fn run(&self, context: RunContext) -> anyhow::Result<StageResult>;
}

#[async_trait::async_trait]
impl<F, Fut> StageHandler for F
where
    F: Fn(RunContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<StageResult>> + Send + 'static,
{
    async fn run(&self, context: RunContext) -> anyhow::Result<StageResult> {
        (self)(context).await
    }
}
