pub mod config;
pub mod error;
pub mod handler;
pub mod hooks;
pub mod model;
pub mod policy;
mod queue;
pub mod snapshot;
pub mod task_tree;

pub use config::*;
pub use error::*;
pub use handler::*;
pub use hooks::*;
pub use model::*;
pub use policy::*;
pub use snapshot::*;
pub use task_tree::*;

pub use tasktree_budget::{global_budget, BudgetManager, BudgetTelemetry, EvictionReason};
