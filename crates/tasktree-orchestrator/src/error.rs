use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskTreeError {
    #[error("task tree must be built inside a tokio runtime")]
    NoRuntime,

    #[error("stage list is empty")]
    EmptyStageList,

    #[error("duplicate stage `{0}`")]
    DuplicateStage(String),

    #[error("unknown stage `{0}`")]
    UnknownStage(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type TaskTreeResult<T> = Result<T, TaskTreeError>;
