use thiserror::Error;

#[derive(Error, Debug)]
pub enum BsmError {
    #[error("parameter length mismatch: expected {expected}, got {got}")]
    ParamLengthMismatch { expected: usize, got: usize },

    #[error("invalid model specification: {0}")]
    InvalidSpec(String),

    #[error("state space construction failed: {0}")]
    StateSpaceError(String),

    #[error("singular system: {0}")]
    SingularSystem(String),

    #[error("optimization failed: {0}")]
    OptimizationFailed(String),

    #[error("data error: {0}")]
    DataError(String),
}

pub type Result<T> = std::result::Result<T, BsmError>;
