use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadTestError {
    #[error("invalid load test parameters: {0}")]
    Params(String),
    #[error("failed to issue token for {identity}: {message}")]
    Token { identity: String, message: String },
    #[error("{identity} could not connect after {attempts} attempts: {message}")]
    Connect {
        identity: String,
        attempts: u32,
        message: String,
    },
    #[error("media session error: {0}")]
    Media(String),
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T, E = LoadTestError> = std::result::Result<T, E>;
