use thiserror::Error;

/// Failure kinds surfaced by the CLI. Command handlers wrap these in
/// `anyhow` with operation context; `main` walks the chain to pick the
/// exit code.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid input: {0}")]
    Input(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("missing credentials: {}", missing.join(", "))]
    MissingCredentials { missing: Vec<String> },
    #[error("credentials rejected: {0}")]
    Credentials(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server returned {status} ({code}): {message}")]
    Protocol {
        status: u16,
        code: String,
        message: String,
    },
    #[error("{0} already exists")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("cancelled")]
    Cancelled,
    #[error("replicas ({replicas}) must not exceed max_replicas ({max})")]
    InvalidReplicaCount { replicas: u32, max: u32 },
    #[error("{0}")]
    Fatal(String),
}

impl CliError {
    pub fn protocol(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Network hiccups, throttling and 5xx answers are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Protocol { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Cancelled => 130,
            Self::Input(_) | Self::InvalidReplicaCount { .. } => 2,
            Self::MissingCredentials { .. } | Self::Credentials(_) => 3,
            _ => 1,
        }
    }
}

impl From<ureq::Error> for CliError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::StatusCode(status) => {
                Self::protocol(status, "http", format!("unexpected HTTP status {status}"))
            }
            ureq::Error::Timeout(_) => Self::Timeout(err.to_string()),
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Exit code for an arbitrary error chain.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<CliError>())
        .map(CliError::exit_code)
        .unwrap_or(1)
}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<CliError>(), Some(CliError::Cancelled)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn transient_classification() {
        assert!(CliError::Transport("reset".into()).is_transient());
        assert!(CliError::protocol(503, "unavailable", "busy").is_transient());
        assert!(CliError::protocol(429, "resource_exhausted", "slow down").is_transient());
        assert!(!CliError::protocol(404, "not_found", "nope").is_transient());
        assert!(!CliError::Cancelled.is_transient());
    }

    #[test]
    fn exit_code_found_through_context() {
        let err = Err::<(), _>(CliError::Cancelled)
            .context("unable to deploy agent")
            .unwrap_err();
        assert_eq!(exit_code_for(&err), 130);
        assert!(is_cancelled(&err));

        let plain = anyhow::anyhow!("boom");
        assert_eq!(exit_code_for(&plain), 1);
    }

    #[test]
    fn missing_credentials_lists_fields() {
        let err = CliError::MissingCredentials {
            missing: vec!["url".into(), "api-secret".into()],
        };
        assert_eq!(err.to_string(), "missing credentials: url, api-secret");
    }
}
