use dwd_bootstrap::BootstrapError;
use dwd_core::DelegateError;
use dwd_relay::RelayError;

/// Failures that end the process with status 1.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Delegate(#[from] DelegateError),
    #[error("{0}")]
    Bootstrap(#[from] BootstrapError),
    #[error("{0}")]
    Relay(#[from] RelayError),
    #[error("cannot render JSON: {0}")]
    Json(#[from] serde_json::Error),
}
