//! Plugin system error types.

use thiserror::Error;

/// Failure of a single scraper invocation inside the sandbox.
///
/// Every fault raised by a script is converted into one of these variants;
/// nothing thrown inside the sandbox crosses this boundary untyped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    #[error("scraper timed out")]
    Timeout,

    #[error("script fault: {0}")]
    ScriptFault(String),

    #[error("malformed output: {0}")]
    MalformedOutput(String),

    #[error("network error inside sandbox: {0}")]
    Unreachable(String),

    #[error("failed to instantiate script: {0}")]
    Instantiation(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invocation cancelled")]
    Cancelled,
}

impl InvocationError {
    /// Short machine-readable tag, used in logs and serialized outcomes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ScriptFault(_) => "script_fault",
            Self::MalformedOutput(_) => "malformed_output",
            Self::Unreachable(_) => "unreachable",
            Self::Instantiation(_) => "instantiation",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("repository unreachable: {0}")]
    Unreachable(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("repository already installed: {0}")]
    DuplicateRepository(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid repository URL: {0}")]
    InvalidUrl(String),

    #[error("WASM validation error: {0}")]
    WasmValidation(String),

    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
