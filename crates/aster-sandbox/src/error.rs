//! Sandbox Error Types
//!
//! Every failure the sandbox can report, grouped by where it originates.
//! Configuration and platform errors stop execution before it starts; the
//! rest are folded into a failed [`SandboxResult`](crate::SandboxResult).

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SandboxError {
    /// Limits failed validation or the configuration cannot be executed
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The host OS lacks the primitives the strategy needs
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// Execution exceeded its wall-clock budget
    #[error("execution timeout after {seconds}s")]
    Timeout { seconds: u64 },

    /// The snippet references a module outside the allow-list
    #[error("Import not allowed: {0}")]
    ImportRestriction(String),

    /// The snippet itself failed or exited non-zero
    #[error("{0}")]
    Execution(String),

    /// The isolation runtime could not be started
    #[error("{0}")]
    Infrastructure(String),
}

impl SandboxError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    pub fn unsupported_platform(reason: impl Into<String>) -> Self {
        Self::UnsupportedPlatform(reason.into())
    }

    pub fn timeout(seconds: u64) -> Self {
        Self::Timeout { seconds }
    }

    pub fn import_restriction(module: impl Into<String>) -> Self {
        Self::ImportRestriction(module.into())
    }

    pub fn execution(reason: impl Into<String>) -> Self {
        Self::Execution(reason.into())
    }

    pub fn infrastructure(reason: impl Into<String>) -> Self {
        Self::Infrastructure(reason.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Rejected by policy before any code ran
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::ImportRestriction(_) | Self::UnsupportedPlatform(_)
        )
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        Self::Infrastructure(err.to_string())
    }
}
