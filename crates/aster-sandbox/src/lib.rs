//! Aster Sandbox - isolated execution of agent-generated code
//!
//! Callers build (or request) a [`SandboxConfiguration`] and hand it to the
//! [`SandboxManager`] together with a code string. The manager dispatches to
//! the executor registered for the configured strategy and always answers
//! with a [`SandboxResult`].

pub mod config;
pub mod error;
pub mod executor;
pub mod limits;
pub mod manager;
pub mod result;
pub mod settings;

pub use config::{SandboxConfiguration, SandboxStrategy};
pub use error::SandboxError;
pub use executor::{
    ContainerExecutor, ProcessExecutor, RestrictedInterpreterExecutor, SandboxExecutor,
    SAFE_MODULES,
};
pub use limits::{
    get_limits_for_trust_level, LimitsValidator, ResourceLimits, TrustLevel, MAX_CPU_CORES,
    MAX_DISK_MB, MAX_MEMORY_MB, MAX_TIMEOUT_SECONDS,
};
pub use manager::{recommended_config, SandboxManager, TRUSTED_IMPORTS};
pub use result::{SandboxResult, FAILURE_EXIT_CODE};
pub use settings::{ContainerSettings, ProcessSettings, RestrictedSettings, SandboxSettings};
