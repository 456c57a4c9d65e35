//! 沙箱执行器
//!
//! 三种可互换的隔离后端共用同一个能力接口：执行代码并返回结果。

mod container;
mod process;
mod restricted;
mod supervise;

pub use container::ContainerExecutor;
pub use process::ProcessExecutor;
pub use restricted::{RestrictedInterpreterExecutor, SAFE_MODULES};

use crate::config::{SandboxConfiguration, SandboxStrategy};
use crate::error::SandboxError;
use crate::result::SandboxResult;
use async_trait::async_trait;

/// 沙箱执行器
///
/// 可预期的失败（超时、运行时缺失、非零退出、导入被拒）都以失败的
/// `SandboxResult` 返回；`Err` 只用于意外的内部错误。
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    /// 执行器对应的策略
    fn strategy(&self) -> SandboxStrategy;

    /// 在配置的限制下执行代码
    async fn execute(
        &self,
        code: &str,
        config: &SandboxConfiguration,
    ) -> Result<SandboxResult, SandboxError>;
}
