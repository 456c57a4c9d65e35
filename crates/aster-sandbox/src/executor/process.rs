//! 进程沙箱执行器
//!
//! 以普通操作系统进程运行代码，exec 前通过 rlimit 施加限制。
//! 比容器便宜，但隔离更弱。

use super::supervise::{exit_code, supervise, ChildOutcome};
use super::SandboxExecutor;
use crate::config::{SandboxConfiguration, SandboxStrategy};
use crate::error::SandboxError;
use crate::limits::ResourceLimits;
use crate::result::SandboxResult;
use crate::settings::ProcessSettings;
use async_trait::async_trait;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// 当前平台是否支持 POSIX 资源限制
pub const RLIMITS_SUPPORTED: bool = cfg!(any(target_os = "linux", target_os = "macos"));

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// 进程执行器
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    settings: ProcessSettings,
}

impl ProcessExecutor {
    pub fn new(settings: ProcessSettings) -> Self {
        Self { settings }
    }

    /// 使用指定解释器，例如 `("sh", [])`
    pub fn with_interpreter<I, S>(interpreter: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            settings: ProcessSettings {
                interpreter: interpreter.into(),
                interpreter_args: args.into_iter().map(Into::into).collect(),
                ..ProcessSettings::default()
            },
        }
    }

    pub fn settings(&self) -> &ProcessSettings {
        &self.settings
    }

    fn build_command(
        &self,
        script: &Path,
        workdir: &Path,
        config: &SandboxConfiguration,
    ) -> Command {
        let mut cmd = Command::new(&self.settings.interpreter);
        cmd.args(&self.settings.interpreter_args)
            .arg(script)
            .current_dir(workdir)
            .env_clear()
            .env(
                "PATH",
                std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()),
            )
            .env("HOME", workdir)
            .env("TMPDIR", workdir)
            .env("LANG", "C.UTF-8")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .envs(config.env_vars())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        apply_resource_limits(&mut cmd, config.limits());
        cmd
    }
}

#[async_trait]
impl SandboxExecutor for ProcessExecutor {
    fn strategy(&self) -> SandboxStrategy {
        SandboxStrategy::Process
    }

    async fn execute(
        &self,
        code: &str,
        config: &SandboxConfiguration,
    ) -> Result<SandboxResult, SandboxError> {
        if !RLIMITS_SUPPORTED {
            warn!(
                "Process sandbox requested on {}, which lacks resource limits",
                std::env::consts::OS
            );
            return Ok(SandboxResult::failure(SandboxError::unsupported_platform(
                format!(
                    "process sandbox requires POSIX resource limits, not available on {}",
                    std::env::consts::OS
                ),
            )));
        }

        let limits = config.limits();

        // 目录与文件在作用域结束时删除，覆盖成功、失败与超时所有路径
        let workdir = tempfile::Builder::new()
            .prefix("aster-sandbox-")
            .tempdir()?;
        let mut script = tempfile::Builder::new()
            .prefix("snippet-")
            .suffix(&self.settings.file_suffix)
            .tempfile_in(workdir.path())?;
        script.write_all(code.as_bytes())?;
        script.flush()?;

        let mut cmd = self.build_command(script.path(), workdir.path(), config);

        debug!(
            "Spawning {} under rlimits (cpu={}s, memory={}MB, processes={})",
            self.settings.interpreter,
            limits.cpu_time_seconds,
            limits.memory_mb,
            limits.max_processes
        );

        let started = Instant::now();
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn {}: {}", self.settings.interpreter, e);
                return Ok(SandboxResult::failure(SandboxError::infrastructure(
                    format!("failed to start {}: {}", self.settings.interpreter, e),
                )));
            }
        };

        let outcome = supervise(
            child,
            limits.timeout(),
            self.settings.max_output_bytes,
            kill_process_group,
        )
        .await;
        let elapsed = started.elapsed().as_secs_f64();

        let result = match outcome {
            Ok(ChildOutcome::Exited {
                status,
                stdout,
                stderr,
            }) => {
                let code = exit_code(&status);
                debug!("Process finished with exit code {} in {:.3}s", code, elapsed);
                with_limit_usage(SandboxResult::completed(stdout, stderr, code), limits)
            }
            Ok(ChildOutcome::TimedOut { stdout, stderr }) => {
                info!(
                    "Process sandbox timed out after {}s",
                    limits.timeout_seconds
                );
                SandboxResult::timed_out(limits.timeout_seconds, stdout, stderr)
            }
            Err(e) => SandboxResult::failure(SandboxError::infrastructure(format!(
                "failed while waiting for process: {}",
                e
            ))),
        };

        Ok(result.with_usage("elapsed_seconds", serde_json::json!(elapsed)))
    }
}

fn with_limit_usage(result: SandboxResult, limits: &ResourceLimits) -> SandboxResult {
    result
        .with_usage("cpu_time_limit_seconds", serde_json::json!(limits.cpu_time_seconds))
        .with_usage("memory_limit_mb", serde_json::json!(limits.memory_mb))
        .with_usage("max_processes", serde_json::json!(limits.max_processes))
        .with_usage("max_open_files", serde_json::json!(limits.max_open_files))
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn apply_resource_limits(cmd: &mut Command, limits: &ResourceLimits) {
    let plan = rlimits::RlimitPlan::from_limits(limits);
    // 独立进程组，超时时整组终止
    cmd.process_group(0);
    // SAFETY: 闭包只调用 getrlimit/setrlimit，不分配内存也不加锁
    unsafe {
        cmd.pre_exec(move || {
            plan.apply();
            Ok(())
        });
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn apply_resource_limits(_cmd: &mut Command, _limits: &ResourceLimits) {}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!("killpg({}) failed: {}", pid, e);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(any(target_os = "linux", target_os = "macos"))]
mod rlimits {
    use crate::limits::ResourceLimits;
    use nix::libc::{rlim_t, RLIM_INFINITY};
    use nix::sys::resource::{getrlimit, setrlimit, Resource};

    const MB: rlim_t = 1024 * 1024;

    /// fork 前计算好的数值，pre_exec 中只做系统调用
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(super) struct RlimitPlan {
        pub cpu_seconds: rlim_t,
        pub memory_bytes: rlim_t,
        pub max_processes: rlim_t,
        pub max_open_files: rlim_t,
        pub max_file_size_bytes: rlim_t,
    }

    impl RlimitPlan {
        pub fn from_limits(limits: &ResourceLimits) -> Self {
            Self {
                cpu_seconds: limits.cpu_time_seconds as rlim_t,
                memory_bytes: (limits.memory_mb as rlim_t).saturating_mul(MB),
                max_processes: limits.max_processes as rlim_t,
                max_open_files: limits.max_open_files as rlim_t,
                max_file_size_bytes: (limits.max_file_size_mb as rlim_t).saturating_mul(MB),
            }
        }

        /// 尽力而为：任何一项失败都不阻止执行
        pub fn apply(&self) {
            lower(Resource::RLIMIT_CPU, self.cpu_seconds);
            set_memory(self.memory_bytes);
            let _ = setrlimit(Resource::RLIMIT_CORE, 0, 0);
            lower(Resource::RLIMIT_NPROC, self.max_processes);
            lower(Resource::RLIMIT_NOFILE, self.max_open_files);
            lower(Resource::RLIMIT_FSIZE, self.max_file_size_bytes);
        }
    }

    /// 内存限制不超过当前硬上限时才设置
    fn set_memory(bytes: rlim_t) {
        if let Ok((_, hard)) = getrlimit(Resource::RLIMIT_AS) {
            if fits_under(bytes, hard) {
                let _ = setrlimit(Resource::RLIMIT_AS, bytes, bytes);
            }
        }
    }

    /// 只在当前上限高于目标时降低，从不提高
    fn lower(resource: Resource, target: rlim_t) {
        if let Ok((soft, hard)) = getrlimit(resource) {
            if let Some((new_soft, new_hard)) = lowered(soft, hard, target) {
                let _ = setrlimit(resource, new_soft, new_hard);
            }
        }
    }

    pub(super) fn fits_under(value: rlim_t, hard: rlim_t) -> bool {
        hard == RLIM_INFINITY || value <= hard
    }

    pub(super) fn lowered(soft: rlim_t, hard: rlim_t, target: rlim_t) -> Option<(rlim_t, rlim_t)> {
        let exceeds = |current: rlim_t| current == RLIM_INFINITY || current > target;
        if !exceeds(soft) && !exceeds(hard) {
            return None;
        }
        let new_hard = if exceeds(hard) { target } else { hard };
        let new_soft = if exceeds(soft) { target } else { soft };
        Some((new_soft.min(new_hard), new_hard))
    }

}
