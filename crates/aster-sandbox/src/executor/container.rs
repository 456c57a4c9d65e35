//! 容器沙箱执行器
//!
//! 每次调用创建一个一次性的加固容器，代码文件以只读方式挂载。

use super::supervise::{exit_code, supervise, ChildOutcome};
use super::SandboxExecutor;
use crate::config::{SandboxConfiguration, SandboxStrategy};
use crate::error::SandboxError;
use crate::result::SandboxResult;
use crate::settings::ContainerSettings;
use anyhow::Context;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 资源采样间隔
const STATS_INTERVAL: Duration = Duration::from_millis(500);
/// 单次 stats / kill 调用的超时
const RUNTIME_CALL_TIMEOUT: Duration = Duration::from_secs(5);

static MEM_USAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([0-9]+(?:\.[0-9]+)?)\s*([KMGT]?i?B)")
        .expect("Invalid regex pattern")
});

/// 运行时自身的退出码：125 运行时错误，126 命令无法执行，127 命令不存在
const RUNTIME_EXIT_CODES: [i32; 3] = [125, 126, 127];

/// 容器执行器
#[derive(Debug, Clone, Default)]
pub struct ContainerExecutor {
    settings: ContainerSettings,
}

impl ContainerExecutor {
    pub fn new(settings: ContainerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    async fn kill_container(&self, name: &str) {
        let mut cmd = Command::new(&self.settings.runtime);
        cmd.args(["kill", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        match tokio::time::timeout(RUNTIME_CALL_TIMEOUT, cmd.status()).await {
            Ok(Ok(status)) if status.success() => debug!("Killed container {}", name),
            Ok(Ok(status)) => debug!("Container kill for {} exited with {}", name, status),
            Ok(Err(e)) => warn!("Failed to kill container {}: {}", name, e),
            Err(_) => warn!("Timed out killing container {}", name),
        }
    }
}

/// 生成 `run` 子命令参数
pub(crate) fn build_run_args(
    settings: &ContainerSettings,
    config: &SandboxConfiguration,
    name: &str,
    host_code_path: &Path,
) -> Vec<String> {
    let limits = config.limits();
    let pids_limit = settings.pids_limit.min(limits.max_processes).max(1);

    let mut args: Vec<String> = vec![
        "run".into(),
        "--rm".into(),
        "--name".into(),
        name.into(),
        "--user".into(),
        settings.user.clone(),
        "--cap-drop".into(),
        "ALL".into(),
        "--security-opt".into(),
        "no-new-privileges".into(),
        "--cpus".into(),
        format!("{}", limits.cpu_cores),
        "--memory".into(),
        format!("{}m", limits.memory_mb),
        "--memory-swap".into(),
        format!("{}m", limits.memory_mb),
        "--pids-limit".into(),
        pids_limit.to_string(),
        "--ulimit".into(),
        format!("nofile={0}:{0}", limits.max_open_files),
        "--read-only".into(),
        "--tmpfs".into(),
        format!("/tmp:rw,noexec,nosuid,size={}m", limits.disk_mb),
        "--workdir".into(),
        "/tmp".into(),
    ];

    if limits.network_offline {
        args.push("--network".into());
        args.push("none".into());
    }

    for (key, value) in config.sorted_env_vars() {
        args.push("-e".into());
        args.push(format!("{}={}", key, value));
    }

    for path in config.allowed_paths() {
        args.push("-v".into());
        args.push(format!("{0}:{0}:ro", path));
    }

    args.push("-v".into());
    args.push(format!(
        "{}:{}:ro",
        host_code_path.display(),
        settings.code_path
    ));
    args.push(settings.image.clone());
    args.push(settings.interpreter.clone());
    args.push(settings.code_path.clone());
    args
}

#[async_trait]
impl SandboxExecutor for ContainerExecutor {
    fn strategy(&self) -> SandboxStrategy {
        SandboxStrategy::Container
    }

    async fn execute(
        &self,
        code: &str,
        config: &SandboxConfiguration,
    ) -> Result<SandboxResult, SandboxError> {
        let runtime = match which::which(&self.settings.runtime) {
            Ok(path) => path,
            Err(e) => {
                warn!("Container runtime {} not available: {}", self.settings.runtime, e);
                return Ok(SandboxResult::failure(SandboxError::infrastructure(
                    format!(
                        "container runtime '{}' not found: {}",
                        self.settings.runtime, e
                    ),
                )));
            }
        };

        let limits = config.limits();
        let code_file = write_code_file(code)?;
        let name = format!("aster-sandbox-{}", uuid::Uuid::new_v4().simple());
        let args = build_run_args(&self.settings, config, &name, code_file.path());

        debug!(
            "Starting container {} from {} (cpus={}, memory={}MB, network={})",
            name,
            self.settings.image,
            limits.cpu_cores,
            limits.memory_mb,
            if limits.network_offline { "none" } else { "default" }
        );

        let mut cmd = Command::new(&runtime);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn {}: {}", runtime.display(), e);
                return Ok(SandboxResult::failure(SandboxError::infrastructure(
                    format!("failed to start container runtime: {}", e),
                )));
            }
        };

        let peak = Arc::new(Mutex::new(UsageSample::default()));
        let sampler = spawn_stats_sampler(
            self.settings.runtime.clone(),
            name.clone(),
            Arc::clone(&peak),
        );

        let outcome = supervise(
            child,
            limits.timeout(),
            self.settings.max_output_bytes,
            |_| {},
        )
        .await;
        sampler.abort();
        let elapsed = started.elapsed().as_secs_f64();

        let result = match outcome {
            Ok(ChildOutcome::Exited {
                status,
                stdout,
                stderr,
            }) => {
                let code = exit_code(&status);
                debug!("Container {} exited with code {}", name, code);
                exited_result(code, stdout, stderr)
            }
            Ok(ChildOutcome::TimedOut { stdout, stderr }) => {
                info!(
                    "Container {} timed out after {}s",
                    name, limits.timeout_seconds
                );
                // 终止 CLI 进程不会停止容器本身
                self.kill_container(&name).await;
                SandboxResult::timed_out(limits.timeout_seconds, stdout, stderr)
            }
            Err(e) => {
                self.kill_container(&name).await;
                SandboxResult::failure(SandboxError::infrastructure(format!(
                    "failed while waiting for container: {}",
                    e
                )))
            }
        };

        let sample = peak.lock().map(|s| *s).unwrap_or_default();
        Ok(sample
            .attach(result)
            .with_usage("elapsed_seconds", serde_json::json!(elapsed)))
    }
}

/// 区分运行时自身的失败与代码的退出状态
fn exited_result(code: i32, stdout: String, stderr: String) -> SandboxResult {
    if !RUNTIME_EXIT_CODES.contains(&code) {
        return SandboxResult::completed(stdout, stderr, code);
    }
    let detail = stderr.trim();
    let message = if detail.is_empty() {
        format!("container runtime failed with exit code {}", code)
    } else {
        format!("container runtime failed with exit code {}: {}", code, detail)
    };
    warn!("{}", message);
    SandboxResult::failure(SandboxError::infrastructure(message))
}

fn write_code_file(code: &str) -> std::io::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("aster-sandbox-")
        .suffix(".py")
        .tempfile()?;
    file.write_all(code.as_bytes())?;
    file.flush()?;
    // 容器内以 nobody 运行，需要可读
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o644))?;
    }
    Ok(file)
}

/// 采样得到的峰值用量
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct UsageSample {
    cpu_percent: Option<f64>,
    memory_mb: Option<f64>,
}

impl UsageSample {
    fn record(&mut self, cpu_percent: f64, memory_mb: f64) {
        self.cpu_percent = Some(self.cpu_percent.map_or(cpu_percent, |p| p.max(cpu_percent)));
        self.memory_mb = Some(self.memory_mb.map_or(memory_mb, |m| m.max(memory_mb)));
    }

    fn attach(self, mut result: SandboxResult) -> SandboxResult {
        if let Some(cpu) = self.cpu_percent {
            result = result.with_usage("cpu_percent", serde_json::json!(cpu));
        }
        if let Some(memory) = self.memory_mb {
            result = result.with_usage("memory_mb", serde_json::json!(memory));
        }
        result
    }
}

/// 后台采样任务，失败只记录日志
fn spawn_stats_sampler(
    runtime: String,
    name: String,
    peak: Arc<Mutex<UsageSample>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(STATS_INTERVAL).await;
            match sample_stats(&runtime, &name).await {
                Ok((cpu, memory)) => {
                    if let Ok(mut peak) = peak.lock() {
                        peak.record(cpu, memory);
                    }
                }
                Err(e) => debug!("Container stats unavailable for {}: {:#}", name, e),
            }
        }
    })
}

async fn sample_stats(runtime: &str, name: &str) -> anyhow::Result<(f64, f64)> {
    let mut cmd = Command::new(runtime);
    cmd.args(["stats", "--no-stream", "--format", "{{json .}}", name])
        .stdin(Stdio::null())
        .kill_on_drop(true);
    let output = tokio::time::timeout(RUNTIME_CALL_TIMEOUT, cmd.output())
        .await
        .context("stats call timed out")??;
    if !output.status.success() {
        anyhow::bail!("stats exited with {}", output.status);
    }
    parse_stats(&String::from_utf8_lossy(&output.stdout))
}

/// 解析 `stats --format '{{json .}}'` 的一行输出，返回 (CPU%, 内存 MB)
fn parse_stats(line: &str) -> anyhow::Result<(f64, f64)> {
    let value: serde_json::Value =
        serde_json::from_str(line.trim()).context("stats output is not JSON")?;

    let cpu = value
        .get("CPUPerc")
        .and_then(|v| v.as_str())
        .context("missing CPUPerc")?
        .trim()
        .trim_end_matches('%')
        .parse::<f64>()
        .context("invalid CPUPerc")?;

    let mem_usage = value
        .get("MemUsage")
        .and_then(|v| v.as_str())
        .context("missing MemUsage")?;
    let memory = parse_memory_mb(mem_usage).context("invalid MemUsage")?;

    Ok((cpu, memory))
}

fn parse_memory_mb(usage: &str) -> Option<f64> {
    let caps = MEM_USAGE_RE.captures(usage)?;
    let amount: f64 = caps.get(1)?.as_str().parse().ok()?;
    let factor = match caps.get(2)?.as_str() {
        "B" => 1.0 / (1024.0 * 1024.0),
        "KiB" => 1.0 / 1024.0,
        "KB" | "kB" => 1000.0 / (1024.0 * 1024.0),
        "MiB" => 1.0,
        "MB" => 1_000_000.0 / (1024.0 * 1024.0),
        "GiB" => 1024.0,
        "GB" => 1_000_000_000.0 / (1024.0 * 1024.0),
        "TiB" => 1024.0 * 1024.0,
        _ => return None,
    };
    Some(amount * factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::ResourceLimits;

    fn args_for(config: &SandboxConfiguration) -> Vec<String> {
        build_run_args(
            &ContainerSettings::default(),
            config,
            "aster-sandbox-test",
            Path::new("/tmp/code.py"),
        )
    }

    fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_run_args_harden_container() {
        let config =
            SandboxConfiguration::new(SandboxStrategy::Container, ResourceLimits::STRICT).unwrap();
        let args = args_for(&config);

        assert_eq!(args[0], "run");
        assert!(args.contains(&"--rm".to_string()));
        assert!(args.contains(&"--read-only".to_string()));
        assert_eq!(flag_value(&args, "--user"), Some("65534:65534"));
        assert_eq!(flag_value(&args, "--cap-drop"), Some("ALL"));
        assert_eq!(flag_value(&args, "--cpus"), Some("0.5"));
        assert_eq!(flag_value(&args, "--memory"), Some("256m"));
        assert_eq!(flag_value(&args, "--pids-limit"), Some("10"));
        assert_eq!(flag_value(&args, "--network"), Some("none"));
        assert_eq!(
            flag_value(&args, "--tmpfs"),
            Some("/tmp:rw,noexec,nosuid,size=100m")
        );

        let tail: Vec<_> = args.iter().rev().take(3).map(String::as_str).collect();
        assert_eq!(tail, vec!["/sandbox/main.py", "python", "python:3.11-slim"]);
        assert!(args.contains(&"/tmp/code.py:/sandbox/main.py:ro".to_string()));
    }

    #[test]
    fn test_run_args_network_and_env() {
        let config = SandboxConfiguration::new(
            SandboxStrategy::Container,
            ResourceLimits::DEFAULT.with_network(),
        )
        .unwrap()
        .with_env_var("B", "2")
        .with_env_var("A", "1")
        .with_allowed_paths(["/data"]);
        let args = args_for(&config);

        assert!(!args.contains(&"--network".to_string()));
        let envs: Vec<_> = args
            .windows(2)
            .filter(|w| w[0] == "-e")
            .map(|w| w[1].as_str())
            .collect();
        assert_eq!(envs, vec!["A=1", "B=2"]);
        assert!(args.contains(&"/data:/data:ro".to_string()));
        // 进程上限取设置与限制中较小者
        assert_eq!(flag_value(&args, "--pids-limit"), Some("50"));
    }

    #[test]
    fn test_parse_stats() {
        let line = r#"{"CPUPerc":"12.50%","MemUsage":"20.5MiB / 256MiB","Name":"x"}"#;
        let (cpu, memory) = parse_stats(line).unwrap();
        assert!((cpu - 12.5).abs() < f64::EPSILON);
        assert!((memory - 20.5).abs() < 1e-9);

        assert!(parse_stats("not json").is_err());
        assert!(parse_stats(r#"{"CPUPerc":"--"}"#).is_err());
    }

    #[test]
    fn test_parse_memory_units() {
        assert_eq!(parse_memory_mb("512KiB / 1GiB"), Some(0.5));
        assert_eq!(parse_memory_mb("1.5GiB / 2GiB"), Some(1536.0));
        assert_eq!(parse_memory_mb("garbage"), None);
    }

    #[test]
    fn test_usage_sample_keeps_peak() {
        let mut sample = UsageSample::default();
        sample.record(10.0, 30.0);
        sample.record(5.0, 40.0);
        let result = sample.attach(SandboxResult::completed(String::new(), String::new(), 0));
        assert_eq!(result.resource_usage["cpu_percent"], serde_json::json!(10.0));
        assert_eq!(result.resource_usage["memory_mb"], serde_json::json!(40.0));
    }

    #[tokio::test]
    async fn test_missing_runtime_is_infrastructure_failure() {
        let executor = ContainerExecutor::new(ContainerSettings {
            runtime: "aster-no-such-runtime".to_string(),
            ..ContainerSettings::default()
        });
        let result = executor
            .execute("print(1)", &SandboxConfiguration::default())
            .await
            .unwrap();
        assert!(!result.success());
        assert_eq!(result.exit_code, -1);
        assert!(matches!(result.error, Some(SandboxError::Infrastructure(_))));
        assert!(result.stderr.contains("aster-no-such-runtime"));
    }

    #[test]
    fn test_runtime_exit_codes_are_infrastructure_failures() {
        for code in RUNTIME_EXIT_CODES {
            let result = exited_result(code, String::new(), "Unable to find image\n".to_string());
            assert!(!result.success());
            assert_eq!(result.exit_code, -1);
            assert!(matches!(result.error, Some(SandboxError::Infrastructure(_))));
            assert!(result.stderr.contains("Unable to find image"));
        }

        let result = exited_result(3, "out".to_string(), "err".to_string());
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout, "out");
        assert!(!result.success());
        assert!(!matches!(result.error, Some(SandboxError::Infrastructure(_))));
    }

    /// 写入一个模拟容器运行时的脚本，`run` 时执行 `run_body`，
    /// `kill` 时把容器名追加到 `killed` 文件
    #[cfg(unix)]
    fn fake_runtime(dir: &Path, run_body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let script = format!(
            "#!/bin/sh\n\
             case \"$1\" in\n\
             run) echo \"$4\" > '{dir}/started'; {run_body} ;;\n\
             kill) echo \"$2\" >> '{dir}/killed' ;;\n\
             *) exit 1 ;;\n\
             esac\n",
            dir = dir.display(),
            run_body = run_body,
        );
        let path = dir.join("fake-runtime");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_container_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ContainerExecutor::new(ContainerSettings {
            runtime: fake_runtime(dir.path(), "echo booting; exec sleep 30"),
            ..ContainerSettings::default()
        });
        let limits = ResourceLimits {
            timeout_seconds: 1,
            ..ResourceLimits::DEFAULT
        };
        let config = SandboxConfiguration::new(SandboxStrategy::Container, limits).unwrap();

        let started = Instant::now();
        let result = executor.execute("while True: pass", &config).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(result.is_timeout());
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("timeout"));
        assert_eq!(result.stdout, "booting\n");

        let name = std::fs::read_to_string(dir.path().join("started")).unwrap();
        let killed = std::fs::read_to_string(dir.path().join("killed")).unwrap();
        assert!(name.starts_with("aster-sandbox-"));
        assert_eq!(killed.trim(), name.trim());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runtime_error_exit_is_infrastructure_failure() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ContainerExecutor::new(ContainerSettings {
            runtime: fake_runtime(dir.path(), "echo 'Unable to find image' >&2; exit 125"),
            ..ContainerSettings::default()
        });
        let result = executor
            .execute("print(1)", &SandboxConfiguration::default())
            .await
            .unwrap();
        assert!(!result.success());
        assert_eq!(result.exit_code, -1);
        assert!(matches!(result.error, Some(SandboxError::Infrastructure(_))));
        assert!(result.stderr.contains("exit code 125"));
        assert!(!dir.path().join("killed").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_snippet_exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ContainerExecutor::new(ContainerSettings {
            runtime: fake_runtime(dir.path(), "echo partial; exit 3"),
            ..ContainerSettings::default()
        });
        let result = executor
            .execute("raise SystemExit(3)", &SandboxConfiguration::default())
            .await
            .unwrap();
        assert!(!result.success());
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout, "partial\n");
        assert!(result.resource_usage.contains_key("elapsed_seconds"));
    }

    #[test]
    fn test_code_file_is_readable_and_removed() {
        let file = write_code_file("print(1)").unwrap();
        let path = file.path().to_path_buf();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "print(1)");
        drop(file);
        assert!(!path.exists());
    }
}
