//! 沙箱执行结果

use crate::error::SandboxError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 非代码自身退出码的失败（超时、基础设施、策略拒绝）统一使用
pub const FAILURE_EXIT_CODE: i32 = -1;

/// 执行结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxResult {
    /// 标准输出
    pub stdout: String,
    /// 标准错误
    pub stderr: String,
    /// 退出码
    pub exit_code: i32,
    /// 失败原因
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<SandboxError>,
    /// 资源使用情况
    #[serde(default)]
    pub resource_usage: HashMap<String, serde_json::Value>,
}

impl SandboxResult {
    /// 代码运行结束；非零退出码记为执行错误
    pub fn completed(stdout: String, stderr: String, exit_code: i32) -> Self {
        let error = (exit_code != 0).then(|| {
            SandboxError::execution(format!("process exited with code {}", exit_code))
        });
        Self {
            stdout,
            stderr,
            exit_code,
            error,
            resource_usage: HashMap::new(),
        }
    }

    /// 未能运行代码的失败，stderr 为错误描述
    pub fn failure(error: SandboxError) -> Self {
        Self {
            stdout: String::new(),
            stderr: error.to_string(),
            exit_code: FAILURE_EXIT_CODE,
            error: Some(error),
            resource_usage: HashMap::new(),
        }
    }

    /// 超时，保留已捕获的输出
    pub fn timed_out(seconds: u64, stdout: String, stderr: String) -> Self {
        let error = SandboxError::timeout(seconds);
        let stderr = append_line(stderr, &error.to_string());
        Self {
            stdout,
            stderr,
            exit_code: FAILURE_EXIT_CODE,
            error: Some(error),
            resource_usage: HashMap::new(),
        }
    }

    /// 代码抛出异常，异常信息追加到 stderr
    pub fn raised(stdout: String, stderr: String, message: String) -> Self {
        let stderr = append_line(stderr, &message);
        Self {
            stdout,
            stderr,
            exit_code: 1,
            error: Some(SandboxError::execution(message)),
            resource_usage: HashMap::new(),
        }
    }

    /// 添加资源使用指标
    pub fn with_usage(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.resource_usage.insert(key.into(), value);
        self
    }

    /// 退出码为 0 且没有错误
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }

    pub fn is_timeout(&self) -> bool {
        self.error.as_ref().is_some_and(SandboxError::is_timeout)
    }
}

fn append_line(mut text: String, line: &str) -> String {
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(line);
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_success() {
        let result = SandboxResult::completed("4\n".into(), String::new(), 0);
        assert!(result.success());
        assert!(result.error.is_none());
    }

    #[test]
    fn test_completed_non_zero_is_failure() {
        let result = SandboxResult::completed(String::new(), "oops".into(), 2);
        assert!(!result.success());
        assert!(matches!(result.error, Some(SandboxError::Execution(_))));
    }

    #[test]
    fn test_failure_uses_error_text() {
        let result = SandboxResult::failure(SandboxError::import_restriction("os"));
        assert_eq!(result.exit_code, FAILURE_EXIT_CODE);
        assert!(result.stderr.contains("Import not allowed: os"));
        assert!(!result.success());
    }

    #[test]
    fn test_timed_out_keeps_output() {
        let result = SandboxResult::timed_out(3, "partial".into(), "warn".into());
        assert_eq!(result.stdout, "partial");
        assert_eq!(result.stderr, "warn\nexecution timeout after 3s");
        assert!(result.is_timeout());
    }

    #[test]
    fn test_raised_sets_exit_code() {
        let result = SandboxResult::raised(String::new(), String::new(), "Error: x".into());
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.stderr, "Error: x");
    }

    #[test]
    fn test_error_flag_overrides_zero_exit() {
        let mut result = SandboxResult::completed(String::new(), String::new(), 0);
        result.error = Some(SandboxError::execution("late failure"));
        assert!(!result.success());
    }
}
