//! 执行器设置
//!
//! 与单次调用无关的宿主级设置：容器运行时、镜像、解释器与受限解释器的引擎限制。
//! 支持通过环境变量覆盖默认值。

use serde::{Deserialize, Serialize};

/// 容器运行时环境变量
pub const ENV_CONTAINER_RUNTIME: &str = "ASTER_SANDBOX_RUNTIME";
/// 容器镜像环境变量
pub const ENV_CONTAINER_IMAGE: &str = "ASTER_SANDBOX_IMAGE";
/// 进程执行器解释器环境变量
pub const ENV_PYTHON: &str = "ASTER_SANDBOX_PYTHON";

/// 捕获输出的默认上限（1 MiB）
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// 沙箱设置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    pub container: ContainerSettings,
    pub process: ProcessSettings,
    pub restricted: RestrictedSettings,
}

/// 容器执行器设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// 容器运行时命令
    pub runtime: String,
    /// 基础镜像
    pub image: String,
    /// 容器内解释器
    pub interpreter: String,
    /// 代码文件在容器内的挂载路径
    pub code_path: String,
    /// 进程数上限（防 fork 炸弹）
    pub pids_limit: u32,
    /// 容器内运行用户
    pub user: String,
    /// 捕获输出上限（字节）
    pub max_output_bytes: usize,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: "python:3.11-slim".to_string(),
            interpreter: "python".to_string(),
            code_path: "/sandbox/main.py".to_string(),
            pids_limit: 64,
            user: "65534:65534".to_string(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// 进程执行器设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    /// 解释器命令
    pub interpreter: String,
    /// 代码文件之前的解释器参数
    pub interpreter_args: Vec<String>,
    /// 临时代码文件后缀
    pub file_suffix: String,
    /// 捕获输出上限（字节）
    pub max_output_bytes: usize,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            // 隔离模式：忽略 PYTHON* 环境变量与用户 site-packages
            interpreter_args: vec!["-I".to_string()],
            file_suffix: ".py".to_string(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// 受限解释器设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestrictedSettings {
    /// 单个循环的最大迭代次数
    pub loop_iteration_limit: u64,
    /// 最大递归深度
    pub recursion_limit: usize,
    /// 捕获输出上限（字节）
    pub max_output_bytes: usize,
}

impl Default for RestrictedSettings {
    fn default() -> Self {
        Self {
            loop_iteration_limit: 50_000_000,
            recursion_limit: 512,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl SandboxSettings {
    /// 默认设置叠加环境变量覆盖
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.apply_env_overrides();
        settings
    }

    /// 用非空的环境变量覆盖对应字段
    pub fn apply_env_overrides(&mut self) {
        if let Some(runtime) = non_empty_env(ENV_CONTAINER_RUNTIME) {
            self.container.runtime = runtime;
        }
        if let Some(image) = non_empty_env(ENV_CONTAINER_IMAGE) {
            self.container.image = image;
        }
        if let Some(python) = non_empty_env(ENV_PYTHON) {
            self.process.interpreter = python;
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
