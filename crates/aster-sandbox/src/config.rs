//! 沙箱配置
//!
//! 组合隔离策略、资源限制和策略相关选项；构造时即校验资源限制

use crate::error::SandboxError;
use crate::limits::{LimitsValidator, ResourceLimits};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// 隔离策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStrategy {
    /// 一次性容器
    #[default]
    Container,
    /// 带 rlimit 的操作系统进程
    Process,
    /// 进程内受限解释器
    RestrictedInterpreter,
    /// 无隔离，执行时总是被拒绝
    None,
}

impl SandboxStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Process => "process",
            Self::RestrictedInterpreter => "restricted_interpreter",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for SandboxStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 沙箱配置
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxConfiguration {
    strategy: SandboxStrategy,
    limits: ResourceLimits,
    allowed_imports: BTreeSet<String>,
    allowed_paths: BTreeSet<String>,
    env_vars: HashMap<String, String>,
}

impl SandboxConfiguration {
    /// 创建配置，资源限制不合法时返回 `SandboxError::Configuration`
    pub fn new(strategy: SandboxStrategy, limits: ResourceLimits) -> Result<Self, SandboxError> {
        check_limits(&limits)?;
        Ok(Self::new_unchecked(strategy, limits))
    }

    /// 仅供 crate 内部的已知合法预设使用
    pub(crate) fn new_unchecked(strategy: SandboxStrategy, limits: ResourceLimits) -> Self {
        debug_assert!(LimitsValidator::validate(&limits).0);
        Self {
            strategy,
            limits,
            allowed_imports: BTreeSet::new(),
            allowed_paths: BTreeSet::new(),
            env_vars: HashMap::new(),
        }
    }

    /// 替换资源限制（重新校验）
    pub fn with_limits(mut self, limits: ResourceLimits) -> Result<Self, SandboxError> {
        check_limits(&limits)?;
        self.limits = limits;
        Ok(self)
    }

    pub fn with_strategy(mut self, strategy: SandboxStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// 设置允许导入的模块（受限解释器使用）
    pub fn with_allowed_imports<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_imports = modules.into_iter().map(Into::into).collect();
        self
    }

    /// 设置允许访问的路径
    pub fn with_allowed_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// 添加环境变量
    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn with_env_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.env_vars.extend(vars);
        self
    }

    pub fn strategy(&self) -> SandboxStrategy {
        self.strategy
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn allowed_imports(&self) -> &BTreeSet<String> {
        &self.allowed_imports
    }

    pub fn allowed_paths(&self) -> &BTreeSet<String> {
        &self.allowed_paths
    }

    pub fn env_vars(&self) -> &HashMap<String, String> {
        &self.env_vars
    }

    /// 环境变量按 key 排序，便于生成稳定的命令行
    pub fn sorted_env_vars(&self) -> Vec<(&String, &String)> {
        let mut vars: Vec<_> = self.env_vars.iter().collect();
        vars.sort();
        vars
    }
}

impl Default for SandboxConfiguration {
    fn default() -> Self {
        Self::new_unchecked(SandboxStrategy::Container, ResourceLimits::DEFAULT)
    }
}

fn check_limits(limits: &ResourceLimits) -> Result<(), SandboxError> {
    match LimitsValidator::validate(limits) {
        (true, _) => Ok(()),
        (false, message) => Err(SandboxError::configuration(
            message.unwrap_or_else(|| "invalid resource limits".to_string()),
        )),
    }
}

/// 反序列化时同样经过校验
#[derive(Deserialize)]
struct RawConfiguration {
    #[serde(default)]
    strategy: SandboxStrategy,
    #[serde(default)]
    limits: ResourceLimits,
    #[serde(default)]
    allowed_imports: BTreeSet<String>,
    #[serde(default)]
    allowed_paths: BTreeSet<String>,
    #[serde(default)]
    env_vars: HashMap<String, String>,
}

impl<'de> Deserialize<'de> for SandboxConfiguration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawConfiguration::deserialize(deserializer)?;
        let config = SandboxConfiguration::new(raw.strategy, raw.limits)
            .map_err(serde::de::Error::custom)?;
        Ok(config
            .with_allowed_imports(raw.allowed_imports)
            .with_allowed_paths(raw.allowed_paths)
            .with_env_vars(raw.env_vars))
    }
}
