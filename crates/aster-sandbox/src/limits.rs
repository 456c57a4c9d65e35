//! 资源限制
//!
//! 沙箱执行的数值策略：CPU、内存、磁盘、进程数、文件数、网络与超时。
//! `ResourceLimits` 是不可变值对象，派生变体通过 `with_*` 方法产生新值。

use serde::{Deserialize, Serialize};

/// CPU 核数上限
pub const MAX_CPU_CORES: f64 = 4.0;
/// 内存上限（MB）
pub const MAX_MEMORY_MB: u64 = 4096;
/// 磁盘上限（MB）
pub const MAX_DISK_MB: u64 = 2048;
/// 超时上限（秒）
pub const MAX_TIMEOUT_SECONDS: u64 = 300;

/// 资源限制
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU 核数（可为小数，例如 0.5）
    pub cpu_cores: f64,
    /// CPU 时间（秒）
    pub cpu_time_seconds: u64,
    /// 内存（MB）
    pub memory_mb: u64,
    /// 磁盘（MB）
    pub disk_mb: u64,
    /// 单个文件最大大小（MB）
    pub max_file_size_mb: u64,
    /// 是否禁用网络
    pub network_offline: bool,
    /// 最大进程数
    pub max_processes: u32,
    /// 最大打开文件数
    pub max_open_files: u32,
    /// 墙钟超时（秒）
    pub timeout_seconds: u64,
}

impl ResourceLimits {
    /// 默认限制
    pub const DEFAULT: ResourceLimits = ResourceLimits {
        cpu_cores: 1.0,
        cpu_time_seconds: 30,
        memory_mb: 1024,
        disk_mb: 512,
        max_file_size_mb: 100,
        network_offline: true,
        max_processes: 50,
        max_open_files: 100,
        timeout_seconds: 30,
    };

    /// 严格限制，用于不可信代码
    pub const STRICT: ResourceLimits = ResourceLimits {
        cpu_cores: 0.5,
        cpu_time_seconds: 10,
        memory_mb: 256,
        disk_mb: 100,
        max_file_size_mb: 10,
        network_offline: true,
        max_processes: 10,
        max_open_files: 20,
        timeout_seconds: 10,
    };

    /// 宽松限制，用于可信代码
    pub const RELAXED: ResourceLimits = ResourceLimits {
        cpu_cores: 2.0,
        cpu_time_seconds: 60,
        memory_mb: 2048,
        disk_mb: 1024,
        max_file_size_mb: 200,
        network_offline: false,
        max_processes: 100,
        max_open_files: 200,
        timeout_seconds: 60,
    };

    /// 返回允许网络访问的副本
    pub fn with_network(&self) -> Self {
        Self {
            network_offline: false,
            ..*self
        }
    }

    /// 返回超时与 CPU 时间都设置为 `seconds` 的副本
    pub fn with_extended_timeout(&self, seconds: u64) -> Self {
        Self {
            timeout_seconds: seconds,
            cpu_time_seconds: seconds,
            ..*self
        }
    }

    /// 墙钟超时
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_seconds)
    }

    /// 按系统上限校验
    pub fn validate(&self) -> (bool, Option<String>) {
        LimitsValidator::validate(self)
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// 信任级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// 不可信
    Untrusted,
    /// 受限
    Limited,
    /// 可信
    Trusted,
}

impl TrustLevel {
    /// 解析信任级别字符串，仅接受小写全称，其他值返回 `None`
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "untrusted" => Some(Self::Untrusted),
            "limited" => Some(Self::Limited),
            "trusted" => Some(Self::Trusted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Untrusted => "untrusted",
            Self::Limited => "limited",
            Self::Trusted => "trusted",
        }
    }

    /// 该级别对应的预设限制
    pub fn limits(&self) -> ResourceLimits {
        match self {
            Self::Untrusted => ResourceLimits::STRICT,
            Self::Limited => ResourceLimits::DEFAULT,
            Self::Trusted => ResourceLimits::RELAXED,
        }
    }
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 根据信任级别获取预设限制，未知级别回退到 `DEFAULT`
pub fn get_limits_for_trust_level(trust_level: &str) -> ResourceLimits {
    TrustLevel::parse(trust_level)
        .map(|level| level.limits())
        .unwrap_or(ResourceLimits::DEFAULT)
}

/// 资源限制校验器
pub struct LimitsValidator;

impl LimitsValidator {
    /// 按固定顺序检查各字段，返回第一个违规项
    pub fn validate(limits: &ResourceLimits) -> (bool, Option<String>) {
        match Self::first_violation(limits) {
            Some(message) => (false, Some(message)),
            None => (true, None),
        }
    }

    fn first_violation(limits: &ResourceLimits) -> Option<String> {
        // NaN 同样视为非正数
        if limits.cpu_cores.is_nan() || limits.cpu_cores <= 0.0 {
            return Some("CPU cores must be positive".to_string());
        }
        if limits.cpu_cores > MAX_CPU_CORES {
            return Some(format!(
                "CPU cores ({}) exceeds max ({})",
                limits.cpu_cores, MAX_CPU_CORES
            ));
        }

        if limits.memory_mb == 0 {
            return Some("Memory must be positive".to_string());
        }
        if limits.memory_mb > MAX_MEMORY_MB {
            return Some(format!(
                "Memory ({}MB) exceeds max ({}MB)",
                limits.memory_mb, MAX_MEMORY_MB
            ));
        }

        if limits.disk_mb == 0 {
            return Some("Disk must be positive".to_string());
        }
        if limits.disk_mb > MAX_DISK_MB {
            return Some(format!(
                "Disk ({}MB) exceeds max ({}MB)",
                limits.disk_mb, MAX_DISK_MB
            ));
        }

        if limits.timeout_seconds == 0 {
            return Some("Timeout must be positive".to_string());
        }
        if limits.timeout_seconds > MAX_TIMEOUT_SECONDS {
            return Some(format!(
                "Timeout ({}s) exceeds max ({}s)",
                limits.timeout_seconds, MAX_TIMEOUT_SECONDS
            ));
        }

        if limits.max_processes == 0 {
            return Some("Max processes must be positive".to_string());
        }

        if limits.max_open_files == 0 {
            return Some("Max open files must be positive".to_string());
        }

        None
    }
}
