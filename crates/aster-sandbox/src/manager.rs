//! 沙箱管理器
//!
//! 按配置的策略选择执行器并执行代码；拒绝无隔离模式，把执行器的错误与
//! panic 转换为失败的结果，自身从不返回错误。

use crate::config::{SandboxConfiguration, SandboxStrategy};
use crate::error::SandboxError;
use crate::executor::{
    ContainerExecutor, ProcessExecutor, RestrictedInterpreterExecutor, SandboxExecutor,
};
use crate::limits::{ResourceLimits, TrustLevel};
use crate::result::SandboxResult;
use crate::settings::SandboxSettings;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

/// 可信代码默认允许导入的模块
pub const TRUSTED_IMPORTS: &[&str] = &["math", "json", "random", "statistics"];

/// 沙箱管理器
#[derive(Clone)]
pub struct SandboxManager {
    executors: HashMap<SandboxStrategy, Arc<dyn SandboxExecutor>>,
}

impl SandboxManager {
    /// 使用默认设置注册全部执行器
    pub fn new() -> Self {
        Self::with_settings(&SandboxSettings::default())
    }

    /// 按设置注册全部执行器
    pub fn with_settings(settings: &SandboxSettings) -> Self {
        let mut manager = Self::empty();
        manager.register_executor(Arc::new(ContainerExecutor::new(settings.container.clone())));
        manager.register_executor(Arc::new(ProcessExecutor::new(settings.process.clone())));
        manager.register_executor(Arc::new(RestrictedInterpreterExecutor::new(
            settings.restricted.clone(),
        )));
        manager
    }

    /// 不含任何执行器
    pub fn empty() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// 注册执行器，替换同策略的已有执行器
    pub fn register_executor(&mut self, executor: Arc<dyn SandboxExecutor>) {
        self.executors.insert(executor.strategy(), executor);
    }

    pub fn has_executor(&self, strategy: SandboxStrategy) -> bool {
        self.executors.contains_key(&strategy)
    }

    /// 执行代码；`config` 为空时使用默认配置
    pub async fn execute(
        &self,
        code: &str,
        config: Option<&SandboxConfiguration>,
    ) -> SandboxResult {
        let default_config;
        let config = match config {
            Some(config) => config,
            None => {
                default_config = SandboxConfiguration::default();
                &default_config
            }
        };

        let strategy = config.strategy();
        if strategy == SandboxStrategy::None {
            warn!("Refusing to execute code without isolation");
            return SandboxResult::failure(SandboxError::configuration(
                "unsafe execution mode not allowed",
            ));
        }

        let Some(executor) = self.executors.get(&strategy) else {
            warn!("No executor registered for strategy {}", strategy);
            return SandboxResult::failure(SandboxError::configuration(format!(
                "no executor registered for strategy: {}",
                strategy
            )));
        };

        debug!(
            "Executing snippet with {} strategy (timeout={}s)",
            strategy,
            config.limits().timeout_seconds
        );

        match AssertUnwindSafe(executor.execute(code, config))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!("Sandbox executor {} failed: {}", strategy, e);
                execution_failed(&e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!("Sandbox executor {} panicked: {}", strategy, message);
                execution_failed(&message)
            }
        }
    }

    /// 根据信任级别推荐配置，未知级别按不可信处理
    pub fn get_recommended_config(&self, trust_level: &str) -> SandboxConfiguration {
        recommended_config(TrustLevel::parse(trust_level).unwrap_or(TrustLevel::Untrusted))
    }
}

impl Default for SandboxManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut strategies: Vec<_> = self.executors.keys().map(|s| s.as_str()).collect();
        strategies.sort_unstable();
        f.debug_struct("SandboxManager")
            .field("strategies", &strategies)
            .finish()
    }
}

/// 信任级别对应的推荐配置
pub fn recommended_config(level: TrustLevel) -> SandboxConfiguration {
    match level {
        TrustLevel::Untrusted => SandboxConfiguration::new_unchecked(
            SandboxStrategy::Container,
            ResourceLimits::STRICT,
        ),
        TrustLevel::Limited => SandboxConfiguration::new_unchecked(
            SandboxStrategy::Process,
            ResourceLimits {
                memory_mb: 512,
                ..ResourceLimits::DEFAULT
            },
        ),
        TrustLevel::Trusted => SandboxConfiguration::new_unchecked(
            SandboxStrategy::RestrictedInterpreter,
            ResourceLimits {
                memory_mb: 1024,
                network_offline: true,
                ..ResourceLimits::RELAXED.with_extended_timeout(60)
            },
        )
        .with_allowed_imports(TRUSTED_IMPORTS.iter().copied()),
    }
}

fn execution_failed(message: &str) -> SandboxResult {
    SandboxResult::failure(SandboxError::infrastructure(format!(
        "sandbox execution failed: {}",
        message
    )))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "executor panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_case::test_case;

    enum Behavior {
        Succeed,
        Fail,
        Panic,
    }

    struct StubExecutor {
        strategy: SandboxStrategy,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl StubExecutor {
        fn new(strategy: SandboxStrategy, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                strategy,
                behavior,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SandboxExecutor for StubExecutor {
        fn strategy(&self) -> SandboxStrategy {
            self.strategy
        }

        async fn execute(
            &self,
            code: &str,
            _config: &SandboxConfiguration,
        ) -> Result<SandboxResult, SandboxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed => Ok(SandboxResult::completed(code.to_string(), String::new(), 0)),
                Behavior::Fail => Err(SandboxError::infrastructure("disk full")),
                Behavior::Panic => panic!("executor exploded"),
            }
        }
    }

    fn config(strategy: SandboxStrategy) -> SandboxConfiguration {
        SandboxConfiguration::new(strategy, ResourceLimits::DEFAULT).unwrap()
    }

    #[tokio::test]
    async fn test_none_strategy_never_executes() {
        let stub = StubExecutor::new(SandboxStrategy::Container, Behavior::Succeed);
        let mut manager = SandboxManager::empty();
        manager.register_executor(stub.clone());

        for limits in [ResourceLimits::STRICT, ResourceLimits::RELAXED] {
            let config = SandboxConfiguration::new(SandboxStrategy::None, limits).unwrap();
            let result = manager.execute("print(1)", Some(&config)).await;
            assert!(!result.success());
            assert!(result.stderr.contains("unsafe execution mode not allowed"));
        }
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_config_uses_container() {
        let stub = StubExecutor::new(SandboxStrategy::Container, Behavior::Succeed);
        let mut manager = SandboxManager::empty();
        manager.register_executor(stub.clone());

        let result = manager.execute("hello", None).await;
        assert!(result.success());
        assert_eq!(result.stdout, "hello");
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregistered_strategy() {
        let manager = SandboxManager::empty();
        let result = manager
            .execute("x", Some(&config(SandboxStrategy::Process)))
            .await;
        assert!(!result.success());
        assert_eq!(result.exit_code, -1);
        assert!(result
            .stderr
            .contains("no executor registered for strategy: process"));
    }

    #[tokio::test]
    async fn test_executor_error_becomes_result() {
        let mut manager = SandboxManager::empty();
        manager.register_executor(StubExecutor::new(SandboxStrategy::Process, Behavior::Fail));
        let result = manager
            .execute("x", Some(&config(SandboxStrategy::Process)))
            .await;
        assert!(!result.success());
        assert_eq!(result.stderr, "sandbox execution failed: disk full");
    }

    #[tokio::test]
    async fn test_executor_panic_becomes_result() {
        let mut manager = SandboxManager::empty();
        manager.register_executor(StubExecutor::new(SandboxStrategy::Process, Behavior::Panic));
        let result = manager
            .execute("x", Some(&config(SandboxStrategy::Process)))
            .await;
        assert!(!result.success());
        assert_eq!(result.stderr, "sandbox execution failed: executor exploded");
    }

    #[test]
    fn test_default_manager_registers_all_strategies() {
        let manager = SandboxManager::new();
        assert!(manager.has_executor(SandboxStrategy::Container));
        assert!(manager.has_executor(SandboxStrategy::Process));
        assert!(manager.has_executor(SandboxStrategy::RestrictedInterpreter));
        assert!(!manager.has_executor(SandboxStrategy::None));
    }

    #[test_case("untrusted", SandboxStrategy::Container, 0.5, 256, 10 ; "untrusted")]
    #[test_case("limited", SandboxStrategy::Process, 1.0, 512, 30 ; "limited")]
    #[test_case("trusted", SandboxStrategy::RestrictedInterpreter, 2.0, 1024, 60 ; "trusted")]
    #[test_case("root", SandboxStrategy::Container, 0.5, 256, 10 ; "unknown falls back")]
    #[test_case("TRUSTED", SandboxStrategy::Container, 0.5, 256, 10 ; "wrong case falls back")]
    #[test_case(" trusted", SandboxStrategy::Container, 0.5, 256, 10 ; "padded falls back")]
    fn test_recommended_config(
        level: &str,
        strategy: SandboxStrategy,
        cpu: f64,
        memory: u64,
        timeout: u64,
    ) {
        let config = SandboxManager::empty().get_recommended_config(level);
        assert_eq!(config.strategy(), strategy);
        assert_eq!(config.limits().cpu_cores, cpu);
        assert_eq!(config.limits().memory_mb, memory);
        assert_eq!(config.limits().timeout_seconds, timeout);
        assert!(config.limits().network_offline);
        assert!(config.limits().validate().0);
    }

    #[test]
    fn test_trusted_config_allows_small_import_set() {
        let config = recommended_config(TrustLevel::Trusted);
        let imports: Vec<_> = config.allowed_imports().iter().map(String::as_str).collect();
        assert_eq!(imports, vec!["json", "math", "random", "statistics"]);
        assert!(recommended_config(TrustLevel::Untrusted)
            .allowed_imports()
            .is_empty());
    }
}
