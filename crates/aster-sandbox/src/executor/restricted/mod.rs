//! 受限解释器执行器
//!
//! 在进程内的嵌入式 JavaScript 引擎中运行代码片段：
//!
//! 1. 执行前扫描导入，拒绝白名单之外的模块
//! 2. 初始化脚本只保留安全的全局对象与只读辅助函数
//! 3. 输出写入捕获缓冲区
//! 4. 在独立工作线程中执行，超时后放弃等待
//!
//! 超时的工作线程无法被强制终止，只能由引擎的循环与递归限制让它最终停下。

mod imports;
mod prelude;

pub use prelude::SAFE_MODULES;

use super::SandboxExecutor;
use crate::config::{SandboxConfiguration, SandboxStrategy};
use crate::error::SandboxError;
use crate::result::SandboxResult;
use crate::settings::RestrictedSettings;
use async_trait::async_trait;
use boa_engine::builtins::promise::{OperationType, PromiseState};
use boa_engine::context::{ContextBuilder, HostHooks};
use boa_engine::object::builtins::JsPromise;
use boa_engine::{
    Context, JsError, JsObject, JsResult, JsString, JsValue, NativeFunction, Script, Source,
};
use imports::ImportViolation;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const WORKER_STACK_SIZE: usize = 8 * 1024 * 1024;

const TRUNCATION_MARKER: &str = "\n... [output truncated]";

thread_local! {
    static CAPTURE: RefCell<Option<Arc<OutputCapture>>> = const { RefCell::new(None) };
}

/// 受限解释器执行器
#[derive(Debug, Clone, Default)]
pub struct RestrictedInterpreterExecutor {
    settings: RestrictedSettings,
}

impl RestrictedInterpreterExecutor {
    pub fn new(settings: RestrictedSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RestrictedSettings {
        &self.settings
    }
}

#[async_trait]
impl SandboxExecutor for RestrictedInterpreterExecutor {
    fn strategy(&self) -> SandboxStrategy {
        SandboxStrategy::RestrictedInterpreter
    }

    async fn execute(
        &self,
        code: &str,
        config: &SandboxConfiguration,
    ) -> Result<SandboxResult, SandboxError> {
        let source = match imports::rewrite_imports(code, config.allowed_imports()) {
            Ok(source) => source,
            Err(ImportViolation::NotAllowed(module)) => {
                info!("Rejected snippet importing {}", module);
                return Ok(SandboxResult::failure(SandboxError::import_restriction(
                    module,
                )));
            }
            Err(ImportViolation::Malformed { line, message }) => {
                return Ok(SandboxResult::failure(SandboxError::execution(format!(
                    "SyntaxError: {} (line {})",
                    message, line
                ))));
            }
        };

        let limits = config.limits();
        let prelude = prelude::build(config.allowed_imports());
        let capture = Arc::new(OutputCapture::new(self.settings.max_output_bytes));
        let (tx, rx) = oneshot::channel();

        let started = Instant::now();
        let worker_capture = Arc::clone(&capture);
        let settings = self.settings.clone();
        let spawned = std::thread::Builder::new()
            .name("aster-restricted".to_string())
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || {
                let outcome = run_worker(&source, &prelude, &settings, worker_capture);
                let _ = tx.send(outcome);
            });
        // 句柄被丢弃，线程分离运行，不阻塞进程退出
        if let Err(e) = spawned {
            warn!("Failed to spawn interpreter worker: {}", e);
            return Ok(SandboxResult::failure(SandboxError::infrastructure(format!(
                "failed to start interpreter worker: {}",
                e
            ))));
        }

        let result = match tokio::time::timeout(limits.timeout(), rx).await {
            Ok(Ok(outcome)) => {
                let (stdout, stderr) = capture.take();
                outcome.into_result(stdout, stderr)
            }
            Ok(Err(_)) => {
                warn!("Interpreter worker exited without reporting a result");
                SandboxResult::failure(SandboxError::infrastructure(
                    "interpreter worker exited unexpectedly",
                ))
            }
            Err(_) => {
                warn!(
                    "Interpreter worker still running after {}s, abandoning it",
                    limits.timeout_seconds
                );
                let (stdout, stderr) = capture.take();
                SandboxResult::timed_out(limits.timeout_seconds, stdout, stderr)
            }
        };

        Ok(result.with_usage(
            "elapsed_seconds",
            serde_json::json!(started.elapsed().as_secs_f64()),
        ))
    }
}

/// 工作线程的执行结果
#[derive(Debug)]
enum WorkerOutcome {
    Completed,
    Raised(String),
    SyntaxError(String),
    Failed(String),
}

impl WorkerOutcome {
    fn into_result(self, stdout: String, stderr: String) -> SandboxResult {
        match self {
            Self::Completed => SandboxResult::completed(stdout, stderr, 0),
            Self::Raised(message) => SandboxResult::raised(stdout, stderr, message),
            Self::SyntaxError(message) => SandboxResult::failure(SandboxError::execution(message)),
            Self::Failed(message) => SandboxResult::failure(SandboxError::infrastructure(message)),
        }
    }
}

fn run_worker(
    source: &str,
    prelude: &str,
    settings: &RestrictedSettings,
    capture: Arc<OutputCapture>,
) -> WorkerOutcome {
    CAPTURE.with(|slot| *slot.borrow_mut() = Some(capture));

    let rejections = Rc::new(RejectionTracker::default());
    let mut context = match ContextBuilder::new()
        .host_hooks(Rc::clone(&rejections))
        .build()
    {
        Ok(context) => context,
        Err(e) => {
            return WorkerOutcome::Failed(format!("failed to prepare interpreter: {}", e));
        }
    };
    context
        .runtime_limits_mut()
        .set_loop_iteration_limit(settings.loop_iteration_limit);
    context
        .runtime_limits_mut()
        .set_recursion_limit(settings.recursion_limit);

    if let Err(e) = register_writers(&mut context) {
        return WorkerOutcome::Failed(format!(
            "failed to prepare interpreter: {}",
            describe(e, &mut context)
        ));
    }

    // 先解析，语法错误时不执行任何代码
    let script = match Script::parse(Source::from_bytes(source), None, &mut context) {
        Ok(script) => script,
        Err(e) => return WorkerOutcome::SyntaxError(describe(e, &mut context)),
    };

    if let Err(e) = context.eval(Source::from_bytes(prelude)) {
        return WorkerOutcome::Failed(format!(
            "failed to prepare interpreter: {}",
            describe(e, &mut context)
        ));
    }

    let outcome = match script.evaluate(&mut context) {
        Ok(_) => match context.run_jobs() {
            Ok(()) => match rejections.first_unhandled() {
                Some(reason) => {
                    WorkerOutcome::Raised(describe(JsError::from_opaque(reason), &mut context))
                }
                None => WorkerOutcome::Completed,
            },
            Err(e) => WorkerOutcome::Raised(describe(e, &mut context)),
        },
        Err(e) => WorkerOutcome::Raised(describe(e, &mut context)),
    };
    debug!("Interpreter worker finished: {:?}", outcome);
    outcome
}

/// 记录没有处理器的被拒绝 Promise
#[derive(Default)]
struct RejectionTracker {
    pending: RefCell<Vec<JsObject>>,
}

impl RejectionTracker {
    /// 第一个仍未处理的拒绝原因
    fn first_unhandled(&self) -> Option<JsValue> {
        self.pending.borrow().iter().find_map(|promise| {
            match JsPromise::from_object(promise.clone()).ok()?.state() {
                PromiseState::Rejected(reason) => Some(reason),
                _ => None,
            }
        })
    }
}

impl HostHooks for RejectionTracker {
    fn promise_rejection_tracker(
        &self,
        promise: &JsObject,
        operation: OperationType,
        _context: &mut Context,
    ) {
        let mut pending = self.pending.borrow_mut();
        match operation {
            OperationType::Reject => pending.push(promise.clone()),
            OperationType::Handle => pending.retain(|p| !JsObject::equals(p, promise)),
        }
    }
}

fn register_writers(context: &mut Context) -> JsResult<()> {
    context.register_global_callable(
        JsString::from(prelude::WRITE_OUT),
        1,
        NativeFunction::from_fn_ptr(write_stdout),
    )?;
    context.register_global_callable(
        JsString::from(prelude::WRITE_ERR),
        1,
        NativeFunction::from_fn_ptr(write_stderr),
    )?;
    Ok(())
}

fn describe(err: JsError, context: &mut Context) -> String {
    match err.try_native(context) {
        Ok(native) => native.to_string(),
        Err(_) => err.to_string(),
    }
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn write_stdout(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    write_stream(Stream::Stdout, args, context)
}

fn write_stderr(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    write_stream(Stream::Stderr, args, context)
}

fn write_stream(stream: Stream, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let text = match args.first() {
        Some(value) => value.to_string(context)?.to_std_string_escaped(),
        None => String::new(),
    };
    CAPTURE.with(|slot| {
        if let Some(capture) = slot.borrow().as_ref() {
            capture.push(stream, &text);
        }
    });
    Ok(JsValue::undefined())
}

/// 工作线程与调用方共享的输出缓冲区，超时后仍可读取已有输出
#[derive(Debug)]
struct OutputCapture {
    stdout: Mutex<CappedBuffer>,
    stderr: Mutex<CappedBuffer>,
}

impl OutputCapture {
    fn new(max_bytes: usize) -> Self {
        Self {
            stdout: Mutex::new(CappedBuffer::new(max_bytes)),
            stderr: Mutex::new(CappedBuffer::new(max_bytes)),
        }
    }

    fn push(&self, stream: Stream, text: &str) {
        let buffer = match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        };
        if let Ok(mut buffer) = buffer.lock() {
            buffer.push(text);
        }
    }

    fn take(&self) -> (String, String) {
        let take = |buffer: &Mutex<CappedBuffer>| {
            buffer
                .lock()
                .map(|mut b| b.take())
                .unwrap_or_default()
        };
        (take(&self.stdout), take(&self.stderr))
    }
}

#[derive(Debug)]
struct CappedBuffer {
    text: String,
    max_bytes: usize,
    truncated: bool,
}

impl CappedBuffer {
    fn new(max_bytes: usize) -> Self {
        Self {
            text: String::new(),
            max_bytes,
            truncated: false,
        }
    }

    fn push(&mut self, text: &str) {
        if self.truncated {
            return;
        }
        let room = self.max_bytes.saturating_sub(self.text.len());
        if text.len() <= room {
            self.text.push_str(text);
            return;
        }
        // 按字符边界截断
        let cut = text
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= room)
            .last()
            .unwrap_or(0);
        self.text.push_str(text.get(..cut).unwrap_or_default());
        self.truncated = true;
    }

    fn take(&mut self) -> String {
        let mut text = std::mem::take(&mut self.text);
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::ResourceLimits;

    fn config(allowed: &[&str]) -> SandboxConfiguration {
        SandboxConfiguration::new(
            SandboxStrategy::RestrictedInterpreter,
            ResourceLimits::DEFAULT,
        )
        .unwrap()
        .with_allowed_imports(allowed.iter().copied())
    }

    async fn run(code: &str, allowed: &[&str]) -> SandboxResult {
        RestrictedInterpreterExecutor::default()
            .execute(code, &config(allowed))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_print_arithmetic() {
        let result = run("print(2+2)", &[]).await;
        assert!(result.success(), "stderr: {}", result.stderr);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "4\n");
    }

    #[tokio::test]
    async fn test_disallowed_import_is_rejected() {
        let result = run("import os", &["math"]).await;
        assert!(!result.success());
        assert!(result.stderr.contains("Import not allowed: os"));
        assert!(matches!(
            result.error,
            Some(SandboxError::ImportRestriction(ref m)) if m == "os"
        ));
    }

    #[tokio::test]
    async fn test_allowed_imports_resolve() {
        let result = run(
            "import math\nfrom statistics import mean\nprint(math.floor(math.sqrt(17)), mean([1, 2, 3]))",
            &["math", "statistics"],
        )
        .await;
        assert!(result.success(), "stderr: {}", result.stderr);
        assert_eq!(result.stdout, "4 2\n");
    }

    #[tokio::test]
    async fn test_star_import_keeps_builtin_helpers() {
        let result = run(
            "from math import *\nprint(sqrt(16), floor(pi), abs(-2), max(1, 5))",
            &["math"],
        )
        .await;
        assert!(result.success(), "stderr: {}", result.stderr);
        assert_eq!(result.stdout, "4 3 2 5\n");

        let result = run(
            "from statistics import *\nprint(mean([1, 2, 3]), median([3, 1, 2]))",
            &["statistics"],
        )
        .await;
        assert!(result.success(), "stderr: {}", result.stderr);
        assert_eq!(result.stdout, "2 2\n");
    }

    #[tokio::test]
    async fn test_unhandled_rejection_in_job_fails() {
        let result = run(
            "import('math').then((m) => { print(m.floor(1.5)); throw new Error('late'); })",
            &["math"],
        )
        .await;
        assert!(!result.success());
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.stdout, "1\n");
        assert!(result.stderr.contains("Error: late"), "stderr: {}", result.stderr);
    }

    #[tokio::test]
    async fn test_handled_rejection_succeeds() {
        let result = run(
            "Promise.reject(new Error('x')).catch((e) => print('caught', e.message))",
            &[],
        )
        .await;
        assert!(result.success(), "stderr: {}", result.stderr);
        assert_eq!(result.stdout, "caught x\n");
    }

    #[tokio::test]
    async fn test_every_safe_module_loads() {
        for module in SAFE_MODULES {
            let result = run(&format!("import {0}\nprint(typeof {0})", module), SAFE_MODULES).await;
            assert!(result.success(), "{}: {}", module, result.stderr);
            assert_eq!(result.stdout, "object\n");
        }
    }

    #[tokio::test]
    async fn test_allowed_but_unknown_module() {
        let result = run("import numpy", &["numpy"]).await;
        assert!(!result.success());
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("Module not found: numpy"));
    }

    #[tokio::test]
    async fn test_loader_rechecks_allow_list() {
        let result = run("__module('os')", &["math"]).await;
        assert!(!result.success());
        assert!(result.stderr.contains("Import not allowed: os"));
    }

    #[tokio::test]
    async fn test_dangerous_globals_removed() {
        for code in [
            "eval('1 + 1')",
            "new Function('return 1')()",
            "(() => {}).constructor('return 1')()",
            "(function* () {}).constructor('yield 1')",
            "Reflect.ownKeys({})",
            "new Proxy({}, {})",
            "__aster_write_out('leak')",
        ] {
            let result = run(code, &[]).await;
            assert!(!result.success(), "{} should fail", code);
            assert_eq!(result.exit_code, 1, "{}", code);
            assert!(result.stdout.is_empty());
        }
    }

    #[tokio::test]
    async fn test_helpers_are_read_only() {
        let result = run("len = () => 99;\nprint(len([1, 2, 3]))", &[]).await;
        assert!(result.success(), "stderr: {}", result.stderr);
        assert_eq!(result.stdout, "3\n");
    }

    #[tokio::test]
    async fn test_helpers() {
        let code = r#"
print(sorted([3, 1, 2]), reversed("ab"), sum(range(5)))
print(list(zip([1, 2], ["a", "b"])), enumerate(["x"]), any([0, 1]), all([]))
print(format("{} + {}", 1, 2), format(3.14159, ".2f"), int("42"), str(null))
"#;
        let result = run(code, &[]).await;
        assert!(result.success(), "stderr: {}", result.stderr);
        assert_eq!(
            result.stdout,
            "[1,2,3] [\"b\",\"a\"] 10\n[[1,\"a\"],[2,\"b\"]] [[0,\"x\"]] true true\n1 + 2 3.14 42 null\n"
        );
    }

    #[tokio::test]
    async fn test_exception_keeps_output() {
        let result = run("print('before'); throw new Error('boom')", &[]).await;
        assert!(!result.success());
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.stdout, "before\n");
        assert!(result.stderr.contains("Error: boom"));
    }

    #[tokio::test]
    async fn test_console_error_goes_to_stderr() {
        let result = run("console.log('out'); console.error('err', 1)", &[]).await;
        assert!(result.success());
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err 1\n");
    }

    #[tokio::test]
    async fn test_syntax_error_reported_without_running() {
        let result = run("print('ran')\nlet = = 1", &[]).await;
        assert!(!result.success());
        assert!(result.stdout.is_empty());
        assert!(result.stderr.contains("SyntaxError"));
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let executor = RestrictedInterpreterExecutor::new(RestrictedSettings {
            max_output_bytes: 16,
            ..RestrictedSettings::default()
        });
        let result = executor
            .execute("for (const i of range(100)) print('0123456789')", &config(&[]))
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, format!("0123456789\n01234{}", TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn test_loop_limit_stops_runaway_script() {
        let executor = RestrictedInterpreterExecutor::new(RestrictedSettings {
            loop_iteration_limit: 1_000,
            ..RestrictedSettings::default()
        });
        let result = executor
            .execute("let i = 0; while (true) { i++; }", &config(&[]))
            .await
            .unwrap();
        assert!(!result.success());
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.to_lowercase().contains("limit"));
    }

    #[tokio::test]
    async fn test_timeout_abandons_worker() {
        let executor = RestrictedInterpreterExecutor::new(RestrictedSettings {
            loop_iteration_limit: u64::MAX,
            ..RestrictedSettings::default()
        });
        let limits = ResourceLimits {
            timeout_seconds: 1,
            ..ResourceLimits::DEFAULT
        };
        let config =
            SandboxConfiguration::new(SandboxStrategy::RestrictedInterpreter, limits).unwrap();
        let started = Instant::now();
        let result = executor
            .execute(
                "print('started'); const end = Date.now() + 5000; while (Date.now() < end) {}",
                &config,
            )
            .await
            .unwrap();
        assert!(started.elapsed().as_secs() < 4);
        assert!(result.is_timeout());
        assert_eq!(result.exit_code, -1);
        assert_eq!(result.stdout, "started\n");
        assert!(result.stderr.contains("timeout"));
    }

    #[test]
    fn test_capped_buffer_respects_char_boundaries() {
        let mut buffer = CappedBuffer::new(4);
        buffer.push("ab");
        buffer.push("çdé");
        buffer.push("ignored");
        assert_eq!(buffer.take(), format!("abç{}", TRUNCATION_MARKER));
    }
}
