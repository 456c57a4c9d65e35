//! 子进程监督：带超时等待、输出捕获与终止

use crate::result::FAILURE_EXIT_CODE;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// 进程结束后等待输出读取完成的时间
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// 子进程运行结果
#[derive(Debug)]
pub(crate) enum ChildOutcome {
    Exited {
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
    TimedOut {
        stdout: String,
        stderr: String,
    },
}

/// 等待子进程退出，超时则调用 `on_timeout`（参数为 pid）并强制终止
pub(crate) async fn supervise<F>(
    mut child: Child,
    timeout: Duration,
    max_output_bytes: usize,
    on_timeout: F,
) -> std::io::Result<ChildOutcome>
where
    F: FnOnce(Option<u32>),
{
    let stdout_task = tokio::spawn(read_capped(child.stdout.take(), max_output_bytes));
    let stderr_task = tokio::spawn(read_capped(child.stderr.take(), max_output_bytes));

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => Some(status?),
        Err(_) => {
            warn!("Child process exceeded {:?}, killing it", timeout);
            on_timeout(child.id());
            if let Err(e) = child.kill().await {
                warn!("Failed to kill child process: {}", e);
            }
            None
        }
    };

    let stdout = collect(stdout_task).await;
    let stderr = collect(stderr_task).await;

    Ok(match status {
        Some(status) => ChildOutcome::Exited {
            status,
            stdout,
            stderr,
        },
        None => ChildOutcome::TimedOut { stdout, stderr },
    })
}

/// 退出码；被信号终止时为 128 + 信号值
pub(crate) fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    FAILURE_EXIT_CODE
}

async fn read_capped<R>(reader: Option<R>, max_bytes: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return String::new();
    };

    let mut captured = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = max_bytes.saturating_sub(captured.len());
                if n > room {
                    truncated = true;
                }
                // 超出上限后继续读取以免子进程阻塞在管道上
                captured.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) => {
                debug!("Stopped reading child output: {}", e);
                break;
            }
        }
    }

    let mut text = String::from_utf8_lossy(&captured).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

async fn collect(task: JoinHandle<String>) -> String {
    let abort = task.abort_handle();
    match tokio::time::timeout(OUTPUT_GRACE, task).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            debug!("Output reader task failed: {}", e);
            String::new()
        }
        Err(_) => {
            // 孙进程仍持有管道
            abort.abort();
            String::new()
        }
    }
}
