use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

/// How long a timed-out command gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How long to keep draining pipes after the command exits. A background
/// process that escaped the process group can hold them open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Output read so far, shared with the reader task so a drain that gives up
/// still keeps it.
type Captured = Arc<Mutex<Vec<u8>>>;

#[derive(Debug, PartialEq)]
pub enum Outcome {
    Succeeded { stdout: String },
    Failed { error: String },
}

#[derive(Debug)]
pub struct Execution {
    pub outcome: Outcome,
    pub elapsed: Duration,
}

impl Execution {
    pub fn elapsed_sec(&self) -> f64 {
        (self.elapsed.as_secs_f64() * 100.0).round() / 100.0
    }
}

/// Run `command` through `sh -c` in its own process group, bounded by
/// `timeout`. Whatever happens, stdout then stderr land in `log_path`.
pub async fn execute(command: &str, timeout: Duration, log_path: &Path) -> Execution {
    let start = Instant::now();

    let spawned = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            let error = format!("failed to spawn command: {e}");
            write_log(log_path, &[], error.as_bytes());
            return Execution {
                outcome: Outcome::Failed { error },
                elapsed: start.elapsed(),
            };
        }
    };

    let group = child.id().map(|pid| Pid::from_raw(pid as i32));
    let stdout = Captured::default();
    let stderr = Captured::default();
    let stdout_task = tokio::spawn(read_into(child.stdout.take(), Arc::clone(&stdout)));
    let stderr_task = tokio::spawn(read_into(child.stderr.take(), Arc::clone(&stderr)));

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = tokio::time::sleep(timeout) => None,
    };

    let status = match waited {
        Some(status) => status,
        None => {
            tracing::warn!(command, timeout_ms = timeout.as_millis(), "command timed out; terminating");
            terminate(&mut child, group).await;
            Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("timed out after {}ms", timeout.as_millis()),
            ))
        }
    };
    let elapsed = start.elapsed();

    // Background processes the command left behind would keep the pipes open.
    if let Some(group) = group {
        match killpg(group, Signal::SIGKILL) {
            Ok(()) => tracing::debug!(pgid = group.as_raw(), "killed leftover processes"),
            Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => tracing::debug!(pgid = group.as_raw(), error = %e, "failed to kill process group"),
        }
    }

    let stdout = drain(stdout_task, &stdout).await;
    let stderr = drain(stderr_task, &stderr).await;
    write_log(log_path, &stdout, &stderr);

    let outcome = match status {
        Ok(status) if status.success() => Outcome::Succeeded {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
        },
        Ok(status) => {
            let stderr = String::from_utf8_lossy(&stderr);
            let error = if stderr.trim().is_empty() {
                format!("command exited with {status}")
            } else {
                stderr.trim_end().to_string()
            };
            Outcome::Failed { error }
        }
        Err(e) => Outcome::Failed {
            error: e.to_string(),
        },
    };

    Execution { outcome, elapsed }
}

async fn terminate(child: &mut Child, group: Option<Pid>) {
    let Some(group) = group else {
        return;
    };
    let pid = group.as_raw();

    if let Err(e) = killpg(group, Signal::SIGTERM) {
        tracing::debug!(pid, error = %e, "failed to send SIGTERM");
    }

    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        tracing::warn!(pid, "command ignored SIGTERM; killing");
        if let Err(e) = killpg(group, Signal::SIGKILL) {
            tracing::debug!(pid, error = %e, "failed to send SIGKILL");
        }
        let _ = child.wait().await;
    }
}

async fn read_into<R: AsyncRead + Unpin>(pipe: Option<R>, sink: Captured) {
    let Some(mut pipe) = pipe else {
        return;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => sink
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(&chunk[..n]),
            Err(e) => {
                tracing::debug!(error = %e, "failed to read command output");
                break;
            }
        }
    }
}

async fn drain(mut task: tokio::task::JoinHandle<()>, captured: &Captured) -> Vec<u8> {
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(error = %e, "output reader failed"),
        Err(_) => {
            tracing::warn!("command output still open after exit; keeping what was read");
            task.abort();
        }
    }
    std::mem::take(&mut *captured.lock().unwrap_or_else(PoisonError::into_inner))
}

fn write_log(path: &Path, stdout: &[u8], stderr: &[u8]) {
    let result = (|| -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, [stdout, stderr].concat())
    })();

    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "failed to write job log");
    }
}
