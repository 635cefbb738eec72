#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tempfile::TempDir;

pub fn queuectl_bin() -> &'static str {
    env!("CARGO_BIN_EXE_queuectl")
}

pub fn wait_for_path(path: &Path, timeout: Duration) -> bool {
    wait_until(timeout, || path.exists())
}

pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

/// A queue home in a temporary directory, isolated from the user's XDG dirs.
pub struct QueueHome {
    pub dir: TempDir,
}

impl QueueHome {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn stop_flag_path(&self) -> PathBuf {
        self.path().join("runtime/stop.flag")
    }

    pub fn job_log_path(&self, id: &str) -> PathBuf {
        self.path().join(format!("data/logs/{id}.log"))
    }

    pub fn cmd(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new(queuectl_bin());
        cmd.env("QUEUECTL_HOME", self.path());
        cmd.env_remove("QUEUECTL_DEBUG");
        cmd
    }

    pub fn assert_cmd(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::Command::new(queuectl_bin());
        cmd.env("QUEUECTL_HOME", self.path());
        cmd.env_remove("QUEUECTL_DEBUG");
        cmd
    }

    /// Run a command that must succeed and return its trimmed stdout.
    pub fn stdout(&self, args: &[&str]) -> String {
        let output = self.cmd().args(args).output().unwrap();
        assert!(
            output.status.success(),
            "queuectl {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8(output.stdout).unwrap().trim().to_string()
    }

    pub fn enqueue(&self, command: &str) -> String {
        self.stdout(&["enqueue", command])
    }

    pub fn status(&self) -> serde_json::Value {
        serde_json::from_str(&self.stdout(&["status", "--format", "json"])).unwrap()
    }

    pub fn list(&self, state: &str) -> Vec<serde_json::Value> {
        serde_json::from_str(&self.stdout(&["list", "--state", state, "--format", "json"]))
            .unwrap()
    }

    /// Wait until `status` reports `count` jobs in `state`.
    pub fn wait_for_count(&self, state: &str, count: u64, timeout: Duration) -> bool {
        wait_until(timeout, || self.status()[state] == count)
    }

    /// Spawn a process in the background against this home.
    pub fn spawn(&self, args: &[&str]) -> Spawned {
        let child = self
            .cmd()
            .args(args)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .expect("failed to spawn queuectl");
        Spawned { child }
    }
}

/// A background queuectl process. Sends SIGTERM and waits for exit on drop.
pub struct Spawned {
    pub child: std::process::Child,
}

impl Spawned {
    pub fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    pub fn terminate(&self) {
        let _ = signal::kill(Pid::from_raw(self.pid()), Signal::SIGTERM);
    }

    /// Wait for the process to exit on its own.
    pub fn wait_exit(&mut self, timeout: Duration) -> Option<std::process::ExitStatus> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Some(status) = self.child.try_wait().unwrap() {
                return Some(status);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        None
    }
}

impl Drop for Spawned {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            self.terminate();
            let _ = self.child.wait();
        }
    }
}
