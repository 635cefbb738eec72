use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

use crate::control::StopSignal;
use crate::paths::Layout;

/// Clear the stop marker, spawn `count` worker processes and wait for all of
/// them to exit. A signal to the pool writes the stop marker so every worker
/// finishes its current job and leaves.
pub async fn start_pool(
    layout: &Layout,
    home: Option<PathBuf>,
    debug: bool,
    count: usize,
) -> anyhow::Result<()> {
    let stop = StopSignal::new(layout);
    stop.clear()?;

    let exe = std::env::current_exe()?;
    let count = count.max(1);

    // Listen before spawning so an early signal still reaches the workers.
    let mut shutdown = super::shutdown_signal().await?;
    tracing::info!(count, "starting workers");

    let mut children = Vec::with_capacity(count);
    for n in 1..=count {
        let id = format!("w-{n}");
        let mut command = Command::new(&exe);
        if let Some(home) = &home {
            command.arg("--home").arg(home);
        }
        if debug {
            command.arg("--debug");
        }
        command
            .args(["worker", "run", "--id", &id])
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let child = command.spawn()?;
        tracing::info!(worker = %id, pid = child.id(), "spawned worker");
        children.push((id, child));
    }

    let stop_on_signal = tokio::spawn(async move {
        if shutdown.changed().await.is_ok() {
            tracing::info!("signal received; asking workers to stop");
            if let Err(e) = stop.request() {
                tracing::error!(error = %e, "failed to write stop marker");
            }
        }
    });

    let mut failed = 0;
    for (id, mut child) in children {
        match child.wait().await {
            Ok(status) if status.success() => {
                tracing::info!(worker = %id, "worker exited");
            }
            Ok(status) => {
                failed += 1;
                tracing::warn!(worker = %id, status = %status, "worker exited with failure");
            }
            Err(e) => {
                failed += 1;
                tracing::error!(worker = %id, error = %e, "failed to wait for worker");
            }
        }
    }
    stop_on_signal.abort();

    if failed > 0 {
        anyhow::bail!("{failed} of {count} workers exited with failure");
    }
    Ok(())
}
