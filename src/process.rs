//! Tunnels carried by an external `ssh` client process.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    process::{Child, Command},
    sync::watch,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{TunnelError, TunnelResult},
    forwarding::TunnelSpec,
    orchestrator::{Launcher, RunningTunnel},
    outcome::{FailureCause, SessionOutcome},
    ssh::{DEFAULT_SSH_BINARY, SshCommand},
};

/// How long a fresh process must survive to count as started
pub const DEFAULT_STARTUP_PROBE: Duration = Duration::from_millis(500);

/// Time allowed between SIGINT and a forced kill
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

/// A supervised child process standing in for a tunnel session
pub struct ProcessTunnel {
    id: String,
    pid: Option<u32>,
    cancel: CancellationToken,
    outcome: watch::Receiver<Option<SessionOutcome>>,
}

impl ProcessTunnel {
    /// Spawn `command` and supervise it.
    ///
    /// With a startup probe, a process that exits inside the window is a
    /// start error rather than a running tunnel.
    pub async fn spawn(
        id: impl Into<String>,
        mut command: Command,
        startup_probe: Option<Duration>,
        grace: Duration,
    ) -> TunnelResult<Self> {
        let id = id.into();
        command.kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| TunnelError::Ssh(format!("Failed to start SSH process: {e}")))?;
        let pid = child.id();

        if let Some(window) = startup_probe {
            match timeout(window, child.wait()).await {
                Ok(Ok(status)) => {
                    return Err(TunnelError::Ssh(format!(
                        "{id}: process exited during startup ({status})"
                    )));
                }
                Ok(Err(e)) => return Err(TunnelError::Io(e)),
                Err(_) => {}
            }
        }

        let (tx, outcome) = watch::channel(None);
        let cancel = CancellationToken::new();
        tokio::spawn(supervise(id.clone(), child, cancel.clone(), grace, tx));

        info!(id = %id, pid = ?pid, "Tunnel process running");
        Ok(Self {
            id,
            pid,
            cancel,
            outcome,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

async fn supervise(
    id: String,
    mut child: Child,
    cancel: CancellationToken,
    grace: Duration,
    tx: watch::Sender<Option<SessionOutcome>>,
) {
    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => SessionOutcome::from_exit_status(status, false),
            Err(e) => SessionOutcome::Failed(FailureCause::Error(e.to_string())),
        },
        _ = cancel.cancelled() => terminate(&id, &mut child, grace).await,
    };

    if outcome.is_failure() {
        warn!(id = %id, "Tunnel process {}", outcome);
    } else {
        info!(id = %id, "Tunnel process {}", outcome);
    }
    tx.send_replace(Some(outcome));
}

/// SIGINT first, then a forced kill once `grace` runs out
async fn terminate(id: &str, child: &mut Child, grace: Duration) -> SessionOutcome {
    if let Some(pid) = child.id()
        && interrupt(pid)
    {
        debug!(id = %id, pid, "Sent SIGINT");
    }

    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => SessionOutcome::from_exit_status(status, true),
        Ok(Err(e)) => SessionOutcome::Failed(FailureCause::Error(e.to_string())),
        Err(_) => {
            warn!(id = %id, "Process ignored SIGINT for {:?}, killing", grace);
            if let Err(e) = child.kill().await {
                warn!(id = %id, "Error killing SSH process: {}", e);
            }
            SessionOutcome::Interrupted
        }
    }
}

#[cfg(unix)]
fn interrupt(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory effects; the pid is our unreaped child
    unsafe { libc::kill(pid, libc::SIGINT) == 0 }
}

#[cfg(not(unix))]
fn interrupt(_pid: u32) -> bool {
    false
}

#[async_trait]
impl RunningTunnel for ProcessTunnel {
    fn id(&self) -> &str {
        &self.id
    }

    fn outcome(&self) -> Option<SessionOutcome> {
        self.outcome.borrow().clone()
    }

    async fn wait(&self) -> SessionOutcome {
        let mut rx = self.outcome.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(SessionOutcome::Interrupted),
            Err(_) => SessionOutcome::Failed(FailureCause::Error(
                "process supervisor exited".to_string(),
            )),
        }
    }

    async fn stop(&self) -> SessionOutcome {
        self.cancel.cancel();
        self.wait().await
    }
}

impl Drop for ProcessTunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Launches tunnels as external `ssh -L ... -N` processes
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    ssh_binary: String,
    startup_probe: Duration,
    grace: Duration,
}

impl ProcessLauncher {
    pub fn new(ssh_binary: impl Into<String>, grace: Duration) -> Self {
        Self {
            ssh_binary: ssh_binary.into(),
            startup_probe: DEFAULT_STARTUP_PROBE,
            grace,
        }
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new(DEFAULT_SSH_BINARY, DEFAULT_STOP_GRACE)
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, spec: &TunnelSpec) -> TunnelResult<Arc<dyn RunningTunnel>> {
        spec.validate()?;
        let command = SshCommand::for_spec(&self.ssh_binary, spec)?;
        debug!(id = %spec.id, "Running: {}", command.command_string());

        let tunnel = ProcessTunnel::spawn(
            spec.id.clone(),
            command.command(),
            Some(self.startup_probe),
            self.grace,
        )
        .await?;
        Ok(Arc::new(tunnel))
    }
}
