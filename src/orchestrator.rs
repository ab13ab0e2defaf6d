//! Client-side coordination of several tunnels started by one user action.
//!
//! A plan is started all-or-nothing, then watched until the first tunnel
//! exits or a stop is requested, at which point every tunnel is stopped and
//! a summary reported.

use std::{collections::HashSet, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{StreamExt, future::join_all, stream::FuturesUnordered};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{TunnelError, TunnelResult},
    forwarding::TunnelSpec,
    outcome::SessionOutcome,
    session::TunnelSession,
    transport::Connector,
};

/// A started tunnel that can be waited on and stopped
#[async_trait]
pub trait RunningTunnel: Send + Sync {
    fn id(&self) -> &str;

    /// Terminal outcome, if the tunnel has already ended
    fn outcome(&self) -> Option<SessionOutcome>;

    /// Resolve once the tunnel ends on its own or is stopped
    async fn wait(&self) -> SessionOutcome;

    /// Stop the tunnel; idempotent, resolves with its terminal outcome
    async fn stop(&self) -> SessionOutcome;
}

/// Starts one variant of running tunnel
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &TunnelSpec) -> TunnelResult<Arc<dyn RunningTunnel>>;
}

#[async_trait]
impl RunningTunnel for TunnelSession {
    fn id(&self) -> &str {
        TunnelSession::id(self)
    }

    fn outcome(&self) -> Option<SessionOutcome> {
        let state = self.state();
        state
            .is_terminal()
            .then(|| SessionOutcome::from_session_state(&state))
    }

    async fn wait(&self) -> SessionOutcome {
        SessionOutcome::from_session_state(&TunnelSession::wait(self).await)
    }

    async fn stop(&self) -> SessionOutcome {
        SessionOutcome::from_session_state(&TunnelSession::stop(self).await)
    }
}

/// Launches in-process tunnel sessions over a connector
pub struct SessionLauncher {
    connector: Arc<dyn Connector>,
}

impl SessionLauncher {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl Launcher for SessionLauncher {
    async fn launch(&self, spec: &TunnelSpec) -> TunnelResult<Arc<dyn RunningTunnel>> {
        let session = TunnelSession::start(spec.clone(), self.connector.as_ref()).await?;
        Ok(Arc::new(session))
    }
}

/// Fixed-delay retry for the single-tunnel path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Specs chosen in one user action, each with its resolved local port
#[derive(Debug, Clone, Default)]
pub struct OrchestrationPlan {
    entries: Vec<TunnelSpec>,
}

impl OrchestrationPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan that keeps each spec's own local port
    pub fn from_specs(specs: impl IntoIterator<Item = TunnelSpec>) -> Self {
        Self {
            entries: specs.into_iter().collect(),
        }
    }

    /// Add `spec`, listening on `local_port`
    pub fn push(&mut self, mut spec: TunnelSpec, local_port: u16) {
        spec.local_port = local_port;
        self.entries.push(spec);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn specs(&self) -> &[TunnelSpec] {
        &self.entries
    }

    /// Every problem found before anything is started, one per line item
    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut ids = HashSet::new();
        let mut ports = HashSet::new();

        for spec in &self.entries {
            if let Err(e) = spec.validate() {
                problems.push(e.to_string());
                continue;
            }
            if !ids.insert(spec.id.as_str()) {
                problems.push(format!("{}: duplicate tunnel id", spec.id));
            }
            if !ports.insert(spec.local_port) {
                problems.push(format!(
                    "{}: local port {} is used twice in this plan",
                    spec.id, spec.local_port
                ));
            }
        }
        problems
    }
}

/// How one tunnel of a plan ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelReport {
    pub id: String,
    pub outcome: SessionOutcome,
}

/// Per-tunnel outcomes once a plan has fully stopped, in plan order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub reports: Vec<TunnelReport>,
}

impl RunSummary {
    pub fn failures(&self) -> impl Iterator<Item = &TunnelReport> {
        self.reports.iter().filter(|r| r.outcome.is_failure())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for report in &self.reports {
            writeln!(f, "  {}: {}", report.id, report.outcome)?;
        }
        Ok(())
    }
}

/// Every tunnel of a plan, all started
pub struct RunningSet {
    tunnels: Vec<Arc<dyn RunningTunnel>>,
}

impl RunningSet {
    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Id and terminal outcome (None while running) of each tunnel
    pub fn status(&self) -> Vec<(String, Option<SessionOutcome>)> {
        self.tunnels
            .iter()
            .map(|t| (t.id().to_string(), t.outcome()))
            .collect()
    }

    /// Stop every tunnel concurrently; resolves once all are terminal
    pub async fn stop_all(&self) -> Vec<SessionOutcome> {
        join_all(self.tunnels.iter().map(|t| t.stop())).await
    }

    /// Wait until any tunnel exits or `stop` fires, then stop everything.
    pub async fn run_until(self, stop: CancellationToken) -> RunSummary {
        if self.tunnels.is_empty() {
            return RunSummary::default();
        }

        let mut exits: FuturesUnordered<_> = self
            .tunnels
            .iter()
            .enumerate()
            .map(|(index, tunnel)| {
                let tunnel = Arc::clone(tunnel);
                async move { (index, tunnel.wait().await) }
            })
            .collect();
        let mut outcomes: Vec<Option<SessionOutcome>> = vec![None; self.tunnels.len()];

        tokio::select! {
            _ = stop.cancelled() => {
                info!("Stop requested, stopping {} tunnel(s)", self.tunnels.len());
            }
            Some((index, outcome)) = exits.next() => {
                info!(
                    id = %self.tunnels[index].id(),
                    "Tunnel {}, stopping the remaining tunnels",
                    outcome
                );
                outcomes[index] = Some(outcome);
            }
        }

        self.stop_all().await;
        while let Some((index, outcome)) = exits.next().await {
            outcomes[index] = Some(outcome);
        }

        let reports = self
            .tunnels
            .iter()
            .zip(outcomes)
            .map(|(tunnel, outcome)| TunnelReport {
                id: tunnel.id().to_string(),
                outcome: outcome.unwrap_or(SessionOutcome::Interrupted),
            })
            .collect();
        RunSummary { reports }
    }
}

/// Starts plans through one launcher variant
pub struct Orchestrator {
    launcher: Arc<dyn Launcher>,
}

impl Orchestrator {
    pub fn new(launcher: Arc<dyn Launcher>) -> Self {
        Self { launcher }
    }

    /// Start every tunnel of `plan` concurrently, all or nothing.
    ///
    /// If any tunnel fails to start, the ones that did start are stopped
    /// before [`TunnelError::PartialStartFailure`] is returned.
    pub async fn start_all(&self, plan: &OrchestrationPlan) -> TunnelResult<RunningSet> {
        let total = plan.len();
        let problems = plan.problems();
        if !problems.is_empty() {
            return Err(TunnelError::PartialStartFailure {
                failed: problems.len(),
                total,
                errors: problems,
            });
        }

        let results = join_all(plan.specs().iter().map(|spec| self.launcher.launch(spec))).await;

        let mut started = Vec::with_capacity(total);
        let mut errors = Vec::new();
        for (spec, result) in plan.specs().iter().zip(results) {
            match result {
                Ok(tunnel) => started.push(tunnel),
                Err(e) => errors.push(format!("{}: {}", spec.id, e)),
            }
        }

        if !errors.is_empty() {
            warn!(
                "{} of {} tunnels failed to start, rolling back {} started",
                errors.len(),
                total,
                started.len()
            );
            join_all(started.iter().map(|t| t.stop())).await;
            return Err(TunnelError::PartialStartFailure {
                failed: errors.len(),
                total,
                errors,
            });
        }

        info!("All {} tunnel(s) active", total);
        Ok(RunningSet { tunnels: started })
    }

    /// Run one tunnel until it ends or `stop` fires, retrying abnormal exits.
    ///
    /// Clean and interrupted exits are never retried. Once retries run out
    /// the last failure is returned as [`TunnelError::SessionFailure`].
    pub async fn run_single(
        &self,
        spec: &TunnelSpec,
        policy: &RetryPolicy,
        stop: CancellationToken,
    ) -> TunnelResult<SessionOutcome> {
        spec.validate()?;
        let mut retries = 0;

        loop {
            if stop.is_cancelled() {
                return Ok(SessionOutcome::Interrupted);
            }

            let failure = match self.launcher.launch(spec).await {
                Ok(tunnel) => {
                    let outcome = tokio::select! {
                        outcome = tunnel.wait() => outcome,
                        _ = stop.cancelled() => tunnel.stop().await,
                    };
                    if !outcome.is_retryable() {
                        debug!(id = %spec.id, "Tunnel {}", outcome);
                        return Ok(outcome);
                    }
                    outcome.to_string()
                }
                Err(e @ TunnelError::InvalidSpec(_)) => return Err(e),
                Err(e) => e.to_string(),
            };

            if retries >= policy.max_retries {
                return Err(TunnelError::SessionFailure {
                    id: spec.id.clone(),
                    reason: format!("{failure} after {} attempt(s)", retries + 1),
                });
            }
            retries += 1;
            warn!(
                id = %spec.id,
                "Tunnel {}; retry {}/{} in {:?}",
                failure,
                retries,
                policy.max_retries,
                policy.delay
            );

            tokio::select! {
                _ = sleep(policy.delay) => {}
                _ = stop.cancelled() => return Ok(SessionOutcome::Interrupted),
            }
        }
    }
}
