//! In-memory set of live tunnels keyed by identifier.
//!
//! All map mutation happens under one short-held lock; dialing, binding and
//! teardown run outside it.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    error::{TunnelError, TunnelResult},
    forwarding::TunnelSpec,
    session::{SessionState, TunnelSession},
    transport::Connector,
};

/// Point-in-time view of one tunnel, as reported by `GET /status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelStatus {
    pub id: String,
    pub local_port: u16,
    pub target: String,
    pub ssh_server: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TunnelStatus {
    fn new(spec: &TunnelSpec, state: &SessionState) -> Self {
        let error = match state {
            SessionState::Failed(reason) => Some(reason.clone()),
            _ => None,
        };
        Self {
            id: spec.id.clone(),
            local_port: spec.local_port,
            target: spec.target(),
            ssh_server: spec.endpoint.address(),
            status: state.as_str().to_string(),
            error,
        }
    }
}

/// Failure records kept for status reporting before the oldest are dropped
pub const DEFAULT_TOMBSTONE_LIMIT: usize = 64;

enum Entry {
    /// Reserved by an in-flight create
    Starting,
    Active {
        serial: u64,
        session: Arc<TunnelSession>,
    },
}

struct Tombstone {
    serial: u64,
    status: TunnelStatus,
}

struct Inner {
    entries: HashMap<String, Entry>,
    /// Sessions that failed on their own, kept for status reporting
    tombstones: HashMap<String, Tombstone>,
    tombstone_limit: usize,
}

impl Inner {
    fn new(tombstone_limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            tombstones: HashMap::new(),
            tombstone_limit,
        }
    }

    /// Record a failure, evicting the oldest records past the limit
    fn bury(&mut self, id: String, serial: u64, status: TunnelStatus) {
        self.tombstones.insert(id, Tombstone { serial, status });
        while self.tombstones.len() > self.tombstone_limit {
            let Some(oldest) = self
                .tombstones
                .iter()
                .min_by_key(|(_, tombstone)| tombstone.serial)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            debug!(id = %oldest, "Dropping oldest failure record");
            self.tombstones.remove(&oldest);
        }
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Concurrency-safe registry enforcing one live session per identifier
pub struct TunnelRegistry {
    connector: Arc<dyn Connector>,
    inner: Arc<Mutex<Inner>>,
    next_serial: AtomicU64,
}

impl TunnelRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_tombstone_limit(connector, DEFAULT_TOMBSTONE_LIMIT)
    }

    /// Registry that remembers at most `limit` failed sessions
    pub fn with_tombstone_limit(connector: Arc<dyn Connector>, limit: usize) -> Self {
        Self {
            connector,
            inner: Arc::new(Mutex::new(Inner::new(limit))),
            next_serial: AtomicU64::new(1),
        }
    }

    /// Start a session for `spec` and register it under `spec.id`.
    ///
    /// Fails with [`TunnelError::Conflict`] while another session (or another
    /// create) holds the id. A failed start leaves no entry behind.
    pub async fn create(&self, spec: TunnelSpec) -> TunnelResult<String> {
        spec.validate()?;
        let id = spec.id.clone();

        {
            let mut inner = lock(&self.inner);
            if inner.entries.contains_key(&id) {
                return Err(TunnelError::Conflict(id));
            }
            inner.entries.insert(id.clone(), Entry::Starting);
        }
        let reservation = Reservation {
            inner: &self.inner,
            id: &id,
            armed: true,
        };

        let session = Arc::new(TunnelSession::start(spec, self.connector.as_ref()).await?);
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);

        {
            let mut inner = lock(&self.inner);
            inner.tombstones.remove(&id);
            inner.entries.insert(
                id.clone(),
                Entry::Active {
                    serial,
                    session: Arc::clone(&session),
                },
            );
        }
        reservation.disarm();

        tokio::spawn(watch_for_failure(
            Arc::downgrade(&self.inner),
            id.clone(),
            serial,
            session.subscribe(),
        ));

        info!(id = %id, "Tunnel registered");
        Ok(id)
    }

    /// Remove and stop the session registered under `id`.
    ///
    /// The id is free for a new `create` as soon as this returns. A tombstone
    /// left by a failed session is cleared instead.
    pub async fn stop(&self, id: &str) -> TunnelResult<()> {
        let session = {
            let mut inner = lock(&self.inner);
            match inner.entries.get(id) {
                Some(Entry::Active { .. }) => match inner.entries.remove(id) {
                    Some(Entry::Active { session, .. }) => session,
                    _ => return Err(TunnelError::NotFound(id.to_string())),
                },
                Some(Entry::Starting) => return Err(TunnelError::NotFound(id.to_string())),
                None => {
                    return match inner.tombstones.remove(id) {
                        Some(_) => Ok(()),
                        None => Err(TunnelError::NotFound(id.to_string())),
                    };
                }
            }
        };

        session.stop().await;
        info!(id = %id, "Tunnel stopped and deregistered");
        Ok(())
    }

    /// Snapshot of every live tunnel plus failed tombstones, sorted by id
    pub fn list(&self) -> Vec<TunnelStatus> {
        let inner = lock(&self.inner);
        let mut statuses: Vec<TunnelStatus> = inner
            .entries
            .values()
            .filter_map(|entry| match entry {
                Entry::Active { session, .. } => {
                    Some(TunnelStatus::new(session.spec(), &session.state()))
                }
                Entry::Starting => None,
            })
            .chain(inner.tombstones.values().map(|t| t.status.clone()))
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    pub fn status(&self, id: &str) -> Option<TunnelStatus> {
        let inner = lock(&self.inner);
        match inner.entries.get(id) {
            Some(Entry::Active { session, .. }) => {
                Some(TunnelStatus::new(session.spec(), &session.state()))
            }
            Some(Entry::Starting) => None,
            None => inner.tombstones.get(id).map(|t| t.status.clone()),
        }
    }

    /// Stop every live session concurrently and forget all tombstones
    pub async fn stop_all(&self) -> usize {
        let sessions: Vec<Arc<TunnelSession>> = {
            let mut inner = lock(&self.inner);
            inner.tombstones.clear();
            let ids: Vec<String> = inner
                .entries
                .iter()
                .filter(|(_, entry)| matches!(entry, Entry::Active { .. }))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| match inner.entries.remove(id) {
                    Some(Entry::Active { session, .. }) => Some(session),
                    _ => None,
                })
                .collect()
        };

        let count = sessions.len();
        join_all(sessions.iter().map(|session| session.stop())).await;
        if count > 0 {
            info!("Stopped {} tunnel(s)", count);
        }
        count
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        lock(&self.inner)
            .entries
            .values()
            .filter(|entry| matches!(entry, Entry::Active { .. }))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases a `Starting` placeholder if the create does not complete
struct Reservation<'a> {
    inner: &'a Mutex<Inner>,
    id: &'a str,
    armed: bool,
}

impl Reservation<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = lock(self.inner);
        if matches!(inner.entries.get(self.id), Some(Entry::Starting)) {
            inner.entries.remove(self.id);
        }
    }
}

/// Deregister a session that fails on its own and leave a tombstone
async fn watch_for_failure(
    inner: Weak<Mutex<Inner>>,
    id: String,
    serial: u64,
    mut state: watch::Receiver<SessionState>,
) {
    let terminal = match state.wait_for(SessionState::is_terminal).await {
        Ok(terminal) => terminal.clone(),
        Err(_) => return,
    };
    let SessionState::Failed(reason) = &terminal else {
        return;
    };
    let Some(inner) = inner.upgrade() else {
        return;
    };

    let mut inner = lock(&inner);
    let current = matches!(
        inner.entries.get(&id),
        Some(Entry::Active { serial: s, .. }) if *s == serial
    );
    if !current {
        return;
    }
    if let Some(Entry::Active { session, .. }) = inner.entries.remove(&id) {
        warn!(id = %id, "Tunnel deregistered after failure: {}", reason);
        let status = TunnelStatus::new(session.spec(), &terminal);
        inner.bury(id, serial, status);
    }
}
