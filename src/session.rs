//! One running tunnel: a secure transport, a local listener and the accept
//! loop that hands every inbound connection to a [`Forwarder`].

use std::{fmt, io::ErrorKind, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::TcpListener,
    sync::watch,
    task::JoinSet,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{TunnelError, TunnelResult},
    forwarder::Forwarder,
    forwarding::TunnelSpec,
    transport::{Connector, Transport},
};

/// How often an idle session checks that its transport is still up
const TRANSPORT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

const TRANSPORT_CLOSED: &str = "ssh transport closed";

/// Lifecycle of a tunnel session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Active,
    Stopping,
    Stopped,
    Failed(String),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed(_))
    }

    /// Lowercase label used in status listings
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// A running tunnel. Dropping it cancels the accept loop.
pub struct TunnelSession {
    spec: TunnelSpec,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    state: Arc<watch::Sender<SessionState>>,
}

impl TunnelSession {
    /// Dial the transport, bind the local listener and start accepting.
    ///
    /// Nothing is left open when this returns an error.
    pub async fn start(spec: TunnelSpec, connector: &dyn Connector) -> TunnelResult<Self> {
        spec.validate()?;

        let transport = connector.connect(&spec).await?;

        let listener = match TcpListener::bind(spec.bind_addr()).await {
            Ok(listener) => listener,
            Err(source) => {
                transport.close().await;
                return Err(TunnelError::BindFailure {
                    port: spec.local_port,
                    source,
                });
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(source) => {
                transport.close().await;
                return Err(TunnelError::BindFailure {
                    port: spec.local_port,
                    source,
                });
            }
        };

        let (state, _) = watch::channel(SessionState::Starting);
        let state = Arc::new(state);
        let cancel = CancellationToken::new();

        tokio::spawn(accept_loop(
            spec.clone(),
            listener,
            transport,
            cancel.clone(),
            Arc::clone(&state),
        ));
        state.send_if_modified(|current| {
            if *current != SessionState::Starting {
                return false;
            }
            *current = SessionState::Active;
            true
        });

        info!(
            id = %spec.id,
            local = %local_addr,
            target = %spec.target(),
            ssh = %spec.endpoint,
            "Tunnel active"
        );

        Ok(Self {
            spec,
            local_addr,
            cancel,
            state,
        })
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    /// Address the listener actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state change
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Wait until the session reaches `Stopped` or `Failed`
    pub async fn wait(&self) -> SessionState {
        wait_terminal(self.subscribe()).await
    }

    /// Stop accepting, interrupt forwarders and close the transport.
    ///
    /// Idempotent; returns once the session is terminal.
    pub async fn stop(&self) -> SessionState {
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == SessionState::Stopping {
                return false;
            }
            *state = SessionState::Stopping;
            true
        });
        self.cancel.cancel();
        self.wait().await
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("id", &self.spec.id)
            .field("local_addr", &self.local_addr)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

async fn wait_terminal(mut rx: watch::Receiver<SessionState>) -> SessionState {
    match rx.wait_for(SessionState::is_terminal).await {
        Ok(state) => state.clone(),
        // The loop task is gone without publishing; nothing is left running
        Err(_) => SessionState::Stopped,
    }
}

async fn accept_loop(
    spec: TunnelSpec,
    listener: TcpListener,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    state: Arc<watch::Sender<SessionState>>,
) {
    let mut forwarders = JoinSet::new();
    let mut liveness = time::interval(TRANSPORT_CHECK_INTERVAL);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let failure = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break None,

            Some(joined) = forwarders.join_next(), if !forwarders.is_empty() => {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(id = %spec.id, "{}", e);
                        if transport.is_closed() {
                            break Some(TRANSPORT_CLOSED.to_string());
                        }
                    }
                    Err(e) if e.is_panic() => warn!(id = %spec.id, "Forwarder panicked: {}", e),
                    Err(_) => {}
                }
            }

            _ = liveness.tick() => {
                if transport.is_closed() {
                    break Some(TRANSPORT_CLOSED.to_string());
                }
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(id = %spec.id, peer = %peer, "Accepted local connection");
                    let forwarder = Forwarder::new(
                        Arc::clone(&transport),
                        spec.remote_host.clone(),
                        spec.remote_port,
                    );
                    forwarders.spawn(forwarder.run(stream, peer, cancel.child_token()));
                }
                Err(e) if is_transient_accept_error(e.kind()) => {
                    debug!(id = %spec.id, "Transient accept error: {}", e);
                }
                Err(e) => break Some(format!("accept failed: {e}")),
            },
        }
    };

    drop(listener);
    cancel.cancel();
    forwarders.shutdown().await;
    transport.close().await;

    let terminal = match failure {
        None => {
            info!(id = %spec.id, "Tunnel stopped");
            SessionState::Stopped
        }
        Some(reason) => {
            warn!(id = %spec.id, "Tunnel failed: {}", reason);
            SessionState::Failed(reason)
        }
    };
    state.send_replace(terminal);
}

fn is_transient_accept_error(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
    )
}
