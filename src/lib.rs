//! sshtun - ephemeral SSH tunnels
//!
//! Exposes firewalled endpoints to an operator by forwarding local TCP
//! connections through short-lived SSH sessions.
//!
//! # Features
//!
//! - In-process SSH sessions with per-connection forwarding
//! - A registry of live tunnels driven over HTTP (`sshtun serve`)
//! - All-or-nothing multi-tunnel start with one stop for everything (`sshtun run`)
//! - An external `ssh -L` process variant with graceful stop
//! - Structured logging with tracing
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use sshtun::{KeyMaterial, SshConnector, SshEndpoint, TunnelRegistry, TunnelSpec};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = TunnelRegistry::new(Arc::new(SshConnector::default()));
//!
//!     let id = registry
//!         .create(TunnelSpec {
//!             id: "db".to_string(),
//!             endpoint: SshEndpoint::new("bastion.example.com", 22, "root"),
//!             key: KeyMaterial::File("/home/me/.ssh/id_ed25519".into()),
//!             bind_address: None,
//!             local_port: 15432,
//!             remote_host: "postgres".to_string(),
//!             remote_port: 5432,
//!         })
//!         .await?;
//!
//!     println!("{:?}", registry.list());
//!     registry.stop(&id).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod forwarder;
pub mod forwarding;
pub mod orchestrator;
pub mod outcome;
pub mod process;
pub mod record;
pub mod registry;
pub mod server;
pub mod session;
pub mod ssh;
pub mod transport;

pub use crate::config::{ClientConfig, RemoteConfig, ServiceConfig, TunnelStyle};
pub use error::{TunnelError, TunnelResult};
pub use forwarding::{ForwardRule, KeyMaterial, SshEndpoint, TunnelSpec};
pub use orchestrator::{
    Launcher, OrchestrationPlan, Orchestrator, RetryPolicy, RunSummary, RunningTunnel,
    SessionLauncher,
};
pub use outcome::SessionOutcome;
pub use process::ProcessLauncher;
pub use record::TunnelRecord;
pub use registry::{TunnelRegistry, TunnelStatus};
pub use server::ControlServer;
pub use session::{SessionState, TunnelSession};
pub use transport::SshConnector;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging with tracing; `verbosity` counts `-v` flags
pub fn init_logging(verbosity: u8) -> TunnelResult<()> {
    let default_filter = match verbosity {
        0 => "sshtun=info",
        1 => "sshtun=debug",
        _ => "sshtun=trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| TunnelError::Config(e.to_string()))?;

    Ok(())
}
