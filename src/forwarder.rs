use std::{net::SocketAddr, sync::Arc};

use tokio::{
    io::{self, AsyncWriteExt},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::{TunnelError, TunnelResult},
    forwarding::format_host_port,
    transport::Transport,
};

/// Relays one accepted local connection to the remote target through a transport
pub struct Forwarder {
    transport: Arc<dyn Transport>,
    remote_host: String,
    remote_port: u16,
}

impl Forwarder {
    pub fn new(transport: Arc<dyn Transport>, remote_host: String, remote_port: u16) -> Self {
        Self {
            transport,
            remote_host,
            remote_port,
        }
    }

    /// Dial the target and copy bytes both ways until either side finishes.
    ///
    /// A dial failure closes `local` and is returned as [`TunnelError::ForwardFailure`];
    /// it concerns this connection only.
    pub async fn run(
        self,
        mut local: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> TunnelResult<()> {
        let target = format_host_port(&self.remote_host, self.remote_port);

        let open = self
            .transport
            .open_channel(&self.remote_host, self.remote_port, peer);
        let opened = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            opened = open => opened,
        };
        let remote = match opened {
            Ok(remote) => remote,
            Err(e) => {
                let _ = local.shutdown().await;
                return Err(match e {
                    TunnelError::ForwardFailure { .. } => e,
                    other => TunnelError::ForwardFailure {
                        target,
                        reason: other.to_string(),
                    },
                });
            }
        };

        debug!(peer = %peer, target = %target, "Forwarding connection");

        let (mut local_read, mut local_write) = local.split();
        let (mut remote_read, mut remote_write) = io::split(remote);

        // The first direction to finish ends the connection
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(peer = %peer, "Forward interrupted by tunnel shutdown");
            }
            result = io::copy(&mut local_read, &mut remote_write) => {
                if let Err(e) = result {
                    debug!(peer = %peer, "Local to remote copy ended: {}", e);
                }
            }
            result = io::copy(&mut remote_read, &mut local_write) => {
                if let Err(e) = result {
                    debug!(peer = %peer, "Remote to local copy ended: {}", e);
                }
            }
        }

        let _ = remote_write.shutdown().await;
        let _ = local_write.shutdown().await;
        debug!(peer = %peer, target = %target, "Forward connection closed");
        Ok(())
    }
}
