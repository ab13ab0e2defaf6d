//! Secure transport seam.
//!
//! A [`Connector`] dials and authenticates one transport per tunnel; the
//! resulting [`Transport`] opens `direct-tcpip` style channels to hosts
//! reachable from the far side. [`SshConnector`] is the russh-backed
//! implementation used outside of tests.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use russh::{
    Disconnect,
    client::{self, Handle},
    keys::{
        PrivateKey, PrivateKeyWithHashAlg, decode_secret_key, load_secret_key, ssh_key::HashAlg,
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time::timeout,
};
use tracing::{debug, info};

use crate::{
    error::{TunnelError, TunnelResult},
    forwarding::{KeyMaterial, TunnelSpec, format_host_port},
};

/// Default bound on dialing and authenticating a transport
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A bidirectional byte stream opened through a transport
pub trait ChannelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ChannelStream for T {}

pub type BoxedChannel = Box<dyn ChannelStream>;

/// An authenticated secure transport owned by exactly one session
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a channel to `host:port` as seen from the far side of the transport
    async fn open_channel(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> TunnelResult<BoxedChannel>;

    /// Close the transport; channels opened from it start failing
    async fn close(&self);

    /// Whether the far side or a previous `close` has ended the transport
    fn is_closed(&self) -> bool;
}

/// Dials transports for tunnel specs
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, spec: &TunnelSpec) -> TunnelResult<Arc<dyn Transport>>;
}

/// russh client handler; host keys are accepted and logged
struct ClientHandler {
    endpoint: String,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            endpoint = %self.endpoint,
            fingerprint = %server_public_key.fingerprint(HashAlg::Sha256),
            "Accepting server host key"
        );
        Ok(true)
    }
}

/// Connector that dials real SSH servers with public key authentication
#[derive(Debug, Clone)]
pub struct SshConnector {
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    fn client_config() -> Arc<client::Config> {
        Arc::new(client::Config {
            nodelay: true,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        })
    }

    async fn dial(
        &self,
        spec: &TunnelSpec,
        key: PrivateKey,
    ) -> TunnelResult<Handle<ClientHandler>> {
        let handler = ClientHandler {
            endpoint: spec.endpoint.address(),
        };
        let mut session = client::connect(
            Self::client_config(),
            (spec.endpoint.host.as_str(), spec.endpoint.port),
            handler,
        )
        .await?;

        // RSA keys need the strongest hash the server accepts; other key types ignore it
        let rsa_hash = session.best_supported_rsa_hash().await?.flatten();
        let auth = session
            .authenticate_publickey(
                spec.endpoint.user.clone(),
                PrivateKeyWithHashAlg::new(Arc::new(key), rsa_hash),
            )
            .await?;

        if !auth.success() {
            return Err(TunnelError::Ssh(format!(
                "public key authentication rejected for user {}",
                spec.endpoint.user
            )));
        }

        Ok(session)
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

/// Decode the private key carried by a spec; an unusable key fails the dial
fn load_private_key(spec: &TunnelSpec) -> TunnelResult<PrivateKey> {
    let reason = match &spec.key {
        KeyMaterial::Inline(text) => match decode_secret_key(text, None) {
            Ok(key) => return Ok(key),
            Err(e) => format!("invalid private key: {e}"),
        },
        KeyMaterial::File(path) => match load_secret_key(path, None) {
            Ok(key) => return Ok(key),
            Err(e) => format!("failed to load private key {}: {e}", path.display()),
        },
    };
    Err(TunnelError::DialFailure {
        endpoint: spec.endpoint.address(),
        reason,
    })
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, spec: &TunnelSpec) -> TunnelResult<Arc<dyn Transport>> {
        let endpoint = spec.endpoint.address();
        let key = load_private_key(spec)?;

        debug!(id = %spec.id, endpoint = %endpoint, "Dialing SSH server");

        let session = match timeout(self.connect_timeout, self.dial(spec, key)).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                return Err(TunnelError::DialFailure {
                    endpoint,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(TunnelError::DialFailure {
                    endpoint,
                    reason: format!("timed out after {:?}", self.connect_timeout),
                });
            }
        };

        info!(
            id = %spec.id,
            endpoint = %endpoint,
            user = %spec.endpoint.user,
            "SSH session established"
        );

        Ok(Arc::new(SshTransport { session, endpoint }))
    }
}

/// A live russh client session
struct SshTransport {
    session: Handle<ClientHandler>,
    endpoint: String,
}

#[async_trait]
impl Transport for SshTransport {
    async fn open_channel(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> TunnelResult<BoxedChannel> {
        let channel = self
            .session
            .channel_open_direct_tcpip(
                host,
                u32::from(port),
                originator.ip().to_string(),
                u32::from(originator.port()),
            )
            .await
            .map_err(|e| TunnelError::ForwardFailure {
                target: format_host_port(host, port),
                reason: e.to_string(),
            })?;

        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) {
        if let Err(e) = self
            .session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(endpoint = %self.endpoint, "Failed to disconnect gracefully: {}", e);
        }
    }

    fn is_closed(&self) -> bool {
        self.session.is_closed()
    }
}

/// Stand-ins for the SSH transport: a plain-TCP connector and an
/// in-process SSH server
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use russh::{
        Channel,
        keys::{
            Algorithm, PublicKey,
            ssh_key::{LineEnding, rand_core::OsRng},
        },
        server::{self, Auth, Server as _, Session},
    };
    use tokio::{
        io::copy_bidirectional,
        net::{TcpListener, TcpStream},
        task::JoinHandle,
    };

    use super::*;
    use crate::forwarding::SshEndpoint;

    /// SSH server on a loopback port that accepts one client key and
    /// bridges `direct-tcpip` channels to TCP targets on this host
    pub(crate) struct TestSshServer {
        pub(crate) addr: SocketAddr,
        client_key: PrivateKey,
        task: JoinHandle<()>,
    }

    impl TestSshServer {
        pub(crate) async fn start() -> Self {
            let client_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
            let config = Arc::new(server::Config {
                keys: vec![PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()],
                auth_rejection_time: Duration::from_millis(10),
                auth_rejection_time_initial: Some(Duration::ZERO),
                ..Default::default()
            });
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let mut server = BridgeServer {
                authorized: client_key.public_key().clone(),
            };
            let task = tokio::spawn(async move {
                let _ = server.run_on_socket(config, &listener).await;
            });
            Self {
                addr,
                client_key,
                task,
            }
        }

        /// The accepted client key in OpenSSH text form
        pub(crate) fn client_key_text(&self) -> String {
            let text = self.client_key.to_openssh(LineEnding::LF).unwrap();
            text.as_str().to_owned()
        }

        pub(crate) fn client_key(&self) -> KeyMaterial {
            KeyMaterial::Inline(self.client_key_text())
        }

        /// Spec tunnelling `local_port` through this server to `127.0.0.1:remote_port`
        pub(crate) fn spec(&self, id: &str, local_port: u16, remote_port: u16) -> TunnelSpec {
            TunnelSpec {
                id: id.to_string(),
                endpoint: SshEndpoint::new("127.0.0.1", self.addr.port(), "tester"),
                key: self.client_key(),
                bind_address: Some("127.0.0.1".to_string()),
                local_port,
                remote_host: "127.0.0.1".to_string(),
                remote_port,
            }
        }
    }

    impl Drop for TestSshServer {
        fn drop(&mut self) {
            self.task.abort();
        }
    }

    struct BridgeServer {
        authorized: PublicKey,
    }

    impl server::Server for BridgeServer {
        type Handler = BridgeHandler;

        fn new_client(&mut self, _peer: Option<SocketAddr>) -> BridgeHandler {
            BridgeHandler {
                authorized: self.authorized.clone(),
            }
        }
    }

    struct BridgeHandler {
        authorized: PublicKey,
    }

    impl server::Handler for BridgeHandler {
        type Error = russh::Error;

        fn auth_publickey(
            &mut self,
            _user: &str,
            public_key: &PublicKey,
        ) -> impl Future<Output = Result<Auth, Self::Error>> + Send {
            let auth = if public_key.key_data() == self.authorized.key_data() {
                Auth::Accept
            } else {
                Auth::reject()
            };
            async move { Ok(auth) }
        }

        fn channel_open_direct_tcpip(
            &mut self,
            channel: Channel<server::Msg>,
            host_to_connect: &str,
            port_to_connect: u32,
            _originator_address: &str,
            _originator_port: u32,
            _session: &mut Session,
        ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
            let host = host_to_connect.to_string();
            async move {
                let Ok(port) = u16::try_from(port_to_connect) else {
                    return Ok(false);
                };
                let Ok(mut upstream) = TcpStream::connect((host.as_str(), port)).await else {
                    return Ok(false);
                };
                tokio::spawn(async move {
                    let mut stream = channel.into_stream();
                    let _ = copy_bidirectional(&mut stream, &mut upstream).await;
                });
                Ok(true)
            }
        }
    }

    /// Connector whose transports dial targets directly from this host
    #[derive(Default)]
    pub(crate) struct LoopbackConnector {
        /// When set, every dial fails with this reason
        pub(crate) fail_with: Option<String>,
        pub(crate) connects: AtomicUsize,
        pub(crate) closes: Arc<AtomicUsize>,
        links: Mutex<Vec<Arc<AtomicBool>>>,
    }

    impl LoopbackConnector {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn failing(reason: &str) -> Self {
            Self {
                fail_with: Some(reason.to_string()),
                ..Self::default()
            }
        }

        pub(crate) fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }

        pub(crate) fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        /// Drop every transport handed out so far, as if the server hung up
        pub(crate) fn sever(&self) {
            let links = self.links.lock().unwrap();
            for link in links.iter() {
                link.store(true, Ordering::SeqCst);
            }
        }
    }

    #[async_trait]
    impl Connector for LoopbackConnector {
        async fn connect(&self, spec: &TunnelSpec) -> TunnelResult<Arc<dyn Transport>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if let Some(reason) = &self.fail_with {
                return Err(TunnelError::DialFailure {
                    endpoint: spec.endpoint.address(),
                    reason: reason.clone(),
                });
            }
            let closed = Arc::new(AtomicBool::new(false));
            self.links.lock().unwrap().push(Arc::clone(&closed));
            Ok(Arc::new(LoopbackTransport {
                closed,
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    struct LoopbackTransport {
        closed: Arc<AtomicBool>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        async fn open_channel(
            &self,
            host: &str,
            port: u16,
            _originator: SocketAddr,
        ) -> TunnelResult<BoxedChannel> {
            let target = format_host_port(host, port);
            if self.closed.load(Ordering::SeqCst) {
                return Err(TunnelError::ForwardFailure {
                    target,
                    reason: "transport closed".to_string(),
                });
            }
            let stream = TcpStream::connect(&target).await.map_err(|e| {
                TunnelError::ForwardFailure {
                    target: target.clone(),
                    reason: e.to_string(),
                }
            })?;
            Ok(Box::new(stream))
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }
}
