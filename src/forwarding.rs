use std::{fmt, path::PathBuf};

use crate::error::{TunnelError, TunnelResult};

/// Address a session listener binds to when the spec does not name one
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Username used when a request leaves it out
pub const DEFAULT_SSH_USER: &str = "root";

/// Represents a port forwarding rule in `ssh -L` notation
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardRule {
    /// Local/bind address (optional)
    pub bind_address: Option<String>,
    /// Local/bind port
    pub bind_port: u16,
    /// Remote host
    pub remote_host: String,
    /// Remote port
    pub remote_port: u16,
}

impl ForwardRule {
    /// Parse a forwarding rule string
    ///
    /// Supported formats:
    /// - "port:host:port" (e.g., "8080:127.0.0.1:8080")
    /// - "address:port:host:port" (e.g., "0.0.0.0:8080:127.0.0.1:8080")
    /// - IPv6 addresses must be enclosed in brackets, e.g., "[::1]:80:localhost:80"
    pub fn parse(rule: &str) -> TunnelResult<Self> {
        // Parse from right to left so bracketed IPv6 bind addresses survive
        let (rest, remote_port_str) = rule
            .rsplit_once(':')
            .ok_or_else(|| TunnelError::Config(format!("Invalid forwarding rule: {rule}")))?;
        let remote_port = parse_port(remote_port_str, "remote")?;

        let (rest, remote_host) = rest
            .rsplit_once(':')
            .ok_or_else(|| TunnelError::Config(format!("Invalid forwarding rule: {rule}")))?;
        if remote_host.is_empty() {
            return Err(TunnelError::Config(format!(
                "Missing remote host in forwarding rule: {rule}"
            )));
        }

        let (bind_address, bind_port_str) = match rest.rsplit_once(':') {
            Some((addr, port)) => (Some(addr.to_string()), port),
            None => (None, rest),
        };
        let bind_port = parse_port(bind_port_str, "bind")?;

        Ok(ForwardRule {
            bind_address,
            bind_port,
            remote_host: remote_host.to_string(),
            remote_port,
        })
    }

    /// Convert to SSH forwarding argument format
    pub fn to_ssh_arg(&self) -> String {
        match &self.bind_address {
            Some(addr) => format!(
                "{}:{}:{}:{}",
                addr, self.bind_port, self.remote_host, self.remote_port
            ),
            None => format!(
                "{}:{}:{}",
                self.bind_port, self.remote_host, self.remote_port
            ),
        }
    }
}

fn parse_port(value: &str, which: &str) -> TunnelResult<u16> {
    match value.parse::<u16>() {
        Ok(0) | Err(_) => Err(TunnelError::Config(format!(
            "Invalid {which} port: {value}"
        ))),
        Ok(port) => Ok(port),
    }
}

/// The SSH server a tunnel is carried over
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl SshEndpoint {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
        }
    }

    /// `host:port`, bracketing bare IPv6 literals
    pub fn address(&self) -> String {
        format_host_port(&self.host, self.port)
    }
}

impl fmt::Display for SshEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.address())
    }
}

/// Join a host and port, bracketing bare IPv6 literals
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Private key used to authenticate the transport
#[derive(Clone, PartialEq, Eq)]
pub enum KeyMaterial {
    /// PEM/OpenSSH encoded key text, as posted to the daemon
    Inline(String),
    /// Path to a key file written by the key collaborator
    File(PathBuf),
}

impl KeyMaterial {
    fn is_empty(&self) -> bool {
        match self {
            KeyMaterial::Inline(text) => text.trim().is_empty(),
            KeyMaterial::File(path) => path.as_os_str().is_empty(),
        }
    }
}

// Key text must never reach logs.
impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMaterial::Inline(_) => f.write_str("Inline(<redacted>)"),
            KeyMaterial::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

/// Everything needed to run one tunnel: local port -> ssh endpoint -> remote host:port
#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub id: String,
    pub endpoint: SshEndpoint,
    pub key: KeyMaterial,
    /// Bind address for the local listener, all interfaces when unset
    pub bind_address: Option<String>,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl TunnelSpec {
    /// Identifier used when the caller does not supply one
    pub fn default_id(local_port: u16) -> String {
        format!("tunnel-{local_port}")
    }

    /// Build a spec from a forwarding rule carried over `endpoint`
    pub fn from_rule(
        id: Option<String>,
        endpoint: SshEndpoint,
        key: KeyMaterial,
        rule: &ForwardRule,
    ) -> Self {
        Self {
            id: id.unwrap_or_else(|| Self::default_id(rule.bind_port)),
            endpoint,
            key,
            bind_address: rule.bind_address.clone(),
            local_port: rule.bind_port,
            remote_host: rule.remote_host.clone(),
            remote_port: rule.remote_port,
        }
    }

    /// Reject specs that cannot start before any socket is touched
    pub fn validate(&self) -> TunnelResult<()> {
        if self.id.trim().is_empty() {
            return Err(TunnelError::InvalidSpec("id cannot be empty".to_string()));
        }
        if self.endpoint.host.trim().is_empty() {
            return Err(TunnelError::InvalidSpec(format!(
                "{}: ssh host cannot be empty",
                self.id
            )));
        }
        if self.endpoint.port == 0 {
            return Err(TunnelError::InvalidSpec(format!(
                "{}: ssh port must be positive",
                self.id
            )));
        }
        if self.endpoint.user.trim().is_empty() {
            return Err(TunnelError::InvalidSpec(format!(
                "{}: ssh user cannot be empty",
                self.id
            )));
        }
        if self.key.is_empty() {
            return Err(TunnelError::InvalidSpec(format!(
                "{}: private key cannot be empty",
                self.id
            )));
        }
        if self.local_port == 0 {
            return Err(TunnelError::InvalidSpec(format!(
                "{}: local port must be positive",
                self.id
            )));
        }
        if self.remote_host.trim().is_empty() {
            return Err(TunnelError::InvalidSpec(format!(
                "{}: remote host cannot be empty",
                self.id
            )));
        }
        if self.remote_port == 0 {
            return Err(TunnelError::InvalidSpec(format!(
                "{}: remote port must be positive",
                self.id
            )));
        }
        Ok(())
    }

    /// Address the local listener binds to
    pub fn bind_addr(&self) -> String {
        format_host_port(
            self.bind_address.as_deref().unwrap_or(DEFAULT_BIND_ADDRESS),
            self.local_port,
        )
    }

    /// `remote_host:remote_port`
    pub fn target(&self) -> String {
        format_host_port(&self.remote_host, self.remote_port)
    }

    /// The equivalent `-L` rule for an external ssh client
    pub fn forward_rule(&self) -> ForwardRule {
        ForwardRule {
            bind_address: self.bind_address.clone(),
            bind_port: self.local_port,
            remote_host: self.remote_host.clone(),
            remote_port: self.remote_port,
        }
    }
}
