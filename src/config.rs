use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::{TunnelError, TunnelResult},
    forwarding::{
        DEFAULT_BIND_ADDRESS, DEFAULT_SSH_USER, ForwardRule, KeyMaterial, SshEndpoint, TunnelSpec,
        format_host_port,
    },
    orchestrator::RetryPolicy,
    process::DEFAULT_STOP_GRACE,
    record::TunnelRecord,
    ssh::DEFAULT_SSH_BINARY,
    transport::DEFAULT_CONNECT_TIMEOUT,
};

/// Prefix of environment variables read by [`ServiceConfig::load`]
pub const ENV_PREFIX: &str = "SSHTUN";

/// Settings for the HTTP control daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind_address: String,
    pub port: u16,
    /// Bound on dialing and authenticating each SSH session
    pub connect_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: 5600,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
        }
    }
}

impl ServiceConfig {
    /// Layer an optional file and `SSHTUN_*` environment variables over the defaults
    pub fn load(path: Option<&Path>) -> TunnelResult<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }
        let settings = builder
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .map_err(|e| TunnelError::Config(format!("Failed to load service config: {e}")))?;

        let config: ServiceConfig = settings
            .try_deserialize()
            .map_err(|e| TunnelError::Config(format!("Failed to parse service config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TunnelResult<()> {
        if self.bind_address.trim().is_empty() {
            return Err(TunnelError::Config(
                "Bind address cannot be empty".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(TunnelError::Config(
                "Connect timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// `bind_address:port` for the HTTP listener
    pub fn listen_addr(&self) -> String {
        format_host_port(&self.bind_address, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// How the client carries its tunnels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStyle {
    /// SSH sessions and forwarding inside this process
    #[default]
    InProcess,
    /// One external `ssh -L` process per tunnel
    Process,
}

/// Remote SSH server shared by every rule in `forwarding_list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Hostname or IP address
    pub host: String,
    /// SSH port (default: 22)
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Username for SSH connection
    #[serde(default = "default_ssh_user")]
    pub user: String,
    /// Path to private key file
    pub key: PathBuf,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    DEFAULT_SSH_USER.to_string()
}

/// A backend tunnel record together with the key file allocated for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordEntry {
    #[serde(flatten)]
    pub record: TunnelRecord,
    pub key: PathBuf,
    /// Listen port, the record's target port when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            delay_secs: policy.delay.as_secs(),
        }
    }
}

/// Configuration for the interactive client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub style: TunnelStyle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteConfig>,
    /// Rules in `[bind_addr:]port:host:port` notation, carried over `remote`
    #[serde(default)]
    pub forwarding_list: Vec<String>,
    #[serde(default)]
    pub records: Vec<RecordEntry>,
    /// Connection timeout in seconds
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,
}

fn default_stop_grace_secs() -> u64 {
    DEFAULT_STOP_GRACE.as_secs()
}

fn default_ssh_binary() -> String {
    DEFAULT_SSH_BINARY.to_string()
}

impl ClientConfig {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> TunnelResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TunnelError::Config(format!("Failed to read config file: {e}")))?;

        let config: ClientConfig = serde_json::from_str(&content)
            .map_err(|e| TunnelError::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> TunnelResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| TunnelError::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| TunnelError::Config(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> TunnelResult<()> {
        if self.forwarding_list.is_empty() && self.records.is_empty() {
            return Err(TunnelError::Config(
                "Configure at least one forwarding rule or tunnel record".to_string(),
            ));
        }

        if !self.forwarding_list.is_empty() {
            let remote = self.remote.as_ref().ok_or_else(|| {
                TunnelError::Config("Forwarding list requires a remote server".to_string())
            })?;
            if remote.host.is_empty() {
                return Err(TunnelError::Config("Remote host cannot be empty".to_string()));
            }
            if remote.user.is_empty() {
                return Err(TunnelError::Config("Remote user cannot be empty".to_string()));
            }
            for rule in &self.forwarding_list {
                ForwardRule::parse(rule)?;
            }
        }

        if self.timeout == Some(0) {
            return Err(TunnelError::Config("Timeout must be positive".to_string()));
        }
        if self.ssh_binary.trim().is_empty() {
            return Err(TunnelError::Config("SSH binary cannot be empty".to_string()));
        }

        Ok(())
    }

    /// Tunnel specs for every rule and every unexpired record, in file order
    pub fn specs(&self) -> TunnelResult<Vec<TunnelSpec>> {
        let mut specs = Vec::new();

        if let Some(remote) = &self.remote {
            let endpoint =
                SshEndpoint::new(remote.host.as_str(), remote.port, remote.user.as_str());
            for rule in &self.forwarding_list {
                let rule = ForwardRule::parse(rule)?;
                specs.push(TunnelSpec::from_rule(
                    None,
                    endpoint.clone(),
                    KeyMaterial::File(remote.key.clone()),
                    &rule,
                ));
            }
        }

        let now = Utc::now();
        for entry in &self.records {
            if entry.record.is_expired(now) {
                warn!(
                    id = %entry.record.tunnel_id,
                    "Skipping tunnel that expired at {}",
                    entry.record.expires_at
                );
                continue;
            }
            specs.push(
                entry
                    .record
                    .clone()
                    .into_spec(KeyMaterial::File(entry.key.clone()), entry.local_port),
            );
        }

        Ok(specs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            delay: Duration::from_secs(self.retry.delay_secs),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.timeout
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}
