use std::{path::PathBuf, process::Stdio};

use tokio::process::Command;

use crate::{
    error::{TunnelError, TunnelResult},
    forwarding::{ForwardRule, KeyMaterial, SshEndpoint, TunnelSpec},
};

/// Default external client binary
pub const DEFAULT_SSH_BINARY: &str = "ssh";

/// Command line for an external `ssh -L` tunnel process
#[derive(Debug, Clone)]
pub struct SshCommand {
    program: String,
    key_path: PathBuf,
    endpoint: SshEndpoint,
    rule: ForwardRule,
}

impl SshCommand {
    /// Build the command for `spec`; the external client needs a key file on disk
    pub fn for_spec(program: impl Into<String>, spec: &TunnelSpec) -> TunnelResult<Self> {
        let key_path = match &spec.key {
            KeyMaterial::File(path) => path.clone(),
            KeyMaterial::Inline(_) => {
                return Err(TunnelError::InvalidSpec(format!(
                    "{}: an external ssh process needs a private key file",
                    spec.id
                )));
            }
        };
        if !key_path.exists() {
            return Err(TunnelError::InvalidSpec(format!(
                "{}: private key file does not exist: {}",
                spec.id,
                key_path.display()
            )));
        }

        Ok(Self {
            program: program.into(),
            key_path,
            endpoint: spec.endpoint.clone(),
            rule: spec.forward_rule(),
        })
    }

    fn args(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            "ServerAliveInterval=30".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-L".to_string(),
            self.rule.to_ssh_arg(),
            "-N".to_string(),
            "-i".to_string(),
            self.key_path.display().to_string(),
            "-p".to_string(),
            self.endpoint.port.to_string(),
            format!("{}@{}", self.endpoint.user, self.endpoint.host),
        ]
    }

    /// Process ready to spawn; stderr is passed through so ssh errors stay visible
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        cmd
    }

    /// Equivalent shell command, for logging and for running by hand
    pub fn command_string(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args());
        parts.join(" ")
    }
}
