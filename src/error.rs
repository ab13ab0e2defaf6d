use thiserror::Error;

/// Result type alias for tunnel operations
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Error types for the sshtun library
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Missing or illegal tunnel fields, rejected before any resource is touched
    #[error("Invalid tunnel spec: {0}")]
    InvalidSpec(String),

    /// A live tunnel already holds this identifier
    #[error("Tunnel with ID {0} already exists")]
    Conflict(String),

    /// No live tunnel holds this identifier
    #[error("tunnel not found: {0}")]
    NotFound(String),

    /// The secure transport could not be dialed or authenticated
    #[error("failed to dial ssh {endpoint}: {reason}")]
    DialFailure { endpoint: String, reason: String },

    /// The local listener could not be bound
    #[error("failed to start local listener on port {port}: {source}")]
    BindFailure {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// A single forwarded connection failed; never escalated past its forwarder
    #[error("failed to forward to {target}: {reason}")]
    ForwardFailure { target: String, reason: String },

    /// A running session died on its own
    #[error("tunnel {id} failed: {reason}")]
    SessionFailure { id: String, reason: String },

    /// A multi-tunnel start was aborted and every started tunnel rolled back
    #[error("failed to start {failed} of {total} tunnels: {}", .errors.join("; "))]
    PartialStartFailure {
        failed: usize,
        total: usize,
        errors: Vec<String>,
    },

    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// SSH protocol errors
    #[error("SSH error: {0}")]
    Ssh(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors
    #[error("Operation timed out")]
    Timeout,

    /// Generic errors
    #[error("Error: {0}")]
    Other(String),
}

impl From<russh::Error> for TunnelError {
    fn from(err: russh::Error) -> Self {
        TunnelError::Ssh(err.to_string())
    }
}

impl From<eyre::Error> for TunnelError {
    fn from(err: eyre::Error) -> Self {
        TunnelError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_start_message_lists_every_failure() {
        let err = TunnelError::PartialStartFailure {
            failed: 2,
            total: 3,
            errors: vec!["a: bind".to_string(), "b: dial".to_string()],
        };

        assert_eq!(
            err.to_string(),
            "failed to start 2 of 3 tunnels: a: bind; b: dial"
        );
    }

    #[test]
    fn test_conflict_message_names_id() {
        let err = TunnelError::Conflict("t1".to_string());
        assert_eq!(err.to_string(), "Tunnel with ID t1 already exists");
    }
}
