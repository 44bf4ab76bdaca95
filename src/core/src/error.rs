use thiserror::Error;

/// Keel error types
#[derive(Error, Debug)]
pub enum KeelError {
    /// Malformed or unreadable configuration (settings, permission rules)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tool call blocked by permission policy
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Requested isolation level cannot be provided on this host
    #[error("Sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    /// Model provider failure (auth, network, bad response)
    #[error("Provider error: {provider} - {message}")]
    Provider {
        provider: String,
        status_code: Option<u16>,
        message: String,
    },

    /// Checkpoint backend is locked or in an inconsistent state
    #[error("Checkpoint conflict: {message}")]
    CheckpointConflict {
        message: String,
        remediation: String,
    },

    /// Checkpoint id does not exist in the backend
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// Persisted session data could not be recovered
    #[error("Session corruption: {message}")]
    SessionCorruption {
        message: String,
        backup: Option<std::path::PathBuf>,
    },

    /// No session with the given id (or prefix)
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Tool arguments failed validation
    #[error("Invalid tool call: {0}")]
    ToolValidation(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl KeelError {
    /// Shorthand for a provider error without an HTTP status.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        KeelError::Provider {
            provider: provider.into(),
            status_code: None,
            message: message.into(),
        }
    }

    /// Suggested next step for the user, if there is one.
    pub fn hint(&self) -> Option<String> {
        match self {
            KeelError::CheckpointConflict { remediation, .. } => Some(remediation.clone()),
            KeelError::SessionCorruption {
                backup: Some(path), ..
            } => Some(format!(
                "The damaged file was preserved at {}",
                path.display()
            )),
            KeelError::Provider {
                status_code: Some(401) | Some(403),
                ..
            } => Some("Check the API key exported for this provider".to_string()),
            KeelError::SandboxUnavailable(_) => {
                Some("Install and start a container runtime, or use --sandbox basic".to_string())
            }
            _ => None,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

impl From<serde_json::Error> for KeelError {
    fn from(err: serde_json::Error) -> Self {
        KeelError::Serialization(err.to_string())
    }
}

/// Result type alias for keel operations
pub type Result<T> = std::result::Result<T, KeelError>;
