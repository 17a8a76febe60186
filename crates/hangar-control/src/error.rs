//! Error types for hangar-control.

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur in the deployment pipeline and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The deployment request was rejected before the pipeline started.
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// No free resource identifier exists in the configured range.
    #[error("no free resource identifier in range {start}-{end}")]
    AllocationExhausted {
        /// First identifier of the range.
        start: u32,
        /// Last identifier of the range (inclusive).
        end: u32,
    },

    /// The platform inventory API could not be queried.
    #[error("platform inventory error: {0}")]
    Inventory(String),

    /// The infrastructure descriptor could not be rendered.
    #[error("template error: {0}")]
    Template(String),

    /// The infrastructure tool reported a failure.
    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),

    /// The remote machine never accepted a connection.
    #[error("remote host {address} unreachable after {waited_secs}s: {last_error}")]
    RemoteUnreachable {
        /// Address that was being dialled.
        address: String,
        /// How long connection attempts were made for.
        waited_secs: u64,
        /// Error from the final attempt.
        last_error: String,
    },

    /// A remote setup step exited unsuccessfully.
    #[error("remote step '{step}' failed with exit code {exit_code}: {stderr}")]
    RemoteCommandFailed {
        /// Name of the failed step.
        step: String,
        /// Exit code reported by the remote shell.
        exit_code: i32,
        /// Captured standard error (truncated).
        stderr: String,
    },

    /// Infrastructure teardown failed.
    #[error("destroy failed: {0}")]
    DestroyFailed(String),

    /// Deployment not found.
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    /// A non-deleted deployment already uses this name.
    #[error("deployment name already in use: {0}")]
    DuplicateName(String),

    /// Invalid state transition attempted.
    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: &'static str,
        /// Attempted target state.
        to: &'static str,
    },

    /// The persisted status changed underneath a check-and-set update.
    #[error("deployment {id} is {actual}, expected {expected}")]
    StaleState {
        /// Deployment identifier.
        id: String,
        /// Status the caller expected.
        expected: &'static str,
        /// Status actually persisted.
        actual: &'static str,
    },

    /// A wait was cancelled before completing.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a provisioning error.
    #[must_use]
    pub fn provisioning(msg: impl Into<String>) -> Self {
        Self::ProvisioningFailed(msg.into())
    }

    /// Create an inventory error.
    #[must_use]
    pub fn inventory(msg: impl Into<String>) -> Self {
        Self::Inventory(msg.into())
    }

    /// Create a template error.
    #[must_use]
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Short stable label for the failure category.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::AllocationExhausted { .. } => "allocation_exhausted",
            Self::Inventory(_) => "inventory",
            Self::Template(_) => "template",
            Self::ProvisioningFailed(_) => "provisioning_failed",
            Self::RemoteUnreachable { .. } => "remote_unreachable",
            Self::RemoteCommandFailed { .. } => "remote_command_failed",
            Self::DestroyFailed(_) => "destroy_failed",
            Self::DeploymentNotFound(_) => "not_found",
            Self::DuplicateName(_) => "duplicate_name",
            Self::InvalidStateTransition { .. } => "invalid_transition",
            Self::StaleState { .. } => "stale_state",
            Self::Cancelled(_) => "cancelled",
            Self::Database(_) => "database",
            Self::Http(_) => "http",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Serialisation(_) => "serialisation",
            Self::Internal(_) => "internal",
        }
    }

    /// Message written into a failed deployment record.
    #[must_use]
    pub fn failure_message(&self) -> String {
        format!("[{}] {self}", self.kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_joins_all_problems() {
        let err = ControlError::Validation(vec!["bad name".to_owned(), "bad url".to_owned()]);
        assert_eq!(err.to_string(), "validation failed: bad name; bad url");
    }

    #[test]
    fn failure_message_carries_kind() {
        let err = ControlError::AllocationExhausted { start: 100, end: 999 };
        assert_eq!(
            err.failure_message(),
            "[allocation_exhausted] no free resource identifier in range 100-999"
        );
    }
}
