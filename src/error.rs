use thiserror::Error;

/// Failure of a mailbox, token, or collaborator HTTP call, as seen by callers.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// Stored credentials are unusable; the user must reconnect interactively.
    /// `notified` is set once the auth-error signal has been emitted for it.
    #[error("authentication required: {message}")]
    Auth { message: String, notified: bool },

    /// Transient or server-side failure, including connectivity loss.
    #[error("network error (status {status:?}): {body}")]
    Network { status: Option<u16>, body: String },

    /// The provider rejected the request itself.
    #[error("request rejected with status {status}: {body}")]
    Request { status: u16, body: String },

    #[error("{0}")]
    Other(String),
}

impl ApiError {
    pub fn auth(message: impl Into<String>) -> Self {
        ApiError::Auth {
            message: message.into(),
            notified: false,
        }
    }

    pub fn offline() -> Self {
        ApiError::Network {
            status: None,
            body: "offline".to_string(),
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Auth { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Network { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Network { status, .. } => *status,
            ApiError::Request { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Failure at the transport seam, before any HTTP status is known.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl From<TransportError> for ApiError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Invalid(msg) => ApiError::Other(msg),
            other => ApiError::Network {
                status: None,
                body: other.to_string(),
            },
        }
    }
}

/// Failure of a persistence collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("keyring error: {0}")]
    Keyring(String),
    /// Malformed local state, e.g. an activity that should carry a draft id but does not.
    #[error("invalid record: {0}")]
    Invalid(String),
}

impl From<keyring::Error> for StoreError {
    fn from(err: keyring::Error) -> Self {
        StoreError::Keyring(err.to_string())
    }
}

/// Failure of one pipeline stage or of the whole batch.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn is_auth(&self) -> bool {
        matches!(self, PipelineError::Api(e) if e.is_auth())
    }
}
