use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrialError {
    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Malformed record for user '{user_id}': {reason}")]
    MalformedRecord { user_id: String, reason: String },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No identity is attached")]
    NotAttached,

    #[error("I/O error: {0}")]
    Io(String),
}

impl TrialError {
    pub fn malformed(user_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            user_id: user_id.into(),
            reason: reason.into(),
        }
    }

    /// Errors the runtime recovers from without surfacing anything to consumers.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Subscription(_) | Self::Persistence(_) | Self::StorageUnavailable(_) | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TrialError>;

impl From<serde_json::Error> for TrialError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for TrialError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
