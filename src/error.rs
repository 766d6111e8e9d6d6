#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SimError {
    #[error("{0}")]
    Validation(String),
    #[error("message not found: {id}")]
    NotFound { id: String },
    #[error("conversation not found: {phone}")]
    ConversationNotFound { phone: String },
    #[error("webhook transport failed: {0}")]
    Transport(String),
    #[error("{0}")]
    Configuration(String),
}

impl SimError {
    pub fn not_found(id: impl Into<String>) -> Self {
        SimError::NotFound { id: id.into() }
    }

    /// Machine-readable error kind used in API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            SimError::Validation(_) => "validation_error",
            SimError::NotFound { .. } | SimError::ConversationNotFound { .. } => "not_found",
            SimError::Transport(_) => "transport_error",
            SimError::Configuration(_) => "configuration_error",
        }
    }
}
