use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferError {
    #[error("Prompt missing")]
    MissingPrompt,

    #[error("conversationId required")]
    MissingConversationId,

    #[error("invalid request body: {0}")]
    InvalidRequest(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("generation cancelled by caller")]
    CancelledByCaller,

    #[error("generation error: {0}")]
    Generation(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an [`InferError`], used for logging and for
/// choosing the HTTP status of a rejected request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MissingPrompt,
    MissingConversationId,
    InvalidRequest,
    ModelUnavailable,
    ResourceExhausted,
    CancelledByCaller,
    Internal,
}

impl InferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InferError::MissingPrompt => ErrorKind::MissingPrompt,
            InferError::MissingConversationId => ErrorKind::MissingConversationId,
            InferError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            InferError::ModelUnavailable(_) => ErrorKind::ModelUnavailable,
            InferError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            InferError::CancelledByCaller => ErrorKind::CancelledByCaller,
            _ => ErrorKind::Internal,
        }
    }

    /// Client input errors are surfaced immediately and never retried.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::MissingPrompt
                | ErrorKind::MissingConversationId
                | ErrorKind::InvalidRequest
        )
    }
}

pub type Result<T> = std::result::Result<T, InferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_variants() {
        assert_eq!(InferError::MissingPrompt.kind(), ErrorKind::MissingPrompt);
        assert_eq!(
            InferError::ModelUnavailable("down".into()).kind(),
            ErrorKind::ModelUnavailable
        );
        assert_eq!(
            InferError::Generation("boom".into()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn client_errors() {
        assert!(InferError::MissingPrompt.is_client_error());
        assert!(InferError::MissingConversationId.is_client_error());
        assert!(InferError::InvalidRequest("bad".into()).is_client_error());
        assert!(!InferError::ResourceExhausted("oom".into()).is_client_error());
        assert!(!InferError::CancelledByCaller.is_client_error());
    }

    #[test]
    fn display_matches_api_details() {
        assert_eq!(InferError::MissingPrompt.to_string(), "Prompt missing");
        assert_eq!(
            InferError::MissingConversationId.to_string(),
            "conversationId required"
        );
    }
}
