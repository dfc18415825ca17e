use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("provider rejected request: status={status} message={message}")]
    Status { status: u16, message: String },

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),
}

/// Coarse failure class, so callers can branch without matching on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    InvalidInput,
    Transport,
    Auth,
    RateLimited,
    Provider,
    ResponseFormat,
}

impl LlmErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::Transport => "transport",
            Self::Auth => "auth",
            Self::RateLimited => "rate_limited",
            Self::Provider => "provider",
            Self::ResponseFormat => "response_format",
        }
    }
}

impl LlmError {
    pub fn kind(&self) -> LlmErrorKind {
        match self {
            Self::InvalidInput(_) => LlmErrorKind::InvalidInput,
            Self::Http(_) => LlmErrorKind::Transport,
            Self::Status { status, .. } => match status {
                401 | 403 => LlmErrorKind::Auth,
                429 => LlmErrorKind::RateLimited,
                _ => LlmErrorKind::Provider,
            },
            Self::ResponseFormat(_) => LlmErrorKind::ResponseFormat,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}
