use thiserror::Error;

#[derive(Debug, Error)]
pub enum PilotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Screenshot error: {0}")]
    Screenshot(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("SSE parsing error: {0}")]
    SseParsing(String),

    #[error("Action parse error: {0}")]
    Parse(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Environment error: {0}")]
    Environment(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Run cancelled")]
    Cancelled,
}

impl PilotError {
    /// Cancellation is never retried and never reported as a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PilotError::Cancelled)
    }
}

impl serde::Serialize for PilotError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::ser::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type PilotResult<T> = Result<T, PilotError>;

/// Machine-readable code carried by the structured run error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ScreenshotFailure,
    ModelFailure,
    EnvironmentError,
    ExecutionError,
    Unknown,
}

impl From<&PilotError> for ErrorCode {
    fn from(err: &PilotError) -> Self {
        match err {
            PilotError::Screenshot(_) | PilotError::Image(_) | PilotError::Base64(_) => {
                ErrorCode::ScreenshotFailure
            }
            PilotError::Model(_)
            | PilotError::SseParsing(_)
            | PilotError::Parse(_)
            | PilotError::Http(_) => ErrorCode::ModelFailure,
            PilotError::Environment(_) => ErrorCode::EnvironmentError,
            PilotError::Execution(_) => ErrorCode::ExecutionError,
            _ => ErrorCode::Unknown,
        }
    }
}

/// Structured error emitted to the caller when a run ends in `Error`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RunError {
    pub code: ErrorCode,
    pub message: String,
    /// Debug rendering of the underlying error, for diagnostics.
    pub detail: Option<String>,
}

impl RunError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }
}

impl From<&PilotError> for RunError {
    fn from(err: &PilotError) -> Self {
        Self {
            code: ErrorCode::from(err),
            message: err.to_string(),
            detail: Some(format!("{err:?}")),
        }
    }
}
