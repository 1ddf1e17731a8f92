use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("trainer initialization failed: {0}")]
    Initialization(String),
    #[error("training failed: {0}")]
    Runtime(String),
    #[error("invalid checkpoint: {0}")]
    Checkpoint(String),
    #[error("collective operation failed: {0}")]
    Collective(String),
    #[error("label mapping violated: {0}")]
    LabelMapping(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }

    pub fn collective(message: impl Into<String>) -> Self {
        Self::Collective(message.into())
    }

    pub fn label_mapping(message: impl Into<String>) -> Self {
        Self::LabelMapping(message.into())
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

pub(crate) fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
