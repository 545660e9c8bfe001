use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request input: {0}")]
    InvalidInput(String),

    #[error("Run failed: every stage failed")]
    TotalFailure,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Input file parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
