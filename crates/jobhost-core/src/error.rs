use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobhostError {
    /// The config file or environment could not be read.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The config was read but holds unusable values.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, JobhostError>;
