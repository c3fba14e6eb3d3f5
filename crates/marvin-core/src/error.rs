use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarvinError {
    #[error("Configuration error: {0}")]
    Config(String),
}

impl MarvinError {
    /// Short error code string for user-facing surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            MarvinError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, MarvinError>;
