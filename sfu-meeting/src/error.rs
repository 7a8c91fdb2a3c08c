use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad request, unknown id or a precondition that does not hold
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0} closed")]
    Closed(String),

    #[error("Limit reached: {0}")]
    LimitReached(String),

    #[error(transparent)]
    Engine(#[from] sfu_engine::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether the request was rejected before reaching the worker, either
    /// here or inside the engine
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::Engine(sfu_engine::Error::Validation(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
