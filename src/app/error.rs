use thiserror::Error;

#[derive(Error, Debug)]
pub enum EstuaryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Feed parsing error: {0}")]
    FeedParse(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Feed not found: {0}")]
    FeedNotFound(String),

    #[error("Invalid feed: {0}")]
    InvalidFeed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("{0}")]
    Other(String),
}

impl EstuaryError {
    /// Whether a caller at the HTTP boundary should answer with a 400.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, EstuaryError::InvalidInput(_))
    }
}

pub type Result<T> = std::result::Result<T, EstuaryError>;
