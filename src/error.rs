use thiserror::Error;

#[derive(Error, Debug)]
pub enum IsomapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    #[error("Evaluation cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal node requires exactly 9 children, got {0}")]
    ChildCount(usize),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type StatusOr<T> = Result<T, IsomapError>;
