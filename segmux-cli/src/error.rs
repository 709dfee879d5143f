use axum::http::HeaderMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Engine(#[from] segmux_engine::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Server error: {0}")]
    Server(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Parse `Name: value` header arguments.
pub fn parse_header_args(raw: &[String]) -> Result<HeaderMap> {
    let mut pairs = Vec::with_capacity(raw.len());
    for header in raw {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| AppError::InvalidInput(format!("header `{header}` is not `Name: value`")))?;
        pairs.push((name, value));
    }
    Ok(segmux_engine::header_map(pairs)?)
}
