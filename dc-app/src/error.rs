use thiserror::Error;

/// Failure to read or write durable relay state. Never fatal: callers log it and
/// keep serving from memory.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

impl From<std::io::Error> for PersistError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encode(e.to_string())
    }
}

/// Every configuration problem found at startup, reported together.
#[derive(Debug, Error)]
#[error("Configuration error:\n{}", render_problems(.problems))]
pub struct ConfigError {
    pub problems: Vec<String>,
}

impl ConfigError {
    pub fn single(problem: impl Into<String>) -> Self {
        Self {
            problems: vec![problem.into()],
        }
    }
}

fn render_problems(problems: &[String]) -> String {
    problems
        .iter()
        .map(|p| format!("  - {p}"))
        .collect::<Vec<_>>()
        .join("\n")
}
