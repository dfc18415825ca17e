//! Completion client for Disclaude.
//!
//! Pure HTTP client speaking the Anthropic Messages wire format. A second,
//! API-compatible provider (GLM) is reached by swapping the base URL, key and
//! model; the request shape never changes.

mod anthropic;
mod client;
mod error;
mod types;

pub use client::{LlmClient, LlmConfig, Provider};
pub use error::{LlmError, LlmErrorKind, Result};
pub use types::{ChatMessage, ChatResponse, Role, Usage};
