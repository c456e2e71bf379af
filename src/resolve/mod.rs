//! Client side of the metadata resolution service plus icon fetching.

mod client;
pub mod icon;
pub mod wire;

pub use client::{
    http_client, Endpoint, RequestTag, ResolutionClient, ResolveEvent, ResolveItem,
    DEFAULT_ENDPOINT, DEFAULT_RESOLVE_PATH,
};
pub use icon::{IconEvent, IconFetcher};

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("service answered with HTTP {0}")]
    Status(u16),
    #[error("could not decode response: {0}")]
    Decode(String),
    #[error("request was cancelled")]
    Cancelled,
}

impl ResolveError {
    /// HTTP status when the service answered, zero otherwise.
    pub fn status_code(&self) -> u16 {
        match self {
            ResolveError::Status(status) => *status,
            _ => 0,
        }
    }
}

impl From<reqwest::Error> for ResolveError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => ResolveError::Status(status.as_u16()),
            None if err.is_decode() => ResolveError::Decode(err.to_string()),
            None => ResolveError::Transport(err.to_string()),
        }
    }
}
