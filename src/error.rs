//! Error types for the stub server and client.

use crate::journal::CountMatcher;
use thiserror::Error;

/// Errors surfaced by the stub server and its client.
#[derive(Debug, Error)]
pub enum StubError {
    /// An inbound request matched no registered mapping.
    #[error("no stub mapping matched {method} {url}")]
    NoStubMatch { method: String, url: String },

    /// The journal did not hold the expected number of matching requests.
    #[error(
        "expected {expected} request(s) matching {pattern} but found {actual}\nrecorded requests:\n{}",
        .recorded.join("\n")
    )]
    Verification {
        expected: CountMatcher,
        actual: usize,
        pattern: String,
        recorded: Vec<String>,
    },

    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A stub registration was contradictory or could not be parsed.
    #[error("malformed stub: {0}")]
    MalformedStub(String),

    /// An operation needed a running listener.
    #[error("stub server is not running")]
    NotRunning,

    /// A client request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StubError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        StubError::MalformedStub(message.into())
    }
}
