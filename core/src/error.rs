// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error taxonomy shared across the replication engine.
//!
//! Every component returns an [`Error`] carrying a stable [`ErrorKind`].
//! Retry and resilience decisions consult the kind, never the message text.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type used throughout the core
pub type Result<T> = std::result::Result<T, Error>;

/// Stable error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Arguments violate a stated precondition
    InvalidInput,
    /// Named entity does not exist
    NotFound,
    /// Creating a duplicate
    AlreadyExists,
    /// Network failure, rate limit, or 5xx from a registry
    Transient,
    /// The resilience layer refused the call
    CircuitOpen,
    /// Context was cancelled
    Cancelled,
    /// Deadline elapsed before completion
    DeadlineExceeded,
    /// Coordinator write attempted on a follower
    NotLeader,
    /// Invariant violation or decode failure
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidInput => "invalid_input",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::Transient => "transient",
            Self::CircuitOpen => "circuit_open",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::NotLeader => "not_leader",
            Self::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// Core error: a classification plus the topmost message and optional cause
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Create an error with an explicit kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach a lower-level cause, preserving this error's classification
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// The stable classification tag
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The topmost message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the retry policy may re-attempt the operation
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircuitOpen, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DeadlineExceeded, message)
    }

    pub fn not_leader(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotLeader, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::TimedOut => ErrorKind::DeadlineExceeded,
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => ErrorKind::Transient,
            _ => ErrorKind::Internal,
        };
        Self::new(kind, err.to_string()).with_source(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Internal, format!("json: {err}")).with_source(err)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::new(ErrorKind::InvalidInput, format!("yaml: {err}")).with_source(err)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::DeadlineExceeded
        } else if let Some(status) = err.status() {
            if status.as_u16() == 404 {
                ErrorKind::NotFound
            } else if status.as_u16() == 429 || status.is_server_error() {
                ErrorKind::Transient
            } else {
                ErrorKind::InvalidInput
            }
        } else {
            // Connect/body errors with no status are network-level
            ErrorKind::Transient
        };
        Self::new(kind, err.to_string()).with_source(err)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Self::new(ErrorKind::DeadlineExceeded, "operation timed out").with_source(err)
    }
}
