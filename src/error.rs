// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy for modelhost.
//!
//! Library code returns [`CoreError`]. The binary renders errors for humans
//! through [`CoreError::user_message`], which uses [`ErrorBuilder`] to attach
//! possible causes and suggested fixes.

use std::path::PathBuf;
use thiserror::Error;

use crate::model::AcquisitionState;
use crate::session::SessionState;

/// Failure while fetching a descriptor, manifest or data file.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("HTTP {status} fetching {url}")]
    Status { url: String, status: u16 },

    #[error("no such asset: {0}")]
    NotFound(String),

    #[error("malformed {what}: {message}")]
    Malformed { what: String, message: String },
}

impl FetchError {
    pub fn malformed(what: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Malformed {
            what: what.into(),
            message: message.to_string(),
        }
    }
}

/// Failure reported by the completion service.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ServiceError {
    pub message: String,
}

impl ServiceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Main error type for the library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("model id {0} is already registered")]
    DuplicateIdentifier(String),

    #[error("model id {0:?} is not a valid directory name")]
    InvalidIdentifier(String),

    #[error("model lib {0} is not supported")]
    UnsupportedBackend(String),

    #[error("a transfer to {0:?} is already in flight")]
    AlreadyInFlight(PathBuf),

    #[error("download pool is saturated ({0} transfers in flight)")]
    PoolSaturated(usize),

    #[error("transfer aborted: {0}")]
    TransferAborted(String),

    #[error("session is {0} and cannot be interrupted")]
    NotInterruptible(SessionState),

    #[error("session is {0} and cannot accept a prompt")]
    NotChatable(SessionState),

    #[error("completion failed: {0}")]
    Service(#[from] ServiceError),

    #[error("cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: AcquisitionState,
    },

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("failed to activate {model}: {message}")]
    Activation { model: String, message: String },

    #[error("IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to persist catalog: {0}")]
    Persist(String),

    #[error("{0} has shut down")]
    Closed(&'static str),
}

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Precondition violations: the caller should have checked state first.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::NotInterruptible(_) | Self::NotChatable(_) | Self::InvalidTransition { .. }
        )
    }

    /// Render the error for a terminal user, with causes and fixes.
    pub fn user_message(&self) -> String {
        let builder = ErrorBuilder::new(self.to_string());
        let builder = match self {
            Self::Fetch(FetchError::Network { .. }) => builder
                .cause("No network connection")
                .cause("Model host unreachable or blocking requests")
                .fix("Check connectivity and retry: modelhost pull <id>"),
            Self::Fetch(FetchError::Status { status, .. }) if *status == 404 => builder
                .cause("Model URL does not point at a model repository")
                .fix("Verify the URL ends at the repository root"),
            Self::Fetch(FetchError::Malformed { .. }) => builder
                .cause("Descriptor or manifest is not valid JSON")
                .fix("Re-add the model from a known-good source"),
            Self::DuplicateIdentifier(_) => builder
                .cause("A model with this id is already in the catalog")
                .fix("Choose another local id with --id"),
            Self::UnsupportedBackend(_) => builder
                .cause("The model library is not in the model_libs whitelist")
                .fix("Add the library to model_libs in app-config.json"),
            Self::NotInterruptible(_) | Self::NotChatable(_) => builder
                .cause("Another session operation is still running")
                .fix("Wait for it to finish and try again"),
            Self::Service(_) => builder
                .cause("Completion endpoint unavailable or rejected the request")
                .fix("Check completion.base_url and the API key environment variable")
                .fix("Use /reset to recover the session"),
            _ => builder,
        };
        builder.build()
    }
}

/// Builder for constructing formatted error messages.
///
/// ```
/// use modelhost::error::ErrorBuilder;
///
/// let text = ErrorBuilder::new("Failed to fetch descriptor")
///     .cause("Host unreachable")
///     .fix("Retry later")
///     .build();
/// assert!(text.starts_with("[✗] Failed to fetch descriptor"));
/// ```
#[derive(Debug, Clone)]
pub struct ErrorBuilder {
    title: String,
    causes: Vec<String>,
    fixes: Vec<String>,
}

impl ErrorBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            causes: Vec::new(),
            fixes: Vec::new(),
        }
    }

    /// Add a possible cause.
    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    /// Add a suggested fix.
    pub fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fixes.push(fix.into());
        self
    }

    pub fn build(&self) -> String {
        let mut output = format!("[✗] {}\n", self.title);

        if !self.causes.is_empty() {
            output.push_str("\nPossible causes:\n");
            for cause in &self.causes {
                output.push_str(&format!("  - {}\n", cause));
            }
        }

        if !self.fixes.is_empty() {
            output.push_str("\nTry these fixes:\n");
            for (i, fix) in self.fixes.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, fix));
            }
        }

        output
    }
}

impl std::fmt::Display for ErrorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.build())
    }
}
