// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! modelhost - local model asset manager library
//!
//! Downloads model descriptors and weight shards into a per-model directory,
//! resumes after interruption, and drives a single chat session bound to one
//! of those models.
//!
//! # Core Modules
//!
//! - [`download`] - Asset index, transfer pool and asset sources
//! - [`model`] - Model descriptors, the acquisition state machine and the registry
//! - [`session`] - The interruptible chat session and its collaborators
//! - [`config`] - Persisted application catalog
//! - [`error`] - Error taxonomy and user-facing formatting

pub mod config;
pub mod download;
pub mod error;
pub mod model;
pub mod session;
pub mod sync;
pub mod types;

pub use types::{Message, Role};

pub use error::{CoreError, ErrorBuilder, FetchError, Result, ServiceError};

pub use config::{AppConfig, CompletionConfig, ModelRecord};

pub use download::{
    AssetIndex, AssetSource, DownloadPool, HttpSource, IndexReport, MemorySource,
    TaskDescriptor, TransferOutcome, DEFAULT_MAX_CONCURRENCY,
};

pub use model::{
    AcquisitionSnapshot, AcquisitionState, BackendWhitelist, FileManifest, ModelAcquisition,
    ModelDescriptor, NoSession, Registry, SessionGate,
};

pub use session::{
    Binding, ChatCompletionsClient, CompletionService, DirectoryRuntime, FileTranscriptStore,
    MemoryTranscriptStore, ModelRuntime, SessionCoordinator, SessionDeps, SessionState,
    TranscriptStore,
};
