// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transfer layer for model assets.
//!
//! This module knows nothing about models or state machines. It provides:
//! - [`AssetIndex`] to work out which manifest files are still missing
//! - [`DownloadPool`] to run a bounded number of transfers
//! - [`AssetSource`] implementations to fetch bytes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  submit   ┌─────────────────┐
//! │ owning actor    │──────────▶│ DownloadPool    │
//! │ (acquisition)   │◀──────────│ transfer tasks  │
//! └─────────────────┘  outcome  └────────┬────────┘
//!                                        │
//!                                        ▼
//!                               ┌─────────────────┐
//!                               │ AssetSource     │
//!                               │ (http / memory) │
//!                               └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use modelhost::download::{DownloadPool, HttpSource, TaskDescriptor};
//!
//! # async fn example() -> modelhost::Result<()> {
//! let mut pool = DownloadPool::new(Arc::new(HttpSource::new()?), 3);
//! pool.submit(TaskDescriptor::new(
//!     "https://huggingface.co/org/model/resolve/main/params_shard_0.bin",
//!     "/tmp/model/params_shard_0.bin",
//! ))?;
//! for outcome in pool.drain().await {
//!     println!("{} -> {:?}", outcome.task.dest.display(), outcome.result.is_ok());
//! }
//! # Ok(())
//! # }
//! ```

pub mod index;
pub mod pool;
pub mod source;
pub mod types;

pub use index::{AssetIndex, IndexReport};
pub use pool::{is_temp_file, DownloadPool};
pub use source::{AssetSource, HttpSource, MemorySource};
pub use types::{TaskDescriptor, TransferOutcome};

/// Concurrent transfers per model unless a test overrides it.
pub const DEFAULT_MAX_CONCURRENCY: usize = 3;
