// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Models: what they are, how their files get onto disk, and which ones
//! this host knows about.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use modelhost::{AppConfig, HttpSource, ModelRecord, NoSession, Registry};
//!
//! # async fn example() -> modelhost::Result<()> {
//! let home = AppConfig::resolve_home(None);
//! let config = AppConfig::load(&home).unwrap_or_default();
//! let registry = Registry::new(&home, config, Arc::new(HttpSource::new()?), Arc::new(NoSession));
//!
//! let model = registry
//!     .add_model(ModelRecord {
//!         model_url: "https://huggingface.co/mlc-ai/Qwen2.5-0.5B-Instruct-q4f16_1-MLC".into(),
//!         model_id: "qwen-0.5b".into(),
//!         estimated_vram_bytes: None,
//!         model_lib: "qwen2_q4f16_1".into(),
//!     })
//!     .await?;
//! model.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod acquisition;
pub mod descriptor;
pub mod registry;

pub use acquisition::{
    AcquisitionSnapshot, AcquisitionState, ModelAcquisition, NoSession, SessionGate,
};
pub use descriptor::{FileManifest, ModelDescriptor};
pub use registry::{BackendWhitelist, Registry};
