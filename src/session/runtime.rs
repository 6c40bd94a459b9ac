// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Model runtime seam.
//!
//! The session never loads weights itself. It asks a [`ModelRuntime`] to
//! activate a model directory, reset its context, or let go of it.

use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};
use crate::model::descriptor::{ModelDescriptor, MODEL_CONFIG_FILENAME};
use crate::sync::{read_lock, write_lock};

pub trait ModelRuntime: Send + Sync {
    fn activate(&self, descriptor: &ModelDescriptor, path: &Path) -> Result<()>;

    fn reset(&self) -> Result<()>;

    fn unload(&self) -> Result<()>;
}

/// Runtime for API-backed chat: a model counts as active once its
/// directory holds a descriptor.
#[derive(Debug, Default)]
pub struct DirectoryRuntime {
    active: std::sync::RwLock<Option<(String, PathBuf)>>,
}

impl DirectoryRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifier of the active model, if any.
    pub fn active_model(&self) -> Option<String> {
        read_lock(&self.active).as_ref().map(|(id, _)| id.clone())
    }
}

impl ModelRuntime for DirectoryRuntime {
    fn activate(&self, descriptor: &ModelDescriptor, path: &Path) -> Result<()> {
        if !path.join(MODEL_CONFIG_FILENAME).is_file() {
            return Err(CoreError::Activation {
                model: descriptor.model_id.clone(),
                message: format!("{} not found in {:?}", MODEL_CONFIG_FILENAME, path),
            });
        }
        *write_lock(&self.active) = Some((descriptor.model_id.clone(), path.to_path_buf()));
        tracing::info!("MODEL_ACTIVATED | model={} lib={}", descriptor.model_id, descriptor.model_lib);
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        Ok(())
    }

    fn unload(&self) -> Result<()> {
        if let Some((id, _)) = write_lock(&self.active).take() {
            tracing::info!("MODEL_UNLOADED | model={}", id);
        }
        Ok(())
    }
}
