// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Registry of known models.
//!
//! Maps a model identifier to its [`ModelAcquisition`], keeps identifiers
//! unique, and mirrors every change into `app-config.json`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;

use crate::config::{AppConfig, ModelRecord};
use crate::download::AssetSource;
use crate::error::{CoreError, Result};
use crate::sync::{read_lock, write_lock};

use super::acquisition::{ModelAcquisition, SessionGate};
use super::descriptor::{resolve_url, validate_identifier, ModelDescriptor, MODEL_CONFIG_FILENAME};

/// Decides which backend libraries this host can run.
pub trait BackendWhitelist: Send + Sync {
    fn is_supported_backend(&self, model_lib: &str) -> bool;
}

impl BackendWhitelist for AppConfig {
    fn is_supported_backend(&self, model_lib: &str) -> bool {
        self.model_libs.iter().any(|lib| lib == model_lib)
    }
}

pub struct Registry {
    home: PathBuf,
    source: Arc<dyn AssetSource>,
    gate: Arc<dyn SessionGate>,
    whitelist: Arc<dyn BackendWhitelist>,
    max_concurrency: usize,
    config: RwLock<AppConfig>,
    models: RwLock<IndexMap<String, Arc<ModelAcquisition>>>,
    /// Identifiers whose registration is in progress
    reserved: RwLock<HashSet<String>>,
}

impl Registry {
    /// Create an empty registry. The whitelist defaults to
    /// `config.model_libs`.
    pub fn new(
        home: impl Into<PathBuf>,
        config: AppConfig,
        source: Arc<dyn AssetSource>,
        gate: Arc<dyn SessionGate>,
    ) -> Self {
        Self {
            home: home.into(),
            source,
            gate,
            whitelist: Arc::new(config.clone()),
            max_concurrency: config.max_concurrent_downloads,
            config: RwLock::new(config),
            models: RwLock::new(IndexMap::new()),
            reserved: RwLock::new(HashSet::new()),
        }
    }

    pub fn with_whitelist(mut self, whitelist: Arc<dyn BackendWhitelist>) -> Self {
        self.whitelist = whitelist;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Directory holding a model's files.
    pub fn model_dir(&self, model_id: &str) -> PathBuf {
        AppConfig::models_dir(&self.home).join(model_id)
    }

    /// Current catalog.
    pub fn config(&self) -> AppConfig {
        read_lock(&self.config).clone()
    }

    /// Re-register every model in the catalog. Models with a descriptor on
    /// disk load locally; the rest are fetched. Failures are returned per
    /// model and do not stop the others.
    pub async fn restore(&self) -> Vec<(String, CoreError)> {
        let records = read_lock(&self.config).model_list.clone();
        let mut failures = Vec::new();

        for record in records {
            let result = async {
                let descriptor = self.descriptor_for(&record).await?;
                self.register_inner(descriptor, false, false).await
            }
            .await;

            if let Err(e) = result {
                tracing::warn!("MODEL_RESTORE_FAILED | model={} error={}", record.model_id, e);
                failures.push((record.model_id.clone(), e));
            }
        }

        tracing::info!(
            "CATALOG_RESTORED | models={} failed={}",
            read_lock(&self.models).len(),
            failures.len()
        );
        failures
    }

    /// Fetch a remote descriptor and register it under `record.model_id`.
    pub async fn add_model(&self, record: ModelRecord) -> Result<Arc<ModelAcquisition>> {
        validate_identifier(&record.model_id)?;
        if self.contains(&record.model_id) {
            return Err(CoreError::DuplicateIdentifier(record.model_id));
        }
        let url = resolve_url(&record.model_url, MODEL_CONFIG_FILENAME);
        let bytes = self.source.fetch(&url).await?;
        let descriptor = ModelDescriptor::parse(&bytes, &record)?;
        self.register(descriptor).await
    }

    /// Register a validated descriptor and append it to the catalog.
    ///
    /// Fails with `DuplicateIdentifier` or `UnsupportedBackend` before any
    /// file is written.
    pub async fn register(&self, descriptor: ModelDescriptor) -> Result<Arc<ModelAcquisition>> {
        self.register_inner(descriptor, true, true).await
    }

    async fn register_inner(
        &self,
        descriptor: ModelDescriptor,
        persist: bool,
        check_backend: bool,
    ) -> Result<Arc<ModelAcquisition>> {
        let model_id = descriptor.model_id.clone();
        validate_identifier(&model_id)?;

        self.reserve(&model_id)?;
        let result = self
            .register_reserved(descriptor, persist, check_backend)
            .await;
        write_lock(&self.reserved).remove(&model_id);
        result
    }

    async fn register_reserved(
        &self,
        descriptor: ModelDescriptor,
        persist: bool,
        check_backend: bool,
    ) -> Result<Arc<ModelAcquisition>> {
        let model_id = descriptor.model_id.clone();
        if check_backend && !self.whitelist.is_supported_backend(&descriptor.model_lib) {
            return Err(CoreError::UnsupportedBackend(descriptor.model_lib));
        }

        let dir = self.model_dir(&model_id);
        let created = !dir.exists();
        let cleanup = |e: CoreError| {
            if created {
                if let Err(rm) = std::fs::remove_dir_all(&dir) {
                    tracing::warn!("Failed to remove {:?} after failed registration: {}", dir, rm);
                }
            }
            e
        };

        if !dir.join(MODEL_CONFIG_FILENAME).is_file() {
            descriptor.save(&dir).map_err(cleanup)?;
        }

        let record = descriptor.record();
        let acquisition = ModelAcquisition::spawn(
            descriptor,
            dir.clone(),
            Arc::clone(&self.source),
            Arc::clone(&self.gate),
            self.max_concurrency,
        )
        .await
        .map_err(cleanup)?;

        if persist {
            self.persist_added(record).map_err(cleanup)?;
        }

        let acquisition = Arc::new(acquisition);
        write_lock(&self.models).insert(model_id.clone(), Arc::clone(&acquisition));
        tracing::info!(
            "MODEL_REGISTERED | model={} state={}",
            model_id,
            acquisition.state()
        );
        Ok(acquisition)
    }

    fn reserve(&self, model_id: &str) -> Result<()> {
        let mut reserved = write_lock(&self.reserved);
        if reserved.contains(model_id) || read_lock(&self.models).contains_key(model_id) {
            return Err(CoreError::DuplicateIdentifier(model_id.to_string()));
        }
        reserved.insert(model_id.to_string());
        Ok(())
    }

    fn persist_added(&self, record: ModelRecord) -> Result<()> {
        let mut config = write_lock(&self.config);
        let exists = config.model_list.iter().any(|r| r.model_id == record.model_id);
        if exists {
            return Ok(());
        }
        config.model_list.push(record);
        if let Err(e) = config.save(&self.home) {
            config.model_list.pop();
            return Err(CoreError::Persist(format!("{:#}", e)));
        }
        Ok(())
    }

    /// Drop a model from the registry and the catalog. Only call this after
    /// the model's `delete()` has completed; [`Registry::delete_model`] does
    /// both.
    pub fn unregister(&self, model_id: &str) -> Result<()> {
        let removed = write_lock(&self.models).shift_remove(model_id);
        if removed.is_none() {
            return Err(CoreError::ModelNotFound(model_id.to_string()));
        }

        let mut config = write_lock(&self.config);
        let before = config.model_list.len();
        config.model_list.retain(|r| r.model_id != model_id);
        if config.model_list.len() != before {
            config
                .save(&self.home)
                .map_err(|e| CoreError::Persist(format!("{:#}", e)))?;
        }
        tracing::info!("MODEL_UNREGISTERED | model={}", model_id);
        Ok(())
    }

    /// Delete a model's files (draining transfers and releasing the session
    /// first), then unregister it.
    pub async fn delete_model(&self, model_id: &str) -> Result<()> {
        let acquisition = self
            .get(model_id)
            .ok_or_else(|| CoreError::ModelNotFound(model_id.to_string()))?;
        acquisition.delete().await?;
        self.unregister(model_id)
    }

    pub fn get(&self, model_id: &str) -> Option<Arc<ModelAcquisition>> {
        read_lock(&self.models).get(model_id).cloned()
    }

    pub fn contains(&self, model_id: &str) -> bool {
        read_lock(&self.models).contains_key(model_id)
    }

    /// Registered models in insertion order.
    pub fn list(&self) -> Vec<Arc<ModelAcquisition>> {
        read_lock(&self.models).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        read_lock(&self.models).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn descriptor_for(&self, record: &ModelRecord) -> Result<ModelDescriptor> {
        let dir = self.model_dir(&record.model_id);
        if dir.join(MODEL_CONFIG_FILENAME).is_file() {
            return ModelDescriptor::load(&dir, record);
        }
        let url = resolve_url(&record.model_url, MODEL_CONFIG_FILENAME);
        let bytes = self.source.fetch(&url).await?;
        Ok(ModelDescriptor::parse(&bytes, record)?)
    }
}
