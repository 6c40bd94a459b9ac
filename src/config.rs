// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent application catalog.
//!
//! `app-config.json` under the modelhost home lists the supported model
//! libraries, every known model, and the completion endpoint. Writes go
//! through a temp file + atomic rename while holding an exclusive lock on a
//! sibling `.lock` file, so two instances never interleave partial writes.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::download::DEFAULT_MAX_CONCURRENCY;

/// Catalog file name under the modelhost home.
pub const APP_CONFIG_FILENAME: &str = "app-config.json";

/// Environment variable overriding the modelhost home directory.
pub const HOME_ENV: &str = "MODELHOST_HOME";

/// Default timeout for acquiring the catalog lock (5 seconds)
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// One model entry in the persisted catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    /// Repository root the descriptor and shards are fetched from
    pub model_url: String,
    /// Local identifier, also the model directory name
    pub model_id: String,
    /// Optional VRAM footprint hint in bytes
    #[serde(default)]
    pub estimated_vram_bytes: Option<u64>,
    /// Backend library the model was compiled for
    pub model_lib: String,
}

/// OpenAI-compatible completion endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 120,
        }
    }
}

fn default_max_concurrent_downloads() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

/// The whole persisted catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Whitelisted backend libraries
    #[serde(default)]
    pub model_libs: Vec<String>,
    /// Known models, in registration order
    #[serde(default)]
    pub model_list: Vec<ModelRecord>,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    /// Prompt sent once, on the first launch with an empty transcript
    #[serde(default)]
    pub greeting_prompt: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model_libs: Vec::new(),
            model_list: Vec::new(),
            completion: CompletionConfig::default(),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENCY,
            greeting_prompt: None,
        }
    }
}

impl AppConfig {
    /// Resolve the modelhost home: explicit flag, then `MODELHOST_HOME`,
    /// then `~/.modelhost`.
    pub fn resolve_home(explicit: Option<PathBuf>) -> PathBuf {
        explicit
            .or_else(|| std::env::var_os(HOME_ENV).map(PathBuf::from))
            .or_else(|| dirs::home_dir().map(|h| h.join(".modelhost")))
            .unwrap_or_else(|| PathBuf::from(".modelhost"))
    }

    pub fn config_path(home: &Path) -> PathBuf {
        home.join(APP_CONFIG_FILENAME)
    }

    fn lock_path(home: &Path) -> PathBuf {
        Self::config_path(home).with_extension("lock")
    }

    /// Directory holding all model directories.
    pub fn models_dir(home: &Path) -> PathBuf {
        home.join("models")
    }

    /// Directory holding the chat transcript and its metadata.
    pub fn transcript_dir(home: &Path) -> PathBuf {
        home.join("transcript")
    }

    /// Load the catalog, returning defaults when none has been written yet.
    pub fn load(home: &Path) -> Result<Self> {
        let path = Self::config_path(home);
        if !path.exists() {
            return Ok(Self::default());
        }

        let lock_file = Self::open_lock_file(&Self::lock_path(home))?;
        Self::acquire_with_timeout(LOCK_TIMEOUT, || FileExt::try_lock_shared(&lock_file))
            .with_context(|| format!("Failed to acquire shared lock on {:?}", path))?;

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Save the catalog atomically.
    pub fn save(&self, home: &Path) -> Result<()> {
        self.save_with_timeout(home, LOCK_TIMEOUT)
    }

    pub fn save_with_timeout(&self, home: &Path, timeout: Duration) -> Result<()> {
        let path = Self::config_path(home);
        fs::create_dir_all(home)
            .with_context(|| format!("Failed to create directory: {:?}", home))?;

        let _lock_guard = Self::acquire_exclusive_lock_with_timeout(&Self::lock_path(home), timeout)?;

        let temp_path = path.with_extension("tmp");
        let content = serde_json::to_string_pretty(self)
            .context("Failed to serialize config to JSON")?;

        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
            temp_file
                .write_all(content.as_bytes())
                .context("Failed to write to temp file")?;
            temp_file
                .sync_all()
                .context("Failed to sync temp file to disk")?;
        }

        fs::rename(&temp_path, &path)
            .with_context(|| format!("Failed to rename {:?} -> {:?}", temp_path, path))?;

        tracing::debug!("CONFIG_SAVED | path={:?} models={}", path, self.model_list.len());
        Ok(())
    }

    /// Whitelist derived from the catalog: explicit libs plus the libs of
    /// every listed model.
    pub fn supported_libs(&self) -> Vec<String> {
        let mut libs = self.model_libs.clone();
        for record in &self.model_list {
            if !libs.contains(&record.model_lib) {
                libs.push(record.model_lib.clone());
            }
        }
        libs
    }

    fn open_lock_file(path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {:?}", path))
    }

    fn acquire_exclusive_lock_with_timeout(path: &Path, timeout: Duration) -> Result<File> {
        let lock_file = Self::open_lock_file(path)?;
        Self::acquire_with_timeout(timeout, || FileExt::try_lock_exclusive(&lock_file))
            .with_context(|| format!("Failed to acquire exclusive lock on {:?}", path))?;
        Ok(lock_file)
    }

    fn acquire_with_timeout(
        timeout: Duration,
        mut try_lock: impl FnMut() -> std::io::Result<()>,
    ) -> Result<()> {
        let start = Instant::now();
        loop {
            match try_lock() {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!(
                            "Timed out waiting for lock after {:?}. \
                             Another modelhost instance may be writing the catalog.",
                            timeout
                        );
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str, lib: &str) -> ModelRecord {
        ModelRecord {
            model_url: format!("https://example.test/{}/", id),
            model_id: id.to_string(),
            estimated_vram_bytes: Some(1024),
            model_lib: lib.to_string(),
        }
    }

    #[test]
    fn test_load_missing_returns_default() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = AppConfig::load(temp_dir.path()).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.max_concurrent_downloads, 3);
    }

    #[test]
    fn test_save_and_load_preserves_order() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let mut config = AppConfig::default();
        config.model_list.push(record("b-model", "lib_b"));
        config.model_list.push(record("a-model", "lib_a"));
        config.save(temp_dir.path()).unwrap();

        let loaded = AppConfig::load(temp_dir.path()).unwrap();
        let ids: Vec<_> = loaded.model_list.iter().map(|r| r.model_id.as_str()).collect();
        assert_eq!(ids, vec!["b-model", "a-model"]);
        assert!(!temp_dir.path().join("app-config.tmp").exists());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(
            AppConfig::config_path(temp_dir.path()),
            r#"{"model_list":[]}"#,
        )
        .unwrap();
        let config = AppConfig::load(temp_dir.path()).unwrap();
        assert_eq!(config.completion, CompletionConfig::default());
        assert!(config.greeting_prompt.is_none());
    }

    #[test]
    fn test_supported_libs_includes_listed_models() {
        let mut config = AppConfig::default();
        config.model_libs.push("lib_a".into());
        config.model_list.push(record("x", "lib_b"));
        config.model_list.push(record("y", "lib_a"));
        assert_eq!(config.supported_libs(), vec!["lib_a", "lib_b"]);
    }

    #[test]
    fn test_exclusive_lock_times_out_while_held() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let lock_path = temp_dir.path().join("held.lock");

        let _held = AppConfig::acquire_exclusive_lock_with_timeout(&lock_path, Duration::from_secs(1))
            .expect("First lock should succeed");

        let start = Instant::now();
        let second =
            AppConfig::acquire_exclusive_lock_with_timeout(&lock_path, Duration::from_millis(150));
        assert!(second.is_err(), "Second exclusive lock should fail while first is held");
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_resolve_home_prefers_explicit() {
        let explicit = PathBuf::from("/tmp/explicit-home");
        assert_eq!(AppConfig::resolve_home(Some(explicit.clone())), explicit);
    }
}
