// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Where asset bytes come from.
//!
//! [`HttpSource`] talks to a model host such as Hugging Face. [`MemorySource`]
//! serves canned payloads for tests and offline use, and can hold transfers
//! open until the caller releases them.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;

use crate::error::{CoreError, FetchError, Result};
use crate::sync::{lock, read_lock, write_lock};

/// Connect timeout for the HTTP source.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Timeout for small metadata fetches (descriptor, manifest).
const FETCH_TIMEOUT_SECS: u64 = 120;

/// A remote (or simulated) origin for model assets.
#[async_trait]
pub trait AssetSource: Send + Sync {
    /// Fetch a whole asset into memory. Used for descriptors and manifests.
    async fn fetch(&self, url: &str) -> std::result::Result<Bytes, FetchError>;

    /// Stream an asset into `file`, which lives at `path`. Returns bytes written.
    async fn stream_to(
        &self,
        url: &str,
        file: &mut tokio::fs::File,
        path: &Path,
    ) -> Result<u64> {
        let bytes = self.fetch(url).await?;
        file.write_all(&bytes)
            .await
            .map_err(|e| CoreError::io(path, e))?;
        Ok(bytes.len() as u64)
    }
}

/// HTTP asset source backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
    fetch_timeout: Duration,
}

impl HttpSource {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(concat!("modelhost/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Network {
                url: String::new(),
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            fetch_timeout: Duration::from_secs(FETCH_TIMEOUT_SECS),
        })
    }

    /// Set the timeout applied to whole-asset fetches.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    async fn get(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> std::result::Result<reqwest::Response, FetchError> {
        let mut request = self.client.get(url);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await.map_err(|e| network_error(url, &e))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

fn network_error(url: &str, e: &reqwest::Error) -> FetchError {
    let message = if e.is_timeout() {
        "request timed out".to_string()
    } else if e.is_connect() {
        format!("failed to connect: {}", e)
    } else {
        e.to_string()
    };
    FetchError::Network {
        url: url.to_string(),
        message,
    }
}

#[async_trait]
impl AssetSource for HttpSource {
    async fn fetch(&self, url: &str) -> std::result::Result<Bytes, FetchError> {
        let response = self.get(url, Some(self.fetch_timeout)).await?;
        response.bytes().await.map_err(|e| network_error(url, &e))
    }

    async fn stream_to(
        &self,
        url: &str,
        file: &mut tokio::fs::File,
        path: &Path,
    ) -> Result<u64> {
        let response = self.get(url, None).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| network_error(url, &e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| CoreError::io(path, e))?;
            written += chunk.len() as u64;
        }

        Ok(written)
    }
}

/// In-memory asset source.
///
/// Assets inserted with [`MemorySource::insert_gated`] block inside `fetch`
/// until [`MemorySource::release`] hands out a permit, which lets tests hold
/// transfers in flight deterministically.
#[derive(Debug)]
pub struct MemorySource {
    assets: RwLock<HashMap<String, Bytes>>,
    gated: RwLock<HashSet<String>>,
    failing: RwLock<HashSet<String>>,
    fetch_counts: Mutex<HashMap<String, usize>>,
    gate: Arc<Semaphore>,
    delay: Option<Duration>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            assets: RwLock::new(HashMap::new()),
            gated: RwLock::new(HashSet::new()),
            failing: RwLock::new(HashSet::new()),
            fetch_counts: Mutex::new(HashMap::new()),
            gate: Arc::new(Semaphore::new(0)),
            delay: None,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Hold every fetch for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn insert(&self, url: impl Into<String>, body: impl Into<Bytes>) {
        write_lock(&self.assets).insert(url.into(), body.into());
    }

    /// Insert an asset whose fetch waits for a [`release`](Self::release).
    pub fn insert_gated(&self, url: impl Into<String>, body: impl Into<Bytes>) {
        let url = url.into();
        write_lock(&self.gated).insert(url.clone());
        self.insert(url, body);
    }

    /// Let `n` gated fetches proceed.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Make fetches of `url` fail with a network error.
    pub fn fail(&self, url: impl Into<String>) {
        write_lock(&self.failing).insert(url.into());
    }

    /// Stop failing fetches of `url`.
    pub fn heal(&self, url: &str) {
        write_lock(&self.failing).remove(url);
    }

    /// How many times `url` has been requested.
    pub fn fetch_count(&self, url: &str) -> usize {
        self.counts().get(url).copied().unwrap_or(0)
    }

    /// Total requests across all URLs.
    pub fn total_fetches(&self) -> usize {
        self.counts().values().sum()
    }

    /// Fetches currently executing.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of fetches observed executing at once.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        lock(&self.fetch_counts)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AssetSource for MemorySource {
    async fn fetch(&self, url: &str) -> std::result::Result<Bytes, FetchError> {
        {
            let mut counts = self.counts();
            *counts.entry(url.to_string()).or_insert(0) += 1;
        }

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let gated = read_lock(&self.gated).contains(url);
        if gated {
            match self.gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => {
                    return Err(FetchError::Network {
                        url: url.to_string(),
                        message: "gate closed".to_string(),
                    })
                }
            }
        }

        if read_lock(&self.failing).contains(url) {
            return Err(FetchError::Network {
                url: url.to_string(),
                message: "simulated failure".to_string(),
            });
        }

        read_lock(&self.assets)
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_fetch_and_counts() {
        let source = MemorySource::new();
        source.insert("mem://a", "alpha");

        let body = source.fetch("mem://a").await.unwrap();
        assert_eq!(&body[..], b"alpha");
        assert_eq!(source.fetch_count("mem://a"), 1);

        let missing = source.fetch("mem://b").await;
        assert!(matches!(missing, Err(FetchError::NotFound(_))));
        assert_eq!(source.total_fetches(), 2);
        assert_eq!(source.active(), 0);
    }

    #[tokio::test]
    async fn test_memory_fail_and_heal() {
        let source = MemorySource::new();
        source.insert("mem://a", "alpha");
        source.fail("mem://a");
        assert!(matches!(
            source.fetch("mem://a").await,
            Err(FetchError::Network { .. })
        ));
        source.heal("mem://a");
        assert!(source.fetch("mem://a").await.is_ok());
    }

    #[tokio::test]
    async fn test_gated_fetch_waits_for_release() {
        let source = Arc::new(MemorySource::new());
        source.insert_gated("mem://g", "gated");

        let fetcher = {
            let source = Arc::clone(&source);
            tokio::spawn(async move { source.fetch("mem://g").await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fetcher.is_finished());
        assert_eq!(source.active(), 1);

        source.release(1);
        let body = tokio::time::timeout(Duration::from_secs(2), fetcher)
            .await
            .expect("gated fetch should finish after release")
            .unwrap()
            .unwrap();
        assert_eq!(&body[..], b"gated");
    }

    #[tokio::test]
    async fn test_default_stream_to_writes_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        let source = MemorySource::new();
        source.insert("mem://x", "0123456789");

        let mut file = tokio::fs::File::create(&path).await.unwrap();
        let n = source.stream_to("mem://x", &mut file, &path).await.unwrap();
        file.flush().await.unwrap();
        assert_eq!(n, 10);
        assert_eq!(std::fs::read(&path).unwrap(), b"0123456789");
    }
}
