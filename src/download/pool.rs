// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Bounded pool of concurrent file transfers.
//!
//! The pool is owned by a single coordinating task. Transfers run on their
//! own tokio tasks and report back over a channel; the in-flight set is only
//! touched by the owner, when it pulls an outcome with
//! [`DownloadPool::next_outcome`].

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::error::{CoreError, Result};

use super::source::AssetSource;
use super::types::{TaskDescriptor, TransferOutcome};

/// Length of the random part of a temp file name.
const TEMP_NAME_LEN: usize = 16;

/// Suffix of in-progress transfer files.
const TEMP_SUFFIX: &str = ".part";

/// Whether a file name belongs to an in-progress (or abandoned) transfer.
pub fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX) && name.len() > 1 + TEMP_SUFFIX.len()
}

fn temp_file_name() -> String {
    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TEMP_NAME_LEN)
        .map(char::from)
        .collect();
    format!(".{}{}", random, TEMP_SUFFIX)
}

pub struct DownloadPool {
    source: Arc<dyn AssetSource>,
    max_concurrency: usize,
    in_flight: HashSet<PathBuf>,
    outcome_tx: mpsc::UnboundedSender<TransferOutcome>,
    outcome_rx: mpsc::UnboundedReceiver<TransferOutcome>,
}

impl DownloadPool {
    /// Create a pool. `max_concurrency` is clamped to at least 1.
    pub fn new(source: Arc<dyn AssetSource>, max_concurrency: usize) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            source,
            max_concurrency: max_concurrency.max(1),
            in_flight: HashSet::new(),
            outcome_tx,
            outcome_rx,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn has_capacity(&self) -> bool {
        self.in_flight.len() < self.max_concurrency
    }

    pub fn is_in_flight(&self, dest: &Path) -> bool {
        self.in_flight.contains(dest)
    }

    /// Start a transfer.
    ///
    /// Fails with `AlreadyInFlight` if the destination is already running and
    /// with `PoolSaturated` if every slot is taken. Neither should happen when
    /// the owner checks [`has_capacity`](Self::has_capacity) first.
    pub fn submit(&mut self, task: TaskDescriptor) -> Result<()> {
        if self.in_flight.contains(&task.dest) {
            return Err(CoreError::AlreadyInFlight(task.dest));
        }
        if !self.has_capacity() {
            return Err(CoreError::PoolSaturated(self.in_flight.len()));
        }

        self.in_flight.insert(task.dest.clone());
        tracing::debug!("TRANSFER_START | file={} src={}", task.file_name(), task.source);

        let source = Arc::clone(&self.source);
        let tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let worker = tokio::spawn(transfer(source, task.clone()));
            let result = match worker.await {
                Ok(result) => result,
                Err(e) => Err(CoreError::TransferAborted(e.to_string())),
            };
            // The receiver lives as long as the pool; a send error means the
            // owner is gone and nobody is left to care.
            let _ = tx.send(TransferOutcome { task, result });
        });

        Ok(())
    }

    /// Wait for the next transfer to finish. `None` when nothing is in flight.
    pub async fn next_outcome(&mut self) -> Option<TransferOutcome> {
        if self.in_flight.is_empty() {
            return None;
        }
        let outcome = self.outcome_rx.recv().await?;
        self.in_flight.remove(&outcome.task.dest);
        Some(outcome)
    }

    /// Wait until every running transfer has finished. Never cancels.
    pub async fn drain(&mut self) -> Vec<TransferOutcome> {
        let mut outcomes = Vec::with_capacity(self.in_flight.len());
        while let Some(outcome) = self.next_outcome().await {
            outcomes.push(outcome);
        }
        outcomes
    }
}

/// Stream into a temp file beside the destination, fsync, then rename.
async fn transfer(source: Arc<dyn AssetSource>, task: TaskDescriptor) -> Result<u64> {
    let parent = task
        .dest
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    tokio::fs::create_dir_all(&parent)
        .await
        .map_err(|e| CoreError::io(&parent, e))?;

    let temp_path = parent.join(temp_file_name());
    let result = write_and_commit(source.as_ref(), &task, &temp_path).await;

    match &result {
        Ok(bytes) => {
            tracing::info!("TRANSFER_DONE | file={} bytes={}", task.file_name(), bytes);
        }
        Err(e) => {
            if let Err(rm) = tokio::fs::remove_file(&temp_path).await {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove temp file {:?}: {}", temp_path, rm);
                }
            }
            tracing::warn!("TRANSFER_FAILED | file={} error={}", task.file_name(), e);
        }
    }

    result
}

async fn write_and_commit(
    source: &dyn AssetSource,
    task: &TaskDescriptor,
    temp_path: &Path,
) -> Result<u64> {
    let mut file = tokio::fs::File::create(temp_path)
        .await
        .map_err(|e| CoreError::io(temp_path, e))?;

    let written = source.stream_to(&task.source, &mut file, temp_path).await?;

    file.flush().await.map_err(|e| CoreError::io(temp_path, e))?;
    file.sync_all().await.map_err(|e| CoreError::io(temp_path, e))?;
    drop(file);

    tokio::fs::rename(temp_path, &task.dest)
        .await
        .map_err(|e| CoreError::io(&task.dest, e))?;

    Ok(written)
}
