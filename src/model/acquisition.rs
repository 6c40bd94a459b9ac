// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-model acquisition state machine.
//!
//! Each [`ModelAcquisition`] is a handle to one actor task. The actor owns the
//! pending queue, the [`DownloadPool`] and the state; the handle talks to it
//! over a command channel and observes it through a `watch` snapshot.
//!
//! ```text
//! Initializing ─▶ Indexing ─┬─▶ Paused ◀──────────── Pausing
//!                    ▲      │     │ start()              ▲ pause()
//!                    │      │     ▼                      │
//!                    │      │  Downloading ──────────────┘
//!                    │      │     │ all done
//!                    │      └─────┴─▶ Finished
//!                    │
//!                 Clearing ◀── clear()  (from Paused, Downloading, Finished)
//!                 Deleting ◀── delete() (actor stops afterwards)
//! ```
//!
//! Destructive commands drain in-flight transfers and tear down a session
//! bound to this model before touching the directory.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use walkdir::WalkDir;

use crate::download::{
    is_temp_file, AssetIndex, AssetSource, DownloadPool, TaskDescriptor, TransferOutcome,
};
use crate::error::{CoreError, Result};

use super::descriptor::{
    resolve_url, write_atomic, FileManifest, ModelDescriptor, MODEL_CONFIG_FILENAME,
    PARAMS_CONFIG_FILENAME,
};

/// Capacity of the command channel between a handle and its actor.
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Lifecycle of one model's files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcquisitionState {
    Initializing,
    Indexing,
    Paused,
    Downloading,
    Pausing,
    Clearing,
    Deleting,
    Finished,
}

impl AcquisitionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Indexing => "indexing",
            Self::Paused => "paused",
            Self::Downloading => "downloading",
            Self::Pausing => "pausing",
            Self::Clearing => "clearing",
            Self::Deleting => "deleting",
            Self::Finished => "finished",
        }
    }

    /// States from which `clear()` and `delete()` are accepted.
    pub fn accepts_destructive(&self) -> bool {
        matches!(self, Self::Downloading | Self::Paused | Self::Finished)
    }
}

impl std::fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of an acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSnapshot {
    pub state: AcquisitionState,
    /// Manifest files present on disk
    pub completed: usize,
    /// Manifest size
    pub total: usize,
    /// Transfers currently running
    pub in_flight: usize,
    /// Transfers waiting for a slot or for the next `start()`
    pub pending: usize,
    /// Most recent per-file failure
    pub last_error: Option<String>,
}

impl AcquisitionSnapshot {
    fn new(state: AcquisitionState, total: usize) -> Self {
        Self {
            state,
            completed: 0,
            total,
            in_flight: 0,
            pending: 0,
            last_error: None,
        }
    }

    pub fn progress(&self) -> (usize, usize) {
        (self.completed, self.total)
    }
}

/// How an acquisition reaches the chat session before destroying files.
#[async_trait]
pub trait SessionGate: Send + Sync {
    /// Whether the session currently runs on `model_id`.
    fn is_bound_to(&self, model_id: &str) -> bool;

    /// Terminate the session and wait until it has let go of the model.
    async fn terminate_bound(&self) -> Result<()>;
}

/// Gate for setups without a chat session.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSession;

#[async_trait]
impl SessionGate for NoSession {
    fn is_bound_to(&self, _model_id: &str) -> bool {
        false
    }

    async fn terminate_bound(&self) -> Result<()> {
        Ok(())
    }
}

type Reply = oneshot::Sender<Result<()>>;

#[derive(Debug)]
enum Command {
    Start(Reply),
    Pause(Reply),
    Clear(Reply),
    Delete(Reply),
}

/// Handle to a running model acquisition.
#[derive(Debug)]
pub struct ModelAcquisition {
    descriptor: ModelDescriptor,
    dir: PathBuf,
    command_tx: mpsc::Sender<Command>,
    snapshot_rx: watch::Receiver<AcquisitionSnapshot>,
}

impl ModelAcquisition {
    /// Load or fetch the shard manifest, index the directory and start the
    /// actor. Fails without leaving a running actor if the manifest cannot
    /// be obtained.
    pub async fn spawn(
        descriptor: ModelDescriptor,
        dir: PathBuf,
        source: Arc<dyn AssetSource>,
        gate: Arc<dyn SessionGate>,
        max_concurrency: usize,
    ) -> Result<Self> {
        let manifest = load_manifest(&descriptor, &dir, source.as_ref()).await?;

        let (snapshot_tx, snapshot_rx) = watch::channel(AcquisitionSnapshot::new(
            AcquisitionState::Initializing,
            manifest.len(),
        ));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let mut actor = Actor {
            descriptor: descriptor.clone(),
            dir: dir.clone(),
            manifest,
            pool: DownloadPool::new(source, max_concurrency),
            gate,
            state: AcquisitionState::Initializing,
            pending: VecDeque::new(),
            failed: Vec::new(),
            completed: 0,
            last_error: None,
            snapshot_tx,
        };
        actor.reindex();

        tokio::spawn(actor.run(command_rx));

        Ok(Self {
            descriptor,
            dir,
            command_tx,
            snapshot_rx,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.descriptor.model_id
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Submit pending transfers. A no-op when already downloading or finished.
    pub async fn start(&self) -> Result<()> {
        self.request(Command::Start).await
    }

    /// Stop submitting. Returns once the state is `Pausing`; in-flight
    /// transfers then finish and the state becomes `Paused`.
    pub async fn pause(&self) -> Result<()> {
        self.request(Command::Pause).await
    }

    /// Remove every downloaded file but keep the descriptor and manifest.
    /// Returns after the directory has been re-indexed.
    pub async fn clear(&self) -> Result<()> {
        self.request(Command::Clear).await
    }

    /// Remove the model directory. The actor stops once this returns `Ok`.
    pub async fn delete(&self) -> Result<()> {
        self.request(Command::Delete).await
    }

    pub fn state(&self) -> AcquisitionState {
        self.snapshot_rx.borrow().state
    }

    /// `(completed, total)` manifest files.
    pub fn progress(&self) -> (usize, usize) {
        self.snapshot_rx.borrow().progress()
    }

    pub fn snapshot(&self) -> AcquisitionSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AcquisitionSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Wait until a snapshot satisfies `pred`.
    pub async fn wait_for(
        &self,
        pred: impl FnMut(&AcquisitionSnapshot) -> bool,
    ) -> Result<AcquisitionSnapshot> {
        let mut rx = self.snapshot_rx.clone();
        let snapshot = rx
            .wait_for(pred)
            .await
            .map_err(|_| CoreError::Closed("model acquisition"))?;
        Ok(snapshot.clone())
    }

    async fn request(&self, make: impl FnOnce(Reply) -> Command) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(make(tx))
            .await
            .map_err(|_| CoreError::Closed("model acquisition"))?;
        rx.await.map_err(|_| CoreError::Closed("model acquisition"))?
    }
}

/// Read the cached `tensor-cache.json`, or fetch and cache it.
async fn load_manifest(
    descriptor: &ModelDescriptor,
    dir: &Path,
    source: &dyn AssetSource,
) -> Result<FileManifest> {
    let path = dir.join(PARAMS_CONFIG_FILENAME);

    let bytes = if path.is_file() {
        tokio::fs::read(&path)
            .await
            .map_err(|e| CoreError::io(&path, e))?
    } else {
        let url = resolve_url(&descriptor.model_url, PARAMS_CONFIG_FILENAME);
        let bytes = source.fetch(&url).await?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| CoreError::io(dir, e))?;
        write_atomic(&path, &bytes)?;
        tracing::debug!("MANIFEST_FETCHED | model={} url={}", descriptor.model_id, url);
        bytes.to_vec()
    };

    Ok(FileManifest::from_parts(descriptor, &bytes)?)
}

enum Flow {
    Continue,
    Stop,
}

struct Actor {
    descriptor: ModelDescriptor,
    dir: PathBuf,
    manifest: FileManifest,
    pool: DownloadPool,
    gate: Arc<dyn SessionGate>,
    state: AcquisitionState,
    pending: VecDeque<TaskDescriptor>,
    /// Failed this round; moved back to `pending` when the round ends.
    failed: Vec<TaskDescriptor>,
    completed: usize,
    last_error: Option<String>,
    snapshot_tx: watch::Sender<AcquisitionSnapshot>,
}

impl Actor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if let Flow::Stop = self.handle(command).await {
                            break;
                        }
                    }
                    None => {
                        // Handle dropped: let running transfers land, then stop.
                        self.drain().await;
                        break;
                    }
                },
                Some(outcome) = self.pool.next_outcome(), if !self.pool.is_idle() => {
                    self.apply(outcome);
                    self.pump();
                }
            }
        }
        tracing::debug!("ACQUISITION_STOPPED | model={}", self.descriptor.model_id);
    }

    async fn handle(&mut self, command: Command) -> Flow {
        match command {
            Command::Start(reply) => {
                let _ = reply.send(self.start());
                Flow::Continue
            }
            Command::Pause(reply) => {
                self.pause(reply).await;
                Flow::Continue
            }
            Command::Clear(reply) => {
                let result = self.clear().await;
                let _ = reply.send(result);
                Flow::Continue
            }
            Command::Delete(reply) => {
                let result = self.delete().await;
                let stop = result.is_ok();
                let _ = reply.send(result);
                if stop {
                    Flow::Stop
                } else {
                    Flow::Continue
                }
            }
        }
    }

    fn start(&mut self) -> Result<()> {
        match self.state {
            AcquisitionState::Paused => {
                self.set_state(AcquisitionState::Downloading);
                self.pump();
                Ok(())
            }
            AcquisitionState::Downloading | AcquisitionState::Finished => Ok(()),
            state => Err(CoreError::InvalidTransition {
                action: "start",
                state,
            }),
        }
    }

    async fn pause(&mut self, reply: Reply) {
        match self.state {
            AcquisitionState::Downloading => {
                self.set_state(AcquisitionState::Pausing);
                let _ = reply.send(Ok(()));
                self.drain().await;
                self.finish_round(AcquisitionState::Paused);
            }
            AcquisitionState::Paused | AcquisitionState::Finished => {
                let _ = reply.send(Ok(()));
            }
            state => {
                let _ = reply.send(Err(CoreError::InvalidTransition {
                    action: "pause",
                    state,
                }));
            }
        }
    }

    async fn clear(&mut self) -> Result<()> {
        self.begin_destructive("clear", AcquisitionState::Clearing)
            .await?;

        let result = self.remove_downloaded_files();
        if let Err(e) = &result {
            tracing::error!("MODEL_CLEAR_FAILED | model={} error={}", self.descriptor.model_id, e);
        } else {
            tracing::info!("MODEL_CLEARED | model={}", self.descriptor.model_id);
        }
        self.reindex();
        result
    }

    async fn delete(&mut self) -> Result<()> {
        self.begin_destructive("delete", AcquisitionState::Deleting)
            .await?;

        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!(
                    "MODEL_DELETE_FAILED | model={} error={}",
                    self.descriptor.model_id,
                    e
                );
                self.reindex();
                return Err(CoreError::io(&self.dir, e));
            }
        }

        self.completed = 0;
        self.publish();
        tracing::info!("MODEL_DELETED | model={}", self.descriptor.model_id);
        Ok(())
    }

    /// Enter a destructive state, drain transfers and release the session.
    /// On failure the directory is re-indexed and the error returned.
    async fn begin_destructive(
        &mut self,
        action: &'static str,
        target: AcquisitionState,
    ) -> Result<()> {
        if !self.state.accepts_destructive() {
            return Err(CoreError::InvalidTransition {
                action,
                state: self.state,
            });
        }

        self.set_state(target);
        self.drain().await;
        self.pending.clear();
        self.failed.clear();
        self.publish();

        if self.gate.is_bound_to(&self.descriptor.model_id) {
            tracing::debug!(
                "SESSION_TEARDOWN | model={} before={}",
                self.descriptor.model_id,
                action
            );
            if let Err(e) = self.gate.terminate_bound().await {
                self.reindex();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Delete everything in the model directory except the descriptor and
    /// the cached manifest. Restores the descriptor if it went missing.
    fn remove_downloaded_files(&self) -> Result<()> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return self.descriptor.save(&self.dir);
            }
            Err(e) => return Err(CoreError::io(&self.dir, e)),
        };

        for entry in entries {
            let entry = entry.map_err(|e| CoreError::io(&self.dir, e))?;
            let name = entry.file_name();
            if name == MODEL_CONFIG_FILENAME || name == PARAMS_CONFIG_FILENAME {
                continue;
            }
            let path = entry.path();
            let removed = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            removed.map_err(|e| CoreError::io(&path, e))?;
        }

        if !self.dir.join(MODEL_CONFIG_FILENAME).is_file() {
            self.descriptor.save(&self.dir)?;
        }
        Ok(())
    }

    /// Fill free pool slots from `pending` and detect the end of a round.
    fn pump(&mut self) {
        if self.state != AcquisitionState::Downloading {
            self.publish();
            return;
        }

        while self.pool.has_capacity() {
            let Some(task) = self.pending.pop_front() else {
                break;
            };
            if self.pool.is_in_flight(&task.dest) {
                tracing::debug!("TRANSFER_SKIPPED | file={} already in flight", task.file_name());
                continue;
            }
            if let Err(e) = self.pool.submit(task.clone()) {
                tracing::error!("TRANSFER_SUBMIT_FAILED | file={} error={}", task.file_name(), e);
                self.pending.push_front(task);
                break;
            }
        }

        if self.pending.is_empty() && self.pool.is_idle() {
            self.finish_round(AcquisitionState::Finished);
        } else {
            self.publish();
        }
    }

    /// Close a download round. Failed files go back to pending and the model
    /// waits in `Paused` for another `start()`.
    fn finish_round(&mut self, when_complete: AcquisitionState) {
        let had_failures = !self.failed.is_empty();
        self.pending.extend(self.failed.drain(..));

        if self.pending.is_empty() {
            self.set_state(when_complete);
            if when_complete == AcquisitionState::Finished {
                tracing::info!("MODEL_READY | model={}", self.descriptor.model_id);
            }
        } else {
            if had_failures {
                tracing::warn!(
                    "DOWNLOAD_INCOMPLETE | model={} remaining={}",
                    self.descriptor.model_id,
                    self.pending.len()
                );
            }
            self.set_state(AcquisitionState::Paused);
        }
    }

    fn apply(&mut self, outcome: TransferOutcome) {
        match outcome.result {
            Ok(_) => self.completed += 1,
            Err(e) => {
                self.last_error = Some(format!("{}: {}", outcome.task.file_name(), e));
                self.failed.push(outcome.task);
            }
        }
    }

    async fn drain(&mut self) {
        while let Some(outcome) = self.pool.next_outcome().await {
            self.apply(outcome);
            self.publish();
        }
    }

    /// Re-scan the directory and land in `Paused` or `Finished`.
    fn reindex(&mut self) {
        self.set_state(AcquisitionState::Indexing);
        self.sweep_partials();

        let report = AssetIndex::scan(&self.manifest, &self.descriptor.model_url, &self.dir);
        self.completed = report.present;
        self.pending = report.pending.into();
        self.failed.clear();

        let next = if self.pending.is_empty() {
            AcquisitionState::Finished
        } else {
            AcquisitionState::Paused
        };
        self.set_state(next);
    }

    /// Remove temp files left by transfers that never committed.
    fn sweep_partials(&self) {
        if !self.pool.is_idle() || !self.dir.is_dir() {
            return;
        }
        for entry in WalkDir::new(&self.dir).into_iter().filter_map(|e| e.ok()) {
            let stale = entry.file_type().is_file()
                && entry.file_name().to_str().map(is_temp_file).unwrap_or(false);
            if stale {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => tracing::debug!("Removed stale partial file {:?}", entry.path()),
                    Err(e) => tracing::warn!("Failed to remove {:?}: {}", entry.path(), e),
                }
            }
        }
    }

    fn set_state(&mut self, next: AcquisitionState) {
        if self.state != next {
            tracing::debug!(
                "ACQUISITION_STATE | model={} {} -> {}",
                self.descriptor.model_id,
                self.state,
                next
            );
            self.state = next;
        }
        self.publish();
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(AcquisitionSnapshot {
            state: self.state,
            completed: self.completed,
            total: self.manifest.len(),
            in_flight: self.pool.in_flight(),
            pending: self.pending.len() + self.failed.len(),
            last_error: self.last_error.clone(),
        });
    }
}
