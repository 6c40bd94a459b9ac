// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The single chat session and its interruption protocol.
//!
//! Every request is split in two:
//!
//! - a **prologue**, run on the caller's thread: an atomic compare-and-set on
//!   the state channel that either claims the session or fails fast;
//! - an **epilogue** (or generation body), queued on the session worker.
//!
//! The worker drains one FIFO queue, so exactly one body runs at a time and a
//! reset accepted mid-generation takes effect right after that generation.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{CoreError, Result};
use crate::model::{ModelDescriptor, SessionGate};
use crate::sync::{lock, read_lock, write_lock};
use crate::types::Message;

use super::completion::CompletionService;
use super::runtime::ModelRuntime;
use super::state::SessionState;
use super::transcript::TranscriptStore;

/// Transcript flag recording that the opening greeting was delivered.
pub const GREETED_FLAG: &str = "greeted";

/// Notice appended after a reset.
pub const CLEARED_NOTICE: &str = "Session cleared. Starting fresh.";

/// Collaborators of a [`SessionCoordinator`].
pub struct SessionDeps {
    pub runtime: Arc<dyn ModelRuntime>,
    pub service: Arc<dyn CompletionService>,
    pub transcript: Arc<dyn TranscriptStore>,
    /// Asked once, on a first launch with an empty transcript
    pub greeting_prompt: Option<String>,
}

/// The model a session currently runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub model_id: String,
    pub model_lib: String,
    pub path: PathBuf,
}

impl Binding {
    fn matches(&self, descriptor: &ModelDescriptor, path: &Path) -> bool {
        self.model_id == descriptor.model_id
            && self.model_lib == descriptor.model_lib
            && self.path == path
    }
}

#[derive(Default)]
struct Shared {
    binding: RwLock<Option<Binding>>,
    /// Model id of an accepted reload that has not run yet
    pending_reload: RwLock<Option<String>>,
    messages: RwLock<Vec<Message>>,
    last_error: RwLock<Option<String>>,
}

enum Job {
    Reset,
    Terminate(oneshot::Sender<()>),
    Reload {
        descriptor: ModelDescriptor,
        path: PathBuf,
    },
    Generate {
        prompt: String,
        reply: oneshot::Sender<Result<String>>,
    },
    Greet(String),
}

/// Owner of the chat session.
pub struct SessionCoordinator {
    state_tx: Arc<watch::Sender<SessionState>>,
    state_rx: watch::Receiver<SessionState>,
    jobs: mpsc::UnboundedSender<Job>,
    /// Keeps prologue order and queue order identical
    submit: Mutex<()>,
    shared: Arc<Shared>,
}

fn compare_and_set(
    tx: &watch::Sender<SessionState>,
    from: SessionState,
    to: SessionState,
) -> bool {
    tx.send_if_modified(|state| {
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    })
}

impl SessionCoordinator {
    /// Load the transcript, start the worker and, on a first launch, queue
    /// the greeting. Must be called inside a tokio runtime.
    pub fn new(deps: SessionDeps) -> Result<Self> {
        let history = deps.transcript.load_all()?;

        let greeting = match deps.greeting_prompt {
            Some(prompt) if history.is_empty() => match deps.transcript.flag(GREETED_FLAG) {
                Ok(false) => Some(prompt),
                Ok(true) => None,
                Err(e) => {
                    tracing::warn!("Could not read greeting flag: {}", e);
                    None
                }
            },
            _ => None,
        };

        let shared = Arc::new(Shared {
            messages: RwLock::new(history),
            ..Shared::default()
        });
        let (state_tx, state_rx) = watch::channel(SessionState::Ready);
        let state_tx = Arc::new(state_tx);
        let (jobs, job_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            state_tx: Arc::clone(&state_tx),
            shared: Arc::clone(&shared),
            runtime: deps.runtime,
            service: deps.service,
            transcript: deps.transcript,
        };
        tokio::spawn(worker.run(job_rx));

        let coordinator = Self {
            state_tx,
            state_rx,
            jobs,
            submit: Mutex::new(()),
            shared,
        };

        if let Some(prompt) = greeting {
            let _guard = lock(&coordinator.submit);
            coordinator.state_tx.send_replace(SessionState::Generating);
            coordinator.enqueue(Job::Greet(prompt))?;
        }

        Ok(coordinator)
    }

    fn enqueue(&self, job: Job) -> Result<()> {
        self.jobs
            .send(job)
            .map_err(|_| CoreError::Closed("chat session"))
    }

    /// Claim the session for a mutation and queue its epilogue.
    fn interrupt(&self, next: SessionState, job: Job) -> Result<()> {
        let _guard = self.claim(next)?;
        self.enqueue(job)
    }

    /// Move an interruptible session to `next`. The returned guard keeps
    /// later prologues out until the epilogue is queued.
    fn claim(&self, next: SessionState) -> Result<MutexGuard<'_, ()>> {
        let guard = lock(&self.submit);

        let mut rejected = None;
        self.state_tx.send_if_modified(|state| {
            if state.is_interruptible() {
                *state = next;
                true
            } else {
                rejected = Some(*state);
                false
            }
        });
        if let Some(state) = rejected {
            return Err(CoreError::NotInterruptible(state));
        }

        tracing::debug!("SESSION_STATE | {}", next);
        Ok(guard)
    }

    /// Clear the conversation. Runs after any in-flight generation.
    pub fn request_reset(&self) -> Result<()> {
        self.interrupt(SessionState::Resetting, Job::Reset)
    }

    /// Unload the model and drop the binding. `on_done` fires once the
    /// session is back in `Ready`.
    pub fn request_terminate(&self, on_done: oneshot::Sender<()>) -> Result<()> {
        self.interrupt(SessionState::Terminating, Job::Terminate(on_done))
    }

    /// Bind the session to another model. Returns `false` without doing
    /// anything when that exact model is already bound.
    pub fn request_reload(&self, descriptor: ModelDescriptor, path: PathBuf) -> Result<bool> {
        let unchanged = read_lock(&self.shared.binding)
            .as_ref()
            .map(|b| b.matches(&descriptor, &path))
            .unwrap_or(false);
        if unchanged {
            return Ok(false);
        }

        let _guard = self.claim(SessionState::Reloading)?;
        *write_lock(&self.shared.pending_reload) = Some(descriptor.model_id.clone());
        if let Err(e) = self.enqueue(Job::Reload { descriptor, path }) {
            *write_lock(&self.shared.pending_reload) = None;
            return Err(e);
        }
        Ok(true)
    }

    /// Send a prompt and wait for the reply.
    pub async fn generate(&self, prompt: impl Into<String>) -> Result<String> {
        let (reply, response) = oneshot::channel();
        {
            let _guard = lock(&self.submit);
            if !compare_and_set(&self.state_tx, SessionState::Ready, SessionState::Generating) {
                return Err(CoreError::NotChatable(self.state()));
            }
            let job = Job::Generate {
                prompt: prompt.into(),
                reply,
            };
            if let Err(e) = self.enqueue(job) {
                compare_and_set(&self.state_tx, SessionState::Generating, SessionState::Ready);
                return Err(e);
            }
        }

        response
            .await
            .map_err(|_| CoreError::Closed("chat session"))?
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn is_chatable(&self) -> bool {
        self.state().is_chatable()
    }

    pub fn is_interruptible(&self) -> bool {
        self.state().is_interruptible()
    }

    pub fn bound_model(&self) -> Option<Binding> {
        read_lock(&self.shared.binding).clone()
    }

    /// In-memory conversation, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        read_lock(&self.shared.messages).clone()
    }

    /// Last generation or activation failure.
    pub fn last_error(&self) -> Option<String> {
        read_lock(&self.shared.last_error).clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Wait until the state satisfies `pred`.
    pub async fn wait_for(&self, pred: impl FnMut(&SessionState) -> bool) -> Result<SessionState> {
        let mut rx = self.state_rx.clone();
        let state = rx
            .wait_for(pred)
            .await
            .map(|state| *state)
            .map_err(|_| CoreError::Closed("chat session"))?;
        Ok(state)
    }
}

#[async_trait]
impl SessionGate for SessionCoordinator {
    /// Also true for the target of a reload that is queued but not yet run.
    fn is_bound_to(&self, model_id: &str) -> bool {
        let bound = read_lock(&self.shared.binding)
            .as_ref()
            .map(|b| b.model_id == model_id)
            .unwrap_or(false);
        bound || read_lock(&self.shared.pending_reload).as_deref() == Some(model_id)
    }

    async fn terminate_bound(&self) -> Result<()> {
        loop {
            let (on_done, done) = oneshot::channel();
            match self.request_terminate(on_done) {
                Ok(()) => {
                    return done.await.map_err(|_| CoreError::Closed("chat session"));
                }
                Err(CoreError::NotInterruptible(state)) => {
                    tracing::debug!("Session busy ({}), waiting to terminate", state);
                    self.wait_for(SessionState::is_interruptible).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

struct Worker {
    state_tx: Arc<watch::Sender<SessionState>>,
    shared: Arc<Shared>,
    runtime: Arc<dyn ModelRuntime>,
    service: Arc<dyn CompletionService>,
    transcript: Arc<dyn TranscriptStore>,
}

impl Worker {
    async fn run(self, mut jobs: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = jobs.recv().await {
            match job {
                Job::Reset => self.reset(),
                Job::Terminate(on_done) => {
                    self.terminate();
                    let _ = on_done.send(());
                }
                Job::Reload { descriptor, path } => self.reload(descriptor, path),
                Job::Generate { prompt, reply } => {
                    let result = self.generate(prompt).await;
                    let _ = reply.send(result);
                }
                Job::Greet(prompt) => self.greet(prompt).await,
            }
        }
        tracing::debug!("Session worker stopped");
    }

    fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
        tracing::debug!("SESSION_STATE | {}", state);
    }

    /// Append to memory and the transcript. Transcript failures are logged,
    /// not fatal to the conversation.
    fn record(&self, message: Message) {
        if let Err(e) = self.transcript.append(&message) {
            tracing::warn!("TRANSCRIPT_APPEND_FAILED | role={} error={}", message.role, e);
        }
        write_lock(&self.shared.messages).push(message);
    }

    fn archive_and_clear(&self) {
        if let Err(e) = self.transcript.snapshot() {
            tracing::warn!("TRANSCRIPT_SNAPSHOT_FAILED | error={}", e);
        }
        if let Err(e) = self.transcript.clear_all() {
            tracing::warn!("TRANSCRIPT_CLEAR_FAILED | error={}", e);
        }
        write_lock(&self.shared.messages).clear();
    }

    fn reset(&self) {
        if let Err(e) = self.runtime.reset() {
            tracing::warn!("Runtime reset failed: {}", e);
        }
        self.archive_and_clear();
        self.record(Message::assistant(CLEARED_NOTICE));
        tracing::info!("SESSION_RESET");
        self.set_state(SessionState::Ready);
    }

    fn terminate(&self) {
        if let Err(e) = self.runtime.unload() {
            tracing::warn!("Runtime unload failed: {}", e);
        }
        self.archive_and_clear();
        let previous = write_lock(&self.shared.binding).take();
        tracing::info!(
            "SESSION_TERMINATED | model={}",
            previous.map(|b| b.model_id).unwrap_or_else(|| "-".to_string())
        );
        self.set_state(SessionState::Ready);
    }

    fn reload(&self, descriptor: ModelDescriptor, path: PathBuf) {
        self.archive_and_clear();
        *write_lock(&self.shared.binding) = Some(Binding {
            model_id: descriptor.model_id.clone(),
            model_lib: descriptor.model_lib.clone(),
            path: path.clone(),
        });
        *write_lock(&self.shared.pending_reload) = None;

        if let Err(e) = self.runtime.unload() {
            tracing::warn!("Runtime unload failed: {}", e);
        }

        match self.runtime.activate(&descriptor, &path) {
            Ok(()) => {
                *write_lock(&self.shared.last_error) = None;
                tracing::info!("SESSION_RELOADED | model={}", descriptor.model_id);
                self.set_state(SessionState::Ready);
            }
            Err(e) => {
                tracing::error!("SESSION_RELOAD_FAILED | model={} error={}", descriptor.model_id, e);
                *write_lock(&self.shared.binding) = None;
                *write_lock(&self.shared.last_error) = Some(e.to_string());
                self.set_state(SessionState::Failed);
            }
        }
    }

    async fn generate(&self, prompt: String) -> Result<String> {
        let history: Vec<Message> = read_lock(&self.shared.messages)
            .iter()
            .filter(|m| m.is_turn())
            .cloned()
            .collect();
        self.record(Message::user(prompt.clone()));

        match self.service.complete(&history, &prompt).await {
            Ok(text) => {
                self.record(Message::assistant(text.clone()));
                compare_and_set(&self.state_tx, SessionState::Generating, SessionState::Ready);
                Ok(text)
            }
            Err(e) => {
                tracing::warn!("GENERATION_FAILED | error={}", e);
                *write_lock(&self.shared.last_error) = Some(e.to_string());
                compare_and_set(&self.state_tx, SessionState::Generating, SessionState::Failed);
                Err(CoreError::Service(e))
            }
        }
    }

    async fn greet(&self, prompt: String) {
        match self.service.complete(&[], &prompt).await {
            Ok(text) => {
                self.record(Message::assistant(text));
                if let Err(e) = self.transcript.set_flag(GREETED_FLAG) {
                    tracing::warn!("Could not persist greeting flag: {}", e);
                }
                tracing::info!("SESSION_GREETED");
            }
            Err(e) => tracing::warn!("Greeting failed, will retry next launch: {}", e),
        }
        compare_and_set(&self.state_tx, SessionState::Generating, SessionState::Ready);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::session::runtime::DirectoryRuntime;
    use crate::session::transcript::MemoryTranscriptStore;
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl CompletionService for Echo {
        async fn complete(&self, _history: &[Message], prompt: &str) -> std::result::Result<String, ServiceError> {
            Ok(format!("echo: {}", prompt))
        }
    }

    fn deps(transcript: Arc<MemoryTranscriptStore>, greeting: Option<&str>) -> SessionDeps {
        SessionDeps {
            runtime: Arc::new(DirectoryRuntime::new()),
            service: Arc::new(Echo),
            transcript,
            greeting_prompt: greeting.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_history_seeded_from_transcript() {
        let store = Arc::new(MemoryTranscriptStore::with_messages(vec![
            Message::user("before"),
            Message::assistant("restart"),
        ]));
        let session = SessionCoordinator::new(deps(store, Some("greet me"))).unwrap();
        assert_eq!(session.messages().len(), 2);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_greeting_runs_once() {
        let store = Arc::new(MemoryTranscriptStore::new());
        let session = SessionCoordinator::new(deps(store.clone(), Some("hello there"))).unwrap();
        tokio::time::timeout(Duration::from_secs(2), session.wait_for(|s| *s == SessionState::Ready))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.messages()[0].content, "echo: hello there");
        assert!(store.flag(GREETED_FLAG).unwrap());

        store.clear_all().unwrap();
        let again = SessionCoordinator::new(deps(store, Some("hello there"))).unwrap();
        assert_eq!(again.state(), SessionState::Ready);
        assert!(again.messages().is_empty());
    }

    #[tokio::test]
    async fn test_reset_appends_cleared_notice_and_snapshots() {
        let store = Arc::new(MemoryTranscriptStore::new());
        let session = SessionCoordinator::new(deps(store.clone(), None)).unwrap();
        session.generate("one").await.unwrap();

        session.request_reset().unwrap();
        session.wait_for(|s| *s == SessionState::Ready).await.unwrap();

        let messages = session.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, CLEARED_NOTICE);
        assert_eq!(store.snapshots().len(), 1);
        assert_eq!(store.load_all().unwrap().len(), 1);
    }
}
