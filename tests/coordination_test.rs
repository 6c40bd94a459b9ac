// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Registry and session coordination tests
//!
//! A destructive operation on the model the chat session is bound to must
//! tear the session down before any file disappears. Registration must keep
//! identifiers unique under concurrent callers.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use modelhost::model::descriptor::{resolve_url, MODEL_CONFIG_FILENAME, PARAMS_CONFIG_FILENAME};
use modelhost::{
    AcquisitionState, AppConfig, CompletionService, CoreError, MemorySource,
    MemoryTranscriptStore, Message, ModelAcquisition, ModelDescriptor, ModelRecord,
    ModelRuntime, Registry, ServiceError, SessionCoordinator, SessionDeps, SessionGate,
    SessionState,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);
const LIB: &str = "tiny_q4f16_1";

// =============================================================================
// TEST DOUBLES
// =============================================================================

/// Runtime that records, at each unload, whether the active model's
/// directory was still on disk.
#[derive(Default)]
struct ObservingRuntime {
    active: Mutex<Option<PathBuf>>,
    unloads: Mutex<Vec<(PathBuf, bool)>>,
}

impl ObservingRuntime {
    fn unloads(&self) -> Vec<(PathBuf, bool)> {
        self.unloads.lock().unwrap().clone()
    }

    fn forget_unloads(&self) {
        self.unloads.lock().unwrap().clear();
    }
}

impl ModelRuntime for ObservingRuntime {
    fn activate(&self, _descriptor: &ModelDescriptor, path: &Path) -> modelhost::Result<()> {
        *self.active.lock().unwrap() = Some(path.to_path_buf());
        Ok(())
    }

    fn reset(&self) -> modelhost::Result<()> {
        Ok(())
    }

    fn unload(&self) -> modelhost::Result<()> {
        if let Some(path) = self.active.lock().unwrap().take() {
            let exists = path.exists();
            self.unloads.lock().unwrap().push((path, exists));
        }
        Ok(())
    }
}

/// Completion service that answers once a permit is released.
struct Held(Arc<Semaphore>);

#[async_trait]
impl CompletionService for Held {
    async fn complete(&self, _history: &[Message], prompt: &str) -> Result<String, ServiceError> {
        self.0.acquire().await.unwrap().forget();
        Ok(format!("re: {}", prompt))
    }
}

struct Fixture {
    home: TempDir,
    source: Arc<MemorySource>,
    runtime: Arc<ObservingRuntime>,
    gate: Arc<Semaphore>,
    session: Arc<SessionCoordinator>,
    registry: Registry,
}

fn base(id: &str) -> String {
    format!("mem://hub/org/{}/", id)
}

fn record(id: &str) -> ModelRecord {
    ModelRecord {
        model_url: base(id),
        model_id: id.to_string(),
        estimated_vram_bytes: None,
        model_lib: LIB.to_string(),
    }
}

fn publish(source: &MemorySource, id: &str) {
    let base = base(id);
    source.insert(
        resolve_url(&base, MODEL_CONFIG_FILENAME),
        r#"{"tokenizer_files":["tokenizer.json"]}"#,
    );
    source.insert(
        resolve_url(&base, PARAMS_CONFIG_FILENAME),
        r#"{"records":[{"dataPath":"params_shard_0.bin"}]}"#,
    );
    source.insert(resolve_url(&base, "tokenizer.json"), "{}");
    source.insert(resolve_url(&base, "params_shard_0.bin"), "weights");
}

fn fixture(source: MemorySource) -> Fixture {
    let home = TempDir::new().unwrap();
    let source = Arc::new(source);
    let runtime = Arc::new(ObservingRuntime::default());
    let gate = Arc::new(Semaphore::new(0));

    let session = Arc::new(
        SessionCoordinator::new(SessionDeps {
            runtime: runtime.clone(),
            service: Arc::new(Held(Arc::clone(&gate))),
            transcript: Arc::new(MemoryTranscriptStore::new()),
            greeting_prompt: None,
        })
        .unwrap(),
    );

    let mut config = AppConfig::default();
    config.model_libs.push(LIB.to_string());
    let registry = Registry::new(home.path(), config, source.clone(), session.clone());

    Fixture {
        home,
        source,
        runtime,
        gate,
        session,
        registry,
    }
}

/// Register, download and bind `id`.
async fn ready_model(fx: &Fixture, id: &str) -> Arc<ModelAcquisition> {
    publish(&fx.source, id);
    let model = fx.registry.add_model(record(id)).await.unwrap();
    model.start().await.unwrap();
    timeout(TEST_TIMEOUT, model.wait_for(|s| s.state == AcquisitionState::Finished))
        .await
        .unwrap()
        .unwrap();
    model
}

async fn bind(fx: &Fixture, model: &ModelAcquisition) {
    assert!(fx
        .session
        .request_reload(model.descriptor().clone(), model.dir().to_path_buf())
        .unwrap());
    timeout(TEST_TIMEOUT, fx.session.wait_for(|s| *s == SessionState::Ready))
        .await
        .unwrap()
        .unwrap();
    assert!(fx.session.is_bound_to(model.model_id()));
    fx.runtime.forget_unloads();
}

// =============================================================================
// TEARDOWN ORDER
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_bound_model_terminates_session_first() {
    let fx = fixture(MemorySource::new());
    let model = ready_model(&fx, "tiny").await;
    bind(&fx, &model).await;
    let dir = model.dir().to_path_buf();

    fx.registry.delete_model("tiny").await.unwrap();

    assert_eq!(fx.runtime.unloads(), vec![(dir.clone(), true)]);
    assert!(fx.session.bound_model().is_none());
    assert_eq!(fx.session.state(), SessionState::Ready);
    assert!(!dir.exists());
    assert!(!fx.registry.contains("tiny"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_clear_bound_model_terminates_session() {
    let fx = fixture(MemorySource::new());
    let model = ready_model(&fx, "tiny").await;
    bind(&fx, &model).await;

    model.clear().await.unwrap();

    assert_eq!(fx.runtime.unloads().len(), 1);
    assert!(fx.runtime.unloads()[0].1);
    assert!(fx.session.bound_model().is_none());
    assert_eq!(model.state(), AcquisitionState::Paused);
    assert!(model.dir().join(MODEL_CONFIG_FILENAME).is_file());
    assert!(!model.dir().join("params_shard_0.bin").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_other_model_keeps_session() {
    let fx = fixture(MemorySource::new());
    let bound = ready_model(&fx, "tiny").await;
    let other = ready_model(&fx, "other").await;
    bind(&fx, &bound).await;

    fx.registry.delete_model("other").await.unwrap();

    assert!(fx.runtime.unloads().is_empty());
    assert!(fx.session.is_bound_to("tiny"));
    assert!(!other.dir().exists());
    assert!(bound.dir().exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_waits_for_running_generation() {
    let fx = fixture(MemorySource::new());
    let model = ready_model(&fx, "tiny").await;
    bind(&fx, &model).await;
    let dir = model.dir().to_path_buf();

    let generation = {
        let session = Arc::clone(&fx.session);
        tokio::spawn(async move { session.generate("hello?").await })
    };
    timeout(TEST_TIMEOUT, fx.session.wait_for(|s| *s == SessionState::Generating))
        .await
        .unwrap()
        .unwrap();

    let deleting = {
        let model = Arc::clone(&model);
        tokio::spawn(async move { model.delete().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!deleting.is_finished());
    assert!(dir.exists(), "files must outlive the generation using them");

    fx.gate.add_permits(1);
    let reply = timeout(TEST_TIMEOUT, generation).await.unwrap().unwrap().unwrap();
    assert_eq!(reply, "re: hello?");
    timeout(TEST_TIMEOUT, deleting).await.unwrap().unwrap().unwrap();

    assert!(!dir.exists());
    assert_eq!(fx.runtime.unloads(), vec![(dir, true)]);
    assert!(fx.session.bound_model().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_waits_for_queued_reload_of_same_model() {
    let fx = fixture(MemorySource::new());
    let model = ready_model(&fx, "tiny").await;
    let dir = model.dir().to_path_buf();

    let generation = {
        let session = Arc::clone(&fx.session);
        tokio::spawn(async move { session.generate("first").await })
    };
    timeout(TEST_TIMEOUT, fx.session.wait_for(|s| *s == SessionState::Generating))
        .await
        .unwrap()
        .unwrap();

    // Accepted, but queued behind the running generation.
    assert!(fx
        .session
        .request_reload(model.descriptor().clone(), dir.clone())
        .unwrap());
    assert_eq!(fx.session.state(), SessionState::Reloading);
    assert!(fx.session.bound_model().is_none());
    assert!(fx.session.is_bound_to("tiny"));

    let deleting = {
        let model = Arc::clone(&model);
        tokio::spawn(async move { model.delete().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!deleting.is_finished());
    assert!(dir.exists());

    fx.gate.add_permits(1);
    timeout(TEST_TIMEOUT, generation).await.unwrap().unwrap().unwrap();
    timeout(TEST_TIMEOUT, deleting).await.unwrap().unwrap().unwrap();

    // The reload ran against intact files and was torn down before removal.
    assert_eq!(fx.runtime.unloads(), vec![(dir.clone(), true)]);
    assert!(!dir.exists());
    assert!(fx.session.bound_model().is_none());
    assert!(!fx.session.is_bound_to("tiny"));
    assert_eq!(fx.session.state(), SessionState::Ready);
}

// =============================================================================
// REGISTRATION
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicate_registration() {
    let fx = fixture(MemorySource::new().with_delay(Duration::from_millis(20)));
    publish(&fx.source, "tiny");
    let registry = Arc::new(fx.registry);

    let attempts: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.add_model(record("tiny")).await })
        })
        .collect();

    let mut ok = 0;
    for attempt in attempts {
        match timeout(TEST_TIMEOUT, attempt).await.unwrap().unwrap() {
            Ok(_) => ok += 1,
            Err(CoreError::DuplicateIdentifier(id)) => assert_eq!(id, "tiny"),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(ok, 1);
    assert_eq!(registry.len(), 1);
    let catalog = AppConfig::load(fx.home.path()).unwrap();
    assert_eq!(catalog.model_list.len(), 1);
    assert_eq!(catalog.model_list[0], record("tiny"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restored_catalog_resumes_download() {
    let fx = fixture(MemorySource::new());
    publish(&fx.source, "tiny");
    let tokenizer = resolve_url(&base("tiny"), "tokenizer.json");
    let shard = resolve_url(&base("tiny"), "params_shard_0.bin");
    fx.source.fail(shard.clone());

    let model = fx.registry.add_model(record("tiny")).await.unwrap();
    model.start().await.unwrap();
    let snapshot = timeout(TEST_TIMEOUT, model.wait_for(|s| s.state == AcquisitionState::Paused))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.progress(), (1, 2));
    drop(model);
    drop(fx.registry);

    fx.source.heal(&shard);
    let config = AppConfig::load(fx.home.path()).unwrap();
    let restored = Registry::new(
        fx.home.path(),
        config,
        fx.source.clone(),
        fx.session.clone() as Arc<dyn SessionGate>,
    );
    assert!(restored.restore().await.is_empty());

    let model = restored.get("tiny").unwrap();
    assert_eq!(model.progress(), (1, 2));
    model.start().await.unwrap();
    timeout(TEST_TIMEOUT, model.wait_for(|s| s.state == AcquisitionState::Finished))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fx.source.fetch_count(&tokenizer), 1);
}
