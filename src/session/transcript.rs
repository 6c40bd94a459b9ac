// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transcript persistence.
//!
//! The session treats the transcript as an opaque append-only log. The file
//! store keeps it as JSON lines under an fs2 lock, archives it as a snapshot
//! before each clear, and keeps small boolean flags in `meta.json`.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::model::descriptor::write_atomic;
use crate::sync::{read_lock, write_lock};
use crate::types::Message;

const TRANSCRIPT_FILENAME: &str = "transcript.jsonl";
const META_FILENAME: &str = "meta.json";
const SNAPSHOT_DIRNAME: &str = "snapshots";

/// Storage behind the chat session.
pub trait TranscriptStore: Send + Sync {
    fn append(&self, message: &Message) -> Result<()>;

    fn load_all(&self) -> Result<Vec<Message>>;

    fn clear_all(&self) -> Result<()>;

    /// Archive the current transcript before it is cleared. Returns an
    /// identifier for the archive, or `None` if nothing was archived.
    fn snapshot(&self) -> Result<Option<String>> {
        Ok(None)
    }

    fn flag(&self, key: &str) -> Result<bool>;

    fn set_flag(&self, key: &str) -> Result<()>;
}

/// An archived transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSnapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
    pub messages: Vec<Message>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Meta {
    #[serde(default)]
    flags: BTreeMap<String, bool>,
}

/// JSON-lines transcript in a directory.
#[derive(Debug, Clone)]
pub struct FileTranscriptStore {
    dir: PathBuf,
}

impl FileTranscriptStore {
    /// Open (creating if needed) the store in `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| CoreError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn transcript_path(&self) -> PathBuf {
        self.dir.join(TRANSCRIPT_FILENAME)
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILENAME)
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_DIRNAME)
    }

    /// Archived transcripts, oldest first.
    pub fn list_snapshots(&self) -> Result<Vec<TranscriptSnapshot>> {
        let dir = self.snapshot_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| CoreError::io(&dir, e))? {
            let path = entry.map_err(|e| CoreError::io(&dir, e))?.path();
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                match fs::read_to_string(&path)
                    .ok()
                    .and_then(|s| serde_json::from_str::<TranscriptSnapshot>(&s).ok())
                {
                    Some(snapshot) => snapshots.push(snapshot),
                    None => tracing::warn!("Skipping unreadable snapshot {:?}", path),
                }
            }
        }
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(snapshots)
    }

    fn read_meta(&self) -> Result<Meta> {
        let path = self.meta_path();
        match fs::read_to_string(&path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Meta::default()),
            Err(e) => Err(CoreError::io(&path, e)),
        }
    }
}

impl TranscriptStore for FileTranscriptStore {
    fn append(&self, message: &Message) -> Result<()> {
        let path = self.transcript_path();
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CoreError::io(&path, e))?;
        FileExt::lock_exclusive(&file).map_err(|e| CoreError::io(&path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| CoreError::io(&path, e))?;
        file.sync_data().map_err(|e| CoreError::io(&path, e))?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<Message>> {
        let path = self.transcript_path();
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CoreError::io(&path, e)),
        };
        FileExt::lock_shared(&file).map_err(|e| CoreError::io(&path, e))?;

        let mut messages = Vec::new();
        for (n, line) in BufReader::new(&file).lines().enumerate() {
            let line = line.map_err(|e| CoreError::io(&path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(&line) {
                Ok(message) => messages.push(message),
                Err(e) => tracing::warn!("Skipping malformed transcript line {}: {}", n + 1, e),
            }
        }
        Ok(messages)
    }

    fn clear_all(&self) -> Result<()> {
        let path = self.transcript_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::io(&path, e)),
        }
    }

    fn snapshot(&self) -> Result<Option<String>> {
        let messages = self.load_all()?;
        if messages.is_empty() {
            return Ok(None);
        }

        let dir = self.snapshot_dir();
        fs::create_dir_all(&dir).map_err(|e| CoreError::io(&dir, e))?;

        let now = Utc::now();
        let base_id = format!("conv_{}", now.timestamp_millis());
        let mut id = base_id.clone();
        let mut suffix = 1;
        while dir.join(format!("{}.json", id)).exists() {
            id = format!("{}_{}", base_id, suffix);
            suffix += 1;
        }

        let snapshot = TranscriptSnapshot {
            id,
            created_at: now,
            message_count: messages.len(),
            messages,
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        write_atomic(&dir.join(format!("{}.json", snapshot.id)), &bytes)?;

        tracing::info!(
            "TRANSCRIPT_SNAPSHOT | id={} messages={}",
            snapshot.id,
            snapshot.message_count
        );
        Ok(Some(snapshot.id))
    }

    fn flag(&self, key: &str) -> Result<bool> {
        Ok(self.read_meta()?.flags.get(key).copied().unwrap_or(false))
    }

    fn set_flag(&self, key: &str) -> Result<()> {
        let mut meta = self.read_meta()?;
        meta.flags.insert(key.to_string(), true);
        write_atomic(&self.meta_path(), &serde_json::to_vec_pretty(&meta)?)
    }
}

/// Transcript kept in memory. Snapshots are retained for inspection.
#[derive(Debug, Default)]
pub struct MemoryTranscriptStore {
    messages: RwLock<Vec<Message>>,
    flags: RwLock<HashSet<String>>,
    snapshots: RwLock<Vec<Vec<Message>>>,
}

impl MemoryTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an existing transcript.
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages: RwLock::new(messages),
            ..Self::default()
        }
    }

    pub fn snapshots(&self) -> Vec<Vec<Message>> {
        read_lock(&self.snapshots).clone()
    }
}

impl TranscriptStore for MemoryTranscriptStore {
    fn append(&self, message: &Message) -> Result<()> {
        write_lock(&self.messages).push(message.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<Message>> {
        Ok(read_lock(&self.messages).clone())
    }

    fn clear_all(&self) -> Result<()> {
        write_lock(&self.messages).clear();
        Ok(())
    }

    fn snapshot(&self) -> Result<Option<String>> {
        let messages = read_lock(&self.messages).clone();
        if messages.is_empty() {
            return Ok(None);
        }
        let mut snapshots = write_lock(&self.snapshots);
        snapshots.push(messages);
        Ok(Some(format!("memory_{}", snapshots.len())))
    }

    fn flag(&self, key: &str) -> Result<bool> {
        Ok(read_lock(&self.flags).contains(key))
    }

    fn set_flag(&self, key: &str) -> Result<()> {
        write_lock(&self.flags).insert(key.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_store_append_and_load() {
        let dir = TempDir::new().unwrap();
        let store = FileTranscriptStore::open(dir.path()).unwrap();
        assert!(store.load_all().unwrap().is_empty());

        store.append(&Message::user("hi")).unwrap();
        store.append(&Message::assistant("hello")).unwrap();

        let reopened = FileTranscriptStore::open(dir.path()).unwrap();
        let messages = reopened.load_all().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "hello");
    }

    #[test]
    fn test_file_store_skips_malformed_lines() {
        let dir = TempDir::new().unwrap();
        let store = FileTranscriptStore::open(dir.path()).unwrap();
        store.append(&Message::user("one")).unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join(TRANSCRIPT_FILENAME))
            .unwrap();
        writeln!(file, "{{not json").unwrap();
        store.append(&Message::user("two")).unwrap();

        let contents: Vec<_> = store
            .load_all()
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["one", "two"]);
    }

    #[test]
    fn test_snapshot_then_clear() {
        let dir = TempDir::new().unwrap();
        let store = FileTranscriptStore::open(dir.path()).unwrap();
        assert_eq!(store.snapshot().unwrap(), None);

        store.append(&Message::user("keep me")).unwrap();
        let id = store.snapshot().unwrap().unwrap();
        store.clear_all().unwrap();

        assert!(store.load_all().unwrap().is_empty());
        let snapshots = store.list_snapshots().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].id, id);
        assert_eq!(snapshots[0].messages[0].content, "keep me");
    }

    #[test]
    fn test_back_to_back_snapshots_are_all_kept() {
        let dir = TempDir::new().unwrap();
        let store = FileTranscriptStore::open(dir.path()).unwrap();
        store.append(&Message::user("same millisecond")).unwrap();

        let ids: HashSet<String> = (0..5).map(|_| store.snapshot().unwrap().unwrap()).collect();
        assert_eq!(ids.len(), 5);
        assert_eq!(store.list_snapshots().unwrap().len(), 5);
    }

    #[test]
    fn test_flags_persist() {
        let dir = TempDir::new().unwrap();
        let store = FileTranscriptStore::open(dir.path()).unwrap();
        assert!(!store.flag("greeted").unwrap());
        store.set_flag("greeted").unwrap();
        let reopened = FileTranscriptStore::open(dir.path()).unwrap();
        assert!(reopened.flag("greeted").unwrap());
        assert!(!reopened.flag("other").unwrap());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryTranscriptStore::new();
        store.append(&Message::user("a")).unwrap();
        assert_eq!(store.snapshot().unwrap().as_deref(), Some("memory_1"));
        store.clear_all().unwrap();
        assert!(store.load_all().unwrap().is_empty());
        assert_eq!(store.snapshots().len(), 1);
    }
}
