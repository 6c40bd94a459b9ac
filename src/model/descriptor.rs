// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Model descriptor and file manifest.

use std::collections::HashSet;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use crate::config::ModelRecord;
use crate::error::{CoreError, FetchError, Result};

/// Descriptor file name, both remotely and in the model directory.
pub const MODEL_CONFIG_FILENAME: &str = "model-config.json";

/// Shard manifest file name, both remotely and in the model directory.
pub const PARAMS_CONFIG_FILENAME: &str = "tensor-cache.json";

/// Path segment between a repository root and its files.
pub const MODEL_URL_SUFFIX: &str = "resolve/main/";

/// Ensure a repository URL ends with a slash.
pub fn normalize_base_url(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    }
}

/// URL of `rel` inside the repository rooted at `base_url`.
pub fn resolve_url(base_url: &str, rel: &str) -> String {
    format!("{}{}{}", normalize_base_url(base_url), MODEL_URL_SUFFIX, rel)
}

/// A model identifier doubles as a directory name, so it must be one path
/// component.
pub fn validate_identifier(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && !id.contains(['/', '\\'])
        && !id.chars().any(char::is_control);
    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidIdentifier(id.to_string()))
    }
}

/// What a model is and how to run it.
///
/// Parsed from `model-config.json`. The identifier, library and VRAM hint
/// come from the catalog record, not the remote file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub model_lib: String,
    #[serde(default)]
    pub estimated_vram_bytes: Option<u64>,
    #[serde(default)]
    pub tokenizer_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window_size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefill_chunk_size: Option<i64>,
    /// Repository root; carried by the catalog, never by the file.
    #[serde(skip)]
    pub model_url: String,
}

impl ModelDescriptor {
    /// Parse descriptor bytes and apply the catalog record on top.
    pub fn parse(bytes: &[u8], record: &ModelRecord) -> std::result::Result<Self, FetchError> {
        let mut descriptor: ModelDescriptor = serde_json::from_slice(bytes)
            .map_err(|e| FetchError::malformed(MODEL_CONFIG_FILENAME, e))?;
        descriptor.apply_record(record);
        Ok(descriptor)
    }

    /// Load the descriptor stored in a model directory.
    pub fn load(dir: &Path, record: &ModelRecord) -> Result<Self> {
        let path = dir.join(MODEL_CONFIG_FILENAME);
        let bytes = std::fs::read(&path).map_err(|e| CoreError::io(&path, e))?;
        Ok(Self::parse(&bytes, record)?)
    }

    /// Write the descriptor into `dir`, creating it if needed.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir).map_err(|e| CoreError::io(dir, e))?;
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(&dir.join(MODEL_CONFIG_FILENAME), &bytes)
    }

    fn apply_record(&mut self, record: &ModelRecord) {
        self.model_id = record.model_id.clone();
        self.model_lib = record.model_lib.clone();
        if record.estimated_vram_bytes.is_some() {
            self.estimated_vram_bytes = record.estimated_vram_bytes;
        }
        self.model_url = normalize_base_url(&record.model_url);
    }

    /// Catalog record describing this model.
    pub fn record(&self) -> ModelRecord {
        ModelRecord {
            model_url: self.model_url.clone(),
            model_id: self.model_id.clone(),
            estimated_vram_bytes: self.estimated_vram_bytes,
            model_lib: self.model_lib.clone(),
        }
    }
}

/// Write `bytes` to `path` through a sibling temp file and a rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    use std::io::Write;

    let temp_path = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&temp_path).map_err(|e| CoreError::io(&temp_path, e))?;
        file.write_all(bytes).map_err(|e| CoreError::io(&temp_path, e))?;
        file.sync_all().map_err(|e| CoreError::io(&temp_path, e))?;
    }
    std::fs::rename(&temp_path, path).map_err(|e| CoreError::io(path, e))
}

#[derive(Debug, Deserialize)]
struct ParamsRecord {
    #[serde(rename = "dataPath")]
    data_path: String,
}

#[derive(Debug, Deserialize)]
struct ParamsConfig {
    #[serde(default)]
    records: Vec<ParamsRecord>,
}

/// Ordered set of relative paths a model needs on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileManifest {
    entries: Vec<String>,
}

impl FileManifest {
    /// Build a manifest, dropping duplicates and keeping first occurrence
    /// order. Entries must be relative, stay inside the model directory and
    /// name a file. `.` segments are dropped, so `./a.bin` and `a.bin` are the
    /// same entry.
    pub fn new(entries: Vec<String>) -> std::result::Result<Self, FetchError> {
        let mut seen = HashSet::new();
        let mut kept = Vec::with_capacity(entries.len());

        for entry in entries {
            let normalized = normalize_entry(&entry)?;
            if seen.insert(normalized.clone()) {
                kept.push(normalized);
            }
        }

        Ok(Self { entries: kept })
    }

    /// Tokenizer files from the descriptor followed by every shard listed in
    /// `tensor-cache.json`.
    pub fn from_parts(
        descriptor: &ModelDescriptor,
        params_bytes: &[u8],
    ) -> std::result::Result<Self, FetchError> {
        let params: ParamsConfig = serde_json::from_slice(params_bytes)
            .map_err(|e| FetchError::malformed(PARAMS_CONFIG_FILENAME, e))?;

        let entries = descriptor
            .tokenizer_files
            .iter()
            .cloned()
            .chain(params.records.into_iter().map(|r| r.data_path))
            .collect();
        Self::new(entries)
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `rel` is one of the manifest files.
    pub fn contains(&self, rel: &str) -> bool {
        self.entries.iter().any(|e| e == rel)
    }
}

/// Reduce a manifest entry to its normal components joined by `/`.
fn normalize_entry(entry: &str) -> std::result::Result<String, FetchError> {
    let mut parts = Vec::new();
    for component in Path::new(entry).components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => {
                    return Err(FetchError::malformed(
                        "manifest",
                        format!("entry {:?} is not valid UTF-8", entry),
                    ))
                }
            },
            Component::CurDir => {}
            _ => {
                return Err(FetchError::malformed(
                    "manifest",
                    format!("entry {:?} escapes the model directory", entry),
                ))
            }
        }
    }
    if parts.is_empty() {
        return Err(FetchError::malformed(
            "manifest",
            format!("entry {:?} does not name a file", entry),
        ));
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DESCRIPTOR: &str = r#"{
        "model_id": "remote-name",
        "model_lib": "remote_lib",
        "tokenizer_files": ["tokenizer.json", "tokenizer_config.json"],
        "context_window_size": 4096,
        "prefill_chunk_size": -1
    }"#;

    fn record() -> ModelRecord {
        ModelRecord {
            model_url: "https://huggingface.co/org/model".to_string(),
            model_id: "local-name".to_string(),
            estimated_vram_bytes: Some(3_000_000_000),
            model_lib: "local_lib".to_string(),
        }
    }

    #[test]
    fn test_parse_applies_record() {
        let d = ModelDescriptor::parse(DESCRIPTOR.as_bytes(), &record()).unwrap();
        assert_eq!(d.model_id, "local-name");
        assert_eq!(d.model_lib, "local_lib");
        assert_eq!(d.estimated_vram_bytes, Some(3_000_000_000));
        assert_eq!(d.model_url, "https://huggingface.co/org/model/");
        assert_eq!(d.context_window_size, Some(4096));
        assert_eq!(d.prefill_chunk_size, Some(-1));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = ModelDescriptor::parse(b"not json", &record()).unwrap_err();
        assert!(matches!(err, FetchError::Malformed { .. }));
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let d = ModelDescriptor::parse(DESCRIPTOR.as_bytes(), &record()).unwrap();
        d.save(dir.path()).unwrap();
        let loaded = ModelDescriptor::load(dir.path(), &record()).unwrap();
        assert_eq!(loaded, d);
        assert!(!dir.path().join("model-config.tmp").exists());
    }

    #[test]
    fn test_manifest_from_parts_orders_tokenizers_first() {
        let d = ModelDescriptor::parse(DESCRIPTOR.as_bytes(), &record()).unwrap();
        let params = br#"{"records":[{"dataPath":"params_shard_0.bin"},{"dataPath":"params_shard_1.bin"}]}"#;
        let manifest = FileManifest::from_parts(&d, params).unwrap();
        assert_eq!(
            manifest.entries(),
            &[
                "tokenizer.json",
                "tokenizer_config.json",
                "params_shard_0.bin",
                "params_shard_1.bin"
            ]
        );
    }

    #[test]
    fn test_manifest_dedups_and_rejects_escape() {
        let m = FileManifest::new(vec!["a".into(), "b".into(), "a".into()]).unwrap();
        assert_eq!(m.len(), 2);
        assert!(FileManifest::new(vec!["../etc/passwd".into()]).is_err());
        assert!(FileManifest::new(vec!["/abs".into()]).is_err());
    }

    #[test]
    fn test_manifest_rejects_entries_naming_the_directory() {
        for entry in ["", ".", "./", "./."] {
            let err = FileManifest::new(vec!["a.bin".into(), entry.into()]).unwrap_err();
            assert!(matches!(err, FetchError::Malformed { .. }), "{:?} accepted", entry);
        }
    }

    #[test]
    fn test_manifest_dedups_current_dir_spellings() {
        let m = FileManifest::new(vec![
            "a.bin".into(),
            "./a.bin".into(),
            "sub/./b.bin".into(),
            "sub/b.bin".into(),
        ])
        .unwrap();
        assert_eq!(m.entries(), &["a.bin".to_string(), "sub/b.bin".to_string()]);
        assert!(m.contains("a.bin"));
    }

    #[test]
    fn test_resolve_url() {
        assert_eq!(
            resolve_url("https://h/m", "tokenizer.json"),
            "https://h/m/resolve/main/tokenizer.json"
        );
        assert_eq!(
            resolve_url("https://h/m/", MODEL_CONFIG_FILENAME),
            "https://h/m/resolve/main/model-config.json"
        );
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("Llama-3-8B-q4f16_1").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("..").is_err());
        assert!(validate_identifier("a/b").is_err());
    }
}
