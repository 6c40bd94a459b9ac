// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Which manifest files are on disk, and which still need fetching.

use std::path::Path;

use crate::model::descriptor::{resolve_url, FileManifest};

use super::types::TaskDescriptor;

/// Result of one index pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexReport {
    /// Manifest entries already present on disk
    pub present: usize,
    /// Manifest size
    pub total: usize,
    /// One task per missing entry, in manifest order
    pub pending: Vec<TaskDescriptor>,
}

impl IndexReport {
    pub fn is_complete(&self) -> bool {
        self.present == self.total
    }
}

/// Stateless scanner over a model directory.
pub struct AssetIndex;

impl AssetIndex {
    /// Check every manifest entry against `dir`.
    ///
    /// Only existence is tested. Completed transfers are renamed into place
    /// atomically, so a present file is a complete file.
    pub fn scan(manifest: &FileManifest, base_url: &str, dir: &Path) -> IndexReport {
        let mut report = IndexReport {
            total: manifest.len(),
            ..Default::default()
        };

        for rel in manifest.entries() {
            let dest = dir.join(rel);
            if dest.is_file() {
                report.present += 1;
            } else {
                report
                    .pending
                    .push(TaskDescriptor::new(resolve_url(base_url, rel), dest));
            }
        }

        tracing::debug!(
            "INDEX | dir={:?} present={} total={}",
            dir,
            report.present,
            report.total
        );
        report
    }
}
