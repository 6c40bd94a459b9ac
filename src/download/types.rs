// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transfer types.

use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One file transfer: where to read it from and where it ends up.
///
/// Two descriptors are the same task when they target the same destination,
/// regardless of source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub source: String,
    pub dest: PathBuf,
}

impl TaskDescriptor {
    pub fn new(source: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
        }
    }

    /// File name of the destination, for log lines.
    pub fn file_name(&self) -> String {
        self.dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl PartialEq for TaskDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.dest == other.dest
    }
}

impl Eq for TaskDescriptor {}

impl Hash for TaskDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.dest.hash(state);
    }
}

/// Completion report for one submitted task. `Ok` carries the byte count.
#[derive(Debug)]
pub struct TransferOutcome {
    pub task: TaskDescriptor,
    pub result: Result<u64>,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identity_is_destination() {
        let a = TaskDescriptor::new("https://a/x", "/m/x.bin");
        let b = TaskDescriptor::new("https://mirror/x", "/m/x.bin");
        let c = TaskDescriptor::new("https://a/x", "/m/y.bin");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_file_name() {
        let t = TaskDescriptor::new("u", "/m/sub/params_shard_3.bin");
        assert_eq!(t.file_name(), "params_shard_3.bin");
    }
}
