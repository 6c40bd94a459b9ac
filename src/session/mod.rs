// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Chat session backed by a downloaded model.
//!
//! [`SessionCoordinator`] owns the conversation and serializes resets,
//! reloads and terminations against generation. Its collaborators sit behind
//! traits so the session can run against an HTTP completion endpoint, a
//! local runtime, or test doubles.

pub mod completion;
pub mod coordinator;
pub mod runtime;
pub mod state;
pub mod transcript;

pub use completion::{ChatCompletionsClient, CompletionService};
pub use coordinator::{Binding, SessionCoordinator, SessionDeps, CLEARED_NOTICE, GREETED_FLAG};
pub use runtime::{DirectoryRuntime, ModelRuntime};
pub use state::SessionState;
pub use transcript::{FileTranscriptStore, MemoryTranscriptStore, TranscriptSnapshot, TranscriptStore};
