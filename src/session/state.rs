// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Chat session states.

/// Where the single chat session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Ready,
    Generating,
    Resetting,
    Reloading,
    Terminating,
    Failed,
}

impl SessionState {
    /// A reset, reload or terminate may be accepted from here.
    pub fn is_interruptible(&self) -> bool {
        matches!(self, Self::Ready | Self::Generating | Self::Failed)
    }

    /// A new prompt may be accepted from here.
    pub fn is_chatable(&self) -> bool {
        matches!(self, Self::Ready)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Generating => "generating",
            Self::Resetting => "resetting",
            Self::Reloading => "reloading",
            Self::Terminating => "terminating",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interruptible_set() {
        let interruptible: Vec<_> = [
            SessionState::Ready,
            SessionState::Generating,
            SessionState::Resetting,
            SessionState::Reloading,
            SessionState::Terminating,
            SessionState::Failed,
        ]
        .into_iter()
        .filter(SessionState::is_interruptible)
        .collect();
        assert_eq!(
            interruptible,
            vec![SessionState::Ready, SessionState::Generating, SessionState::Failed]
        );
    }

    #[test]
    fn test_only_ready_is_chatable() {
        assert!(SessionState::Ready.is_chatable());
        assert!(!SessionState::Generating.is_chatable());
        assert!(!SessionState::Failed.is_chatable());
    }
}
