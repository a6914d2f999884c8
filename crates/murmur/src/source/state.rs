use std::fmt;

use serde::Serialize;

/// Lifecycle of a source.
///
/// `Init -> Idle <-> Running`, `{Idle, Running} <-> Suspended`, and any state
/// to `Unlinked`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    Init,
    Idle,
    Running,
    Suspended,
    Unlinked,
}

impl SourceState {
    /// Idle or running: the device is open.
    pub fn is_opened(self) -> bool {
        matches!(self, SourceState::Idle | SourceState::Running)
    }

    /// Published and not yet unlinked.
    pub fn is_linked(self) -> bool {
        matches!(
            self,
            SourceState::Idle | SourceState::Running | SourceState::Suspended
        )
    }
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceState::Init => "init",
            SourceState::Idle => "idle",
            SourceState::Running => "running",
            SourceState::Suspended => "suspended",
            SourceState::Unlinked => "unlinked",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(!SourceState::Init.is_linked());
        assert!(SourceState::Idle.is_opened() && SourceState::Idle.is_linked());
        assert!(SourceState::Running.is_opened());
        assert!(!SourceState::Suspended.is_opened() && SourceState::Suspended.is_linked());
        assert!(!SourceState::Unlinked.is_linked());
    }
}
