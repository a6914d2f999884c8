//! Device backend hooks.
//!
//! A backend implements only the operations its hardware can do natively
//! and advertises them through [`SourceBackend::provides`]. The source keeps
//! a [`HookTable`] of which ops are live; an op whose call fails is marked
//! absent and the software path takes over for good.

use std::time::Duration;

use thiserror::Error;

use super::state::SourceState;
use crate::sample::ChannelVolume;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookOp {
    Latency,
    SetVolume,
    GetVolume,
    SetMute,
    GetMute,
    SetState,
}

impl HookOp {
    pub const ALL: [HookOp; 6] = [
        HookOp::Latency,
        HookOp::SetVolume,
        HookOp::GetVolume,
        HookOp::SetMute,
        HookOp::GetMute,
        HookOp::SetState,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend does not implement {0:?}")]
    Unsupported(HookOp),

    #[error("{0}")]
    Failed(String),
}

/// Hardware side of a source. Every method runs on the control thread.
pub trait SourceBackend: Send {
    /// Whether this backend implements `op`.
    fn provides(&self, _op: HookOp) -> bool {
        false
    }

    fn latency(&mut self) -> Result<Duration, BackendError> {
        Err(BackendError::Unsupported(HookOp::Latency))
    }

    fn set_volume(&mut self, _volume: &ChannelVolume) -> Result<(), BackendError> {
        Err(BackendError::Unsupported(HookOp::SetVolume))
    }

    fn volume(&mut self) -> Result<ChannelVolume, BackendError> {
        Err(BackendError::Unsupported(HookOp::GetVolume))
    }

    fn set_mute(&mut self, _muted: bool) -> Result<(), BackendError> {
        Err(BackendError::Unsupported(HookOp::SetMute))
    }

    fn mute(&mut self) -> Result<bool, BackendError> {
        Err(BackendError::Unsupported(HookOp::GetMute))
    }

    /// Called before every state change; an error vetoes the change.
    fn set_state(&mut self, _state: SourceState) -> Result<(), BackendError> {
        Err(BackendError::Unsupported(HookOp::SetState))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Hook {
    Native,
    #[default]
    Absent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookTable {
    latency: Hook,
    set_volume: Hook,
    get_volume: Hook,
    set_mute: Hook,
    get_mute: Hook,
    set_state: Hook,
}

impl HookTable {
    /// Native for every op the backend provides.
    pub fn for_backend(backend: &dyn SourceBackend) -> Self {
        let mut table = Self::default();
        for op in HookOp::ALL {
            if backend.provides(op) {
                *table.slot(op) = Hook::Native;
            }
        }
        table
    }

    pub fn get(&self, op: HookOp) -> Hook {
        match op {
            HookOp::Latency => self.latency,
            HookOp::SetVolume => self.set_volume,
            HookOp::GetVolume => self.get_volume,
            HookOp::SetMute => self.set_mute,
            HookOp::GetMute => self.get_mute,
            HookOp::SetState => self.set_state,
        }
    }

    pub fn is_native(&self, op: HookOp) -> bool {
        self.get(op) == Hook::Native
    }

    pub fn disable(&mut self, op: HookOp) {
        *self.slot(op) = Hook::Absent;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn slot(&mut self, op: HookOp) -> &mut Hook {
        match op {
            HookOp::Latency => &mut self.latency,
            HookOp::SetVolume => &mut self.set_volume,
            HookOp::GetVolume => &mut self.get_volume,
            HookOp::SetMute => &mut self.set_mute,
            HookOp::GetMute => &mut self.get_mute,
            HookOp::SetState => &mut self.set_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MuteOnly;

    impl SourceBackend for MuteOnly {
        fn provides(&self, op: HookOp) -> bool {
            matches!(op, HookOp::SetMute | HookOp::GetMute)
        }
    }

    #[test]
    fn test_table_follows_provides() {
        let mut table = HookTable::for_backend(&MuteOnly);
        assert!(table.is_native(HookOp::SetMute));
        assert!(table.is_native(HookOp::GetMute));
        assert_eq!(table.get(HookOp::SetVolume), Hook::Absent);

        table.disable(HookOp::SetMute);
        assert!(!table.is_native(HookOp::SetMute));
        assert!(table.is_native(HookOp::GetMute));

        table.clear();
        assert_eq!(table, HookTable::default());
    }

    #[test]
    fn test_default_methods_report_unsupported() {
        let mut backend = MuteOnly;
        assert_eq!(
            backend.latency(),
            Err(BackendError::Unsupported(HookOp::Latency))
        );
    }
}
