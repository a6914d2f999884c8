use std::fmt;
use std::time::Duration;

use super::state::SourceState;
use crate::output::OutputStream;
use crate::sample::ChannelVolume;

/// Operations the control thread asks of a source's realtime half.
pub enum SourceMessage {
    /// Take ownership of a consumer's stream half.
    AddOutput(Box<dyn OutputStream>),
    RemoveOutput(u32),
    GetVolume,
    SetVolume(ChannelVolume),
    GetMute,
    SetMute(bool),
    GetLatency,
    Ping,
    SetState(SourceState),
    /// Opcode from an extension this source does not know.
    Extension(u32),
}

/// First opcode free for extensions.
pub const MESSAGE_MAX: u32 = 9;

impl SourceMessage {
    pub fn opcode(&self) -> u32 {
        match self {
            SourceMessage::AddOutput(_) => 0,
            SourceMessage::RemoveOutput(_) => 1,
            SourceMessage::GetVolume => 2,
            SourceMessage::SetVolume(_) => 3,
            SourceMessage::GetMute => 4,
            SourceMessage::SetMute(_) => 5,
            SourceMessage::GetLatency => 6,
            SourceMessage::Ping => 7,
            SourceMessage::SetState(_) => 8,
            SourceMessage::Extension(code) => *code,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SourceMessage::AddOutput(_) => "add-output",
            SourceMessage::RemoveOutput(_) => "remove-output",
            SourceMessage::GetVolume => "get-volume",
            SourceMessage::SetVolume(_) => "set-volume",
            SourceMessage::GetMute => "get-mute",
            SourceMessage::SetMute(_) => "set-mute",
            SourceMessage::GetLatency => "get-latency",
            SourceMessage::Ping => "ping",
            SourceMessage::SetState(_) => "set-state",
            SourceMessage::Extension(_) => "extension",
        }
    }
}

impl fmt::Debug for SourceMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceMessage::AddOutput(o) => write!(f, "AddOutput({})", o.index()),
            SourceMessage::RemoveOutput(i) => write!(f, "RemoveOutput({})", i),
            SourceMessage::SetVolume(v) => write!(f, "SetVolume({:?})", v.values()),
            SourceMessage::SetMute(m) => write!(f, "SetMute({})", m),
            SourceMessage::SetState(s) => write!(f, "SetState({:?})", s),
            SourceMessage::Extension(code) => write!(f, "Extension({})", code),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceReply {
    Done,
    Volume(ChannelVolume),
    Muted(bool),
    Latency(Duration),
}
