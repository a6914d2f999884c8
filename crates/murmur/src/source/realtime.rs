//! Realtime half of a source.
//!
//! Owned by the realtime thread. Its fields change only through
//! [`SourceRt::process_msg`], which the realtime loop calls for each message
//! the control half sent or posted.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tracing::{debug, trace};

use super::message::{SourceMessage, SourceReply};
use super::state::SourceState;
use crate::chunk::{ChunkScratch, MemChunk};
use crate::msgq::ProtocolError;
use crate::output::OutputStream;
use crate::sample::{self, ChannelVolume, SampleSpec};

/// Answers `GetLatency` on the realtime thread.
pub type LatencyProbe = Box<dyn FnMut() -> Duration + Send>;

pub struct SourceRt {
    index: u32,
    spec: SampleSpec,
    outputs: BTreeMap<u32, Box<dyn OutputStream>>,
    soft_volume: ChannelVolume,
    soft_muted: bool,
    state: SourceState,
    scratch: ChunkScratch,
    latency_probe: Option<LatencyProbe>,
}

impl SourceRt {
    pub(crate) fn new(index: u32, spec: SampleSpec, volume: ChannelVolume, muted: bool) -> Self {
        Self {
            index,
            spec,
            outputs: BTreeMap::new(),
            soft_volume: volume,
            soft_muted: muted,
            state: SourceState::Init,
            scratch: ChunkScratch::default(),
            latency_probe: None,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn sample_spec(&self) -> &SampleSpec {
        &self.spec
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn soft_volume(&self) -> &ChannelVolume {
        &self.soft_volume
    }

    pub fn soft_muted(&self) -> bool {
        self.soft_muted
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn has_output(&self, index: u32) -> bool {
        self.outputs.contains_key(&index)
    }

    pub fn set_latency_probe(&mut self, probe: LatencyProbe) {
        self.latency_probe = Some(probe);
    }

    /// Apply one control message.
    pub fn process_msg(&mut self, msg: SourceMessage) -> Result<SourceReply, ProtocolError> {
        trace!("source {} rt <- {:?}", self.index, msg);

        match msg {
            SourceMessage::AddOutput(mut output) => {
                let index = output.index();
                output.attach();
                if let Some(mut previous) = self.outputs.insert(index, output) {
                    previous.detach();
                }
                Ok(SourceReply::Done)
            }

            SourceMessage::RemoveOutput(index) => {
                if let Some(mut output) = self.outputs.remove(&index) {
                    output.detach();
                }
                Ok(SourceReply::Done)
            }

            SourceMessage::SetVolume(volume) => {
                self.soft_volume = volume;
                Ok(SourceReply::Done)
            }

            SourceMessage::GetVolume => Ok(SourceReply::Volume(self.soft_volume)),

            SourceMessage::SetMute(muted) => {
                self.soft_muted = muted;
                Ok(SourceReply::Done)
            }

            SourceMessage::GetMute => Ok(SourceReply::Muted(self.soft_muted)),

            SourceMessage::Ping => Ok(SourceReply::Done),

            SourceMessage::SetState(state) => {
                self.state = state;
                Ok(SourceReply::Done)
            }

            SourceMessage::GetLatency => match self.latency_probe.as_mut() {
                Some(probe) => Ok(SourceReply::Latency(probe())),
                None => Err(ProtocolError::Unhandled("get-latency")),
            },

            SourceMessage::Extension(code) => Err(ProtocolError::UnknownOpcode(code)),
        }
    }

    /// Fan a captured chunk out to every attached consumer.
    ///
    /// Silently dropped unless running. With soft mute or non-unity soft
    /// volume, consumers get a processed copy; otherwise the chunk itself.
    pub fn post(&mut self, chunk: &MemChunk) {
        if self.state != SourceState::Running {
            return;
        }

        if self.soft_muted || !self.soft_volume.is_norm() {
            let muted = self.soft_muted || self.soft_volume.is_muted();
            let spec = self.spec;
            let volume = self.soft_volume;

            let processed = self.scratch.process(chunk, |buf| {
                if muted {
                    sample::silence(buf, spec.format);
                } else {
                    sample::scale(buf, &spec, &volume);
                }
            });

            for output in self.outputs.values_mut() {
                output.push(&processed);
            }
        } else {
            for output in self.outputs.values_mut() {
                output.push(chunk);
            }
        }
    }

    /// Run each consumer's per-cycle work, stopping at the first non-zero
    /// result.
    pub fn process_outputs(&mut self) -> i32 {
        if !self.state.is_linked() {
            return 0;
        }

        for output in self.outputs.values_mut() {
            let r = output.process();
            if r != 0 {
                return r;
            }
        }

        0
    }
}

impl Drop for SourceRt {
    fn drop(&mut self) {
        if !self.outputs.is_empty() {
            debug!(
                "source {} rt releasing {} outputs",
                self.index,
                self.outputs.len()
            );
        }
        self.outputs.clear();
    }
}

impl fmt::Debug for SourceRt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRt")
            .field("index", &self.index)
            .field("state", &self.state)
            .field("outputs", &self.outputs.keys().collect::<Vec<_>>())
            .field("soft_muted", &self.soft_muted)
            .field("soft_volume", &self.soft_volume.values())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{SampleFormat, Volume};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Seen {
        chunks: Vec<MemChunk>,
        attached: bool,
        detached: bool,
    }

    struct Probe {
        index: u32,
        seen: Arc<Mutex<Seen>>,
        process_result: i32,
    }

    impl OutputStream for Probe {
        fn index(&self) -> u32 {
            self.index
        }

        fn attach(&mut self) {
            self.seen.lock().unwrap().attached = true;
        }

        fn detach(&mut self) {
            self.seen.lock().unwrap().detached = true;
        }

        fn process(&mut self) -> i32 {
            self.process_result
        }

        fn push(&mut self, chunk: &MemChunk) {
            self.seen.lock().unwrap().chunks.push(chunk.clone());
        }
    }

    fn stereo() -> SampleSpec {
        SampleSpec::new(SampleFormat::S16Le, 44100, 2)
    }

    fn running_rt() -> SourceRt {
        let mut rt = SourceRt::new(0, stereo(), ChannelVolume::norm(2), false);
        rt.process_msg(SourceMessage::SetState(SourceState::Running))
            .unwrap();
        rt
    }

    fn add_probe(rt: &mut SourceRt, index: u32, process_result: i32) -> Arc<Mutex<Seen>> {
        let seen = Arc::new(Mutex::new(Seen::default()));
        rt.process_msg(SourceMessage::AddOutput(Box::new(Probe {
            index,
            seen: seen.clone(),
            process_result,
        })))
        .unwrap();
        seen
    }

    fn tone() -> MemChunk {
        let mut data = Vec::new();
        for s in [1000i16, -1000, 2000, -2000] {
            data.extend_from_slice(&s.to_le_bytes());
        }
        MemChunk::from(data)
    }

    #[test]
    fn test_add_and_remove_output() {
        let mut rt = running_rt();
        let seen = add_probe(&mut rt, 4, 0);
        assert!(rt.has_output(4));
        assert!(seen.lock().unwrap().attached);

        rt.process_msg(SourceMessage::RemoveOutput(4)).unwrap();
        assert!(!rt.has_output(4));
        assert!(seen.lock().unwrap().detached);
    }

    #[test]
    fn test_unity_post_shares_chunk() {
        let mut rt = running_rt();
        let a = add_probe(&mut rt, 0, 0);
        let b = add_probe(&mut rt, 1, 0);

        let chunk = tone();
        rt.post(&chunk);

        for seen in [a, b] {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.chunks.len(), 1);
            assert_eq!(seen.chunks[0].bytes().as_ptr(), chunk.bytes().as_ptr());
        }
    }

    #[test]
    fn test_soft_mute_delivers_silence() {
        let mut rt = running_rt();
        let seen = add_probe(&mut rt, 0, 0);
        rt.process_msg(SourceMessage::SetMute(true)).unwrap();

        let chunk = tone();
        rt.post(&chunk);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.chunks[0].len(), chunk.len());
        assert!(seen.chunks[0].as_ref().iter().all(|&b| b == 0));
        assert!(chunk.as_ref().iter().any(|&b| b != 0));
    }

    #[test]
    fn test_soft_volume_scales_copy() {
        let mut rt = running_rt();
        let seen = add_probe(&mut rt, 0, 0);
        rt.process_msg(SourceMessage::SetVolume(ChannelVolume::uniform(
            2,
            Volume(0x8000),
        )))
        .unwrap();

        rt.post(&tone());

        let seen = seen.lock().unwrap();
        let samples: Vec<i16> = seen.chunks[0]
            .as_ref()
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        assert_eq!(samples, vec![500, -500, 1000, -1000]);
    }

    #[test]
    fn test_post_outside_running_is_dropped() {
        let mut rt = SourceRt::new(0, stereo(), ChannelVolume::norm(2), false);
        let seen = add_probe(&mut rt, 0, 0);

        for state in [SourceState::Init, SourceState::Idle, SourceState::Suspended] {
            rt.process_msg(SourceMessage::SetState(state)).unwrap();
            rt.post(&tone());
        }
        assert!(seen.lock().unwrap().chunks.is_empty());
    }

    #[test]
    fn test_get_replies_mirror_fields() {
        let mut rt = running_rt();
        rt.process_msg(SourceMessage::SetMute(true)).unwrap();
        assert_eq!(
            rt.process_msg(SourceMessage::GetMute).unwrap(),
            SourceReply::Muted(true)
        );
        assert_eq!(
            rt.process_msg(SourceMessage::GetVolume).unwrap(),
            SourceReply::Volume(ChannelVolume::norm(2))
        );
        assert_eq!(rt.process_msg(SourceMessage::Ping).unwrap(), SourceReply::Done);
    }

    #[test]
    fn test_unknown_opcode_is_protocol_error() {
        let mut rt = running_rt();
        assert_eq!(
            rt.process_msg(SourceMessage::Extension(42)),
            Err(ProtocolError::UnknownOpcode(42))
        );
        assert!(rt.process_msg(SourceMessage::GetLatency).is_err());

        rt.set_latency_probe(Box::new(|| Duration::from_millis(20)));
        assert_eq!(
            rt.process_msg(SourceMessage::GetLatency).unwrap(),
            SourceReply::Latency(Duration::from_millis(20))
        );
    }

    #[test]
    fn test_process_outputs_stops_at_first_nonzero() {
        let mut rt = running_rt();
        add_probe(&mut rt, 0, 0);
        add_probe(&mut rt, 1, 7);
        add_probe(&mut rt, 2, 9);
        assert_eq!(rt.process_outputs(), 7);

        rt.process_msg(SourceMessage::SetState(SourceState::Unlinked))
            .unwrap();
        assert_eq!(rt.process_outputs(), 0);
    }
}
