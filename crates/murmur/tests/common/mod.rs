//! Shared fixtures: a source running on its own realtime thread, fed through
//! a lock-free ring, plus a recording consumer.

#![allow(dead_code)]

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use murmur::{
    Core, EventLog, MemChunk, OutputControl, OutputStream, RealtimeLoop, RealtimeThread, RtPoll,
    SampleFormat, SampleSpec, Source, SourceFlags, SourceHandle, SourceNewData, SourceRt,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn stereo_44k() -> SampleSpec {
    SampleSpec::new(SampleFormat::S16Le, 44100, 2)
}

/// Interleaved s16le samples, all non-zero.
pub fn s16_chunk(samples: &[i16]) -> MemChunk {
    let mut data = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        data.extend_from_slice(&s.to_le_bytes());
    }
    MemChunk::from(data)
}

pub fn s16_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Poll `cond` until it holds or [`TIMEOUT`] passes.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Attach,
    Detach,
    Suspend(bool),
    Kill,
}

#[derive(Debug, Default)]
pub struct Recorded {
    pub chunks: Vec<MemChunk>,
    pub events: Vec<OutputEvent>,
}

pub type Recording = Arc<Mutex<Recorded>>;

pub struct TestControl {
    index: u32,
    recording: Recording,
}

impl OutputControl for TestControl {
    fn index(&self) -> u32 {
        self.index
    }

    fn suspend(&self, suspending: bool) {
        self.recording
            .lock()
            .unwrap()
            .events
            .push(OutputEvent::Suspend(suspending));
    }

    fn kill(&self) {
        self.recording.lock().unwrap().events.push(OutputEvent::Kill);
    }
}

pub struct TestStream {
    index: u32,
    recording: Recording,
}

impl OutputStream for TestStream {
    fn index(&self) -> u32 {
        self.index
    }

    fn attach(&mut self) {
        self.recording.lock().unwrap().events.push(OutputEvent::Attach);
    }

    fn detach(&mut self) {
        self.recording.lock().unwrap().events.push(OutputEvent::Detach);
    }

    fn push(&mut self, chunk: &MemChunk) {
        self.recording.lock().unwrap().chunks.push(chunk.clone());
    }
}

/// Both halves of a recording consumer plus the shared recording.
pub fn test_output(index: u32) -> (Arc<dyn OutputControl>, Box<dyn OutputStream>, Recording) {
    let recording = Recording::default();
    (
        Arc::new(TestControl {
            index,
            recording: recording.clone(),
        }),
        Box::new(TestStream {
            index,
            recording: recording.clone(),
        }),
        recording,
    )
}

/// A published source on its own realtime thread.
pub struct Harness {
    pub core: Arc<Core>,
    pub log: Arc<EventLog>,
    pub handle: SourceHandle,
    pub rtpoll: RtPoll,
    feed: rtrb::Producer<MemChunk>,
    thread: Option<RealtimeThread>,
}

impl Harness {
    pub fn new(name: &str, spec: SampleSpec, flags: SourceFlags) -> Self {
        Self::with_setup(name, spec, flags, |_| {})
    }

    /// `setup` runs on the realtime half before it moves to its thread.
    pub fn with_setup(
        name: &str,
        spec: SampleSpec,
        flags: SourceFlags,
        setup: impl FnOnce(&mut SourceRt),
    ) -> Self {
        let log = Arc::new(EventLog::new());
        let core = Core::new(log.clone());

        let (handle, mut rt) = Source::new(&core, SourceNewData::new(name, spec)).unwrap();
        setup(&mut rt);

        let rtpoll = RtPoll::new(name);
        let (queue, inbox) = rtpoll.message_queue(64);
        let (feed, mut chunks) = rtrb::RingBuffer::<MemChunk>::new(64);

        let mut rt_loop = RealtimeLoop::new(rtpoll.clone(), Duration::from_millis(2));
        rt_loop.register(
            inbox,
            rt,
            Some(Box::new(move |rt: &mut SourceRt| {
                while let Ok(chunk) = chunks.pop() {
                    rt.post(&chunk);
                }
            })),
        );
        let thread = RealtimeThread::spawn("murmur-test-rt", rt_loop).unwrap();

        {
            let mut source = handle.lock().unwrap();
            source.set_message_queue(queue);
            source.set_rtpoll(rtpoll.clone());
            source.set_flags(flags);
            source.put().unwrap();
            source.flush().unwrap();
        }

        Self {
            core,
            log,
            handle,
            rtpoll,
            feed,
            thread: Some(thread),
        }
    }

    pub fn source(&self) -> MutexGuard<'_, Source> {
        self.handle.lock().unwrap()
    }

    /// Hand a chunk to the realtime driver and wait until it was posted.
    pub fn capture(&mut self, chunk: MemChunk) {
        self.feed.push(chunk).unwrap();
        self.rtpoll.wake();
        assert!(wait_for(|| self.feed.slots() == self.feed.buffer().capacity()));
        // The driver posts right after popping; a flush orders us after it.
        self.source().flush().unwrap();
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        {
            let mut source = self.handle.lock().unwrap_or_else(|p| p.into_inner());
            if source.state().is_linked() {
                source.unlink();
            }
        }
        if let Some(thread) = self.thread.take() {
            drop(thread.stop());
        }
    }
}
