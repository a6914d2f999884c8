//! murmur - realtime capture core
//!
//! Two pieces of a sound server:
//!
//! - **Shared memory** ([`shm`]): private or named segments for moving audio
//!   between processes without copying, with page reclaim for ring buffers.
//! - **Sources** ([`source`]): capture endpoints split into a control half
//!   and a realtime half that talk only through a message queue ([`msgq`]),
//!   driven by a realtime loop ([`rtpoll`]) and registered with a [`Core`].
//!
//! ## Threads
//!
//! Control operations run on any thread holding a [`SourceHandle`]. Each
//! realtime loop runs on its own thread and owns the [`SourceRt`] halves
//! registered with it. Nothing on the realtime side takes a lock shared with
//! the control side.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use murmur::{
//!     Core, RealtimeLoop, RealtimeThread, RtPoll, SampleFormat, SampleSpec, Source, SourceNewData,
//! };
//!
//! let core = Core::with_tracing();
//! let spec = SampleSpec::new(SampleFormat::S16Le, 44100, 2);
//! let (handle, rt) = Source::new(&core, SourceNewData::new("mic", spec)).unwrap();
//!
//! let rtpoll = RtPoll::new("mic");
//! let (queue, inbox) = rtpoll.message_queue(128);
//! let mut rt_loop = RealtimeLoop::new(rtpoll.clone(), Duration::from_millis(10));
//! rt_loop.register(inbox, rt, None);
//! let thread = RealtimeThread::spawn("murmur-rt", rt_loop).unwrap();
//!
//! {
//!     let mut source = handle.lock().unwrap();
//!     source.set_message_queue(queue);
//!     source.set_rtpoll(rtpoll);
//!     source.put().unwrap();
//!     source.unlink();
//! }
//! thread.stop();
//! ```

pub mod chunk;
pub mod events;
pub mod msgq;
pub mod namereg;
pub mod output;
pub mod registry;
pub mod rtpoll;
pub mod sample;
pub mod shm;
pub mod source;

pub use chunk::MemChunk;
pub use events::{
    CoreEvent, CoreEvents, CoreHook, EventLog, Facility, SubscriptionKind, TracingEvents,
};
pub use msgq::{ChannelError, ProtocolError};
pub use namereg::NameError;
pub use output::{OutputControl, OutputStream};
pub use registry::Core;
pub use rtpoll::{Driver, RealtimeLoop, RealtimeThread, RtPoll};
pub use sample::{ChannelMap, ChannelPosition, ChannelVolume, SampleFormat, SampleSpec, Volume};
pub use shm::{ShmError, ShmSegment, MAX_SEGMENT_SIZE};
pub use source::{
    Source, SourceBackend, SourceError, SourceFlags, SourceHandle, SourceInfo, SourceNewData,
    SourceRt, SourceState,
};
