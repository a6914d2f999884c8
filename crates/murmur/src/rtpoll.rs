//! Realtime loop.
//!
//! [`RtPoll`] is the token a source carries to show it is bound to a loop;
//! it creates message queues that ring the loop's doorbell. [`RealtimeLoop`]
//! owns the realtime halves of its sources and, each cycle:
//!
//! 1. dispatches pending control messages to each source,
//! 2. runs the source's driver (the device side producing chunks),
//! 3. runs `process_outputs`.
//!
//! Between idle cycles it parks on the doorbell for at most `poll_interval`.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use crate::msgq::{self, Doorbell, MessageReceiver, MessageSender};
use crate::source::{SourceMessage, SourceReply, SourceRt};

/// Device-side work run once per cycle with the source's realtime half.
pub type Driver = Box<dyn FnMut(&mut SourceRt) + Send>;

pub type SourceReceiver = MessageReceiver<SourceMessage, SourceReply>;

/// Registration token for a realtime loop.
#[derive(Debug, Clone)]
pub struct RtPoll {
    name: Arc<str>,
    doorbell: Arc<Doorbell>,
}

impl RtPoll {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            doorbell: Arc::new(Doorbell::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A message queue whose sends wake this loop.
    pub fn message_queue<M, R>(
        &self,
        capacity: usize,
    ) -> (MessageSender<M, R>, MessageReceiver<M, R>) {
        msgq::channel_with_doorbell(capacity, self.doorbell.clone())
    }

    /// Wake the loop without sending a message, e.g. after feeding a driver.
    pub fn wake(&self) {
        self.doorbell.ring();
    }
}

struct Member {
    inbox: SourceReceiver,
    source: SourceRt,
    driver: Option<Driver>,
}

pub struct RealtimeLoop {
    rtpoll: RtPoll,
    members: Vec<Member>,
    poll_interval: Duration,
}

impl RealtimeLoop {
    pub fn new(rtpoll: RtPoll, poll_interval: Duration) -> Self {
        Self {
            rtpoll,
            members: Vec::new(),
            poll_interval,
        }
    }

    pub fn rtpoll(&self) -> &RtPoll {
        &self.rtpoll
    }

    /// Take ownership of a source's realtime half and its inbox.
    pub fn register(&mut self, inbox: SourceReceiver, source: SourceRt, driver: Option<Driver>) {
        debug!(
            "rtpoll {}: registered source {}",
            self.rtpoll.name,
            source.index()
        );
        self.members.push(Member {
            inbox,
            source,
            driver,
        });
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// One cycle over every source. Returns whether another cycle should
    /// follow without parking.
    pub fn run_once(&mut self) -> bool {
        let mut busy = false;

        for member in &mut self.members {
            let Member {
                inbox,
                source,
                driver,
            } = member;

            if inbox.dispatch(|msg| source.process_msg(msg)) > 0 {
                busy = true;
            }

            if let Some(driver) = driver.as_mut() {
                driver(source);
            }

            if source.process_outputs() != 0 {
                busy = true;
            }
        }

        busy
    }

    /// Cycle until `stop` is set, draining messages one last time on exit.
    pub fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            if !self.run_once() {
                self.rtpoll.doorbell.wait(self.poll_interval);
            }
        }

        for member in &mut self.members {
            let Member { inbox, source, .. } = member;
            inbox.dispatch(|msg| source.process_msg(msg));
        }
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceRt> {
        self.members.iter().map(|m| &m.source)
    }

    /// Hand back the realtime halves, dropping the inboxes.
    pub fn into_sources(self) -> Vec<SourceRt> {
        self.members.into_iter().map(|m| m.source).collect()
    }
}

/// A [`RealtimeLoop`] running on its own named thread.
pub struct RealtimeThread {
    rtpoll: RtPoll,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<RealtimeLoop>>,
}

impl RealtimeThread {
    pub fn spawn(thread_name: &str, mut rt_loop: RealtimeLoop) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let rtpoll = rt_loop.rtpoll.clone();

        let thread_stop = stop.clone();
        let handle = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || {
                rt_loop.rtpoll.doorbell.bind_current();
                info!(
                    "realtime loop {} running {} sources",
                    rt_loop.rtpoll.name,
                    rt_loop.len()
                );
                rt_loop.run(&thread_stop);
                rt_loop
            })?;

        Ok(Self {
            rtpoll,
            stop,
            handle: Some(handle),
        })
    }

    pub fn rtpoll(&self) -> &RtPoll {
        &self.rtpoll
    }

    /// Stop the loop and return it. Sources still linked afterwards must not
    /// issue synchronous sends until the loop runs again or is dropped.
    pub fn stop(mut self) -> RealtimeLoop {
        match self.join() {
            Some(Ok(rt_loop)) => rt_loop,
            Some(Err(panic)) => std::panic::resume_unwind(panic),
            None => unreachable!("realtime thread joined twice"),
        }
    }

    fn join(&mut self) -> Option<thread::Result<RealtimeLoop>> {
        let handle = self.handle.take()?;
        self.stop.store(true, Ordering::Release);
        self.rtpoll.wake();
        let result = handle.join();
        info!("realtime loop {} stopped", self.rtpoll.name);
        Some(result)
    }
}

impl Drop for RealtimeThread {
    fn drop(&mut self) {
        let _ = self.join();
    }
}
