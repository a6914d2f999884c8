//! Control → realtime message channel.
//!
//! A lock-free SPSC ring carries envelopes from one control-side sender to
//! the realtime thread. Two delivery modes:
//!
//! - `send` blocks the caller until the handler has run and returns its reply.
//! - `post` enqueues and returns; an optional release callback runs on the
//!   realtime thread once the message has been handled.
//!
//! Messages are handled strictly in enqueue order. The realtime side never
//! takes a lock to receive: it pops from the ring and answers through a
//! oneshot.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, Thread};
use std::time::Duration;

use rtrb::{Consumer, Producer, RingBuffer};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::error;

/// Cleanup run after a posted message has been handled.
pub type ReleaseFn = Box<dyn FnOnce() + Send>;

/// A handler rejected a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown message opcode {0}")]
    UnknownOpcode(u32),

    #[error("no handler for {0}")]
    Unhandled(&'static str),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("message queue is full")]
    Full,

    #[error("message queue receiver is gone")]
    Disconnected,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Wakes a parked realtime thread when messages arrive.
#[derive(Default)]
pub struct Doorbell {
    rung: AtomicBool,
    thread: Mutex<Option<Thread>>,
}

impl Doorbell {
    /// Make the calling thread the one `ring` unparks.
    pub fn bind_current(&self) {
        *self.thread.lock().expect("doorbell mutex poisoned") = Some(thread::current());
    }

    pub fn ring(&self) {
        self.rung.store(true, Ordering::Release);
        if let Some(thread) = self.thread.lock().expect("doorbell mutex poisoned").as_ref() {
            thread.unpark();
        }
    }

    /// Park until rung or `timeout` passes. Returns immediately if the bell
    /// rang since the last wait.
    pub fn wait(&self, timeout: Duration) {
        if !self.rung.swap(false, Ordering::AcqRel) {
            thread::park_timeout(timeout);
            self.rung.store(false, Ordering::Release);
        }
    }
}

impl fmt::Debug for Doorbell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Doorbell")
            .field("rung", &self.rung.load(Ordering::Relaxed))
            .finish()
    }
}

struct Envelope<M, R> {
    msg: M,
    reply: Option<oneshot::Sender<Result<R, ProtocolError>>>,
    release: Option<ReleaseFn>,
}

/// Create a channel with its own doorbell.
pub fn channel<M, R>(capacity: usize) -> (MessageSender<M, R>, MessageReceiver<M, R>) {
    channel_with_doorbell(capacity, Arc::new(Doorbell::default()))
}

/// Create a channel that rings an existing doorbell, so one realtime thread
/// can wait on many queues.
pub fn channel_with_doorbell<M, R>(
    capacity: usize,
    doorbell: Arc<Doorbell>,
) -> (MessageSender<M, R>, MessageReceiver<M, R>) {
    let (producer, consumer) = RingBuffer::new(capacity);
    (
        MessageSender {
            producer,
            doorbell: doorbell.clone(),
        },
        MessageReceiver { consumer, doorbell },
    )
}

/// Control-side end of a message channel.
pub struct MessageSender<M, R> {
    producer: Producer<Envelope<M, R>>,
    doorbell: Arc<Doorbell>,
}

impl<M, R> MessageSender<M, R> {
    /// Deliver `msg` and block until it has been handled.
    ///
    /// The receiving loop must be running (or dropped); a receiver that is
    /// alive but never dispatched blocks this call indefinitely.
    pub fn send(&mut self, msg: M) -> Result<R, ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(Envelope {
            msg,
            reply: Some(tx),
            release: None,
        })?;

        match rx.blocking_recv() {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(ChannelError::Protocol(e)),
            Err(_) => Err(ChannelError::Disconnected),
        }
    }

    /// Enqueue `msg` without waiting. `release` runs after the message is
    /// handled, or immediately if it could not be enqueued.
    pub fn post(&mut self, msg: M, release: Option<ReleaseFn>) -> Result<(), ChannelError> {
        self.enqueue(Envelope {
            msg,
            reply: None,
            release,
        })
    }

    pub fn is_disconnected(&self) -> bool {
        self.producer.is_abandoned()
    }

    fn enqueue(&mut self, envelope: Envelope<M, R>) -> Result<(), ChannelError> {
        if self.producer.is_abandoned() {
            run_release(envelope);
            return Err(ChannelError::Disconnected);
        }

        if let Err(rtrb::PushError::Full(envelope)) = self.producer.push(envelope) {
            run_release(envelope);
            return Err(ChannelError::Full);
        }

        self.doorbell.ring();
        Ok(())
    }
}

impl<M, R> fmt::Debug for MessageSender<M, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSender")
            .field("free_slots", &self.producer.slots())
            .finish()
    }
}

/// Realtime-side end of a message channel.
pub struct MessageReceiver<M, R> {
    consumer: Consumer<Envelope<M, R>>,
    doorbell: Arc<Doorbell>,
}

impl<M, R> MessageReceiver<M, R> {
    /// Handle every pending message in order. Returns how many ran.
    pub fn dispatch<F>(&mut self, mut handler: F) -> usize
    where
        F: FnMut(M) -> Result<R, ProtocolError>,
    {
        let mut handled = 0;

        while let Ok(envelope) = self.consumer.pop() {
            let Envelope {
                msg,
                reply,
                release,
            } = envelope;

            let result = handler(msg);
            match reply {
                Some(tx) => {
                    let _ = tx.send(result);
                }
                None => {
                    if let Err(e) = result {
                        error!("posted message failed: {}", e);
                    }
                }
            }

            if let Some(release) = release {
                release();
            }
            handled += 1;
        }

        handled
    }

    pub fn pending(&self) -> usize {
        self.consumer.slots()
    }

    /// Park the calling thread until a sender rings or `timeout` passes.
    pub fn wait(&self, timeout: Duration) {
        self.doorbell.wait(timeout);
    }

    pub fn doorbell(&self) -> &Arc<Doorbell> {
        &self.doorbell
    }
}

impl<M, R> Drop for MessageReceiver<M, R> {
    fn drop(&mut self) {
        // Unhandled envelopes still owe their release; dropping the reply
        // sender wakes any blocked `send` with Disconnected.
        while let Ok(envelope) = self.consumer.pop() {
            run_release(envelope);
        }
    }
}

impl<M, R> fmt::Debug for MessageReceiver<M, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageReceiver")
            .field("pending", &self.consumer.slots())
            .finish()
    }
}

fn run_release<M, R>(envelope: Envelope<M, R>) {
    if let Some(release) = envelope.release {
        release();
    }
}
