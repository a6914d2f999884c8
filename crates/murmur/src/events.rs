//! Subscription events and core hooks.
//!
//! Sources report lifecycle changes through [`CoreEvents`]. Delivery is
//! fire-and-forget; nothing an implementation returns is consumed.
//!
//! Events are delivered while the emitting source's lock is held. An
//! implementation must not lock that source again from inside a callback.

use std::sync::Mutex;

use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Facility {
    Source,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionKind {
    New,
    Change,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreHook {
    SourceNewPost,
    SourceUnlink,
    SourceUnlinkPost,
    SourceStateChanged,
}

/// One delivered event, as recorded by [`EventLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    Subscription {
        facility: Facility,
        kind: SubscriptionKind,
        index: u32,
    },
    Hook {
        hook: CoreHook,
        index: u32,
    },
}

/// Receiver for subscription events and hook firings.
pub trait CoreEvents: Send + Sync {
    fn subscription(&self, facility: Facility, kind: SubscriptionKind, index: u32);

    fn hook(&self, hook: CoreHook, index: u32);
}

/// Logs every event at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEvents;

impl CoreEvents for TracingEvents {
    fn subscription(&self, facility: Facility, kind: SubscriptionKind, index: u32) {
        debug!("subscription {:?}/{:?} index={}", facility, kind, index);
    }

    fn hook(&self, hook: CoreHook, index: u32) {
        debug!("hook {:?} index={}", hook, index);
    }
}

/// Records events in delivery order.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<CoreEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<CoreEvent> {
        self.events.lock().expect("event log mutex poisoned").clone()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event log mutex poisoned").clear();
    }

    /// Number of recorded events equal to `event`.
    pub fn count(&self, event: CoreEvent) -> usize {
        self.events
            .lock()
            .expect("event log mutex poisoned")
            .iter()
            .filter(|e| **e == event)
            .count()
    }

    /// Position of the first occurrence of `event`.
    pub fn position(&self, event: CoreEvent) -> Option<usize> {
        self.events
            .lock()
            .expect("event log mutex poisoned")
            .iter()
            .position(|e| *e == event)
    }
}

impl CoreEvents for EventLog {
    fn subscription(&self, facility: Facility, kind: SubscriptionKind, index: u32) {
        self.events
            .lock()
            .expect("event log mutex poisoned")
            .push(CoreEvent::Subscription {
                facility,
                kind,
                index,
            });
    }

    fn hook(&self, hook: CoreHook, index: u32) {
        self.events
            .lock()
            .expect("event log mutex poisoned")
            .push(CoreEvent::Hook { hook, index });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_log_records_in_order() {
        let log = EventLog::new();
        log.subscription(Facility::Source, SubscriptionKind::New, 3);
        log.hook(CoreHook::SourceNewPost, 3);
        log.subscription(Facility::Source, SubscriptionKind::Change, 3);

        let new = CoreEvent::Subscription {
            facility: Facility::Source,
            kind: SubscriptionKind::New,
            index: 3,
        };
        assert_eq!(log.snapshot().len(), 3);
        assert_eq!(log.position(new), Some(0));
        assert_eq!(
            log.position(CoreEvent::Hook {
                hook: CoreHook::SourceNewPost,
                index: 3
            }),
            Some(1)
        );
        assert_eq!(log.count(new), 1);

        log.clear();
        assert!(log.snapshot().is_empty());
    }

    #[test]
    fn test_event_serializes_tagged() {
        let event = CoreEvent::Hook {
            hook: CoreHook::SourceUnlinkPost,
            index: 1,
        };
        let json = serde_json::to_value(event).unwrap();
        assert_eq!(json["type"], "hook");
        assert_eq!(json["hook"], "source_unlink_post");
    }
}
