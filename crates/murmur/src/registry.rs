//! Process-wide registry of sources (the core).
//!
//! The core hands out source indices, owns the name registry and keeps a
//! non-owning table of live sources for lookup and broadcast operations.
//! Sources hold an `Arc<Core>`; the core only holds `Weak` source handles.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::events::{CoreEvents, TracingEvents};
use crate::namereg::{NameError, NameRegistry};
use crate::source::{Source, SourceHandle};

pub struct Core {
    names: Mutex<NameRegistry>,
    sources: Mutex<BTreeMap<u32, Weak<Mutex<Source>>>>,
    next_index: AtomicU32,
    events: Arc<dyn CoreEvents>,
}

impl Core {
    pub fn new(events: Arc<dyn CoreEvents>) -> Arc<Self> {
        Arc::new(Self {
            names: Mutex::new(NameRegistry::new()),
            sources: Mutex::new(BTreeMap::new()),
            next_index: AtomicU32::new(0),
            events,
        })
    }

    /// Core that reports events through `tracing`.
    pub fn with_tracing() -> Arc<Self> {
        Self::new(Arc::new(TracingEvents))
    }

    pub fn events(&self) -> &dyn CoreEvents {
        self.events.as_ref()
    }

    pub(crate) fn assign_index(&self) -> u32 {
        self.next_index.fetch_add(1, Ordering::Relaxed)
    }

    /// See [`NameRegistry::register`].
    pub fn register_name(
        &self,
        name: &str,
        index: u32,
        fail_on_collision: bool,
    ) -> Result<String, NameError> {
        self.names
            .lock()
            .expect("name registry mutex poisoned")
            .register(name, index, fail_on_collision)
    }

    pub fn unregister_name(&self, name: &str) {
        if self
            .names
            .lock()
            .expect("name registry mutex poisoned")
            .unregister(name)
            .is_none()
        {
            warn!("unregistering unknown name {:?}", name);
        }
    }

    pub(crate) fn insert_source(&self, index: u32, handle: &SourceHandle) {
        self.sources
            .lock()
            .expect("source table mutex poisoned")
            .insert(index, Arc::downgrade(handle));
    }

    pub(crate) fn remove_source(&self, index: u32) -> bool {
        self.sources
            .lock()
            .expect("source table mutex poisoned")
            .remove(&index)
            .is_some()
    }

    pub fn source_by_index(&self, index: u32) -> Option<SourceHandle> {
        self.sources
            .lock()
            .expect("source table mutex poisoned")
            .get(&index)
            .and_then(Weak::upgrade)
    }

    pub fn source_by_name(&self, name: &str) -> Option<SourceHandle> {
        let index = self
            .names
            .lock()
            .expect("name registry mutex poisoned")
            .lookup(name)?;
        self.source_by_index(index)
    }

    /// Live handles in index order.
    pub fn sources(&self) -> Vec<SourceHandle> {
        self.sources
            .lock()
            .expect("source table mutex poisoned")
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn source_count(&self) -> usize {
        self.sources().len()
    }

    /// Suspend or resume every linked source. Returns how many refused;
    /// a failure never stops the sweep.
    pub fn suspend_all(&self, suspend: bool) -> usize {
        let mut failed = 0;

        for handle in self.sources() {
            let mut source = handle.lock().expect("source mutex poisoned");
            if !source.state().is_linked() {
                continue;
            }
            if let Err(e) = source.suspend(suspend) {
                debug!("source {} refused suspend={}: {}", source.index(), suspend, e);
                failed += 1;
            }
        }

        failed
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("next_index", &self.next_index.load(Ordering::Relaxed))
            .field(
                "sources",
                &self.sources.lock().map(|s| s.len()).unwrap_or_default(),
            )
            .finish()
    }
}
