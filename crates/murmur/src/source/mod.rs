//! Capture sources.
//!
//! A source is split in two halves that never share a lock:
//!
//! - [`Source`], the control half, behind a [`SourceHandle`]. Volume, mute,
//!   suspend and lifecycle operations run here on whichever thread holds the
//!   handle.
//! - [`SourceRt`], the realtime half, owned by the realtime loop. It holds
//!   the attached consumer streams, soft volume/mute and the mirrored state,
//!   and fans captured chunks out to consumers.
//!
//! The only path from control to realtime is the source's message queue.
//! State changes and synchronous reads use `send`; volume, mute and consumer
//! plumbing use `post`.
//!
//! ## Lifecycle
//!
//! ```text
//! new ──► Init ──put──► Idle ◄──► Running
//!                        ▲  ╲      ╱  ▲
//!                        │   Suspended │
//!                        └──────┬──────┘
//!                             unlink ──► Unlinked
//! ```
//!
//! Idle and Running follow the consumer count. Suspended needs
//! [`SourceFlags::CAN_SUSPEND`].

pub mod backend;
pub mod message;
pub mod realtime;
pub mod state;

pub use backend::{BackendError, Hook, HookOp, HookTable, SourceBackend};
pub use message::{SourceMessage, SourceReply, MESSAGE_MAX};
pub use realtime::{LatencyProbe, SourceRt};
pub use state::SourceState;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bitflags::bitflags;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::{CoreHook, Facility, SubscriptionKind};
use crate::msgq::{ChannelError, MessageSender};
use crate::namereg::NameError;
use crate::output::{OutputControl, OutputStream};
use crate::registry::Core;
use crate::rtpoll::RtPoll;
use crate::sample::{ChannelMap, ChannelVolume, SampleSpec};

/// Shared handle to the control half of a source.
pub type SourceHandle = Arc<Mutex<Source>>;

/// Control-side end of a source's message queue.
pub type SourceSender = MessageSender<SourceMessage, SourceReply>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SourceFlags: u32 {
        const HW_VOLUME_CTRL = 0x0001;
        const LATENCY = 0x0002;
        const HARDWARE = 0x0004;
        const NETWORK = 0x0008;
        const HW_MUTE_CTRL = 0x0010;
        const CAN_SUSPEND = 0x0020;
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid sample spec: {0}")]
    InvalidSampleSpec(SampleSpec),

    #[error("invalid channel map")]
    InvalidChannelMap,

    #[error("channel map has {map} channels, sample spec has {spec}")]
    ChannelCountMismatch { spec: u8, map: u8 },

    #[error("invalid source name {0:?}")]
    InvalidName(String),

    #[error(transparent)]
    Name(#[from] NameError),

    #[error("source {index} cannot be suspended")]
    NotSupported { index: u32 },

    #[error("backend refused: {0}")]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Parameters for [`Source::new`].
#[derive(Debug, Clone)]
pub struct SourceNewData {
    pub name: String,
    pub driver: Option<String>,
    pub spec: SampleSpec,
    /// Filled with [`ChannelMap::auto`] when absent.
    pub channel_map: Option<ChannelMap>,
    /// Fail instead of picking `name.N` when the name is taken.
    pub fail_on_collision: bool,
}

impl SourceNewData {
    pub fn new(name: impl Into<String>, spec: SampleSpec) -> Self {
        Self {
            name: name.into(),
            driver: None,
            spec,
            channel_map: None,
            fail_on_collision: false,
        }
    }

    pub fn driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self
    }

    pub fn channel_map(mut self, map: ChannelMap) -> Self {
        self.channel_map = Some(map);
        self
    }

    pub fn fail_on_collision(mut self, fail: bool) -> Self {
        self.fail_on_collision = fail;
        self
    }
}

/// Snapshot of a source for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    pub index: u32,
    pub name: String,
    pub description: Option<String>,
    pub driver: Option<String>,
    pub owner: Option<String>,
    pub state: SourceState,
    pub sample_spec: SampleSpec,
    pub channel_map: String,
    pub volume: Vec<u32>,
    pub muted: bool,
    pub flags: u32,
    pub outputs: usize,
}

/// Control half of a source.
pub struct Source {
    core: Arc<Core>,
    index: u32,
    name: String,
    description: Option<String>,
    driver: Option<String>,
    owner: Option<String>,

    spec: SampleSpec,
    channel_map: ChannelMap,

    state: SourceState,
    flags: SourceFlags,

    volume: ChannelVolume,
    muted: bool,
    refresh_volume: bool,
    refresh_muted: bool,

    outputs: BTreeMap<u32, Weak<dyn OutputControl>>,

    backend: Option<Box<dyn SourceBackend>>,
    hooks: HookTable,

    asyncmsgq: Option<SourceSender>,
    rtpoll: Option<RtPoll>,
}

impl Source {
    /// Validate, register and create a source in `Init`.
    ///
    /// Returns the control handle and the realtime half. The realtime half
    /// belongs on the thread that will service the source's message queue.
    pub fn new(
        core: &Arc<Core>,
        data: SourceNewData,
    ) -> Result<(SourceHandle, SourceRt), SourceError> {
        let spec = data.spec;
        if !spec.is_valid() {
            return Err(SourceError::InvalidSampleSpec(spec));
        }

        let channel_map = match data.channel_map {
            Some(map) => map,
            None => ChannelMap::auto(spec.channels).ok_or(SourceError::InvalidChannelMap)?,
        };
        if !channel_map.is_valid() {
            return Err(SourceError::InvalidChannelMap);
        }
        if channel_map.channels() != spec.channels {
            return Err(SourceError::ChannelCountMismatch {
                spec: spec.channels,
                map: channel_map.channels(),
            });
        }

        if data.name.is_empty() {
            return Err(SourceError::InvalidName(data.name));
        }
        if let Some(driver) = &data.driver {
            if driver.is_empty() || driver.chars().any(char::is_control) {
                return Err(SourceError::InvalidName(driver.clone()));
            }
        }

        let index = core.assign_index();
        let name = core.register_name(&data.name, index, data.fail_on_collision)?;

        let volume = ChannelVolume::norm(spec.channels);
        let muted = false;

        let source = Source {
            core: core.clone(),
            index,
            name,
            description: None,
            driver: data.driver,
            owner: None,
            spec,
            channel_map,
            state: SourceState::Init,
            flags: SourceFlags::empty(),
            volume,
            muted,
            refresh_volume: false,
            refresh_muted: false,
            outputs: BTreeMap::new(),
            backend: None,
            hooks: HookTable::default(),
            asyncmsgq: None,
            rtpoll: None,
        };

        info!(
            "Created source {} \"{}\" with sample spec {}",
            index, source.name, spec
        );

        let handle = Arc::new(Mutex::new(source));
        core.insert_source(index, &handle);

        Ok((handle, SourceRt::new(index, spec, volume, muted)))
    }

    pub fn set_message_queue(&mut self, queue: SourceSender) {
        self.asyncmsgq = Some(queue);
    }

    pub fn set_rtpoll(&mut self, rtpoll: RtPoll) {
        self.rtpoll = Some(rtpoll);
    }

    /// Install the device backend; its `provides` answers decide which hooks
    /// start out native.
    pub fn set_backend(&mut self, backend: Box<dyn SourceBackend>) {
        self.hooks = HookTable::for_backend(backend.as_ref());
        self.backend = Some(backend);
    }

    pub fn set_flags(&mut self, flags: SourceFlags) {
        self.flags = flags;
    }

    pub fn set_refresh_volume(&mut self, refresh: bool) {
        self.refresh_volume = refresh;
    }

    pub fn set_refresh_muted(&mut self, refresh: bool) {
        self.refresh_muted = refresh;
    }

    /// Publish the source: `Init -> Idle`.
    ///
    /// # Panics
    ///
    /// Unless the source is in `Init` with a message queue and rtpoll set.
    pub fn put(&mut self) -> Result<(), SourceError> {
        assert_eq!(self.state, SourceState::Init, "put on source {} twice", self.index);
        assert!(self.rtpoll.is_some(), "source {} has no rtpoll", self.index);
        assert!(self.asyncmsgq.is_some(), "source {} has no message queue", self.index);

        self.post(SourceMessage::SetState(SourceState::Idle))?;
        self.state = SourceState::Idle;

        let events = self.core.events();
        events.subscription(Facility::Source, SubscriptionKind::New, self.index);
        events.hook(CoreHook::SourceNewPost, self.index);

        debug!("source {} \"{}\" published", self.index, self.name);
        Ok(())
    }

    /// Tear the source down: kill consumers, drop the backend, reach `Unlinked`.
    ///
    /// # Panics
    ///
    /// If the source is not linked.
    pub fn unlink(&mut self) {
        self.assert_linked("unlink");

        self.core.events().hook(CoreHook::SourceUnlink, self.index);

        self.core.unregister_name(&self.name);
        self.core.remove_source(self.index);

        let indices: Vec<u32> = self.outputs.keys().copied().collect();
        for index in indices {
            if let Some(output) = self.outputs.get(&index).and_then(Weak::upgrade) {
                output.kill();
            }
            if let Err(e) = self.remove_output(index) {
                warn!("source {}: detaching output {} failed: {}", self.index, index, e);
            }
        }

        self.force_unlinked();

        self.hooks.clear();
        self.backend = None;

        let events = self.core.events();
        events.subscription(Facility::Source, SubscriptionKind::Remove, self.index);
        events.hook(CoreHook::SourceUnlinkPost, self.index);

        info!("Unlinked source {} \"{}\"", self.index, self.name);
    }

    /// Recompute Idle/Running from the consumer count. No-op while suspended.
    pub fn update_status(&mut self) -> Result<(), SourceError> {
        self.assert_linked("update_status");

        if self.state == SourceState::Suspended {
            return Ok(());
        }

        self.set_state(self.state_for_usage())
    }

    /// Suspend, or resume to Idle/Running by consumer count.
    pub fn suspend(&mut self, suspend: bool) -> Result<(), SourceError> {
        self.assert_linked("suspend");

        if suspend {
            self.set_state(SourceState::Suspended)
        } else {
            self.set_state(self.state_for_usage())
        }
    }

    /// Post a no-op to the realtime side.
    pub fn ping(&mut self) -> Result<(), SourceError> {
        self.assert_linked("ping");
        self.post(SourceMessage::Ping)
    }

    /// Block until every message already queued for this source has run.
    pub fn flush(&mut self) -> Result<(), SourceError> {
        self.send(SourceMessage::Ping).map(|_| ())
    }

    /// Capture latency. Zero unless opened or when nothing can answer.
    pub fn latency(&mut self) -> Duration {
        self.assert_linked("latency");

        if !self.state.is_opened() {
            return Duration::ZERO;
        }

        if self.hooks.is_native(HookOp::Latency) {
            if let Some(backend) = self.backend.as_mut() {
                match backend.latency() {
                    Ok(latency) => return latency,
                    Err(e) => self.disable_hook(HookOp::Latency, &e),
                }
            }
        }

        match self.send(SourceMessage::GetLatency) {
            Ok(SourceReply::Latency(latency)) => latency,
            Ok(other) => {
                warn!("source {}: unexpected latency reply {:?}", self.index, other);
                Duration::ZERO
            }
            Err(e) => {
                debug!("source {}: no latency available: {}", self.index, e);
                Duration::ZERO
            }
        }
    }

    pub fn set_volume(&mut self, volume: &ChannelVolume) -> Result<(), SourceError> {
        self.assert_linked("set_volume");
        assert_eq!(
            volume.channels(),
            self.spec.channels,
            "volume channel count does not match source {}",
            self.index
        );

        let changed = *volume != self.volume;
        self.volume = *volume;

        if self.hooks.is_native(HookOp::SetVolume) {
            if let Some(backend) = self.backend.as_mut() {
                if let Err(e) = backend.set_volume(volume) {
                    self.disable_hook(HookOp::SetVolume, &e);
                }
            }
        }

        let result = if self.hooks.is_native(HookOp::SetVolume) {
            Ok(())
        } else {
            self.post(SourceMessage::SetVolume(*volume))
        };

        if changed {
            self.notify_change();
        }

        result
    }

    /// Current volume, refreshed from the backend or realtime side when
    /// configured to.
    pub fn volume(&mut self) -> ChannelVolume {
        self.assert_linked("volume");

        let old = self.volume;

        if self.hooks.is_native(HookOp::GetVolume) {
            if let Some(backend) = self.backend.as_mut() {
                match backend.volume() {
                    Ok(volume) => self.volume = volume,
                    Err(e) => self.disable_hook(HookOp::GetVolume, &e),
                }
            }
        }

        if !self.hooks.is_native(HookOp::GetVolume) && self.refresh_volume {
            match self.send(SourceMessage::GetVolume) {
                Ok(SourceReply::Volume(volume)) => self.volume = volume,
                Ok(other) => warn!("source {}: unexpected volume reply {:?}", self.index, other),
                Err(e) => warn!("source {}: volume refresh failed: {}", self.index, e),
            }
        }

        if old != self.volume {
            self.notify_change();
        }

        self.volume
    }

    pub fn set_mute(&mut self, muted: bool) -> Result<(), SourceError> {
        self.assert_linked("set_mute");

        let changed = self.muted != muted;
        self.muted = muted;

        if self.hooks.is_native(HookOp::SetMute) {
            if let Some(backend) = self.backend.as_mut() {
                if let Err(e) = backend.set_mute(muted) {
                    self.disable_hook(HookOp::SetMute, &e);
                }
            }
        }

        let result = if self.hooks.is_native(HookOp::SetMute) {
            Ok(())
        } else {
            self.post(SourceMessage::SetMute(muted))
        };

        if changed {
            self.notify_change();
        }

        result
    }

    pub fn mute(&mut self) -> bool {
        self.assert_linked("mute");

        let old = self.muted;

        if self.hooks.is_native(HookOp::GetMute) {
            if let Some(backend) = self.backend.as_mut() {
                match backend.mute() {
                    Ok(muted) => self.muted = muted,
                    Err(e) => self.disable_hook(HookOp::GetMute, &e),
                }
            }
        }

        if !self.hooks.is_native(HookOp::GetMute) && self.refresh_muted {
            match self.send(SourceMessage::GetMute) {
                Ok(SourceReply::Muted(muted)) => self.muted = muted,
                Ok(other) => warn!("source {}: unexpected mute reply {:?}", self.index, other),
                Err(e) => warn!("source {}: mute refresh failed: {}", self.index, e),
            }
        }

        if old != self.muted {
            self.notify_change();
        }

        self.muted
    }

    pub fn set_description(&mut self, description: Option<String>) {
        if description == self.description {
            return;
        }
        self.description = description;
        self.notify_change();
    }

    /// Record which module owns this source.
    pub fn set_owner(&mut self, owner: Option<String>) {
        if owner == self.owner {
            return;
        }
        self.owner = owner;
        self.notify_change();
    }

    /// Attach a consumer. The stream half moves to the realtime thread.
    ///
    /// # Panics
    ///
    /// If the source is not linked or the halves disagree on their index.
    pub fn attach_output(
        &mut self,
        control: Arc<dyn OutputControl>,
        stream: Box<dyn OutputStream>,
    ) -> Result<(), SourceError> {
        self.assert_linked("attach_output");

        let index = control.index();
        assert_eq!(index, stream.index(), "output halves disagree on index");

        self.outputs.insert(index, Arc::downgrade(&control));
        if let Err(e) = self.post(SourceMessage::AddOutput(stream)) {
            self.outputs.remove(&index);
            return Err(e);
        }

        debug!("source {}: attached output {}", self.index, index);

        if let Err(e) = self.update_status() {
            warn!("source {}: status update after attach failed: {}", self.index, e);
        }
        Ok(())
    }

    /// Detach a consumer and release its stream half on the realtime thread.
    pub fn detach_output(&mut self, index: u32) -> Result<(), SourceError> {
        self.assert_linked("detach_output");

        if !self.outputs.contains_key(&index) {
            debug!("source {}: output {} not attached", self.index, index);
            return Ok(());
        }

        self.remove_output(index)?;
        debug!("source {}: detached output {}", self.index, index);

        if let Err(e) = self.update_status() {
            warn!("source {}: status update after detach failed: {}", self.index, e);
        }
        Ok(())
    }

    /// Number of attached consumers.
    ///
    /// # Panics
    ///
    /// If the source is not linked.
    pub fn used_by(&self) -> usize {
        self.assert_linked("used_by");
        self.outputs.len()
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn driver(&self) -> Option<&str> {
        self.driver.as_deref()
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn flags(&self) -> SourceFlags {
        self.flags
    }

    pub fn sample_spec(&self) -> &SampleSpec {
        &self.spec
    }

    pub fn channel_map(&self) -> &ChannelMap {
        &self.channel_map
    }

    pub fn hooks(&self) -> &HookTable {
        &self.hooks
    }

    /// Cached volume, without consulting backend or realtime side.
    pub fn cached_volume(&self) -> &ChannelVolume {
        &self.volume
    }

    pub fn cached_mute(&self) -> bool {
        self.muted
    }

    pub fn info(&self) -> SourceInfo {
        SourceInfo {
            index: self.index,
            name: self.name.clone(),
            description: self.description.clone(),
            driver: self.driver.clone(),
            owner: self.owner.clone(),
            state: self.state,
            sample_spec: self.spec,
            channel_map: self.channel_map.to_string(),
            volume: self.volume.values().iter().map(|v| v.0).collect(),
            muted: self.muted,
            flags: self.flags.bits(),
            outputs: self.outputs.len(),
        }
    }

    fn set_state(&mut self, state: SourceState) -> Result<(), SourceError> {
        if self.state == state {
            return Ok(());
        }

        let crossing_suspend = (self.state == SourceState::Suspended && state.is_opened())
            || (self.state.is_opened() && state == SourceState::Suspended);

        if crossing_suspend {
            if !self.flags.contains(SourceFlags::CAN_SUSPEND) {
                return Err(SourceError::NotSupported { index: self.index });
            }

            let suspending = state == SourceState::Suspended;
            for output in self.outputs.values().filter_map(Weak::upgrade) {
                output.suspend(suspending);
            }
        }

        if self.hooks.is_native(HookOp::SetState) {
            if let Some(backend) = self.backend.as_mut() {
                backend.set_state(state).map_err(|e| {
                    warn!("source {}: backend refused {}: {}", self.index, state, e);
                    SourceError::Backend(e)
                })?;
            }
        }

        self.send(SourceMessage::SetState(state))?;

        debug!("source {}: {} -> {}", self.index, self.state, state);
        self.state = state;

        if state != SourceState::Unlinked {
            self.core
                .events()
                .hook(CoreHook::SourceStateChanged, self.index);
        }

        Ok(())
    }

    /// Unlinked on both halves. The backend is told but cannot veto.
    fn force_unlinked(&mut self) {
        if self.hooks.is_native(HookOp::SetState) {
            if let Some(backend) = self.backend.as_mut() {
                if let Err(e) = backend.set_state(SourceState::Unlinked) {
                    warn!("source {}: backend refused unlink, forcing: {}", self.index, e);
                }
            }
        }

        if let Err(e) = self.send(SourceMessage::SetState(SourceState::Unlinked)) {
            warn!("source {}: realtime side missed unlink: {}", self.index, e);
        }

        debug!("source {}: {} -> {}", self.index, self.state, SourceState::Unlinked);
        self.state = SourceState::Unlinked;
    }

    fn state_for_usage(&self) -> SourceState {
        if self.outputs.is_empty() {
            SourceState::Idle
        } else {
            SourceState::Running
        }
    }

    fn remove_output(&mut self, index: u32) -> Result<(), SourceError> {
        self.outputs.remove(&index);
        self.post(SourceMessage::RemoveOutput(index))
    }

    fn disable_hook(&mut self, op: HookOp, error: &BackendError) {
        warn!(
            "source {}: {:?} hook failed, using software path: {}",
            self.index, op, error
        );
        self.hooks.disable(op);
    }

    fn notify_change(&self) {
        self.core
            .events()
            .subscription(Facility::Source, SubscriptionKind::Change, self.index);
    }

    fn queue(&mut self) -> &mut SourceSender {
        let index = self.index;
        self.asyncmsgq
            .as_mut()
            .unwrap_or_else(|| panic!("source {} has no message queue", index))
    }

    fn send(&mut self, msg: SourceMessage) -> Result<SourceReply, SourceError> {
        Ok(self.queue().send(msg)?)
    }

    fn post(&mut self, msg: SourceMessage) -> Result<(), SourceError> {
        Ok(self.queue().post(msg, None)?)
    }

    fn assert_linked(&self, op: &str) {
        assert!(
            self.state.is_linked(),
            "{} on source {} in state {}",
            op,
            self.index,
            self.state
        );
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        if self.state.is_linked() {
            self.unlink();
        } else if self.state == SourceState::Init {
            self.core.unregister_name(&self.name);
            self.core.remove_source(self.index);
        }

        info!("Freeing source {} \"{}\"", self.index, self.name);
        self.outputs.clear();
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("spec", &self.spec)
            .field("flags", &self.flags)
            .field("outputs", &self.outputs.keys().collect::<Vec<_>>())
            .finish()
    }
}
