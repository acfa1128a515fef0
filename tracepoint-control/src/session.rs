/* -------------------------------------------------------------------------- *\
 *                |   █████╗ ██╗   ██╗██████╗  █████╗ ███████╗ |              *
 *                |  ██╔══██╗██║   ██║██╔══██╗██╔══██╗██╔════╝ |              *
 *                |  ███████║██║   ██║██████╔╝███████║█████╗   |              *
 *                |  ██╔══██║██║   ██║██╔══██╗██╔══██║██╔══╝   |              *
 *                |  ██║  ██║╚██████╔╝██║  ██║██║  ██║███████╗ |              *
 *                |  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ |              *
 *                +--------------------------------------------+              *
 *                                                                            *
 *                         Distributed Systems Runtime                        *
 * -------------------------------------------------------------------------- *
 * Copyright 2022 - 2024, the aurae contributors                              *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! The tracepoint session: per-CPU ring buffers plus the tracepoints that
//! write into them.
//!
//! The first tracepoint registered becomes the *leader*: its handles are
//! mapped and every later tracepoint redirects its output into the leader's
//! rings. Buffers and tracepoints refer to each other by index only.

use crate::buffer::{BufferInfo, RawRecord};
use crate::counters::{Counters, SessionCounters};
use crate::error::{Result, SessionError};
use crate::options::{BufferSizing, SessionMode, SessionOptions, Wakeup};
use crate::parser::{self, EventInfo, SampleFields};
use crate::perf_abi::{
    PerfEventAttr, SampleType, ATTR_FLAG_DISABLED, ATTR_FLAG_USE_CLOCKID,
    ATTR_FLAG_WATERMARK, ATTR_FLAG_WRITE_BACKWARD, PERF_FORMAT_ID,
    PERF_TYPE_TRACEPOINT,
};
use crate::session_info::SessionInfo;
use crate::sys::{LinuxPerf, PerfSystem, RingMemory, WaitOutcome};
use crate::tracepoint::{
    CommonTypeField, EnableState, EventDesc, TracefsCache, TracepointCache,
    TracepointInfo, TracepointMetadata, TracepointName,
};
use nix::sys::signal::SigSet;
use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Largest record the kernel can write (the header's size is a u16).
const MAX_RECORD_SIZE: usize = u16::MAX as usize;

/// A sample that decoded and resolved to a registered tracepoint.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DecodedSample {
    pub buffer: usize,
    pub record: RawRecord,
    pub wrapped: bool,
    pub fields: SampleFields,
    pub tracepoint: u32,
}

/// Collects tracepoint events from per-CPU perf ring buffers.
#[derive(Debug)]
pub struct TracepointSession<
    C: TracepointCache = TracefsCache,
    S: PerfSystem = LinuxPerf,
> {
    pub(crate) cache: C,
    pub(crate) system: S,
    pub(crate) options: SessionOptions,
    pub(crate) session_info: SessionInfo,
    pub(crate) buffers: Vec<BufferInfo>,
    pub(crate) tracepoints: BTreeMap<u32, TracepointInfo<S::Handle>>,
    /// Kernel sample id to tracepoint id.
    pub(crate) sample_ids: HashMap<u64, u32>,
    pub(crate) leader: Option<u32>,
    pub(crate) common_type: Option<CommonTypeField>,
    pub(crate) scratch: Vec<u8>,
    pub(crate) counters: SessionCounters,
}

impl TracepointSession {
    /// A session on the running kernel, resolving names through tracefs.
    pub fn new(options: SessionOptions) -> Result<Self> {
        Self::with_system(TracefsCache::new(), LinuxPerf::new(), options)
    }
}

impl<C: TracepointCache, S: PerfSystem> TracepointSession<C, S> {
    pub fn with_system(cache: C, system: S, options: SessionOptions) -> Result<Self> {
        options.validate()?;

        let page_size = system.page_size();
        let cpu_count = match options.buffer_sizing() {
            BufferSizing::Uniform(_) => system.cpu_count()?,
            BufferSizing::PerCpu(_) => 0,
        };
        let sizes = options.buffer_sizes(cpu_count, page_size);

        let mut buffers = Vec::new();
        buffers.try_reserve_exact(sizes.len())?;
        buffers.extend(sizes.iter().map(|&size| BufferInfo::new(size, page_size)));

        // Wrapped records are copied here; sized once so decoding never
        // allocates.
        let mut scratch = Vec::new();
        scratch.try_reserve_exact(MAX_RECORD_SIZE)?;

        debug!(
            "created {:?} session with {} buffers ({} in use)",
            options.mode(),
            buffers.len(),
            sizes.iter().filter(|&&size| size != 0).count()
        );

        Ok(Self {
            cache,
            system,
            session_info: SessionInfo::capture(options.mode(), options.clock()),
            options,
            buffers,
            tracepoints: BTreeMap::new(),
            sample_ids: HashMap::new(),
            leader: None,
            common_type: None,
            scratch,
            counters: SessionCounters::default(),
        })
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn mode(&self) -> SessionMode {
        self.options.mode()
    }

    pub fn is_realtime(&self) -> bool {
        self.mode() == SessionMode::RealTime
    }

    pub fn sample_type(&self) -> SampleType {
        self.options.sample_fields()
    }

    /// Number of per-CPU buffers, including unused ones.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn page_size(&self) -> usize {
        self.system.page_size()
    }

    pub fn session_info(&self) -> &SessionInfo {
        &self.session_info
    }

    pub fn counters(&self) -> Counters {
        self.counters.snapshot()
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Registered tracepoints, by id.
    pub fn tracepoints(&self) -> impl Iterator<Item = &TracepointInfo<S::Handle>> + '_ {
        self.tracepoints.values()
    }

    pub fn find_tracepoint(&self, id: u32) -> Option<&TracepointInfo<S::Handle>> {
        self.tracepoints.get(&id)
    }

    /// How often tracepoint `id` has fired on all CPUs.
    pub fn event_count(&self, id: u32) -> Result<u64> {
        self.tracepoints
            .get(&id)
            .ok_or(SessionError::TracepointNotFound { id })?
            .event_count(&self.system)
    }

    pub fn enable_tracepoint(&mut self, name: &TracepointName) -> Result<()> {
        self.add_tracepoint(name, true)
    }

    pub fn disable_tracepoint(&mut self, name: &TracepointName) -> Result<()> {
        self.add_tracepoint(name, false)
    }

    pub fn enable_tracepoint_id(&mut self, id: u32) -> Result<()> {
        self.add_tracepoint_id(id, true)
    }

    pub fn disable_tracepoint_id(&mut self, id: u32) -> Result<()> {
        self.add_tracepoint_id(id, false)
    }

    /// Registers `name` with the given state, or only changes its state if it
    /// is already registered.
    pub fn add_tracepoint(&mut self, name: &TracepointName, enabled: bool) -> Result<()> {
        let metadata = self.cache.find_by_name(name)?;
        self.add_metadata(metadata, enabled)
    }

    pub fn add_tracepoint_id(&mut self, id: u32, enabled: bool) -> Result<()> {
        if self.tracepoints.contains_key(&id) {
            return self.set_enable_state(id, enabled);
        }
        let metadata = self.cache.find_by_id(id)?;
        self.add_metadata(metadata, enabled)
    }

    fn add_metadata(
        &mut self,
        metadata: Arc<TracepointMetadata>,
        enabled: bool,
    ) -> Result<()> {
        if self.tracepoints.contains_key(&metadata.id()) {
            self.set_enable_state(metadata.id(), enabled)
        } else {
            self.register(metadata, enabled)
        }
    }

    fn event_attr(&self, id: u32, enabled: bool) -> PerfEventAttr {
        let mut flags = ATTR_FLAG_USE_CLOCKID;
        if !enabled {
            flags |= ATTR_FLAG_DISABLED;
        }
        if self.mode() == SessionMode::Circular {
            flags |= ATTR_FLAG_WRITE_BACKWARD;
        }
        let wakeup = match self.options.wakeup_policy() {
            Wakeup::Watermark(bytes) => {
                flags |= ATTR_FLAG_WATERMARK;
                bytes
            }
            Wakeup::Events(events) => events,
        };

        PerfEventAttr {
            attr_type: PERF_TYPE_TRACEPOINT,
            size: PerfEventAttr::SIZE,
            config: u64::from(id),
            sample_period: 1,
            sample_type: self.sample_type().0,
            read_format: PERF_FORMAT_ID,
            flags,
            wakeup_events_or_watermark: wakeup,
            clockid: self.options.clock(),
            ..PerfEventAttr::default()
        }
    }

    /// Opens one handle per buffer and hooks them up to the rings. Nothing in
    /// the session changes unless every step succeeds; handles and mappings
    /// created along the way are released when they go out of scope.
    fn register(&mut self, metadata: Arc<TracepointMetadata>, enabled: bool) -> Result<()> {
        let id = metadata.id();
        let attr = self.event_attr(id, enabled);
        let leader = self.leader.and_then(|leader| self.tracepoints.get(&leader));

        let mut handles = Vec::new();
        handles.try_reserve_exact(self.buffers.len())?;
        let mut sample_ids = Vec::new();
        sample_ids.try_reserve_exact(self.buffers.len())?;
        let mut rings: Vec<(usize, RingMemory)> = Vec::new();
        if leader.is_none() {
            rings.try_reserve_exact(self.buffers.len())?;
        }

        for (index, buffer) in self.buffers.iter().enumerate() {
            if buffer.is_empty() {
                handles.push(None);
                sample_ids.push(0);
                continue;
            }

            let cpu = index as u32;
            let handle = self
                .system
                .open_event(&attr, cpu)
                .map_err(|e| SessionError::os("perf_event_open", cpu, e))?;

            match leader {
                None => {
                    let ring = self
                        .system
                        .map_ring(&handle, buffer.mapping_len())
                        .map_err(|e| SessionError::os("mmap", cpu, e))?;
                    rings.push((index, ring));
                }
                Some(leader) => {
                    let leader_handle = leader.handle(index).ok_or(
                        SessionError::TracepointNotFound { id: leader.id() },
                    )?;
                    self.system
                        .set_output(&handle, leader_handle)
                        .map_err(|e| SessionError::os("PERF_EVENT_IOC_SET_OUTPUT", cpu, e))?;
                }
            }

            let sample_id = self
                .system
                .sample_id(&handle)
                .map_err(|e| SessionError::os("PERF_EVENT_IOC_ID", cpu, e))?;
            handles.push(Some(handle));
            sample_ids.push(sample_id);
        }

        self.sample_ids.try_reserve(sample_ids.len())?;

        // Commit.
        let becomes_leader = leader.is_none();
        for (index, ring) in rings {
            self.buffers[index].attach(ring);
        }
        for &sample_id in sample_ids.iter().filter(|&&sample_id| sample_id != 0) {
            let _ = self.sample_ids.insert(sample_id, id);
        }
        if becomes_leader {
            debug!("{} ({id}) is now the buffer leader", metadata.name());
            self.leader = Some(id);
        }
        match self.common_type {
            None => self.common_type = Some(metadata.common_type()),
            Some(common_type) if common_type != metadata.common_type() => {
                warn!(
                    "{} has a different common_type layout than the session",
                    metadata.name()
                );
            }
            Some(_) => {}
        }

        debug!("registered {} ({id}), enabled: {enabled}", metadata.name());
        let desc = EventDesc::new(metadata, attr, sample_ids);
        let _ = self
            .tracepoints
            .insert(id, TracepointInfo::new(desc, handles, EnableState::from(enabled)));
        Ok(())
    }

    /// Enables or disables every handle of tracepoint `id`. Every handle is
    /// tried; the last failure is returned.
    pub(crate) fn set_enable_state(&mut self, id: u32, enabled: bool) -> Result<()> {
        let tracepoint = self
            .tracepoints
            .get_mut(&id)
            .ok_or(SessionError::TracepointNotFound { id })?;
        let wanted = EnableState::from(enabled);
        if tracepoint.enable_state() == wanted {
            return Ok(());
        }

        let operation =
            if enabled { "PERF_EVENT_IOC_ENABLE" } else { "PERF_EVENT_IOC_DISABLE" };
        let mut last_error = None;
        for (index, handle) in tracepoint.handles() {
            if let Err(e) = self.system.set_enabled(handle, enabled) {
                warn!("{operation} failed for tracepoint {id} on cpu {index}: {e}");
                last_error = Some(SessionError::os(operation, index as u32, e));
            }
        }

        match last_error {
            None => {
                tracepoint.set_enable_state(wanted);
                Ok(())
            }
            Some(e) => {
                tracepoint.set_enable_state(EnableState::Unknown);
                Err(e)
            }
        }
    }

    /// Disables and forgets tracepoint `id`. The rings stay mapped while any
    /// tracepoint remains.
    pub fn remove_tracepoint(&mut self, id: u32) -> Result<()> {
        if !self.tracepoints.contains_key(&id) {
            return Err(SessionError::TracepointNotFound { id });
        }
        if let Err(e) = self.set_enable_state(id, false) {
            warn!("removing tracepoint {id} without disabling it: {e}");
        }

        if let Some(tracepoint) = self.tracepoints.remove(&id) {
            for sample_id in tracepoint.desc().sample_ids() {
                let _ = self.sample_ids.remove(&sample_id);
            }
        }

        if self.leader == Some(id) {
            // The other tracepoints already write into the leader's rings.
            self.leader = self.tracepoints.keys().next().copied();
            match self.leader {
                Some(leader) => debug!("tracepoint {leader} is now the buffer leader"),
                None => self.unmap_buffers(),
            }
        }
        Ok(())
    }

    /// Removes every tracepoint and unmaps the buffers.
    pub fn clear(&mut self) {
        self.tracepoints.clear();
        self.sample_ids.clear();
        self.leader = None;
        self.unmap_buffers();
    }

    fn unmap_buffers(&mut self) {
        debug!("unmapping {} buffers", self.buffers.len());
        for buffer in &mut self.buffers {
            buffer.detach();
        }
        self.common_type = None;
    }

    /// The handle that owns buffer `index`'s mapping.
    pub(crate) fn leader_handle(&self, index: usize) -> Option<&S::Handle> {
        self.tracepoints.get(&self.leader?)?.handle(index)
    }

    /// `(buffer index, handle)` for every mapped buffer. Polling these handles
    /// waits for data in the buffers.
    pub fn buffer_handles(&self) -> impl Iterator<Item = (usize, &S::Handle)> + '_ {
        self.leader
            .and_then(|leader| self.tracepoints.get(&leader))
            .into_iter()
            .flat_map(|leader| leader.handles())
    }

    /// Blocks until a buffer reaches its wakeup threshold, `timeout` passes or
    /// a signal not blocked by `sigmask` arrives.
    pub fn wait_for_wakeup(
        &self,
        timeout: Option<Duration>,
        sigmask: Option<&SigSet>,
    ) -> Result<WaitOutcome> {
        let handles: Vec<&S::Handle> =
            self.buffer_handles().map(|(_, handle)| handle).collect();
        trace!("waiting on {} buffers", handles.len());
        self.system
            .poll(&handles, timeout, sigmask)
            .map_err(|source| SessionError::Os { operation: "ppoll", cpu: None, source })
    }

    /// Starts a pass over buffer `index`, pausing a circular buffer first.
    /// Returns false if there is nothing to scan.
    pub(crate) fn begin_buffer(&mut self, index: usize) -> bool {
        if !self.buffers.get(index).is_some_and(BufferInfo::is_mapped) {
            return false;
        }

        let mode = self.mode();
        if mode == SessionMode::Circular {
            if let Some(handle) = self.leader_handle(index) {
                if let Err(e) = self.system.pause_output(handle, true) {
                    warn!("failed to pause buffer {index}: {e}");
                }
            }
        }
        self.buffers[index].begin(mode, &self.counters)
    }

    /// Ends the pass started by [`Self::begin_buffer`].
    pub(crate) fn end_buffer(&mut self, index: usize) {
        if !self.buffers.get(index).is_some_and(BufferInfo::is_active) {
            return;
        }

        let mode = self.mode();
        self.buffers[index].end(mode);
        if mode == SessionMode::Circular {
            if let Some(handle) = self.leader_handle(index) {
                if let Err(e) = self.system.pause_output(handle, false) {
                    warn!("failed to resume buffer {index}: {e}");
                }
            }
        }
    }

    pub(crate) fn next_record(&mut self, index: usize) -> Option<RawRecord> {
        let mode = self.mode();
        self.buffers.get_mut(index)?.next_record(mode, &self.counters)
    }

    /// Copies a wrapped record into the scratch buffer. Returns whether it
    /// was wrapped.
    fn stage(&mut self, buffer: usize, record: RawRecord) -> Option<bool> {
        let span = self.buffers.get(buffer)?.span(record.pos, record.len())?;
        if !span.is_wrapped() {
            return Some(false);
        }
        let _ = span.linearize(&mut self.scratch).ok()?;
        Some(true)
    }

    /// The linear bytes of a record; `wrapped` records live in the scratch
    /// buffer.
    pub(crate) fn record_bytes(
        &self,
        buffer: usize,
        record: RawRecord,
        wrapped: bool,
    ) -> Option<&[u8]> {
        if wrapped {
            return self.scratch.get(..record.len());
        }
        let info = self.buffers.get(buffer)?;
        info.data_slice(info.offset(record.pos), record.len())
    }

    fn resolve(&self, record: &[u8], fields: &SampleFields) -> Option<u32> {
        if let Some(field) = self.common_type {
            let id = record
                .get(fields.raw.range())
                .and_then(|raw| parser::common_type(raw, field));
            if let Some(id) = id.filter(|id| self.tracepoints.contains_key(id)) {
                return Some(id);
            }
        }

        let sample_id = fields.sample_id(self.sample_type())?;
        self.sample_ids.get(&sample_id).copied()
    }

    /// Decodes a sample record and finds its tracepoint. Failures are counted
    /// as corrupt events.
    pub(crate) fn decode(&mut self, buffer: usize, record: RawRecord) -> Option<DecodedSample> {
        let decoded = self.stage(buffer, record).and_then(|wrapped| {
            let bytes = self.record_bytes(buffer, record, wrapped)?;
            let fields = parser::parse_sample(bytes, self.sample_type())?;
            let tracepoint = self.resolve(bytes, &fields)?;
            Some(DecodedSample { buffer, record, wrapped, fields, tracepoint })
        });

        if decoded.is_none() {
            trace!("dropping undecodable sample at {:#x} in buffer {buffer}", record.pos);
            self.counters.corrupt_event();
        }
        decoded
    }

    pub(crate) fn event_info(&self, decoded: &DecodedSample) -> Option<EventInfo<'_>> {
        let record = self.record_bytes(decoded.buffer, decoded.record, decoded.wrapped)?;
        let desc = self.tracepoints.get(&decoded.tracepoint)?.desc();
        Some(EventInfo::new(record, decoded.fields, desc, &self.session_info))
    }

    /// Calls `f` for each event in buffer order until it breaks.
    pub fn enumerate_unordered<F>(&mut self, mut f: F)
    where
        F: FnMut(&EventInfo<'_>) -> ControlFlow<()>,
    {
        let mut events = self.unordered();
        while let Some(event) = events.move_next() {
            if f(&event).is_break() {
                break;
            }
        }
    }

    /// Calls `f` for each event in timestamp order until it breaks.
    pub fn enumerate_ordered<F>(&mut self, mut f: F) -> Result<()>
    where
        F: FnMut(&EventInfo<'_>) -> ControlFlow<()>,
    {
        let mut events = self.ordered()?;
        while let Some(event) = events.move_next() {
            if f(&event).is_break() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
impl<C: TracepointCache, S: PerfSystem> TracepointSession<C, S> {
    pub(crate) fn buffer_mut(&mut self, index: usize) -> &mut BufferInfo {
        &mut self.buffers[index]
    }

    pub(crate) fn system(&self) -> &S {
        &self.system
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cache, FakeOp, FakePerf, PAGE_SIZE};
    use crate::tracepoint::MemoryCache;
    use nix::errno::Errno;
    use simple_test_case::test_case;

    type TestSession = TracepointSession<MemoryCache, FakePerf>;

    fn session(mode: SessionMode, cpus: u32) -> TestSession {
        TracepointSession::with_system(
            cache(),
            FakePerf::new(cpus),
            SessionOptions::new(mode, PAGE_SIZE),
        )
        .expect("session")
    }

    fn name(event: &str) -> TracepointName {
        TracepointName::new("test", event).expect("name")
    }

    /// Everything registration may touch, for before/after comparison.
    fn registration_state(
        session: &TestSession,
    ) -> (Vec<(u32, EnableState)>, Vec<(u64, u32)>, Option<u32>, Vec<bool>) {
        let tracepoints = session
            .tracepoints()
            .map(|tp| (tp.id(), tp.enable_state()))
            .collect();
        let mut sample_ids: Vec<_> =
            session.sample_ids.iter().map(|(&k, &v)| (k, v)).collect();
        sample_ids.sort();
        let mapped = session.buffers.iter().map(BufferInfo::is_mapped).collect();
        (tracepoints, sample_ids, session.leader, mapped)
    }

    #[test]
    fn uniform_sizing_creates_one_buffer_per_cpu() {
        let session = session(SessionMode::RealTime, 4);
        assert_eq!(session.buffer_count(), 4);
        assert!(session.buffers.iter().all(|b| b.size() == PAGE_SIZE));
        assert!(session.is_realtime());
    }

    #[test]
    fn per_cpu_sizing_skips_zero_sized_buffers() {
        let mut session = TracepointSession::with_system(
            cache(),
            FakePerf::new(8),
            SessionOptions::per_cpu(SessionMode::RealTime, vec![PAGE_SIZE, 0, 100]),
        )
        .expect("session");
        assert_eq!(session.buffer_count(), 3);

        session.enable_tracepoint(&name("one")).expect("enable");
        let opened: Vec<u32> =
            session.system().calls_of(FakeOp::Open).iter().map(|c| c.cpu).collect();
        assert_eq!(opened, vec![0, 2]);
        assert_eq!(session.buffers[2].size(), PAGE_SIZE);
    }

    #[test]
    fn rejects_unsupported_sample_type() {
        let result = TracepointSession::with_system(
            cache(),
            FakePerf::new(1),
            SessionOptions::default().sample_type(SampleType::COMMON | SampleType::READ),
        );
        assert!(matches!(result, Err(SessionError::UnsupportedSampleType { .. })));
    }

    #[test]
    fn first_tracepoint_maps_and_later_ones_redirect() {
        let mut session = session(SessionMode::RealTime, 2);
        session.enable_tracepoint(&name("one")).expect("enable one");
        session.enable_tracepoint(&name("two")).expect("enable two");

        let system = session.system();
        assert_eq!(system.calls_of(FakeOp::Map).len(), 2);
        assert_eq!(system.calls_of(FakeOp::SetOutput).len(), 2);
        assert_eq!(system.live_handles(), 4);
        assert_eq!(session.leader, Some(1));
        assert_eq!(session.sample_ids.len(), 4);
        assert!(session.buffers.iter().all(BufferInfo::is_mapped));
        assert_eq!(session.common_type, Some(CommonTypeField { offset: 0, size: 2 }));
    }

    #[test]
    fn attr_reflects_mode_and_initial_state() {
        let mut session = session(SessionMode::Circular, 1);
        session.add_tracepoint(&name("one"), false).expect("add");

        let attr = *session.find_tracepoint(1).expect("registered").desc().attr();
        assert_eq!(attr.attr_type, PERF_TYPE_TRACEPOINT);
        assert_eq!(attr.config, 1);
        assert_eq!(attr.sample_period, 1);
        assert_eq!(attr.read_format, PERF_FORMAT_ID);
        assert!(attr.has_flag(ATTR_FLAG_DISABLED));
        assert!(attr.has_flag(ATTR_FLAG_WRITE_BACKWARD));
        assert!(attr.has_flag(ATTR_FLAG_USE_CLOCKID));
        assert_eq!(attr.clockid, libc::CLOCK_MONOTONIC);
        assert_eq!(
            session.find_tracepoint(1).map(TracepointInfo::enable_state),
            Some(EnableState::Disabled)
        );
    }

    #[test_case(FakeOp::Open; "open fails")]
    #[test_case(FakeOp::Map; "mapping fails")]
    #[test_case(FakeOp::SampleId; "id lookup fails")]
    #[test]
    fn failed_leader_registration_changes_nothing(op: FakeOp) {
        let mut session = session(SessionMode::RealTime, 3);
        let before = registration_state(&session);

        session.system().fail(op, Some(2), Errno::EMFILE);
        let err = session.enable_tracepoint(&name("one")).expect_err("must fail");

        assert_eq!(err.errno(), Some(Errno::EMFILE));
        assert_eq!(registration_state(&session), before);
        assert_eq!(session.system().live_handles(), 0);
    }

    #[test_case(FakeOp::Open; "open fails")]
    #[test_case(FakeOp::SetOutput; "redirect fails")]
    #[test_case(FakeOp::SampleId; "id lookup fails")]
    #[test]
    fn failed_follower_registration_changes_nothing(op: FakeOp) {
        let mut session = session(SessionMode::RealTime, 3);
        session.enable_tracepoint(&name("one")).expect("leader");
        let before = registration_state(&session);
        let live = session.system().live_handles();

        session.system().fail(op, Some(1), Errno::ENOSPC);
        assert!(session.enable_tracepoint(&name("two")).is_err());

        assert_eq!(registration_state(&session), before);
        assert_eq!(session.system().live_handles(), live);

        session.system().clear_failures();
        session.enable_tracepoint(&name("two")).expect("retry succeeds");
        assert_eq!(session.tracepoints().count(), 2);
    }

    #[test]
    fn unknown_tracepoint_is_a_cache_error() {
        let mut session = session(SessionMode::RealTime, 1);
        assert!(matches!(
            session.enable_tracepoint(&name("missing")),
            Err(SessionError::Cache(_))
        ));
        assert!(matches!(
            session.disable_tracepoint_id(99),
            Err(SessionError::Cache(_))
        ));
    }

    #[test]
    fn redundant_state_changes_issue_no_calls() {
        let mut session = session(SessionMode::RealTime, 2);
        session.enable_tracepoint(&name("one")).expect("enable");
        session.system().clear_calls();

        session.disable_tracepoint(&name("one")).expect("disable");
        assert_eq!(session.system().calls_of(FakeOp::Disable).len(), 2);
        session.disable_tracepoint(&name("one")).expect("disable again");
        assert_eq!(session.system().calls_of(FakeOp::Disable).len(), 2);

        session.enable_tracepoint_id(1).expect("enable");
        session.enable_tracepoint_id(1).expect("enable again");
        assert_eq!(session.system().calls_of(FakeOp::Enable).len(), 2);
        assert_eq!(session.system().calls_of(FakeOp::Open).len(), 0);
        assert_eq!(
            session.find_tracepoint(1).map(TracepointInfo::enable_state),
            Some(EnableState::Enabled)
        );
    }

    #[test]
    fn fan_out_reaches_every_handle_and_reports_last_error() {
        let mut session = session(SessionMode::RealTime, 3);
        session.add_tracepoint(&name("one"), false).expect("add");
        session.system().clear_calls();
        session.system().fail(FakeOp::Enable, Some(0), Errno::EBADF);
        session.system().fail(FakeOp::Enable, Some(1), Errno::ENODEV);

        let err = session.enable_tracepoint(&name("one")).expect_err("fails");
        assert_eq!(err.errno(), Some(Errno::ENODEV));
        assert_eq!(session.system().calls_of(FakeOp::Enable).len(), 3);
        assert_eq!(
            session.find_tracepoint(1).map(TracepointInfo::enable_state),
            Some(EnableState::Unknown)
        );

        // Unknown state means the next request is issued again.
        session.system().clear_failures();
        session.enable_tracepoint(&name("one")).expect("enable");
        assert_eq!(session.system().calls_of(FakeOp::Enable).len(), 6);
    }

    #[test]
    fn removing_the_leader_promotes_another_tracepoint() {
        let mut session = session(SessionMode::RealTime, 2);
        session.enable_tracepoint(&name("one")).expect("one");
        session.enable_tracepoint(&name("two")).expect("two");

        session.remove_tracepoint(1).expect("remove");
        assert_eq!(session.leader, Some(2));
        assert!(session.buffers.iter().all(BufferInfo::is_mapped));
        assert_eq!(session.sample_ids.len(), 2);
        assert_eq!(session.system().live_handles(), 2);
        assert_eq!(session.buffer_handles().count(), 2);

        session.remove_tracepoint(2).expect("remove");
        assert_eq!(session.leader, None);
        assert!(session.buffers.iter().all(|b| !b.is_mapped()));
        assert!(matches!(
            session.remove_tracepoint(2),
            Err(SessionError::TracepointNotFound { id: 2 })
        ));

        // The next registration maps the buffers again.
        session.system().clear_calls();
        session.enable_tracepoint(&name("three")).expect("three");
        assert_eq!(session.system().calls_of(FakeOp::Map).len(), 2);
        assert_eq!(session.leader, Some(3));
    }

    #[test]
    fn clear_releases_everything() {
        let mut session = session(SessionMode::Circular, 2);
        session.enable_tracepoint(&name("one")).expect("one");
        session.enable_tracepoint(&name("two")).expect("two");

        session.clear();
        assert_eq!(session.tracepoints().count(), 0);
        assert_eq!(session.system().live_handles(), 0);
        assert!(session.buffers.iter().all(|b| !b.is_mapped()));
    }

    #[test]
    fn event_count_sums_all_cpus() {
        let mut session = session(SessionMode::RealTime, 3);
        session.enable_tracepoint(&name("one")).expect("one");
        // The fake reports 10 * (cpu + 1) per handle.
        assert_eq!(session.event_count(1).expect("count"), 60);
        assert!(session.event_count(2).is_err());
    }

    #[test_case(Ok(WaitOutcome::Ready(1)), WaitOutcome::Ready(1); "ready")]
    #[test_case(Ok(WaitOutcome::Interrupted), WaitOutcome::Interrupted; "interrupted")]
    #[test_case(Ok(WaitOutcome::TimedOut), WaitOutcome::TimedOut; "timed out")]
    #[test]
    fn wait_polls_leader_handles(
        result: std::result::Result<WaitOutcome, Errno>,
        expected: WaitOutcome,
    ) {
        let mut session = session(SessionMode::RealTime, 2);
        session.enable_tracepoint(&name("one")).expect("one");
        session.enable_tracepoint(&name("two")).expect("two");
        session.system().set_poll_result(result);

        let outcome = session
            .wait_for_wakeup(Some(Duration::from_millis(10)), None)
            .expect("wait");
        assert_eq!(outcome, expected);
        assert_eq!(session.system().polled(), vec![2]);
    }

    #[test]
    fn wait_failure_carries_errno() {
        let session = session(SessionMode::RealTime, 1);
        session.system().set_poll_result(Err(Errno::EINVAL));
        let err = session.wait_for_wakeup(None, None).expect_err("fails");
        assert_eq!(err.errno(), Some(Errno::EINVAL));
    }
}
