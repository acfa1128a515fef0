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

//! An in-memory [`PerfSystem`] for unit tests.

use crate::perf_abi::{mmap_page, PerfEventAttr};
use crate::sys::{PerfSystem, RingMemory, WaitOutcome};
use crate::tracepoint::{MemoryCache, TracepointMetadata, TracepointName};
use nix::errno::Errno;
use nix::sys::signal::SigSet;
use std::cell::RefCell;
use std::collections::HashSet;
use std::io;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::time::Duration;

pub(crate) const PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FakeOp {
    Open,
    Map,
    SetOutput,
    SampleId,
    Enable,
    Disable,
    Pause,
    Resume,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FakeCall {
    pub op: FakeOp,
    pub handle: u64,
    pub cpu: u32,
}

/// An open fake event. Dropping it closes it.
#[derive(Debug)]
pub(crate) struct FakeHandle {
    pub id: u64,
    pub cpu: u32,
    pub config: u64,
    pub flags: u64,
    live: Rc<RefCell<HashSet<u64>>>,
}

impl Drop for FakeHandle {
    fn drop(&mut self) {
        let _ = self.live.borrow_mut().remove(&self.id);
    }
}

#[derive(Debug, Default)]
struct FakeState {
    next_handle: u64,
    calls: Vec<FakeCall>,
    failures: Vec<(FakeOp, Option<u32>, Errno)>,
    poll_result: Option<Result<WaitOutcome, Errno>>,
    polled: Vec<usize>,
}

#[derive(Debug)]
pub(crate) struct FakePerf {
    cpu_count: u32,
    live: Rc<RefCell<HashSet<u64>>>,
    state: RefCell<FakeState>,
}

impl FakePerf {
    pub(crate) fn new(cpu_count: u32) -> Self {
        Self {
            cpu_count,
            live: Rc::default(),
            state: RefCell::default(),
        }
    }

    /// Makes every `op` on `cpu` (or on any cpu) fail with `errno`.
    pub(crate) fn fail(&self, op: FakeOp, cpu: Option<u32>, errno: Errno) {
        self.state.borrow_mut().failures.push((op, cpu, errno));
    }

    pub(crate) fn clear_failures(&self) {
        self.state.borrow_mut().failures.clear();
    }

    pub(crate) fn calls(&self) -> Vec<FakeCall> {
        self.state.borrow().calls.clone()
    }

    pub(crate) fn calls_of(&self, op: FakeOp) -> Vec<FakeCall> {
        self.calls().into_iter().filter(|call| call.op == op).collect()
    }

    pub(crate) fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    pub(crate) fn live_handles(&self) -> usize {
        self.live.borrow().len()
    }

    pub(crate) fn set_poll_result(&self, result: Result<WaitOutcome, Errno>) {
        self.state.borrow_mut().poll_result = Some(result);
    }

    /// Handle counts passed to each poll.
    pub(crate) fn polled(&self) -> Vec<usize> {
        self.state.borrow().polled.clone()
    }

    fn record(&self, op: FakeOp, handle: u64, cpu: u32) -> Result<(), Errno> {
        let mut state = self.state.borrow_mut();
        state.calls.push(FakeCall { op, handle, cpu });
        let failure = state.failures.iter().find(|(failing, on_cpu, _)| {
            *failing == op && on_cpu.map_or(true, |on_cpu| on_cpu == cpu)
        });
        match failure {
            Some((_, _, errno)) => Err(*errno),
            None => Ok(()),
        }
    }
}

impl PerfSystem for FakePerf {
    type Handle = FakeHandle;

    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn cpu_count(&self) -> io::Result<u32> {
        Ok(self.cpu_count)
    }

    fn open_event(&self, attr: &PerfEventAttr, cpu: u32) -> Result<FakeHandle, Errno> {
        let id = {
            let mut state = self.state.borrow_mut();
            state.next_handle += 1;
            state.next_handle
        };
        self.record(FakeOp::Open, id, cpu)?;
        let _ = self.live.borrow_mut().insert(id);
        Ok(FakeHandle {
            id,
            cpu,
            config: attr.config,
            flags: attr.flags,
            live: self.live.clone(),
        })
    }

    fn map_ring(&self, handle: &FakeHandle, len: usize) -> Result<RingMemory, Errno> {
        self.record(FakeOp::Map, handle.id, handle.cpu)?;
        let ring = RingMemory::owned(len);
        for (offset, value) in [
            (mmap_page::DATA_OFFSET, PAGE_SIZE),
            (mmap_page::DATA_SIZE, len - PAGE_SIZE),
        ] {
            if let Some(word) = ring.header_word(offset) {
                word.store(value as u64, Ordering::Release);
            }
        }
        Ok(ring)
    }

    fn set_output(&self, handle: &FakeHandle, _leader: &FakeHandle) -> Result<(), Errno> {
        self.record(FakeOp::SetOutput, handle.id, handle.cpu)
    }

    fn sample_id(&self, handle: &FakeHandle) -> Result<u64, Errno> {
        self.record(FakeOp::SampleId, handle.id, handle.cpu)?;
        Ok(1000 + handle.id)
    }

    fn set_enabled(&self, handle: &FakeHandle, enabled: bool) -> Result<(), Errno> {
        let op = if enabled { FakeOp::Enable } else { FakeOp::Disable };
        self.record(op, handle.id, handle.cpu)
    }

    fn pause_output(&self, handle: &FakeHandle, paused: bool) -> Result<(), Errno> {
        let op = if paused { FakeOp::Pause } else { FakeOp::Resume };
        self.record(op, handle.id, handle.cpu)
    }

    fn read_value(&self, handle: &FakeHandle) -> Result<u64, Errno> {
        self.record(FakeOp::Read, handle.id, handle.cpu)?;
        Ok(10 * u64::from(handle.cpu + 1))
    }

    fn poll(
        &self,
        handles: &[&FakeHandle],
        _timeout: Option<Duration>,
        _sigmask: Option<&SigSet>,
    ) -> Result<WaitOutcome, Errno> {
        let mut state = self.state.borrow_mut();
        state.polled.push(handles.len());
        state.poll_result.unwrap_or(Ok(WaitOutcome::TimedOut))
    }
}

/// Metadata for a minimal tracepoint `test:<event>` with id `id`.
pub(crate) fn metadata(event: &str, id: u32) -> TracepointMetadata {
    let name = TracepointName::new("test", event).expect("valid name");
    let format = format!(
        "name: {event}\nID: {id}\nformat:\n\
         \tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;\n\
         \tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n\
         \tfield:u64 value;\toffset:8;\tsize:8;\tsigned:0;\n"
    );
    TracepointMetadata::parse(name, &format).expect("valid format")
}

/// A cache holding `test:one` (id 1), `test:two` (id 2) and `test:three`
/// (id 3).
pub(crate) fn cache() -> MemoryCache {
    let mut cache = MemoryCache::new();
    for (event, id) in [("one", 1), ("two", 2), ("three", 3)] {
        let _ = cache.insert(metadata(event, id));
    }
    cache
}
