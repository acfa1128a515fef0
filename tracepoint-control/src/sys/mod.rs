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

//! The seam between session logic and the kernel.
//!
//! [`PerfSystem`] covers every syscall the session issues. [`LinuxPerf`] is
//! the real implementation; tests substitute an in-memory kernel.

pub use self::linux::LinuxPerf;
pub use self::ring_memory::RingMemory;
use crate::perf_abi::PerfEventAttr;
use nix::errno::Errno;
use nix::sys::signal::SigSet;
use std::fmt;
use std::io;
use std::time::Duration;

pub mod cpu_list;
mod linux;
mod ring_memory;

/// Result of waiting for data in the buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Number of handles with data ready.
    Ready(usize),
    TimedOut,
    /// A signal allowed by the wait's signal mask arrived.
    Interrupted,
}

/// Kernel operations used by a tracepoint session.
pub trait PerfSystem {
    /// An open perf event. Dropping it closes the event.
    type Handle: fmt::Debug;

    fn page_size(&self) -> usize;

    /// Number of per-CPU buffers to create when sizing is uniform.
    fn cpu_count(&self) -> io::Result<u32>;

    /// `perf_event_open` for one CPU, any process.
    fn open_event(
        &self,
        attr: &PerfEventAttr,
        cpu: u32,
    ) -> Result<Self::Handle, Errno>;

    /// Maps a header page plus data region of `len` total bytes.
    fn map_ring(
        &self,
        handle: &Self::Handle,
        len: usize,
    ) -> Result<RingMemory, Errno>;

    /// `PERF_EVENT_IOC_SET_OUTPUT`: send `handle`'s records to `leader`'s ring.
    fn set_output(
        &self,
        handle: &Self::Handle,
        leader: &Self::Handle,
    ) -> Result<(), Errno>;

    /// `PERF_EVENT_IOC_ID`
    fn sample_id(&self, handle: &Self::Handle) -> Result<u64, Errno>;

    /// `PERF_EVENT_IOC_ENABLE` / `PERF_EVENT_IOC_DISABLE`
    fn set_enabled(&self, handle: &Self::Handle, enabled: bool)
        -> Result<(), Errno>;

    /// `PERF_EVENT_IOC_PAUSE_OUTPUT`
    fn pause_output(&self, handle: &Self::Handle, paused: bool)
        -> Result<(), Errno>;

    /// Reads the event's counter value.
    fn read_value(&self, handle: &Self::Handle) -> Result<u64, Errno>;

    /// Waits for any of `handles` to become readable.
    fn poll(
        &self,
        handles: &[&Self::Handle],
        timeout: Option<Duration>,
        sigmask: Option<&SigSet>,
    ) -> Result<WaitOutcome, Errno>;
}
