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

use super::cpu_list::{possible_cpu_count, POSSIBLE_CPUS};
use super::{PerfSystem, RingMemory, WaitOutcome};
use crate::perf_abi::{PerfEventAttr, PERF_FLAG_FD_CLOEXEC};
use nix::errno::Errno;
use nix::poll::{ppoll, PollFd, PollFlags};
use nix::sys::mman::{mmap, MapFlags, ProtFlags};
use nix::sys::signal::SigSet;
use nix::sys::time::TimeSpec;
use nix::unistd::{read, sysconf, SysconfVar};
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::ptr::NonNull;
use std::time::Duration;
use tracing::trace;

const FALLBACK_PAGE_SIZE: usize = 4096;

// The enable/disable/set-output requests are `_IO` but take an integer
// argument, so they are declared as "bad" int writes.
nix::ioctl_write_int_bad!(
    perf_event_ioc_enable,
    nix::request_code_none!(b'$', 0)
);
nix::ioctl_write_int_bad!(
    perf_event_ioc_disable,
    nix::request_code_none!(b'$', 1)
);
nix::ioctl_write_int_bad!(
    perf_event_ioc_set_output,
    nix::request_code_none!(b'$', 5)
);
nix::ioctl_read!(perf_event_ioc_id, b'$', 7, u64);
nix::ioctl_write_int!(perf_event_ioc_pause_output, b'$', 9);

/// Direct `perf_event_open(2)` access.
#[derive(Debug, Clone)]
pub struct LinuxPerf {
    page_size: usize,
}

impl LinuxPerf {
    pub fn new() -> Self {
        let page_size = match sysconf(SysconfVar::PAGE_SIZE) {
            Ok(Some(size)) if size > 0 => size as usize,
            _ => FALLBACK_PAGE_SIZE,
        };
        Self { page_size }
    }
}

impl Default for LinuxPerf {
    fn default() -> Self {
        Self::new()
    }
}

impl PerfSystem for LinuxPerf {
    type Handle = OwnedFd;

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn cpu_count(&self) -> io::Result<u32> {
        possible_cpu_count(Path::new(POSSIBLE_CPUS))
    }

    fn open_event(
        &self,
        attr: &PerfEventAttr,
        cpu: u32,
    ) -> Result<OwnedFd, Errno> {
        let pid: libc::pid_t = -1;
        let group_fd: libc::c_int = -1;
        // SAFETY: `attr` is a valid perf_event_attr whose size field matches
        // the struct.
        let fd = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                attr as *const PerfEventAttr,
                pid,
                cpu as libc::c_int,
                group_fd,
                PERF_FLAG_FD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(Errno::last());
        }

        trace!("opened perf event fd {fd} for config {} on cpu {cpu}", attr.config);
        // SAFETY: the syscall returned a new descriptor that nothing else owns.
        Ok(unsafe { OwnedFd::from_raw_fd(fd as libc::c_int) })
    }

    fn map_ring(
        &self,
        handle: &OwnedFd,
        len: usize,
    ) -> Result<RingMemory, Errno> {
        let length = NonZeroUsize::new(len).ok_or(Errno::EINVAL)?;
        // SAFETY: a fresh shared mapping of the event's ring; the returned
        // pointer is owned by the RingMemory.
        let base = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                handle.as_raw_fd(),
                0,
            )?
        };
        let base = NonNull::new(base.cast::<u8>()).ok_or(Errno::ENOMEM)?;
        // SAFETY: `base` is the start of the mapping of `len` bytes above.
        Ok(unsafe { RingMemory::from_mapping(base, len) })
    }

    fn set_output(&self, handle: &OwnedFd, leader: &OwnedFd) -> Result<(), Errno> {
        // SAFETY: both descriptors are open perf events.
        unsafe {
            perf_event_ioc_set_output(handle.as_raw_fd(), leader.as_raw_fd())
        }
        .map(drop)
    }

    fn sample_id(&self, handle: &OwnedFd) -> Result<u64, Errno> {
        let mut id = 0u64;
        // SAFETY: the kernel writes one u64 to `id`.
        unsafe { perf_event_ioc_id(handle.as_raw_fd(), &mut id) }?;
        Ok(id)
    }

    fn set_enabled(&self, handle: &OwnedFd, enabled: bool) -> Result<(), Errno> {
        let fd = handle.as_raw_fd();
        // SAFETY: `fd` is an open perf event.
        let result = unsafe {
            if enabled {
                perf_event_ioc_enable(fd, 0)
            } else {
                perf_event_ioc_disable(fd, 0)
            }
        };
        result.map(drop)
    }

    fn pause_output(&self, handle: &OwnedFd, paused: bool) -> Result<(), Errno> {
        // SAFETY: `handle` is an open perf event with a ring buffer.
        unsafe {
            perf_event_ioc_pause_output(
                handle.as_raw_fd(),
                nix::sys::ioctl::ioctl_param_type::from(paused),
            )
        }
        .map(drop)
    }

    fn read_value(&self, handle: &OwnedFd) -> Result<u64, Errno> {
        // read_format is PERF_FORMAT_ID: { u64 value; u64 id; }
        let mut buf = [0u8; 16];
        let len = read(handle.as_raw_fd(), &mut buf)?;
        if len < 8 {
            return Err(Errno::EIO);
        }
        let mut value = [0u8; 8];
        value.copy_from_slice(&buf[..8]);
        Ok(u64::from_ne_bytes(value))
    }

    fn poll(
        &self,
        handles: &[&OwnedFd],
        timeout: Option<Duration>,
        sigmask: Option<&SigSet>,
    ) -> Result<WaitOutcome, Errno> {
        let mut fds: Vec<PollFd> = handles
            .iter()
            .map(|handle| PollFd::new(handle.as_raw_fd(), PollFlags::POLLIN))
            .collect();

        match ppoll(
            &mut fds,
            timeout.map(TimeSpec::from_duration),
            sigmask.copied(),
        ) {
            Ok(0) => Ok(WaitOutcome::TimedOut),
            Ok(ready) => Ok(WaitOutcome::Ready(ready as usize)),
            Err(Errno::EINTR) => Ok(WaitOutcome::Interrupted),
            Err(e) => Err(e),
        }
    }
}
