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

use crate::options::SessionMode;
use chrono::{DateTime, TimeZone, Utc};
use nix::sys::time::TimeSpec;
use nix::sys::utsname::uname;
use nix::time::{clock_gettime, ClockId};
use serde::Serialize;
use tracing::warn;

/// The session mode and clock, and how the clock relates to wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Circular rings are written out newest first.
    mode: SessionMode,
    clock_id: i32,
    /// `CLOCK_REALTIME - clock`, in nanoseconds, at session creation.
    clock_offset_ns: i64,
    created_at: DateTime<Utc>,
}

impl SessionInfo {
    pub(crate) fn capture(mode: SessionMode, clock_id: i32) -> Self {
        let clock_offset_ns = match (
            clock_gettime(ClockId::CLOCK_REALTIME),
            clock_gettime(ClockId::from_raw(clock_id)),
        ) {
            (Ok(realtime), Ok(session)) => {
                i64::try_from(nanos(realtime) - nanos(session)).unwrap_or(0)
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("failed to read clock {clock_id}: {e}");
                0
            }
        };

        Self { mode, clock_id, clock_offset_ns, created_at: Utc::now() }
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn clock_id(&self) -> i32 {
        self.clock_id
    }

    pub fn clock_offset_ns(&self) -> i64 {
        self.clock_offset_ns
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Converts a sample timestamp to wall-clock time.
    pub fn to_utc(&self, timestamp: u64) -> Option<DateTime<Utc>> {
        let nanos = i128::from(timestamp) + i128::from(self.clock_offset_ns);
        let nanos = i64::try_from(nanos).ok()?;
        Utc.timestamp_opt(
            nanos.div_euclid(1_000_000_000),
            nanos.rem_euclid(1_000_000_000) as u32,
        )
        .single()
    }
}

fn nanos(time: TimeSpec) -> i128 {
    i128::from(time.tv_sec()) * 1_000_000_000 + i128::from(time.tv_nsec())
}

/// Facts about the machine a trace was recorded on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostInfo {
    pub hostname: String,
    pub os_release: String,
    pub architecture: String,
}

impl HostInfo {
    pub fn current() -> Self {
        match uname() {
            Ok(uts) => Self {
                hostname: uts.nodename().to_string_lossy().into_owned(),
                os_release: uts.release().to_string_lossy().into_owned(),
                architecture: uts.machine().to_string_lossy().into_owned(),
            },
            Err(e) => {
                warn!("uname failed: {e}");
                Self::default()
            }
        }
    }
}
