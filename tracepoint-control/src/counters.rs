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

use serde::Serialize;
use std::cell::Cell;

/// Totals since the session was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    /// Sample records read from the buffers.
    pub samples: u64,
    /// Events the kernel reported as dropped.
    pub lost_events: u64,
    /// Sample records that could not be decoded or attributed.
    pub corrupt_events: u64,
    /// Buffer passes cut short by a bad header or record layout.
    pub corrupt_buffers: u64,
}

// Updated while event data is borrowed from the session, hence the cells.
#[derive(Debug, Default)]
pub(crate) struct SessionCounters {
    samples: Cell<u64>,
    lost_events: Cell<u64>,
    corrupt_events: Cell<u64>,
    corrupt_buffers: Cell<u64>,
}

impl SessionCounters {
    fn bump(cell: &Cell<u64>, by: u64) {
        cell.set(cell.get().wrapping_add(by));
    }

    pub(crate) fn sample(&self) {
        Self::bump(&self.samples, 1);
    }

    pub(crate) fn lost(&self, count: u64) {
        Self::bump(&self.lost_events, count);
    }

    pub(crate) fn corrupt_event(&self) {
        Self::bump(&self.corrupt_events, 1);
    }

    pub(crate) fn corrupt_buffer(&self) {
        Self::bump(&self.corrupt_buffers, 1);
    }

    pub(crate) fn snapshot(&self) -> Counters {
        Counters {
            samples: self.samples.get(),
            lost_events: self.lost_events.get(),
            corrupt_events: self.corrupt_events.get(),
            corrupt_buffers: self.corrupt_buffers.get(),
        }
    }
}
