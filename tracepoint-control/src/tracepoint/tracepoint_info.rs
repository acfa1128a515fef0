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

use super::cache::TracepointMetadata;
use crate::error::{Result, SessionError};
use crate::perf_abi::PerfEventAttr;
use crate::sys::PerfSystem;
use std::sync::Arc;

/// Last known state of a tracepoint's handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableState {
    /// A fan-out failed part way; the handles may disagree.
    Unknown,
    Enabled,
    Disabled,
}

impl From<bool> for EnableState {
    fn from(enabled: bool) -> Self {
        if enabled {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}

/// What a consumer needs to interpret a tracepoint's samples.
#[derive(Debug, Clone)]
pub struct EventDesc {
    metadata: Arc<TracepointMetadata>,
    attr: PerfEventAttr,
    /// Kernel sample id per buffer, 0 where the buffer is empty.
    sample_ids: Vec<u64>,
}

impl EventDesc {
    pub(crate) fn new(
        metadata: Arc<TracepointMetadata>,
        attr: PerfEventAttr,
        sample_ids: Vec<u64>,
    ) -> Self {
        Self { metadata, attr, sample_ids }
    }

    pub fn metadata(&self) -> &TracepointMetadata {
        &self.metadata
    }

    pub fn attr(&self) -> &PerfEventAttr {
        &self.attr
    }

    pub fn sample_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.sample_ids.iter().copied().filter(|&id| id != 0)
    }
}

/// A tracepoint registered with a session: one handle per non-empty buffer.
#[derive(Debug)]
pub struct TracepointInfo<H> {
    desc: EventDesc,
    handles: Vec<Option<H>>,
    enable_state: EnableState,
}

impl<H> TracepointInfo<H> {
    pub(crate) fn new(
        desc: EventDesc,
        handles: Vec<Option<H>>,
        enable_state: EnableState,
    ) -> Self {
        Self { desc, handles, enable_state }
    }

    pub fn id(&self) -> u32 {
        self.desc.metadata.id()
    }

    pub fn desc(&self) -> &EventDesc {
        &self.desc
    }

    pub fn metadata(&self) -> &TracepointMetadata {
        &self.desc.metadata
    }

    pub fn enable_state(&self) -> EnableState {
        self.enable_state
    }

    pub(crate) fn set_enable_state(&mut self, state: EnableState) {
        self.enable_state = state;
    }

    /// Handle for buffer `index`, if that buffer is in use.
    pub fn handle(&self, index: usize) -> Option<&H> {
        self.handles.get(index).and_then(Option::as_ref)
    }

    /// `(buffer index, handle)` for every open handle.
    pub fn handles(&self) -> impl Iterator<Item = (usize, &H)> + '_ {
        self.handles
            .iter()
            .enumerate()
            .filter_map(|(index, handle)| handle.as_ref().map(|h| (index, h)))
    }

    /// Number of times the tracepoint fired, summed over all CPUs.
    pub fn event_count<S>(&self, system: &S) -> Result<u64>
    where
        S: PerfSystem<Handle = H>,
    {
        let mut total = 0u64;
        for (cpu, handle) in self.handles() {
            let value = system
                .read_value(handle)
                .map_err(|e| SessionError::os("read", cpu as u32, e))?;
            total = total.wrapping_add(value);
        }
        Ok(total)
    }
}
