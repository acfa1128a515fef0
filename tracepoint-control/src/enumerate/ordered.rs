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

use crate::buffer::RawRecord;
use crate::error::{Result, SessionError};
use crate::options::SessionMode;
use crate::parser::EventInfo;
use crate::session::{DecodedSample, TracepointSession};
use crate::sys::PerfSystem;
use crate::tracepoint::TracepointCache;
use tracing::debug;

/// Where a sample sits, and when it was recorded.
#[derive(Debug, Clone, Copy)]
struct Bookmark {
    timestamp: u64,
    buffer: u32,
    record: RawRecord,
}

/// Events from all buffers merged by timestamp. Samples with equal
/// timestamps keep buffer order, and within a buffer, write order.
///
/// Every buffer is held (paused, for circular sessions) from construction
/// until the enumerator is dropped.
#[derive(Debug)]
pub struct OrderedEnumerator<'s, C: TracepointCache, S: PerfSystem> {
    session: &'s mut TracepointSession<C, S>,
    bookmarks: Vec<Bookmark>,
    next: usize,
    /// Buffers begun by this enumerator.
    active: Vec<usize>,
}

impl<'s, C: TracepointCache, S: PerfSystem> OrderedEnumerator<'s, C, S> {
    fn new(session: &'s mut TracepointSession<C, S>) -> Self {
        Self { session, bookmarks: Vec::new(), next: 0, active: Vec::new() }
    }

    /// Begins every buffer and bookmarks its samples.
    fn load(&mut self, time_offset: usize) -> Result<()> {
        let circular = self.session.mode() == SessionMode::Circular;
        self.active.try_reserve_exact(self.session.buffers.len())?;

        for index in 0..self.session.buffers.len() {
            if !self.session.begin_buffer(index) {
                continue;
            }
            self.active.push(index);

            let first = self.bookmarks.len();
            while let Some(record) = self.session.next_record(index) {
                if !record.header.is_sample() {
                    continue;
                }
                let timestamp = self.session.buffers[index]
                    .span(record.pos, record.len())
                    .and_then(|span| span.read_u64(time_offset));
                let Some(timestamp) = timestamp else {
                    self.session.counters.corrupt_event();
                    continue;
                };

                self.bookmarks.try_reserve(1)?;
                self.bookmarks.push(Bookmark { timestamp, buffer: index as u32, record });
            }

            // Circular scans run newest first.
            if circular {
                self.bookmarks[first..].reverse();
            }
        }

        self.bookmarks.sort_by_key(|bookmark| bookmark.timestamp);
        debug!(
            "ordered {} samples from {} buffers",
            self.bookmarks.len(),
            self.active.len()
        );
        Ok(())
    }

    /// The next event, or `None` once every sample has been replayed.
    pub fn move_next(&mut self) -> Option<EventInfo<'_>> {
        let decoded = self.advance()?;
        self.session.event_info(&decoded)
    }

    fn advance(&mut self) -> Option<DecodedSample> {
        while let Some(bookmark) = self.bookmarks.get(self.next).copied() {
            self.next += 1;
            if let Some(decoded) =
                self.session.decode(bookmark.buffer as usize, bookmark.record)
            {
                return Some(decoded);
            }
        }
        None
    }

    /// Samples not yet replayed.
    pub fn remaining(&self) -> usize {
        self.bookmarks.len() - self.next
    }
}

impl<C: TracepointCache, S: PerfSystem> Drop for OrderedEnumerator<'_, C, S> {
    fn drop(&mut self) {
        for &index in &self.active {
            self.session.end_buffer(index);
        }
    }
}

impl<C: TracepointCache, S: PerfSystem> TracepointSession<C, S> {
    /// Starts a timestamp-ordered pass over all buffers. Fails if the
    /// session does not sample `time`.
    pub fn ordered(&mut self) -> Result<OrderedEnumerator<'_, C, S>> {
        let time_offset = self
            .sample_type()
            .time_offset()
            .ok_or(SessionError::TimestampNotSampled)?;

        let mut events = OrderedEnumerator::new(self);
        events.load(time_offset)?;
        Ok(events)
    }
}
