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

use crate::parser::EventInfo;
use crate::session::{DecodedSample, TracepointSession};
use crate::sys::PerfSystem;
use crate::tracepoint::TracepointCache;

/// Events in buffer order: buffer 0 first, each buffer oldest record first
/// (newest first for circular buffers).
#[derive(Debug)]
pub struct UnorderedEnumerator<'s, C: TracepointCache, S: PerfSystem> {
    session: &'s mut TracepointSession<C, S>,
    buffer: usize,
    /// Whether `buffer` has been begun.
    started: bool,
}

impl<'s, C: TracepointCache, S: PerfSystem> UnorderedEnumerator<'s, C, S> {
    pub(crate) fn new(session: &'s mut TracepointSession<C, S>) -> Self {
        Self { session, buffer: 0, started: false }
    }

    /// The next event, or `None` once every buffer has been read.
    pub fn move_next(&mut self) -> Option<EventInfo<'_>> {
        let decoded = self.advance()?;
        self.session.event_info(&decoded)
    }

    fn advance(&mut self) -> Option<DecodedSample> {
        while self.buffer < self.session.buffers.len() {
            if !self.started {
                self.started = self.session.begin_buffer(self.buffer);
                if !self.started {
                    self.buffer += 1;
                    continue;
                }
            }

            match self.session.next_record(self.buffer) {
                Some(record) if record.header.is_sample() => {
                    if let Some(decoded) = self.session.decode(self.buffer, record) {
                        return Some(decoded);
                    }
                }
                Some(_) => {}
                None => {
                    self.session.end_buffer(self.buffer);
                    self.started = false;
                    self.buffer += 1;
                }
            }
        }
        None
    }
}

impl<C: TracepointCache, S: PerfSystem> Drop for UnorderedEnumerator<'_, C, S> {
    fn drop(&mut self) {
        if self.started {
            self.session.end_buffer(self.buffer);
        }
    }
}

impl<C: TracepointCache, S: PerfSystem> TracepointSession<C, S> {
    /// Starts an unordered pass over all buffers.
    pub fn unordered(&mut self) -> UnorderedEnumerator<'_, C, S> {
        UnorderedEnumerator::new(self)
    }
}
