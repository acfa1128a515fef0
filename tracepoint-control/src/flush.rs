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

//! Copying raw buffer contents to a [`TraceWriter`].

use crate::buffer::BufferInfo;
use crate::error::Result;
use crate::perf_abi::SampleType;
use crate::session::TracepointSession;
use crate::session_info::HostInfo;
use crate::sys::PerfSystem;
use crate::tracepoint::TracepointCache;
use crate::writer::{FormatRegistration, TraceFileWriter, TraceWriter};
use serde::Serialize;
use std::collections::HashSet;
use std::io::IoSlice;
use std::path::Path;
use tracing::{debug, trace};

/// Spans gathered before a vectored write.
const BATCH_CAPACITY: usize = 16;

/// Inclusive range of sample timestamps to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub min: u64,
    pub max: u64,
}

impl TimeRange {
    pub const ALL: Self = Self { min: 0, max: u64::MAX };

    pub fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, timestamp: u64) -> bool {
        (self.min..=self.max).contains(&timestamp)
    }
}

impl Default for TimeRange {
    fn default() -> Self {
        Self::ALL
    }
}

/// What a flush wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushSummary {
    /// Records of any kind.
    pub records: u64,
    pub samples: u64,
    pub min_time: Option<u64>,
    pub max_time: Option<u64>,
}

impl FlushSummary {
    fn add_sample(&mut self, timestamp: Option<u64>) {
        self.samples += 1;
        if let Some(timestamp) = timestamp {
            self.min_time = Some(self.min_time.map_or(timestamp, |min| min.min(timestamp)));
            self.max_time = Some(self.max_time.map_or(timestamp, |max| max.max(timestamp)));
        }
    }
}

/// `(offset, len)` ranges of one buffer's data region.
#[derive(Debug)]
struct SpanBatch {
    spans: [(usize, usize); BATCH_CAPACITY],
    len: usize,
    writes: usize,
}

impl SpanBatch {
    fn new() -> Self {
        Self { spans: [(0, 0); BATCH_CAPACITY], len: 0, writes: 0 }
    }

    fn has_room(&self, spans: usize) -> bool {
        self.len + spans <= BATCH_CAPACITY
    }

    /// Adds a span, extending the previous one if they touch.
    fn push(&mut self, offset: usize, len: usize) {
        if len == 0 {
            return;
        }
        if let Some(last) = self.len.checked_sub(1).map(|last| &mut self.spans[last]) {
            if last.0 + last.1 == offset {
                last.1 += len;
                return;
            }
        }
        self.spans[self.len] = (offset, len);
        self.len += 1;
    }

    fn flush<W: TraceWriter>(&mut self, buffer: &BufferInfo, writer: &mut W) -> Result<()> {
        if self.len == 0 {
            return Ok(());
        }

        let mut slices = [IoSlice::new(&[]); BATCH_CAPACITY];
        let mut count = 0;
        for &(offset, len) in &self.spans[..self.len] {
            if let Some(bytes) = buffer.data_slice(offset, len) {
                slices[count] = IoSlice::new(bytes);
                count += 1;
            }
        }
        self.len = 0;

        let written = writer.write_event_data(&slices[..count])?;
        self.writes += 1;
        trace!("wrote {written} bytes in {count} spans");
        Ok(())
    }
}

impl<C: TracepointCache, S: PerfSystem> TracepointSession<C, S> {
    /// Writes the unread contents of every buffer to `writer`, registering
    /// the format of each tracepoint seen. Samples outside `filter` are
    /// skipped; other records are always written.
    ///
    /// Like enumeration, this consumes RealTime buffers.
    pub fn flush_to_writer<W: TraceWriter>(
        &mut self,
        writer: &mut W,
        filter: TimeRange,
    ) -> Result<FlushSummary> {
        writer.set_session_info(&self.session_info, &HostInfo::current())?;

        let mut summary = FlushSummary::default();
        let mut registered = HashSet::new();
        let mut batch = SpanBatch::new();

        for index in 0..self.buffers.len() {
            if !self.begin_buffer(index) {
                continue;
            }
            let result =
                self.flush_buffer(index, writer, filter, &mut batch, &mut registered, &mut summary);
            self.end_buffer(index);
            result?;
        }

        if let (Some(min), Some(max)) = (summary.min_time, summary.max_time) {
            writer.set_sample_time_range(min, max);
        }
        debug!(
            "flushed {} records ({} samples) in {} writes",
            summary.records, summary.samples, batch.writes
        );
        Ok(summary)
    }

    fn flush_buffer<W: TraceWriter>(
        &mut self,
        index: usize,
        writer: &mut W,
        filter: TimeRange,
        batch: &mut SpanBatch,
        registered: &mut HashSet<u32>,
        summary: &mut FlushSummary,
    ) -> Result<()> {
        let timed = self.sample_type().has_flag(SampleType::TIME);

        while let Some(record) = self.next_record(index) {
            if record.header.is_sample() {
                let Some(decoded) = self.decode(index, record) else {
                    continue;
                };
                let timestamp = timed.then_some(decoded.fields.time);
                if timestamp.is_some_and(|timestamp| !filter.contains(timestamp)) {
                    continue;
                }

                registered.try_reserve(1)?;
                if registered.insert(decoded.tracepoint) {
                    if let Some(tracepoint) = self.tracepoints.get(&decoded.tracepoint) {
                        if writer.add_format(tracepoint.desc())? == FormatRegistration::Added {
                            debug!("added format for {}", tracepoint.metadata().name());
                        }
                    }
                }
                summary.add_sample(timestamp);
            }

            let buffer = &self.buffers[index];
            if !batch.has_room(2) {
                batch.flush(buffer, writer)?;
            }
            let Some(span) = buffer.span(record.pos, record.len()) else {
                continue;
            };
            let (first, second) = span.parts();
            batch.push(buffer.offset(record.pos), first.len());
            batch.push(0, second.len());
            summary.records += 1;
        }

        batch.flush(&self.buffers[index], writer)
    }

    /// Flushes every buffer into a new trace file at `path`.
    pub fn save_to_file(
        &mut self,
        path: impl AsRef<Path>,
        filter: TimeRange,
    ) -> Result<FlushSummary> {
        let mut writer = TraceFileWriter::create(path)?;
        let summary = self.flush_to_writer(&mut writer, filter)?;
        let _ = writer.finalize()?;
        Ok(summary)
    }
}
