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

//! One CPU's ring buffer and the head/tail protocol shared with the kernel.

use crate::counters::SessionCounters;
use crate::options::SessionMode;
use crate::perf_abi::{mmap_page, RecordHeader, LOST_COUNT_OFFSET};
use crate::record::RecordSpan;
use crate::sys::RingMemory;
use std::sync::atomic::Ordering;
use tracing::{trace, warn};

/// A record found by a scan. `pos` is a logical (unwrapped) position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RawRecord {
    pub header: RecordHeader,
    pub pos: u64,
}

impl RawRecord {
    pub(crate) fn len(&self) -> usize {
        self.header.size as usize
    }
}

#[derive(Debug)]
pub(crate) struct BufferInfo {
    ring: Option<RingMemory>,
    /// Data region size, a power of two. 0 means no buffer on this CPU.
    size: usize,
    page_size: usize,
    data_pos: u64,
    data_tail: u64,
    data_head: u64,
    active: bool,
}

impl BufferInfo {
    pub(crate) fn new(size: usize, page_size: usize) -> Self {
        Self {
            ring: None,
            size,
            page_size,
            data_pos: 0,
            data_tail: 0,
            data_head: 0,
            active: false,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn is_mapped(&self) -> bool {
        self.ring.is_some()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active
    }

    /// Header page plus data region.
    pub(crate) fn mapping_len(&self) -> usize {
        self.page_size + self.size
    }

    pub(crate) fn attach(&mut self, ring: RingMemory) {
        self.ring = Some(ring);
        self.data_pos = 0;
        self.data_tail = 0;
        self.data_head = 0;
    }

    pub(crate) fn detach(&mut self) {
        self.active = false;
        self.ring = None;
    }

    fn data(&self) -> Option<&[u8]> {
        self.ring.as_ref()?.bytes(self.page_size, self.size)
    }

    /// Offset of logical position `pos` inside the data region.
    pub(crate) fn offset(&self, pos: u64) -> usize {
        (pos & (self.size as u64).wrapping_sub(1)) as usize
    }

    pub(crate) fn span(&self, pos: u64, len: usize) -> Option<RecordSpan<'_>> {
        RecordSpan::from_ring(self.data()?, self.offset(pos), len)
    }

    /// `len` bytes at `offset` inside the data region, without wrapping.
    pub(crate) fn data_slice(&self, offset: usize, len: usize) -> Option<&[u8]> {
        self.data()?.get(offset..offset.checked_add(len)?)
    }

    // Older kernels leave data_offset/data_size zero.
    fn layout_matches(&self, ring: &RingMemory) -> bool {
        let word = |offset| {
            ring.header_word(offset).map(|word| word.load(Ordering::Relaxed))
        };
        match (word(mmap_page::DATA_OFFSET), word(mmap_page::DATA_SIZE)) {
            (Some(0), Some(0)) => true,
            (Some(offset), Some(size)) => {
                offset == self.page_size as u64 && size == self.size as u64
            }
            _ => false,
        }
    }

    /// Starts a pass: snapshots the head and positions the cursor at the
    /// oldest unread record. Returns false if there is nothing to scan.
    pub(crate) fn begin(&mut self, mode: SessionMode, counters: &SessionCounters) -> bool {
        let Some(ring) = self.ring.as_ref() else {
            return false;
        };
        let size = self.size as u64;

        let head = ring
            .header_word(mmap_page::DATA_HEAD)
            .map(|word| word.load(Ordering::Acquire));
        let tail = ring
            .header_word(mmap_page::DATA_TAIL)
            .map(|word| word.load(Ordering::Relaxed))
            .unwrap_or(0);
        let layout_ok = self.layout_matches(ring);

        self.active = true;
        let head = match head {
            Some(head) if layout_ok && head % 8 == 0 => head,
            head => {
                let head = head.unwrap_or(tail);
                warn!("ring buffer header is corrupt (head {head:#x})");
                counters.corrupt_buffer();
                self.data_tail = tail;
                self.data_pos = head;
                self.data_head = head;
                return true;
            }
        };

        match mode {
            SessionMode::Circular => {
                // The kernel writes backward; the newest record is at head.
                self.data_tail = head;
                self.data_pos = head;
                self.data_head = head.wrapping_add(size);
            }
            SessionMode::RealTime => {
                self.data_tail = tail;
                self.data_pos = tail;
                self.data_head = head;
                if head.wrapping_sub(tail) > size {
                    warn!("ring buffer tail {tail:#x} is out of range of head {head:#x}");
                    counters.corrupt_buffer();
                    self.data_pos = head.wrapping_sub(size);
                }
            }
        }

        trace!(
            "buffer pass from {:#x} to {:#x}",
            self.data_pos,
            self.data_head
        );
        true
    }

    /// Advances over the next record. Lost-event records are counted here.
    pub(crate) fn next_record(
        &mut self,
        mode: SessionMode,
        counters: &SessionCounters,
    ) -> Option<RawRecord> {
        let remaining = self.data_head.wrapping_sub(self.data_pos);
        if remaining == 0 {
            return None;
        }

        let header = self
            .span(self.data_pos, RecordHeader::SIZE)
            .and_then(|span| span.header());
        let size = header.map(|header| u64::from(header.size));

        let header = match (header, size) {
            (Some(header), Some(size))
                if size != 0 && size % 8 == 0 && size <= remaining =>
            {
                header
            }
            // Unwritten space or an overwritten oldest record ends a
            // circular snapshot.
            (_, Some(size))
                if mode == SessionMode::Circular
                    && (size == 0 || (size % 8 == 0 && size > remaining)) =>
            {
                self.data_pos = self.data_head;
                return None;
            }
            _ => {
                warn!(
                    "corrupt record at {:#x} ({:?} bytes, {remaining} remaining)",
                    self.data_pos, size
                );
                counters.corrupt_buffer();
                self.data_pos = self.data_head;
                return None;
            }
        };

        let record = RawRecord { header, pos: self.data_pos };
        self.data_pos = self.data_pos.wrapping_add(u64::from(header.size));

        if header.is_sample() {
            counters.sample();
        } else if header.is_lost() {
            let lost = self
                .span(record.pos, record.len())
                .and_then(|span| span.read_u64(LOST_COUNT_OFFSET))
                .unwrap_or(0);
            counters.lost(lost);
        }
        Some(record)
    }

    /// Ends a pass. In RealTime mode the consumed space goes back to the
    /// kernel.
    pub(crate) fn end(&mut self, mode: SessionMode) {
        if !self.active {
            return;
        }
        self.active = false;

        if mode == SessionMode::RealTime && self.data_pos != self.data_tail {
            if let Some(tail) = self
                .ring
                .as_ref()
                .and_then(|ring| ring.header_word(mmap_page::DATA_TAIL))
            {
                tail.store(self.data_pos, Ordering::Release);
            }
            self.data_tail = self.data_pos;
        }
    }
}

/// Plays the kernel's side of the protocol.
#[cfg(test)]
impl BufferInfo {
    fn header(&self, offset: usize) -> u64 {
        self.ring
            .as_ref()
            .and_then(|ring| ring.header_word(offset))
            .map(|word| word.load(Ordering::Acquire))
            .expect("mapped buffer")
    }

    pub(crate) fn set_header(&self, offset: usize, value: u64) {
        self.ring
            .as_ref()
            .and_then(|ring| ring.header_word(offset))
            .expect("mapped buffer")
            .store(value, Ordering::Release);
    }

    pub(crate) fn head(&self) -> u64 {
        self.header(mmap_page::DATA_HEAD)
    }

    pub(crate) fn tail(&self) -> u64 {
        self.header(mmap_page::DATA_TAIL)
    }

    fn copy_in(&mut self, pos: u64, bytes: &[u8]) {
        let offset = self.offset(pos);
        let (page_size, size) = (self.page_size, self.size);
        let data = &mut self.ring.as_mut().expect("mapped buffer").bytes_mut()
            [page_size..page_size + size];
        for (i, byte) in bytes.iter().enumerate() {
            data[(offset + i) % size] = *byte;
        }
    }

    /// Appends a record the way a forward-writing kernel does.
    pub(crate) fn write_forward(&mut self, record: &[u8]) {
        let head = self.head();
        self.copy_in(head, record);
        self.set_header(mmap_page::DATA_HEAD, head.wrapping_add(record.len() as u64));
    }

    /// Prepends a record the way a backward-writing kernel does.
    pub(crate) fn write_backward(&mut self, record: &[u8]) {
        let head = self.head().wrapping_sub(record.len() as u64);
        self.copy_in(head, record);
        self.set_header(mmap_page::DATA_HEAD, head);
    }
}
