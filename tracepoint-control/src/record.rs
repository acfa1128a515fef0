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

//! Bounds-checked access to records inside a ring buffer's data region.

use crate::perf_abi::RecordHeader;
use std::collections::TryReserveError;
use std::io::IoSlice;

/// The logical bytes of one record. A record that wraps past the end of the
/// data region is split in two; `second` is empty otherwise.
#[derive(Clone, Copy, Debug)]
pub struct RecordSpan<'a> {
    first: &'a [u8],
    second: &'a [u8],
}

impl<'a> RecordSpan<'a> {
    pub fn contiguous(bytes: &'a [u8]) -> Self {
        Self { first: bytes, second: &[] }
    }

    pub fn split(first: &'a [u8], second: &'a [u8]) -> Self {
        Self { first, second }
    }

    /// Slices `len` bytes starting at `offset` out of a power-of-two sized
    /// ring, wrapping at the end. Returns `None` if `len` exceeds the ring.
    pub fn from_ring(data: &'a [u8], offset: usize, len: usize) -> Option<Self> {
        if len > data.len() || offset >= data.len() {
            return None;
        }

        let available = data.len() - offset;
        if len <= available {
            Some(Self::contiguous(&data[offset..offset + len]))
        } else {
            Some(Self::split(&data[offset..], &data[..len - available]))
        }
    }

    pub fn len(&self) -> usize {
        self.first.len() + self.second.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_wrapped(&self) -> bool {
        !self.second.is_empty()
    }

    pub fn parts(&self) -> (&'a [u8], &'a [u8]) {
        (self.first, self.second)
    }

    /// Copies `N` bytes at `offset` out of the span, crossing the wrap point
    /// if needed.
    pub fn read_array<const N: usize>(&self, offset: usize) -> Option<[u8; N]> {
        let end = offset.checked_add(N)?;
        if end > self.len() {
            return None;
        }

        let mut out = [0u8; N];
        for (i, byte) in out.iter_mut().enumerate() {
            let pos = offset + i;
            *byte = if pos < self.first.len() {
                self.first[pos]
            } else {
                self.second[pos - self.first.len()]
            };
        }
        Some(out)
    }

    pub fn read_u64(&self, offset: usize) -> Option<u64> {
        self.read_array::<8>(offset).map(u64::from_ne_bytes)
    }

    pub fn header(&self) -> Option<RecordHeader> {
        self.read_array::<{ RecordHeader::SIZE }>(0).map(RecordHeader::from_bytes)
    }

    /// Returns the span as one slice. Wrapped spans are copied into `scratch`.
    pub fn linearize<'s>(
        &self,
        scratch: &'s mut Vec<u8>,
    ) -> Result<&'s [u8], TryReserveError>
    where
        'a: 's,
    {
        if self.second.is_empty() {
            return Ok(self.first);
        }

        scratch.clear();
        scratch.try_reserve(self.len())?;
        scratch.extend_from_slice(self.first);
        scratch.extend_from_slice(self.second);
        Ok(scratch.as_slice())
    }

    pub fn io_slices(&self) -> impl Iterator<Item = IoSlice<'a>> {
        [self.first, self.second]
            .into_iter()
            .filter(|part| !part.is_empty())
            .map(IoSlice::new)
    }
}

/// Sequential, bounds-checked reader over a linear record.
#[derive(Debug)]
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn at(bytes: &'a [u8], pos: usize) -> Self {
        Self { bytes, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    pub fn read_slice(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let slice = self.read_slice(4)?;
        Some(u32::from_ne_bytes([slice[0], slice[1], slice[2], slice[3]]))
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        let slice = self.read_slice(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(slice);
        Some(u64::from_ne_bytes(buf))
    }

    /// Reads a pair of native-endian `u32` packed into one `u64` slot.
    pub fn read_u32_pair(&mut self) -> Option<(u32, u32)> {
        Some((self.read_u32()?, self.read_u32()?))
    }

    pub fn skip_to_alignment(&mut self, align: usize) {
        let aligned = (self.pos + align - 1) & !(align - 1);
        self.pos = aligned.min(self.bytes.len());
    }
}

/// Reads an unsigned integer of `size` (1, 2 or 4) bytes at `offset`.
pub fn read_unsigned(bytes: &[u8], offset: usize, size: usize) -> Option<u32> {
    let end = offset.checked_add(size)?;
    let field = bytes.get(offset..end)?;
    match size {
        1 => Some(u32::from(field[0])),
        2 => Some(u32::from(u16::from_ne_bytes([field[0], field[1]]))),
        4 => Some(u32::from_ne_bytes([field[0], field[1], field[2], field[3]])),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_ring_wraps_at_the_end() {
        let data: Vec<u8> = (0..32).collect();
        let span = RecordSpan::from_ring(&data, 24, 16).expect("span");

        assert!(span.is_wrapped());
        assert_eq!(span.parts().0, &data[24..]);
        assert_eq!(span.parts().1, &data[..8]);
        assert_eq!(span.read_array::<4>(6), Some([30, 31, 0, 1]));
    }

    #[test]
    fn from_ring_rejects_oversized_span() {
        let data = [0u8; 16];
        assert!(RecordSpan::from_ring(&data, 0, 17).is_none());
    }

    #[test]
    fn linearize_only_copies_wrapped_spans() {
        let data: Vec<u8> = (0..16).collect();
        let mut scratch = Vec::new();

        let direct = RecordSpan::from_ring(&data, 0, 8).expect("span");
        let linear = direct.linearize(&mut scratch).expect("linearize");
        assert_eq!(linear.as_ptr(), data.as_ptr());

        let wrapped = RecordSpan::from_ring(&data, 12, 8).expect("span");
        let linear = wrapped.linearize(&mut scratch).expect("linearize");
        assert_eq!(linear, &[12, 13, 14, 15, 0, 1, 2, 3]);
    }

    #[test]
    fn byte_reader_stops_at_end() {
        let bytes = [1u8, 0, 0, 0, 2, 0, 0];
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.read_u32(), Some(1));
        assert_eq!(reader.read_u32(), None);
        assert_eq!(reader.position(), 4);
    }

    #[test]
    fn read_unsigned_supports_three_widths() {
        let bytes = 0x0403_0201u32.to_ne_bytes();
        assert_eq!(read_unsigned(&bytes, 0, 1), Some(u32::from(bytes[0])));
        assert_eq!(
            read_unsigned(&bytes, 0, 2),
            Some(u32::from(u16::from_ne_bytes([bytes[0], bytes[1]])))
        );
        assert_eq!(read_unsigned(&bytes, 0, 4), Some(0x0403_0201));
        assert_eq!(read_unsigned(&bytes, 2, 4), None);
        assert_eq!(read_unsigned(&bytes, 0, 3), None);
    }
}
