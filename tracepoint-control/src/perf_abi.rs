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

//! Kernel ABI constants and fixed-layout descriptors from
//! `linux/uapi/linux/perf_event.h` that the session needs.

use std::fmt;
use std::mem::size_of;
use std::ops::BitOr;

/// `PERF_TYPE_TRACEPOINT`
pub const PERF_TYPE_TRACEPOINT: u32 = 2;

/// `PERF_RECORD_LOST`: `{ header; u64 id; u64 lost; }`
pub const PERF_RECORD_LOST: u32 = 2;
/// `PERF_RECORD_SAMPLE`
pub const PERF_RECORD_SAMPLE: u32 = 9;

/// Byte offset of the lost-event count inside a `PERF_RECORD_LOST` record.
pub const LOST_COUNT_OFFSET: usize = 16;

/// `PERF_FORMAT_ID`. Reading a handle returns `{ u64 value; u64 id; }`.
pub const PERF_FORMAT_ID: u64 = 1 << 2;

/// `PERF_FLAG_FD_CLOEXEC`
pub const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

// perf_event_attr bitfield, bit N is (1 << N) on the little-endian targets we
// build for.
pub const ATTR_FLAG_DISABLED: u64 = 1 << 0;
pub const ATTR_FLAG_WATERMARK: u64 = 1 << 14;
pub const ATTR_FLAG_USE_CLOCKID: u64 = 1 << 25;
pub const ATTR_FLAG_WRITE_BACKWARD: u64 = 1 << 27;

/// Offsets into `struct perf_event_mmap_page` (the header page of a ring).
pub mod mmap_page {
    pub const DATA_HEAD: usize = 1024;
    pub const DATA_TAIL: usize = 1032;
    pub const DATA_OFFSET: usize = 1040;
    pub const DATA_SIZE: usize = 1048;
    /// Smallest header page that contains every field above.
    pub const MIN_SIZE: usize = 1056;
}

/// `perf_event_sample_format`: bits of `perf_event_attr.sample_type`.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SampleType(pub u64);

impl SampleType {
    pub const NONE: Self = Self(0);
    pub const IP: Self = Self(1 << 0);
    pub const TID: Self = Self(1 << 1);
    pub const TIME: Self = Self(1 << 2);
    pub const ADDR: Self = Self(1 << 3);
    pub const READ: Self = Self(1 << 4);
    pub const CALLCHAIN: Self = Self(1 << 5);
    pub const ID: Self = Self(1 << 6);
    pub const CPU: Self = Self(1 << 7);
    pub const PERIOD: Self = Self(1 << 8);
    pub const STREAM_ID: Self = Self(1 << 9);
    pub const RAW: Self = Self(1 << 10);
    pub const IDENTIFIER: Self = Self(1 << 16);

    /// Every bit the sample parser knows how to decode.
    pub const SUPPORTED: Self = Self(
        Self::IDENTIFIER.0
            | Self::IP.0
            | Self::TID.0
            | Self::TIME.0
            | Self::ADDR.0
            | Self::ID.0
            | Self::STREAM_ID.0
            | Self::CPU.0
            | Self::PERIOD.0
            | Self::CALLCHAIN.0
            | Self::RAW.0,
    );

    /// identifier + tid + time + cpu + raw, the layout most sessions use.
    pub const COMMON: Self = Self(
        Self::IDENTIFIER.0
            | Self::TID.0
            | Self::TIME.0
            | Self::CPU.0
            | Self::RAW.0,
    );

    pub const fn has_flag(self, mask: Self) -> bool {
        0 != (self.0 & mask.0)
    }

    pub const fn or(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Bits that are set but not in [`SampleType::SUPPORTED`].
    pub const fn unsupported(self) -> Self {
        Self(self.0 & !Self::SUPPORTED.0)
    }

    /// Offset of the `time` field within a sample record (including the
    /// 8-byte record header), or `None` if time is not sampled.
    pub const fn time_offset(self) -> Option<usize> {
        if !self.has_flag(Self::TIME) {
            return None;
        }

        let mut offset = RecordHeader::SIZE;
        if self.has_flag(Self::IDENTIFIER) {
            offset += 8;
        }
        if self.has_flag(Self::IP) {
            offset += 8;
        }
        if self.has_flag(Self::TID) {
            offset += 8;
        }
        Some(offset)
    }

    /// Parses a field name as used in configuration files.
    pub fn from_field_name(name: &str) -> Option<Self> {
        let field = match name {
            "identifier" => Self::IDENTIFIER,
            "ip" => Self::IP,
            "tid" => Self::TID,
            "time" => Self::TIME,
            "addr" => Self::ADDR,
            "id" => Self::ID,
            "stream_id" => Self::STREAM_ID,
            "cpu" => Self::CPU,
            "period" => Self::PERIOD,
            "callchain" => Self::CALLCHAIN,
            "raw" => Self::RAW,
            _ => return None,
        };
        Some(field)
    }
}

impl BitOr for SampleType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.or(rhs)
    }
}

impl From<u64> for SampleType {
    fn from(val: u64) -> Self {
        Self(val)
    }
}

impl fmt::Debug for SampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SampleType({:#x})", self.0)
    }
}

/// `struct perf_event_attr` up to `PERF_ATTR_SIZE_VER6`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PerfEventAttr {
    pub attr_type: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events_or_watermark: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub reserved_2: u16,
    pub aux_sample_size: u32,
    pub reserved_3: u32,
}

impl PerfEventAttr {
    /// `PERF_ATTR_SIZE_VER6`
    pub const SIZE: u32 = size_of::<PerfEventAttr>() as u32;

    pub fn has_flag(&self, flag: u64) -> bool {
        0 != (self.flags & flag)
    }
}

/// `struct perf_event_header`, the 8 bytes that start every record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecordHeader {
    pub record_type: u32,
    pub misc: u16,
    pub size: u16,
}

impl RecordHeader {
    pub const SIZE: usize = 8;

    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self {
            record_type: u32::from_ne_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ]),
            misc: u16::from_ne_bytes([bytes[4], bytes[5]]),
            size: u16::from_ne_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.record_type.to_ne_bytes());
        bytes[4..6].copy_from_slice(&self.misc.to_ne_bytes());
        bytes[6..8].copy_from_slice(&self.size.to_ne_bytes());
        bytes
    }

    pub fn is_sample(&self) -> bool {
        self.record_type == PERF_RECORD_SAMPLE
    }

    pub fn is_lost(&self) -> bool {
        self.record_type == PERF_RECORD_LOST
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_matches_kernel_ver6_size() {
        assert_eq!(PerfEventAttr::SIZE, 120);
    }

    #[test]
    fn time_offset_counts_preceding_fields() {
        assert_eq!(SampleType::COMMON.time_offset(), Some(24));
        assert_eq!(
            (SampleType::IP | SampleType::TIME).time_offset(),
            Some(16)
        );
        assert_eq!(SampleType::TIME.time_offset(), Some(8));
        assert_eq!(SampleType::RAW.time_offset(), None);
    }

    #[test]
    fn header_bytes_round_trip() {
        let header =
            RecordHeader { record_type: PERF_RECORD_SAMPLE, misc: 2, size: 48 };
        assert_eq!(RecordHeader::from_bytes(header.to_bytes()), header);
    }

    #[test]
    fn read_is_not_supported() {
        let sample_type = SampleType::COMMON | SampleType::READ;
        assert_eq!(sample_type.unsupported(), SampleType::READ);
    }
}
