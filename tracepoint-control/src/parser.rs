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

//! Decoding of `PERF_RECORD_SAMPLE` records.
//!
//! The fields present in a sample depend on the `sample_type` the event was
//! opened with. They always appear in the same order, so decoding is a walk
//! over [`DECODERS`], skipping entries whose bit is not set.

use crate::perf_abi::{RecordHeader, SampleType};
use crate::record::{read_unsigned, ByteReader};
use crate::session_info::SessionInfo;
use crate::tracepoint::{CommonTypeField, EventDesc, TracepointMetadata};
use std::ops::Range;

/// Location of a variable-length field inside a linear record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u32,
    pub len: u32,
}

impl ByteRange {
    fn new(start: usize, len: usize) -> Option<Self> {
        Some(Self { start: start.try_into().ok()?, len: len.try_into().ok()? })
    }

    pub fn range(&self) -> Range<usize> {
        let start = self.start as usize;
        start..start + self.len as usize
    }
}

/// The decoded fields of one sample. Fields that were not sampled keep their
/// default of zero (or an empty range).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SampleFields {
    pub identifier: u64,
    pub ip: u64,
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub addr: u64,
    pub id: u64,
    pub stream_id: u64,
    pub cpu: u32,
    pub cpu_reserved: u32,
    pub period: u64,
    /// `nr` addresses, 8 bytes each.
    pub callchain: ByteRange,
    pub raw: ByteRange,
}

impl SampleFields {
    /// The kernel-assigned sample id, from `IDENTIFIER` or `ID`.
    pub fn sample_id(&self, sample_type: SampleType) -> Option<u64> {
        if sample_type.has_flag(SampleType::IDENTIFIER) {
            Some(self.identifier)
        } else if sample_type.has_flag(SampleType::ID) {
            Some(self.id)
        } else {
            None
        }
    }
}

type Decoder = fn(&mut ByteReader<'_>, &mut SampleFields) -> Option<()>;

/// Sample fields in the order the kernel writes them.
const DECODERS: [(SampleType, Decoder); 11] = [
    (SampleType::IDENTIFIER, decode_identifier),
    (SampleType::IP, decode_ip),
    (SampleType::TID, decode_tid),
    (SampleType::TIME, decode_time),
    (SampleType::ADDR, decode_addr),
    (SampleType::ID, decode_id),
    (SampleType::STREAM_ID, decode_stream_id),
    (SampleType::CPU, decode_cpu),
    (SampleType::PERIOD, decode_period),
    (SampleType::CALLCHAIN, decode_callchain),
    (SampleType::RAW, decode_raw),
];

fn decode_identifier(
    reader: &mut ByteReader<'_>,
    fields: &mut SampleFields,
) -> Option<()> {
    fields.identifier = reader.read_u64()?;
    Some(())
}

fn decode_ip(reader: &mut ByteReader<'_>, fields: &mut SampleFields) -> Option<()> {
    fields.ip = reader.read_u64()?;
    Some(())
}

fn decode_tid(
    reader: &mut ByteReader<'_>,
    fields: &mut SampleFields,
) -> Option<()> {
    let (pid, tid) = reader.read_u32_pair()?;
    fields.pid = pid;
    fields.tid = tid;
    Some(())
}

fn decode_time(
    reader: &mut ByteReader<'_>,
    fields: &mut SampleFields,
) -> Option<()> {
    fields.time = reader.read_u64()?;
    Some(())
}

fn decode_addr(
    reader: &mut ByteReader<'_>,
    fields: &mut SampleFields,
) -> Option<()> {
    fields.addr = reader.read_u64()?;
    Some(())
}

fn decode_id(reader: &mut ByteReader<'_>, fields: &mut SampleFields) -> Option<()> {
    fields.id = reader.read_u64()?;
    Some(())
}

fn decode_stream_id(
    reader: &mut ByteReader<'_>,
    fields: &mut SampleFields,
) -> Option<()> {
    fields.stream_id = reader.read_u64()?;
    Some(())
}

fn decode_cpu(
    reader: &mut ByteReader<'_>,
    fields: &mut SampleFields,
) -> Option<()> {
    let (cpu, reserved) = reader.read_u32_pair()?;
    fields.cpu = cpu;
    fields.cpu_reserved = reserved;
    Some(())
}

fn decode_period(
    reader: &mut ByteReader<'_>,
    fields: &mut SampleFields,
) -> Option<()> {
    fields.period = reader.read_u64()?;
    Some(())
}

fn decode_callchain(
    reader: &mut ByteReader<'_>,
    fields: &mut SampleFields,
) -> Option<()> {
    let nr = usize::try_from(reader.read_u64()?).ok()?;
    let len = nr.checked_mul(8)?;
    let start = reader.position();
    let _ = reader.read_slice(len)?;
    fields.callchain = ByteRange::new(start, len)?;
    Some(())
}

fn decode_raw(
    reader: &mut ByteReader<'_>,
    fields: &mut SampleFields,
) -> Option<()> {
    let len = reader.read_u32()? as usize;
    let start = reader.position();
    let _ = reader.read_slice(len)?;
    fields.raw = ByteRange::new(start, len)?;
    Some(())
}

/// Decodes a linear sample record, header included. Returns `None` if a
/// field would read past the end of the record.
pub fn parse_sample(
    record: &[u8],
    sample_type: SampleType,
) -> Option<SampleFields> {
    if sample_type == SampleType::COMMON {
        return parse_common(record);
    }

    let mut reader = ByteReader::at(record, RecordHeader::SIZE);
    let mut fields = SampleFields::default();
    for (flag, decode) in DECODERS {
        if sample_type.has_flag(flag) {
            decode(&mut reader, &mut fields)?;
        }
    }
    Some(fields)
}

// identifier, pid/tid, time, cpu/res, raw size at fixed offsets.
fn parse_common(record: &[u8]) -> Option<SampleFields> {
    const RAW_SIZE_OFFSET: usize = 40;
    const RAW_OFFSET: usize = RAW_SIZE_OFFSET + 4;

    let word = |offset: usize| -> Option<u64> {
        let bytes = record.get(offset..offset + 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Some(u64::from_ne_bytes(buf))
    };
    let half = |offset: usize| -> Option<u32> { read_unsigned(record, offset, 4) };

    let raw_len = half(RAW_SIZE_OFFSET)? as usize;
    if RAW_OFFSET.checked_add(raw_len)? > record.len() {
        return None;
    }

    Some(SampleFields {
        identifier: word(8)?,
        pid: half(16)?,
        tid: half(20)?,
        time: word(24)?,
        cpu: half(32)?,
        cpu_reserved: half(36)?,
        raw: ByteRange::new(RAW_OFFSET, raw_len)?,
        ..SampleFields::default()
    })
}

/// Reads the tracepoint id out of a raw payload.
pub fn common_type(raw: &[u8], field: CommonTypeField) -> Option<u32> {
    read_unsigned(raw, field.offset, field.size)
}

/// One decoded sample, borrowed from the session that produced it.
#[derive(Clone, Copy, Debug)]
pub struct EventInfo<'a> {
    record: &'a [u8],
    fields: SampleFields,
    desc: &'a EventDesc,
    session_info: &'a SessionInfo,
}

impl<'a> EventInfo<'a> {
    pub(crate) fn new(
        record: &'a [u8],
        fields: SampleFields,
        desc: &'a EventDesc,
        session_info: &'a SessionInfo,
    ) -> Self {
        Self { record, fields, desc, session_info }
    }

    /// The complete record, header included.
    pub fn record(&self) -> &'a [u8] {
        self.record
    }

    pub fn fields(&self) -> &SampleFields {
        &self.fields
    }

    pub fn time(&self) -> u64 {
        self.fields.time
    }

    pub fn pid(&self) -> u32 {
        self.fields.pid
    }

    pub fn tid(&self) -> u32 {
        self.fields.tid
    }

    pub fn cpu(&self) -> u32 {
        self.fields.cpu
    }

    /// The tracepoint's payload, starting with its common fields.
    pub fn raw(&self) -> &'a [u8] {
        self.record.get(self.fields.raw.range()).unwrap_or_default()
    }

    pub fn callchain(&self) -> impl Iterator<Item = u64> + 'a {
        self.record
            .get(self.fields.callchain.range())
            .unwrap_or_default()
            .chunks_exact(8)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(chunk);
                u64::from_ne_bytes(buf)
            })
    }

    pub fn desc(&self) -> &'a EventDesc {
        self.desc
    }

    pub fn metadata(&self) -> &'a TracepointMetadata {
        self.desc.metadata()
    }

    pub fn session_info(&self) -> &'a SessionInfo {
        self.session_info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;
    use test_helpers::records::{tracepoint_raw, SampleRecord};

    fn full_sample() -> SampleRecord {
        SampleRecord {
            identifier: 101,
            ip: 0xffff_0000_1234,
            pid: 42,
            tid: 43,
            time: 1_000_000,
            addr: 0xdead_beef,
            id: 101,
            stream_id: 7,
            cpu: 3,
            period: 1,
            callchain: vec![0x10, 0x20, 0x30],
            raw: tracepoint_raw(316, b"payload"),
        }
    }

    fn expected_fields(
        record: &[u8],
        sample: &SampleRecord,
        sample_type: SampleType,
    ) -> SampleFields {
        let mut expected = SampleFields::default();
        let has = |flag: SampleType| sample_type.has_flag(flag);
        let mut pos = RecordHeader::SIZE;
        if has(SampleType::IDENTIFIER) {
            expected.identifier = sample.identifier;
            pos += 8;
        }
        if has(SampleType::IP) {
            expected.ip = sample.ip;
            pos += 8;
        }
        if has(SampleType::TID) {
            expected.pid = sample.pid;
            expected.tid = sample.tid;
            pos += 8;
        }
        if has(SampleType::TIME) {
            expected.time = sample.time;
            pos += 8;
        }
        if has(SampleType::ADDR) {
            expected.addr = sample.addr;
            pos += 8;
        }
        if has(SampleType::ID) {
            expected.id = sample.id;
            pos += 8;
        }
        if has(SampleType::STREAM_ID) {
            expected.stream_id = sample.stream_id;
            pos += 8;
        }
        if has(SampleType::CPU) {
            expected.cpu = sample.cpu;
            pos += 8;
        }
        if has(SampleType::PERIOD) {
            expected.period = sample.period;
            pos += 8;
        }
        if has(SampleType::CALLCHAIN) {
            let len = sample.callchain.len() * 8;
            expected.callchain =
                ByteRange { start: (pos + 8) as u32, len: len as u32 };
            pos += 8 + len;
        }
        if has(SampleType::RAW) {
            expected.raw = ByteRange {
                start: (pos + 4) as u32,
                len: sample.raw.len() as u32,
            };
        }
        assert!(pos <= record.len());
        expected
    }

    #[test]
    fn every_field_combination_round_trips() {
        let sample = full_sample();
        let bits: Vec<SampleType> = DECODERS.iter().map(|(bit, _)| *bit).collect();

        for mask in 0u32..(1 << bits.len()) {
            let sample_type = bits
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .fold(SampleType::NONE, |acc, (_, bit)| acc | *bit);

            let record = sample.to_bytes(sample_type.0);
            let parsed = parse_sample(&record, sample_type)
                .unwrap_or_else(|| panic!("parse failed for {sample_type:?}"));
            assert_eq!(
                parsed,
                expected_fields(&record, &sample, sample_type),
                "{sample_type:?}"
            );
        }
    }

    #[test]
    fn fast_path_matches_general_path() {
        let sample = full_sample();
        let record = sample.to_bytes(SampleType::COMMON.0);

        let fast = parse_common(&record).expect("fast path");
        let mut reader = ByteReader::at(&record, RecordHeader::SIZE);
        let mut general = SampleFields::default();
        for (flag, decode) in DECODERS {
            if SampleType::COMMON.has_flag(flag) {
                decode(&mut reader, &mut general).expect("general path");
            }
        }
        assert_eq!(fast, general);
    }

    #[test_case(SampleType::COMMON; "fast path")]
    #[test_case(SampleType::COMMON | SampleType::CALLCHAIN; "general path")]
    #[test]
    fn raw_length_past_record_end_is_rejected(sample_type: SampleType) {
        let mut record = full_sample().to_bytes(sample_type.0);
        let valid = parse_sample(&record, sample_type).expect("valid record");

        let size_offset = valid.raw.start as usize - 4;
        record[size_offset..size_offset + 4]
            .copy_from_slice(&0x1000u32.to_ne_bytes());
        assert_eq!(parse_sample(&record, sample_type), None);
    }

    #[test]
    fn callchain_length_past_record_end_is_rejected() {
        let sample_type = SampleType::TIME | SampleType::CALLCHAIN;
        let mut record = full_sample().to_bytes(sample_type.0);
        // nr follows header + time.
        record[16..24].copy_from_slice(&u64::MAX.to_ne_bytes());
        assert_eq!(parse_sample(&record, sample_type), None);
    }

    #[test]
    fn truncated_record_is_rejected() {
        let record = full_sample().to_bytes(SampleType::COMMON.0);
        assert_eq!(parse_sample(&record[..30], SampleType::COMMON), None);
        assert_eq!(
            parse_sample(&record[..30], SampleType::COMMON | SampleType::IP),
            None
        );
    }

    #[test]
    fn common_type_reads_configured_width() {
        let raw = tracepoint_raw(316, b"");
        let field = CommonTypeField { offset: 0, size: 2 };
        assert_eq!(common_type(&raw, field), Some(316));
        assert_eq!(
            common_type(&raw, CommonTypeField { offset: 0, size: 8 }),
            None
        );
    }

    #[test]
    fn sample_id_prefers_identifier() {
        let fields = SampleFields { identifier: 5, id: 6, ..Default::default() };
        assert_eq!(fields.sample_id(SampleType::COMMON), Some(5));
        assert_eq!(fields.sample_id(SampleType::ID), Some(6));
        assert_eq!(fields.sample_id(SampleType::TIME), None);
    }
}
