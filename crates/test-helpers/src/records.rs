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

//! Byte-level builders for perf ring buffer records.

const PERF_RECORD_LOST: u32 = 2;
const PERF_RECORD_SAMPLE: u32 = 9;

const SAMPLE_IP: u64 = 1 << 0;
const SAMPLE_TID: u64 = 1 << 1;
const SAMPLE_TIME: u64 = 1 << 2;
const SAMPLE_ADDR: u64 = 1 << 3;
const SAMPLE_CALLCHAIN: u64 = 1 << 5;
const SAMPLE_ID: u64 = 1 << 6;
const SAMPLE_CPU: u64 = 1 << 7;
const SAMPLE_PERIOD: u64 = 1 << 8;
const SAMPLE_STREAM_ID: u64 = 1 << 9;
const SAMPLE_RAW: u64 = 1 << 10;
const SAMPLE_IDENTIFIER: u64 = 1 << 16;

fn header(record_type: u32, size: u16) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(size as usize);
    bytes.extend_from_slice(&record_type.to_ne_bytes());
    bytes.extend_from_slice(&0u16.to_ne_bytes());
    bytes.extend_from_slice(&size.to_ne_bytes());
    bytes
}

/// Every field a sample can carry. Only those selected by the sample type
/// passed to [`SampleRecord::to_bytes`] are written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleRecord {
    pub identifier: u64,
    pub ip: u64,
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub addr: u64,
    pub id: u64,
    pub stream_id: u64,
    pub cpu: u32,
    pub period: u64,
    pub callchain: Vec<u64>,
    pub raw: Vec<u8>,
}

impl SampleRecord {
    /// A sample as written for the common session layout.
    pub fn common(identifier: u64, time: u64, cpu: u32, raw: Vec<u8>) -> Self {
        Self { identifier, time, cpu, pid: 1, tid: 1, raw, ..Self::default() }
    }

    /// Encodes a `PERF_RECORD_SAMPLE`, zero padded to 8 bytes.
    pub fn to_bytes(&self, sample_type: u64) -> Vec<u8> {
        let has = |bit: u64| sample_type & bit != 0;
        let mut body = Vec::new();

        if has(SAMPLE_IDENTIFIER) {
            body.extend_from_slice(&self.identifier.to_ne_bytes());
        }
        if has(SAMPLE_IP) {
            body.extend_from_slice(&self.ip.to_ne_bytes());
        }
        if has(SAMPLE_TID) {
            body.extend_from_slice(&self.pid.to_ne_bytes());
            body.extend_from_slice(&self.tid.to_ne_bytes());
        }
        if has(SAMPLE_TIME) {
            body.extend_from_slice(&self.time.to_ne_bytes());
        }
        if has(SAMPLE_ADDR) {
            body.extend_from_slice(&self.addr.to_ne_bytes());
        }
        if has(SAMPLE_ID) {
            body.extend_from_slice(&self.id.to_ne_bytes());
        }
        if has(SAMPLE_STREAM_ID) {
            body.extend_from_slice(&self.stream_id.to_ne_bytes());
        }
        if has(SAMPLE_CPU) {
            body.extend_from_slice(&self.cpu.to_ne_bytes());
            body.extend_from_slice(&0u32.to_ne_bytes());
        }
        if has(SAMPLE_PERIOD) {
            body.extend_from_slice(&self.period.to_ne_bytes());
        }
        if has(SAMPLE_CALLCHAIN) {
            body.extend_from_slice(&(self.callchain.len() as u64).to_ne_bytes());
            for ip in &self.callchain {
                body.extend_from_slice(&ip.to_ne_bytes());
            }
        }
        if has(SAMPLE_RAW) {
            body.extend_from_slice(&(self.raw.len() as u32).to_ne_bytes());
            body.extend_from_slice(&self.raw);
        }

        let size = (8 + body.len() + 7) & !7;
        let mut record = header(PERF_RECORD_SAMPLE, size as u16);
        record.extend_from_slice(&body);
        record.resize(size, 0);
        record
    }
}

/// A tracepoint payload: the 8 bytes of common fields followed by `fields`.
pub fn tracepoint_raw(common_type: u16, fields: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(8 + fields.len());
    raw.extend_from_slice(&common_type.to_ne_bytes());
    raw.extend_from_slice(&[0u8, 0u8]);
    raw.extend_from_slice(&1i32.to_ne_bytes());
    raw.extend_from_slice(fields);
    raw
}

/// `PERF_RECORD_LOST` reporting `lost` dropped events.
pub fn lost_record(id: u64, lost: u64) -> Vec<u8> {
    let mut record = header(PERF_RECORD_LOST, 24);
    record.extend_from_slice(&id.to_ne_bytes());
    record.extend_from_slice(&lost.to_ne_bytes());
    record
}

/// A zero-filled record of any type. `size` should be a multiple of 8.
pub fn other_record(record_type: u32, size: u16) -> Vec<u8> {
    let mut record = header(record_type, size);
    record.resize(size as usize, 0);
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_are_padded_to_eight_bytes() {
        let sample = SampleRecord::common(1, 2, 3, vec![1, 2, 3]);
        let bytes = sample.to_bytes(SAMPLE_RAW);
        // header + u32 size + 3 bytes, rounded up
        assert_eq!(bytes.len(), 16);
        assert_eq!(u16::from_ne_bytes([bytes[6], bytes[7]]), 16);
    }

    #[test]
    fn lost_record_carries_count_at_sixteen() {
        let record = lost_record(1, 99);
        assert_eq!(record.len(), 24);
        let lost: [u8; 8] = record[16..24].try_into().expect("8 bytes");
        assert_eq!(u64::from_ne_bytes(lost), 99);
    }
}
