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

//! A self-describing trace file.
//!
//! ```text
//! "TPCTRACE" | version: u64
//! raw perf records, as copied from the rings
//! metadata: JSON
//! metadata offset: u64 | "TPCTRACE"
//! ```
//!
//! Integers are little-endian. The trailer lets a reader find the metadata
//! without scanning the records.

use super::{FormatRegistration, TraceWriter};
use crate::session_info::{HostInfo, SessionInfo};
use crate::tracepoint::EventDesc;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, IoSlice, Write};
use std::path::Path;
use tracing::debug;

pub const TRACE_FILE_MAGIC: &[u8; 8] = b"TPCTRACE";
pub const TRACE_FILE_VERSION: u64 = 1;

#[derive(Debug, Serialize)]
struct FormatEntry {
    name: String,
    id: u32,
    sample_ids: Vec<u64>,
    format: String,
}

#[derive(Debug, Serialize)]
struct Metadata<'a> {
    formats: Vec<&'a FormatEntry>,
    session: Option<&'a SessionInfo>,
    host: Option<&'a HostInfo>,
    sample_time_range: Option<(u64, u64)>,
    event_data_len: u64,
    recorded_at: DateTime<Utc>,
}

/// Writes the trace file format described in the module docs.
#[derive(Debug)]
pub struct TraceFileWriter<W: Write = BufWriter<File>> {
    out: W,
    /// Bytes written so far, including the preamble.
    position: u64,
    formats: BTreeMap<u32, FormatEntry>,
    session: Option<SessionInfo>,
    host: Option<HostInfo>,
    sample_time_range: Option<(u64, u64)>,
}

impl TraceFileWriter {
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        debug!("creating trace file {}", path.display());
        Self::new(BufWriter::new(File::create(path)?))
    }
}

impl<W: Write> TraceFileWriter<W> {
    /// Starts a trace file by writing the preamble to `out`.
    pub fn new(mut out: W) -> io::Result<Self> {
        out.write_all(TRACE_FILE_MAGIC)?;
        out.write_all(&TRACE_FILE_VERSION.to_le_bytes())?;
        Ok(Self {
            out,
            position: (TRACE_FILE_MAGIC.len() + 8) as u64,
            formats: BTreeMap::new(),
            session: None,
            host: None,
            sample_time_range: None,
        })
    }

    /// Writes the metadata block and trailer, then returns the sink.
    pub fn finalize(mut self) -> io::Result<W> {
        let metadata = Metadata {
            formats: self.formats.values().collect(),
            session: self.session.as_ref(),
            host: self.host.as_ref(),
            sample_time_range: self.sample_time_range,
            event_data_len: self.position - (TRACE_FILE_MAGIC.len() + 8) as u64,
            recorded_at: Utc::now(),
        };
        let json = serde_json::to_vec(&metadata).map_err(io::Error::from)?;

        let metadata_offset = self.position;
        self.out.write_all(&json)?;
        self.out.write_all(&metadata_offset.to_le_bytes())?;
        self.out.write_all(TRACE_FILE_MAGIC)?;
        self.out.flush()?;
        debug!(
            "finished trace file: {} bytes of events, {} formats",
            metadata.event_data_len,
            metadata.formats.len()
        );
        Ok(self.out)
    }

    fn write_all_vectored(&mut self, data: &[IoSlice<'_>]) -> io::Result<usize> {
        let total: usize = data.iter().map(|slice| slice.len()).sum();
        if total == 0 {
            return Ok(0);
        }

        let written = self.out.write_vectored(data)?;
        if written == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }

        // Finish a short write one slice at a time.
        let mut skip = written;
        for slice in data {
            if skip >= slice.len() {
                skip -= slice.len();
                continue;
            }
            self.out.write_all(&slice[skip..])?;
            skip = 0;
        }
        Ok(total)
    }
}

impl<W: Write> TraceWriter for TraceFileWriter<W> {
    fn set_session_info(&mut self, session: &SessionInfo, host: &HostInfo) -> io::Result<()> {
        self.session = Some(session.clone());
        self.host = Some(host.clone());
        Ok(())
    }

    fn add_format(&mut self, desc: &EventDesc) -> io::Result<FormatRegistration> {
        let metadata = desc.metadata();
        if self.formats.contains_key(&metadata.id()) {
            return Ok(FormatRegistration::AlreadyPresent);
        }

        let entry = FormatEntry {
            name: metadata.name().to_string(),
            id: metadata.id(),
            sample_ids: desc.sample_ids().collect(),
            format: metadata.format().to_owned(),
        };
        let _ = self.formats.insert(entry.id, entry);
        Ok(FormatRegistration::Added)
    }

    fn write_event_data(&mut self, data: &[IoSlice<'_>]) -> io::Result<usize> {
        let written = self.write_all_vectored(data)?;
        self.position += written as u64;
        Ok(written)
    }

    /// Widens the recorded range; a file may take several flushes.
    fn set_sample_time_range(&mut self, min: u64, max: u64) {
        self.sample_time_range = Some(
            self.sample_time_range
                .map_or((min, max), |(lo, hi)| (lo.min(min), hi.max(max))),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::SessionMode;
    use crate::perf_abi::PerfEventAttr;
    use crate::testing::metadata;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn desc(event: &str, id: u32) -> EventDesc {
        EventDesc::new(Arc::new(metadata(event, id)), PerfEventAttr::default(), vec![7, 0, 9])
    }

    fn split(file: &[u8]) -> (&[u8], serde_json::Value) {
        let (rest, trailer) = file.split_at(file.len() - 16);
        assert_eq!(&trailer[8..], TRACE_FILE_MAGIC);
        let offset = u64::from_le_bytes(trailer[..8].try_into().expect("8 bytes")) as usize;
        let metadata = serde_json::from_slice(&rest[offset..]).expect("json");
        (&rest[16..offset], metadata)
    }

    #[test]
    fn empty_file_has_preamble_metadata_and_trailer() {
        let file = TraceFileWriter::new(Vec::new())
            .and_then(TraceFileWriter::finalize)
            .expect("write");
        assert_eq!(&file[..8], TRACE_FILE_MAGIC);
        assert_eq!(&file[8..16], &1u64.to_le_bytes());

        let (events, metadata) = split(&file);
        assert!(events.is_empty());
        assert_eq!(metadata["formats"], serde_json::json!([]));
        assert_eq!(metadata["sample_time_range"], serde_json::Value::Null);
    }

    #[test]
    fn event_data_is_written_in_order() {
        let mut writer = TraceFileWriter::new(Vec::new()).expect("writer");
        let written = writer
            .write_event_data(&[IoSlice::new(b"abc"), IoSlice::new(b""), IoSlice::new(b"de")])
            .expect("write");
        assert_eq!(written, 5);
        assert_eq!(writer.write_event_data(&[IoSlice::new(b"f")]).expect("write"), 1);
        writer.set_sample_time_range(3, 9);

        let file = writer.finalize().expect("finalize");
        let (events, metadata) = split(&file);
        assert_eq!(events, b"abcdef");
        assert_eq!(metadata["event_data_len"], 6);
        assert_eq!(metadata["sample_time_range"], serde_json::json!([3, 9]));
    }

    #[test]
    fn formats_are_added_once() {
        let mut writer = TraceFileWriter::new(Vec::new()).expect("writer");
        assert_eq!(writer.add_format(&desc("one", 1)).expect("add"), FormatRegistration::Added);
        assert_eq!(
            writer.add_format(&desc("one", 1)).expect("add"),
            FormatRegistration::AlreadyPresent
        );
        assert_eq!(writer.add_format(&desc("two", 2)).expect("add"), FormatRegistration::Added);

        let file = writer.finalize().expect("finalize");
        let (_, metadata) = split(&file);
        let formats = metadata["formats"].as_array().expect("array");
        assert_eq!(formats.len(), 2);
        assert_eq!(formats[0]["name"], "test:one");
        assert_eq!(formats[0]["sample_ids"], serde_json::json!([7, 9]));
        assert!(formats[1]["format"].as_str().expect("format").contains("ID: 2"));
    }

    #[test]
    fn session_and_host_are_recorded() {
        let mut writer = TraceFileWriter::new(Vec::new()).expect("writer");
        let host = HostInfo {
            hostname: "box".into(),
            os_release: "6.1.0".into(),
            architecture: "x86_64".into(),
        };
        writer
            .set_session_info(
                &SessionInfo::capture(SessionMode::Circular, libc::CLOCK_MONOTONIC),
                &host,
            )
            .expect("session");

        let file = writer.finalize().expect("finalize");
        let (_, metadata) = split(&file);
        assert_eq!(metadata["host"]["hostname"], "box");
        assert_eq!(metadata["session"]["clock_id"], libc::CLOCK_MONOTONIC);
        assert_eq!(metadata["session"]["mode"], "circular");
    }

    #[test]
    fn sample_time_range_spans_every_flush() {
        let mut writer = TraceFileWriter::new(Vec::new()).expect("writer");
        writer.set_sample_time_range(5, 5);
        writer.set_sample_time_range(50, 50);
        writer.set_sample_time_range(20, 30);

        let file = writer.finalize().expect("finalize");
        let (_, metadata) = split(&file);
        assert_eq!(metadata["sample_time_range"], serde_json::json!([5, 50]));
    }
}
