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

//! Persisting raw session data.

use crate::session_info::{HostInfo, SessionInfo};
use crate::tracepoint::EventDesc;
use std::io::{self, IoSlice};

pub use self::trace_file::{TraceFileWriter, TRACE_FILE_MAGIC, TRACE_FILE_VERSION};

mod trace_file;

/// Outcome of [`TraceWriter::add_format`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatRegistration {
    Added,
    AlreadyPresent,
}

/// Destination for [`TracepointSession::flush_to_writer`].
///
/// [`TracepointSession::flush_to_writer`]: crate::TracepointSession::flush_to_writer
pub trait TraceWriter {
    /// Records the session clock and the host it ran on.
    fn set_session_info(&mut self, session: &SessionInfo, host: &HostInfo) -> io::Result<()>;

    /// Registers the format of a tracepoint whose samples are about to be
    /// written. Registering the same tracepoint again is not an error.
    fn add_format(&mut self, desc: &EventDesc) -> io::Result<FormatRegistration>;

    /// Appends raw perf records, in order. Returns the number of bytes
    /// written, which is always the total length of `data`.
    fn write_event_data(&mut self, data: &[IoSlice<'_>]) -> io::Result<usize>;

    /// The lowest and highest sample timestamp written.
    fn set_sample_time_range(&mut self, min: u64, max: u64);
}
