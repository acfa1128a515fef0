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

//! Collects Linux tracepoint events through `perf_event_open`.
//!
//! A [`TracepointSession`] owns one ring buffer per CPU and any number of
//! tracepoints writing into them. Events are read back in buffer order
//! ([`TracepointSession::unordered`]), in timestamp order
//! ([`TracepointSession::ordered`]), or copied raw into a trace file
//! ([`TracepointSession::save_to_file`]).
//!
//! A session runs in one of two modes:
//!
//! - [`SessionMode::RealTime`]: the reader consumes records as the kernel
//!   produces them; a full buffer drops new events.
//! - [`SessionMode::Circular`]: the kernel overwrites the oldest records;
//!   the reader takes snapshots of the most recent ones.
//!
//! ```no_run
//! use std::ops::ControlFlow;
//! use tracepoint_control::{SessionMode, SessionOptions, TracepointSession};
//!
//! # fn main() -> tracepoint_control::Result<()> {
//! let mut session =
//!     TracepointSession::new(SessionOptions::new(SessionMode::RealTime, 64 * 1024))?;
//! session.enable_tracepoint(&"sched:sched_switch".parse()?)?;
//! let _ = session.wait_for_wakeup(None, None)?;
//! session.enumerate_ordered(|event| {
//!     println!("{} {} on cpu {}", event.time(), event.metadata().name(), event.cpu());
//!     ControlFlow::Continue(())
//! })?;
//! # Ok(())
//! # }
//! ```

// Lint groups: https://doc.rust-lang.org/rustc/lints/groups.html
#![warn(future_incompatible, nonstandard_style, unused)]
#![warn(
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    unconditional_recursion,
    unused_comparisons,
    while_true
)]
#![warn(missing_debug_implementations,
    // TODO: missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
#![warn(clippy::unwrap_used)]

pub use counters::Counters;
pub use enumerate::{OrderedEnumerator, UnorderedEnumerator};
pub use error::{Result, SessionError};
pub use flush::{FlushSummary, TimeRange};
pub use options::{
    BufferSizing, SessionConfig, SessionMode, SessionOptions, Wakeup,
    MAX_BUFFER_SIZE,
};
pub use parser::{parse_sample, ByteRange, EventInfo, SampleFields};
pub use perf_abi::{PerfEventAttr, RecordHeader, SampleType};
pub use session::TracepointSession;
pub use session_info::{HostInfo, SessionInfo};
pub use sys::{LinuxPerf, PerfSystem, RingMemory, WaitOutcome};
pub use tracepoint::{
    CacheError, CommonTypeField, EnableState, EventDesc, FieldFormat,
    MemoryCache, TracefsCache, TracepointCache, TracepointInfo,
    TracepointMetadata, TracepointName,
};
pub use writer::{
    FormatRegistration, TraceFileWriter, TraceWriter, TRACE_FILE_MAGIC,
    TRACE_FILE_VERSION,
};

pub mod logging;
pub mod perf_abi;
pub mod record;
pub mod sys;
pub mod tracepoint;
pub mod writer;

mod buffer;
mod counters;
mod enumerate;
mod error;
mod flush;
mod options;
mod parser;
mod session;
mod session_info;

#[cfg(test)]
mod testing;
