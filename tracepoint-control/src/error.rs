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

use crate::tracepoint::CacheError;
use nix::errno::Errno;
use std::collections::TryReserveError;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{operation} failed{}: {source}", cpu_suffix(.cpu))]
    Os {
        operation: &'static str,
        cpu: Option<u32>,
        source: Errno,
    },
    #[error("tracepoint {id} is not registered with the session")]
    TracepointNotFound { id: u32 },
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("ordered enumeration requires the time sample field")]
    TimestampNotSampled,
    #[error("unsupported sample type bits {bits:#x}")]
    UnsupportedSampleType { bits: u64 },
    #[error("invalid buffer size {size}")]
    InvalidBufferSize { size: usize },
    #[error("invalid configuration: {reason}")]
    Config { reason: String },
    #[error("out of memory")]
    OutOfMemory(#[from] TryReserveError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SessionError {
    pub(crate) fn os(operation: &'static str, cpu: u32, source: Errno) -> Self {
        Self::Os { operation, cpu: Some(cpu), source }
    }

    /// The OS error code, if this error came from a syscall.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Os { source, .. } => Some(*source),
            Self::Io(e) => e.raw_os_error().map(Errno::from_i32),
            _ => None,
        }
    }
}

fn cpu_suffix(cpu: &Option<u32>) -> String {
    cpu.map(|cpu| format!(" on cpu {cpu}")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_error_reports_cpu_and_errno() {
        let err = SessionError::os("perf_event_open", 3, Errno::EACCES);
        assert_eq!(err.errno(), Some(Errno::EACCES));
        assert!(err.to_string().contains("on cpu 3"));
    }

    #[test]
    fn usage_errors_have_no_errno() {
        assert_eq!(SessionError::TimestampNotSampled.errno(), None);
    }
}
