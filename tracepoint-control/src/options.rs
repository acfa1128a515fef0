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

//! Session configuration.
//!
//! [`SessionOptions`] is normally built in code. [`SessionConfig`] is the
//! same information as it appears in a TOML file, e.g.
//!
//! ```toml
//! mode = "realtime"
//! buffer_size = 65536
//! sample_fields = ["identifier", "tid", "time", "cpu", "raw"]
//! wakeup_watermark = 4096
//! ```

use crate::error::{Result, SessionError};
use crate::perf_abi::SampleType;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Largest per-CPU data region accepted.
pub const MAX_BUFFER_SIZE: usize = 1 << 30;

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// How the kernel treats a full buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Kernel overwrites the oldest data. Reading does not consume.
    Circular,
    /// Kernel drops new data until the consumer frees space. Reading consumes.
    #[serde(alias = "real_time")]
    RealTime,
}

/// Per-CPU data region sizes, in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferSizing {
    /// The same size for every possible CPU.
    Uniform(usize),
    /// One entry per CPU; zero means no buffer for that CPU.
    PerCpu(Vec<usize>),
}

/// When the kernel wakes up a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// After this many bytes are pending.
    Watermark(u32),
    /// After this many events are pending.
    Events(u32),
}

/// Immutable settings of a [`crate::TracepointSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    mode: SessionMode,
    buffer_sizing: BufferSizing,
    sample_type: SampleType,
    wakeup: Wakeup,
    clock_id: i32,
}

impl SessionOptions {
    pub fn new(mode: SessionMode, buffer_size: usize) -> Self {
        Self {
            mode,
            buffer_sizing: BufferSizing::Uniform(buffer_size),
            sample_type: SampleType::COMMON,
            wakeup: Wakeup::Watermark(0),
            clock_id: libc::CLOCK_MONOTONIC,
        }
    }

    pub fn per_cpu(mode: SessionMode, sizes: Vec<usize>) -> Self {
        Self { buffer_sizing: BufferSizing::PerCpu(sizes), ..Self::new(mode, 0) }
    }

    pub fn sample_type(mut self, sample_type: SampleType) -> Self {
        self.sample_type = sample_type;
        self
    }

    pub fn wakeup(mut self, wakeup: Wakeup) -> Self {
        self.wakeup = wakeup;
        self
    }

    pub fn clock_id(mut self, clock_id: i32) -> Self {
        self.clock_id = clock_id;
        self
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn buffer_sizing(&self) -> &BufferSizing {
        &self.buffer_sizing
    }

    pub fn sample_fields(&self) -> SampleType {
        self.sample_type
    }

    pub fn wakeup_policy(&self) -> Wakeup {
        self.wakeup
    }

    pub fn clock(&self) -> i32 {
        self.clock_id
    }

    /// Checks settings that do not depend on the host.
    pub(crate) fn validate(&self) -> Result<()> {
        let unsupported = self.sample_type.unsupported();
        if unsupported != SampleType::NONE {
            return Err(SessionError::UnsupportedSampleType {
                bits: unsupported.0,
            });
        }

        let sizes: &[usize] = match &self.buffer_sizing {
            BufferSizing::Uniform(size) => std::slice::from_ref(size),
            BufferSizing::PerCpu(sizes) => sizes,
        };
        if let Some(&size) = sizes.iter().find(|&&size| size > MAX_BUFFER_SIZE)
        {
            return Err(SessionError::InvalidBufferSize { size });
        }
        Ok(())
    }

    /// Rounds every requested size up to a power of two of at least one
    /// page. `cpu_count` is used for uniform sizing.
    pub(crate) fn buffer_sizes(
        &self,
        cpu_count: u32,
        page_size: usize,
    ) -> Vec<usize> {
        let round = |size: usize| {
            if size == 0 {
                0
            } else {
                size.max(page_size).next_power_of_two()
            }
        };

        match &self.buffer_sizing {
            BufferSizing::Uniform(size) => {
                vec![round(*size); cpu_count as usize]
            }
            BufferSizing::PerCpu(sizes) => {
                sizes.iter().copied().map(round).collect()
            }
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::new(SessionMode::RealTime, DEFAULT_BUFFER_SIZE)
    }
}

/// [`SessionOptions`] as read from a TOML file. Missing keys take the
/// defaults of [`SessionOptions::default`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    pub mode: Option<SessionMode>,
    pub buffer_size: Option<usize>,
    pub per_cpu_buffer_sizes: Option<Vec<usize>>,
    pub sample_fields: Option<Vec<String>>,
    pub wakeup_watermark: Option<u32>,
    pub wakeup_events: Option<u32>,
    pub clock_id: Option<i32>,
}

impl SessionConfig {
    pub fn parse_from_toml(config_toml: &str) -> Result<Self> {
        toml::from_str(config_toml)
            .map_err(|e| SessionError::Config { reason: e.to_string() })
    }

    pub fn parse_from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config_toml = fs::read_to_string(path).map_err(|e| {
            SessionError::Config {
                reason: format!("could not read {}: {e}", path.display()),
            }
        })?;
        Self::parse_from_toml(&config_toml)
    }
}

impl TryFrom<SessionConfig> for SessionOptions {
    type Error = SessionError;

    fn try_from(config: SessionConfig) -> Result<Self> {
        let defaults = SessionOptions::default();
        let mode = config.mode.unwrap_or(defaults.mode);

        let mut options = match (config.buffer_size, config.per_cpu_buffer_sizes)
        {
            (Some(_), Some(_)) => {
                return Err(SessionError::Config {
                    reason: "buffer_size and per_cpu_buffer_sizes are exclusive"
                        .into(),
                })
            }
            (_, Some(sizes)) => SessionOptions::per_cpu(mode, sizes),
            (size, None) => SessionOptions::new(
                mode,
                size.unwrap_or(DEFAULT_BUFFER_SIZE),
            ),
        };

        if let Some(fields) = config.sample_fields {
            let mut sample_type = SampleType::NONE;
            for field in &fields {
                sample_type = sample_type.or(
                    SampleType::from_field_name(field).ok_or_else(|| {
                        SessionError::Config {
                            reason: format!("unknown sample field '{field}'"),
                        }
                    })?,
                );
            }
            options = options.sample_type(sample_type);
        }

        options = match (config.wakeup_watermark, config.wakeup_events) {
            (Some(_), Some(_)) => {
                return Err(SessionError::Config {
                    reason: "wakeup_watermark and wakeup_events are exclusive"
                        .into(),
                })
            }
            (Some(bytes), None) => options.wakeup(Wakeup::Watermark(bytes)),
            (None, Some(events)) => options.wakeup(Wakeup::Events(events)),
            (None, None) => options,
        };

        if let Some(clock_id) = config.clock_id {
            options = options.clock_id(clock_id);
        }

        options.validate()?;
        Ok(options)
    }
}
