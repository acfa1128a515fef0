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

//! `tpcollect`: records tracepoint events into a trace file or prints them.

#![warn(clippy::unwrap_used)]

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use nix::poll::ppoll;
use nix::sys::signal::{
    pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet,
    SigmaskHow, Signal,
};
use nix::sys::time::TimeSpec;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracepoint_control::{
    logging, EventInfo, SessionConfig, SessionMode, SessionOptions,
    TimeRange, TraceFileWriter, TracepointName, TracepointSession,
    WaitOutcome,
};
use tracing::{debug, error, info, trace, warn};

const EXIT_OKAY: i32 = 0;
const EXIT_ERROR: i32 = 1;

static STOP: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Circular,
    Realtime,
}

impl From<ModeArg> for SessionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Circular => SessionMode::Circular,
            ModeArg::Realtime => SessionMode::RealTime,
        }
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct TpcollectOptions {
    /// Session settings in TOML. Command line flags take precedence.
    #[clap(long, value_parser)]
    config: Option<PathBuf>,

    #[clap(long, value_enum)]
    mode: Option<ModeArg>,

    /// Bytes per CPU, rounded up to a power of two.
    #[clap(long, value_parser)]
    buffer_size: Option<usize>,

    /// Trace file to write.
    #[clap(short, long, value_parser)]
    output: Option<PathBuf>,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[clap(short, long, value_parser)]
    duration: Option<u64>,

    /// Print events as text.
    #[clap(short, long, conflicts_with = "output")]
    print: bool,

    #[clap(short, long)]
    verbose: bool,

    /// Tracepoints as `system:event`.
    #[clap(required = true, value_parser)]
    tracepoints: Vec<TracepointName>,
}

extern "C" fn request_stop(_: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

/// Blocks SIGINT and SIGTERM so they only arrive while waiting. Returns the
/// mask to wait with.
fn block_stop_signals() -> nix::Result<SigSet> {
    let action = SigAction::new(
        SigHandler::Handler(request_stop),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let mut stop_signals = SigSet::empty();
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // Safety: the handler only stores to an atomic.
        let _ = unsafe { sigaction(signal, &action) }?;
        stop_signals.add(signal);
    }

    let mut wait_mask = SigSet::empty();
    pthread_sigmask(
        SigmaskHow::SIG_BLOCK,
        Some(&stop_signals),
        Some(&mut wait_mask),
    )?;
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        wait_mask.remove(signal);
    }
    Ok(wait_mask)
}

fn session_options(options: &TpcollectOptions) -> anyhow::Result<SessionOptions> {
    let mut config = match &options.config {
        Some(path) => SessionConfig::parse_from_toml_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(mode) = options.mode {
        config.mode = Some(mode.into());
    }
    if let Some(size) = options.buffer_size {
        config.buffer_size = Some(size);
        config.per_cpu_buffer_sizes = None;
    }
    Ok(SessionOptions::try_from(config)?)
}

fn print_event(event: &EventInfo<'_>) {
    let when = event
        .session_info()
        .to_utc(event.time())
        .map(|utc| utc.to_rfc3339())
        .unwrap_or_else(|| event.time().to_string());
    println!(
        "{when} cpu={} pid={} tid={} {} raw={}B",
        event.cpu(),
        event.pid(),
        event.tid(),
        event.metadata().name(),
        event.raw().len()
    );
}

fn print_events(session: &mut TracepointSession) -> anyhow::Result<()> {
    session.enumerate_ordered(|event| {
        print_event(event);
        ControlFlow::Continue(())
    })?;
    Ok(())
}

/// Reads RealTime buffers so the kernel can keep writing.
fn drain(
    session: &mut TracepointSession,
    writer: Option<&mut TraceFileWriter>,
    print: bool,
) -> anyhow::Result<()> {
    if let Some(writer) = writer {
        let summary = session.flush_to_writer(writer, TimeRange::ALL)?;
        trace!("flushed {} records", summary.records);
    } else if print {
        print_events(session)?;
    } else {
        let mut events = session.unordered();
        while events.move_next().is_some() {}
    }
    Ok(())
}

fn run(options: TpcollectOptions) -> anyhow::Result<()> {
    let mut session = TracepointSession::new(session_options(&options)?)
        .context("failed to create the session")?;
    for name in &options.tracepoints {
        session
            .enable_tracepoint(name)
            .with_context(|| format!("failed to enable {name}"))?;
    }
    if session.buffer_handles().next().is_none() {
        bail!("no buffers to collect from");
    }

    let wait_mask = block_stop_signals().context("failed to set up signals")?;
    let deadline = options.duration.map(|secs| Instant::now() + Duration::from_secs(secs));
    let realtime = session.is_realtime();

    // RealTime data has to be written as it arrives.
    let mut writer = match (&options.output, realtime) {
        (Some(path), true) => Some(TraceFileWriter::create(path).with_context(|| {
            format!("failed to create {}", path.display())
        })?),
        _ => None,
    };

    info!(
        "collecting {} tracepoints on {} buffers",
        options.tracepoints.len(),
        session.buffer_count()
    );
    while !STOP.load(Ordering::SeqCst) {
        let timeout =
            deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
        if timeout == Some(Duration::ZERO) {
            break;
        }

        if !realtime {
            // Circular buffers are only read at the end.
            match ppoll(&mut [], timeout.map(TimeSpec::from_duration), Some(wait_mask)) {
                Ok(_) | Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e).context("ppoll"),
            }
        }

        match session.wait_for_wakeup(timeout, Some(&wait_mask))? {
            WaitOutcome::Ready(ready) => {
                trace!("{ready} buffers ready");
                drain(&mut session, writer.as_mut(), options.print)?;
            }
            WaitOutcome::TimedOut => {}
            WaitOutcome::Interrupted => debug!("interrupted"),
        }
    }
    info!("stopping");

    if realtime {
        drain(&mut session, writer.as_mut(), options.print)?;
        if let Some(writer) = writer {
            let _ = writer.finalize().context("failed to finish the trace file")?;
        }
    } else if let Some(path) = &options.output {
        let summary = session
            .save_to_file(path, TimeRange::ALL)
            .with_context(|| format!("failed to save {}", path.display()))?;
        info!("saved {} samples to {}", summary.samples, path.display());
    } else if options.print {
        print_events(&mut session)?;
    }

    let counters = session.counters();
    if counters.lost_events > 0 || counters.corrupt_events > 0 || counters.corrupt_buffers > 0 {
        warn!("{}", serde_json::to_string(&counters)?);
    } else {
        info!("{}", serde_json::to_string(&counters)?);
    }
    Ok(())
}

fn main() {
    let options = TpcollectOptions::parse();

    if let Err(e) = logging::init(options.verbose) {
        eprintln!("failed to initialize logging: {e}");
    }
    trace!("**Logging: Verbose Mode**");

    let exit_code = match run(options) {
        Ok(()) => EXIT_OKAY,
        Err(e) => {
            error!("{e:?}");
            EXIT_ERROR
        }
    };
    std::process::exit(exit_code);
}
