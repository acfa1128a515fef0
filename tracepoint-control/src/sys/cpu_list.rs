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

use fancy_regex::Regex;
use lazy_static::lazy_static;
use std::fs;
use std::io;
use std::path::Path;

lazy_static! {
    // comma separated list of cpu numbers or ranges, e.g. "0-3,5,7-8"
    static ref CPU_LIST_REGEX: Regex = {
        Regex::new(r"^\d+(-\d+)?(,\d+(-\d+)?)*$").expect("regex construction")
    };
}

/// Kernel's list of CPUs that can ever be brought online.
pub const POSSIBLE_CPUS: &str = "/sys/devices/system/cpu/possible";

/// Parses a kernel cpu list such as `0-3,6`. Returns `None` if malformed.
pub fn parse_cpu_list(input: &str) -> Option<Vec<u32>> {
    let input = input.trim();
    if !CPU_LIST_REGEX.is_match(input).unwrap_or(false) {
        return None;
    }

    let mut cpus = Vec::new();
    for part in input.split(',') {
        match part.split_once('-') {
            Some((start, end)) => {
                let start: u32 = start.parse().ok()?;
                let end: u32 = end.parse().ok()?;
                if end < start {
                    return None;
                }
                cpus.extend(start..=end);
            }
            None => cpus.push(part.parse().ok()?),
        }
    }
    Some(cpus)
}

/// Number of per-CPU buffers a session needs: one more than the highest
/// possible cpu number, so buffer index == cpu number.
pub fn possible_cpu_count(path: &Path) -> io::Result<u32> {
    let contents = fs::read_to_string(path)?;
    parse_cpu_list(&contents)
        .and_then(|cpus| cpus.into_iter().max())
        .map(|max| max + 1)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("malformed cpu list in {}: {contents:?}", path.display()),
            )
        })
}
