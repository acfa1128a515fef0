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

use super::cache::{CacheError, TracepointCache, TracepointMetadata, TracepointName};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};
use walkdir::WalkDir;

const TRACEFS_ROOTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

/// Reads tracepoint formats from tracefs and keeps what it has read.
#[derive(Debug, Clone)]
pub struct TracefsCache {
    root: PathBuf,
    by_id: HashMap<u32, Arc<TracepointMetadata>>,
    by_name: HashMap<TracepointName, Arc<TracepointMetadata>>,
}

impl TracefsCache {
    /// Uses the first mounted tracefs found.
    pub fn new() -> Self {
        let root = TRACEFS_ROOTS
            .iter()
            .map(PathBuf::from)
            .find(|root| root.join("events").is_dir())
            .unwrap_or_else(|| PathBuf::from(TRACEFS_ROOTS[0]));
        Self::with_root(root)
    }

    /// Uses a tracefs (or a copy of one) at `root`.
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            by_id: HashMap::new(),
            by_name: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn event_dir(&self, name: &TracepointName) -> PathBuf {
        self.root.join("events").join(name.system()).join(name.event())
    }

    fn load(
        &mut self,
        name: &TracepointName,
    ) -> Result<Arc<TracepointMetadata>, CacheError> {
        let path = self.event_dir(name).join("format");
        let format = fs::read_to_string(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                CacheError::NameNotFound { name: name.clone() }
            }
            _ => CacheError::Io { path: path.clone(), source: e },
        })?;

        let metadata = Arc::new(TracepointMetadata::parse(name.clone(), &format)?);
        debug!("loaded format of {name} (id {})", metadata.id());
        let _ = self.by_id.insert(metadata.id(), metadata.clone());
        let _ = self.by_name.insert(name.clone(), metadata.clone());
        Ok(metadata)
    }

    /// Walks `events/*/*/id` looking for `id`.
    fn scan_for_id(&self, id: u32) -> Option<TracepointName> {
        let events = self.root.join("events");
        for entry in WalkDir::new(&events)
            .min_depth(3)
            .max_depth(3)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name() == "id")
        {
            let Ok(contents) = fs::read_to_string(entry.path()) else {
                continue;
            };
            if contents.trim().parse::<u32>().ok() != Some(id) {
                continue;
            }

            let event_dir = entry.path().parent()?;
            let event = event_dir.file_name()?.to_str()?;
            let system = event_dir.parent()?.file_name()?.to_str()?;
            trace!("found id {id} at {}", event_dir.display());
            return TracepointName::new(system, event).ok();
        }
        None
    }
}

impl Default for TracefsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TracepointCache for TracefsCache {
    fn find_by_name(
        &mut self,
        name: &TracepointName,
    ) -> Result<Arc<TracepointMetadata>, CacheError> {
        match self.by_name.get(name) {
            Some(metadata) => Ok(metadata.clone()),
            None => self.load(name),
        }
    }

    fn find_by_id(&mut self, id: u32) -> Result<Arc<TracepointMetadata>, CacheError> {
        if let Some(metadata) = self.by_id.get(&id) {
            return Ok(metadata.clone());
        }

        let name = self.scan_for_id(id).ok_or(CacheError::IdNotFound { id })?;
        self.load(&name)
    }
}
