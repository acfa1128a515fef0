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
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

lazy_static! {
    // tracefs system and event directory names
    static ref NAME_PART_REGEX: Regex = {
        Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]*$").expect("regex construction")
    };

    // field:unsigned short common_type;	offset:0;	size:2;	signed:0;
    static ref FIELD_REGEX: Regex = {
        Regex::new(
            r"^\s*field:(?P<decl>[^;]+);\s*offset:(?P<offset>\d+);\s*size:(?P<size>\d+);(\s*signed:(?P<signed>\d+);)?",
        )
        .expect("regex construction")
    };

    // last identifier of a declaration, ignoring an array suffix
    static ref FIELD_NAME_REGEX: Regex = {
        Regex::new(r"(?P<name>\w+)\s*(\[[^\]]*\])?\s*$").expect("regex construction")
    };

    static ref ID_REGEX: Regex = {
        Regex::new(r"(?m)^ID:\s*(?P<id>\d+)\s*$").expect("regex construction")
    };
}

const COMMON_TYPE: &str = "common_type";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid tracepoint name '{name}'")]
    InvalidName { name: String },
    #[error("tracepoint '{name}' not found")]
    NameNotFound { name: TracepointName },
    #[error("no tracepoint with id {id}")]
    IdNotFound { id: u32 },
    #[error("invalid format for '{name}': {reason}")]
    InvalidFormat { name: String, reason: String },
    #[error("failed to read {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
}

/// `system:event`, e.g. `sched:sched_switch`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TracepointName {
    system: String,
    event: String,
}

impl TracepointName {
    pub fn new(system: &str, event: &str) -> Result<Self, CacheError> {
        let valid = |part: &str| NAME_PART_REGEX.is_match(part).unwrap_or(false);
        if !valid(system) || !valid(event) {
            return Err(CacheError::InvalidName {
                name: format!("{system}:{event}"),
            });
        }
        Ok(Self { system: system.to_owned(), event: event.to_owned() })
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    pub fn event(&self) -> &str {
        &self.event
    }
}

impl FromStr for TracepointName {
    type Err = CacheError;

    /// Accepts `system:event` and `system/event`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (system, event) = s
            .split_once(':')
            .or_else(|| s.split_once('/'))
            .ok_or_else(|| CacheError::InvalidName { name: s.to_owned() })?;
        Self::new(system, event)
    }
}

impl fmt::Display for TracepointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.system, self.event)
    }
}

/// Position of the `common_type` field in every raw payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommonTypeField {
    pub offset: usize,
    /// 1, 2 or 4
    pub size: usize,
}

/// One `field:` line of a tracepoint format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldFormat {
    pub name: String,
    pub declaration: String,
    pub offset: u16,
    pub size: u16,
    pub signed: bool,
}

/// The parsed contents of a tracepoint's `format` file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TracepointMetadata {
    name: TracepointName,
    id: u32,
    common_type: CommonTypeField,
    fields: Vec<FieldFormat>,
    format: String,
}

impl TracepointMetadata {
    /// Parses the text of `events/<system>/<event>/format`.
    pub fn parse(name: TracepointName, format: &str) -> Result<Self, CacheError> {
        let invalid = |reason: &str| CacheError::InvalidFormat {
            name: name.to_string(),
            reason: reason.to_owned(),
        };

        let id = ID_REGEX
            .captures(format)
            .ok()
            .flatten()
            .and_then(|caps| caps.name("id"))
            .and_then(|id| id.as_str().parse::<u32>().ok())
            .ok_or_else(|| invalid("missing ID line"))?;

        let mut fields = Vec::new();
        for line in format.lines() {
            let Some(caps) = FIELD_REGEX.captures(line).ok().flatten() else {
                continue;
            };
            let declaration = caps
                .name("decl")
                .map(|m| m.as_str().trim().to_owned())
                .unwrap_or_default();
            let field_name = FIELD_NAME_REGEX
                .captures(&declaration)
                .ok()
                .flatten()
                .and_then(|caps| caps.name("name"))
                .map(|m| m.as_str().to_owned())
                .ok_or_else(|| invalid("field without a name"))?;
            let number = |group: &str| {
                caps.name(group).and_then(|m| m.as_str().parse::<u16>().ok())
            };

            fields.push(FieldFormat {
                name: field_name,
                offset: number("offset").ok_or_else(|| invalid("bad offset"))?,
                size: number("size").ok_or_else(|| invalid("bad size"))?,
                signed: number("signed").unwrap_or(0) != 0,
                declaration,
            });
        }

        let common_type = fields
            .iter()
            .find(|field| field.name == COMMON_TYPE)
            .map(|field| CommonTypeField {
                offset: field.offset as usize,
                size: field.size as usize,
            })
            .ok_or_else(|| invalid("missing common_type field"))?;
        if !matches!(common_type.size, 1 | 2 | 4) {
            return Err(invalid("common_type must be 1, 2 or 4 bytes"));
        }

        Ok(Self { name, id, common_type, fields, format: format.to_owned() })
    }

    pub fn name(&self) -> &TracepointName {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn common_type(&self) -> CommonTypeField {
        self.common_type
    }

    pub fn fields(&self) -> &[FieldFormat] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldFormat> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// The original format text.
    pub fn format(&self) -> &str {
        &self.format
    }
}

/// Resolves tracepoints to their metadata.
pub trait TracepointCache {
    fn find_by_name(
        &mut self,
        name: &TracepointName,
    ) -> Result<Arc<TracepointMetadata>, CacheError>;

    fn find_by_id(&mut self, id: u32) -> Result<Arc<TracepointMetadata>, CacheError>;
}

/// A cache filled by the caller.
#[derive(Debug, Default, Clone)]
pub struct MemoryCache {
    by_id: HashMap<u32, Arc<TracepointMetadata>>,
    by_name: HashMap<TracepointName, Arc<TracepointMetadata>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `metadata`, replacing any entry with the same id or name.
    pub fn insert(&mut self, metadata: TracepointMetadata) -> Arc<TracepointMetadata> {
        let metadata = Arc::new(metadata);
        let _ = self.by_id.insert(metadata.id(), metadata.clone());
        let _ = self.by_name.insert(metadata.name().clone(), metadata.clone());
        metadata
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl TracepointCache for MemoryCache {
    fn find_by_name(
        &mut self,
        name: &TracepointName,
    ) -> Result<Arc<TracepointMetadata>, CacheError> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::NameNotFound { name: name.clone() })
    }

    fn find_by_id(&mut self, id: u32) -> Result<Arc<TracepointMetadata>, CacheError> {
        self.by_id.get(&id).cloned().ok_or(CacheError::IdNotFound { id })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use simple_test_case::test_case;

    pub(crate) const SCHED_SWITCH_FORMAT: &str = "\
name: sched_switch
ID: 316
format:
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;
\tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;

\tfield:char prev_comm[16];\toffset:8;\tsize:16;\tsigned:0;
\tfield:pid_t prev_pid;\toffset:24;\tsize:4;\tsigned:1;
\tfield:__data_loc char[] next_comm;\toffset:28;\tsize:4;\tsigned:0;

print fmt: \"prev_comm=%s prev_pid=%d\", REC->prev_comm, REC->prev_pid
";

    /// Format text for a minimal tracepoint with the given id.
    pub(crate) fn format_with_id(event: &str, id: u32) -> String {
        format!(
            "name: {event}\nID: {id}\nformat:\n\
             \tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;\n\
             \tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;\n\n\
             print fmt: \"\"\n"
        )
    }

    #[test]
    fn can_parse_sched_switch_format() {
        let name = TracepointName::new("sched", "sched_switch").expect("name");
        let metadata =
            TracepointMetadata::parse(name, SCHED_SWITCH_FORMAT).expect("parse");

        assert_eq!(metadata.id(), 316);
        assert_eq!(metadata.common_type(), CommonTypeField { offset: 0, size: 2 });
        assert_eq!(metadata.fields().len(), 7);
        assert_eq!(
            metadata.field("prev_comm"),
            Some(&FieldFormat {
                name: "prev_comm".into(),
                declaration: "char prev_comm[16]".into(),
                offset: 8,
                size: 16,
                signed: false,
            })
        );
        assert_eq!(metadata.field("next_comm").map(|f| f.offset), Some(28));
        assert!(metadata.field("prev_pid").map(|f| f.signed).unwrap_or(false));
    }

    #[test]
    fn format_without_common_type_is_rejected() {
        let name = TracepointName::new("a", "b").expect("name");
        let format = "name: b\nID: 1\nformat:\n\tfield:int x;\toffset:0;\tsize:4;\tsigned:1;\n";
        assert!(matches!(
            TracepointMetadata::parse(name, format),
            Err(CacheError::InvalidFormat { .. })
        ));
    }

    #[test_case("sched:sched_switch", "sched", "sched_switch"; "colon")]
    #[test_case("syscalls/sys_enter_openat", "syscalls", "sys_enter_openat"; "slash")]
    #[test]
    fn can_parse_names(input: &str, system: &str, event: &str) {
        let name: TracepointName = input.parse().expect("valid name");
        assert_eq!(name.system(), system);
        assert_eq!(name.event(), event);
    }

    #[test_case("sched"; "no separator")]
    #[test_case(":event"; "empty system")]
    #[test_case("sched:../../etc"; "path traversal")]
    #[test]
    fn rejects_bad_names(input: &str) {
        assert!(input.parse::<TracepointName>().is_err());
    }

    #[test]
    fn name_displays_with_colon() {
        let name: TracepointName = "sched/sched_switch".parse().expect("name");
        assert_eq!(name.to_string(), "sched:sched_switch");
    }

    #[test]
    fn memory_cache_finds_by_name_and_id() {
        let mut cache = MemoryCache::new();
        let name = TracepointName::new("test", "one").expect("name");
        let metadata =
            TracepointMetadata::parse(name.clone(), &format_with_id("one", 7))
                .expect("parse");
        let _ = cache.insert(metadata);

        assert_eq!(cache.find_by_name(&name).expect("by name").id(), 7);
        assert_eq!(cache.find_by_id(7).expect("by id").name(), &name);
        assert!(matches!(
            cache.find_by_id(8),
            Err(CacheError::IdNotFound { id: 8 })
        ));
    }
}
