//! Proc-file puller: reads a pseudo-file of `uid: v1 v2 ... vN` lines and
//! emits one [`EventRecord`] per (uid, column-index, value).

use std::fs;
use std::path::PathBuf;

use crate::error::PullError;
use crate::event::{EventRecord, FieldValue};
use crate::puller::Puller;

pub struct ProcFilePuller {
    path: PathBuf,
}

impl ProcFilePuller {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn parse_line(tag_id: u32, elapsed_ns: i64, line: &str) -> Vec<EventRecord> {
        let mut parts = line.split_whitespace();
        let Some(uid_field) = parts.next() else { return Vec::new() };
        let Some(uid_str) = uid_field.strip_suffix(':') else { return Vec::new() };
        let Ok(uid) = uid_str.parse::<u32>() else { return Vec::new() };

        parts
            .enumerate()
            .filter_map(|(column_index, value_str)| {
                let value: i64 = value_str.parse().ok()?;
                Some(EventRecord::new(
                    tag_id,
                    uid,
                    0,
                    elapsed_ns,
                    elapsed_ns,
                    vec![FieldValue::Int32(column_index as i32), FieldValue::Int64(value)],
                ))
            })
            .collect()
    }
}

impl Puller for ProcFilePuller {
    fn pull_internal(&self, tag_id: u32, deadline_ns: i64) -> Result<Vec<EventRecord>, PullError> {
        let contents = fs::read_to_string(&self.path)
            .map_err(|e| PullError::RemoteError(format!("failed to read {:?}: {e}", self.path)))?;

        let mut records = Vec::new();
        for line in contents.lines() {
            records.extend(Self::parse_line(tag_id, deadline_ns, line));
        }
        Ok(records)
    }
}
