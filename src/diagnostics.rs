//! Diagnostics (C9): thread-safe counters, timings, and bounded histories.
//!
//! Per-tag counters live in a [`dashmap::DashMap`] of atomics, the same
//! concurrent-map-of-atomics idiom the teacher uses for its lock-free
//! diagnostic mode; the two bounded histories (log-loss, queue-overflow) are
//! small and mutated together, so they sit behind one `parking_lot::Mutex`
//! rather than forcing atomics onto a `VecDeque`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;

/// One loss-report observation (§4.2, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogLossRecord {
    pub wall_sec: i64,
    pub dropped_count: u32,
    pub error_code: u32,
    pub last_atom_tag: u32,
    pub uid: u32,
    pub pid: u32,
}

struct TagCounters {
    total_pulls: AtomicU64,
    cache_hits: AtomicU64,
    pull_fail: AtomicU64,
    pull_timeout: AtomicU64,
    empty_pulls: AtomicU64,
    pull_time_count: AtomicU64,
    pull_time_sum_ns: AtomicU64,
    pull_time_max_ns: AtomicU64,
    pull_delay_count: AtomicU64,
    pull_delay_sum_ns: AtomicU64,
    pull_delay_max_ns: AtomicU64,
    /// `u64::MAX` means "no interval observed yet" — a real 0-ns interval
    /// (two pulls at the same `elapsed_ns`, reachable via `cooldown_ns = 0`)
    /// must stay distinguishable from "unset" so it isn't later overwritten
    /// by a larger genuine interval.
    min_observed_interval_ns: AtomicU64,
    pushed_atoms: AtomicU64,
}

impl Default for TagCounters {
    fn default() -> Self {
        Self {
            total_pulls: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            pull_fail: AtomicU64::new(0),
            pull_timeout: AtomicU64::new(0),
            empty_pulls: AtomicU64::new(0),
            pull_time_count: AtomicU64::new(0),
            pull_time_sum_ns: AtomicU64::new(0),
            pull_time_max_ns: AtomicU64::new(0),
            pull_delay_count: AtomicU64::new(0),
            pull_delay_sum_ns: AtomicU64::new(0),
            pull_delay_max_ns: AtomicU64::new(0),
            min_observed_interval_ns: AtomicU64::new(u64::MAX),
            pushed_atoms: AtomicU64::new(0),
        }
    }
}

/// Point-in-time readout of one tag's counters, used by [`Diagnostics::snapshot`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TagSnapshot {
    pub tag_id: u32,
    pub total_pulls: u64,
    pub cache_hits: u64,
    pub pull_fail: u64,
    pub pull_timeout: u64,
    pub empty_pulls: u64,
    pub avg_pull_time_ns: u64,
    pub max_pull_time_ns: u64,
    pub avg_pull_delay_ns: u64,
    pub max_pull_delay_ns: u64,
    pub min_observed_interval_ns: u64,
    pub pushed_atoms: u64,
}

fn bump_max(cell: &AtomicU64, value: u64) {
    let mut current = cell.load(Ordering::Relaxed);
    while value > current {
        match cell.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}

fn bump_min(cell: &AtomicU64, value: u64) {
    let mut current = cell.load(Ordering::Relaxed);
    while value < current {
        match cell.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(observed) => current = observed,
        }
    }
}

struct Histories {
    log_loss: VecDeque<LogLossRecord>,
    overflow: VecDeque<i64>,
}

/// Thread-safe accounting surface. Independent of every other core mutex —
/// a leaf component, as required by §5.
pub struct Diagnostics {
    per_tag: DashMap<u32, TagCounters>,
    histories: Mutex<Histories>,
    max_pushed_atom_id: u32,
    log_loss_cap: usize,
    overflow_cap: usize,
}

impl Diagnostics {
    pub fn new(max_pushed_atom_id: u32, log_loss_cap: usize, overflow_cap: usize) -> Self {
        Self {
            per_tag: DashMap::new(),
            histories: Mutex::new(Histories {
                log_loss: VecDeque::with_capacity(log_loss_cap),
                overflow: VecDeque::with_capacity(overflow_cap),
            }),
            max_pushed_atom_id,
            log_loss_cap,
            overflow_cap,
        }
    }

    fn entry(&self, tag_id: u32) -> dashmap::mapref::one::RefMut<'_, u32, TagCounters> {
        self.per_tag.entry(tag_id).or_default()
    }

    pub fn note_pushed_atom(&self, tag_id: u32) {
        if tag_id >= self.max_pushed_atom_id {
            return;
        }
        self.entry(tag_id).pushed_atoms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_pull(&self, tag_id: u32) {
        self.entry(tag_id).total_pulls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_pull_from_cache(&self, tag_id: u32) {
        self.entry(tag_id).cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_pull_fail(&self, tag_id: u32) {
        self.entry(tag_id).pull_fail.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_pull_timeout(&self, tag_id: u32) {
        self.entry(tag_id).pull_timeout.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_empty_pull(&self, tag_id: u32) {
        self.entry(tag_id).empty_pulls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_min_observed_interval(&self, tag_id: u32, interval_ns: i64) {
        if interval_ns < 0 {
            return;
        }
        let counters = self.entry(tag_id);
        bump_min(&counters.min_observed_interval_ns, interval_ns as u64);
    }

    pub fn note_pull_time(&self, tag_id: u32, ns: u64) {
        let counters = self.entry(tag_id);
        counters.pull_time_count.fetch_add(1, Ordering::Relaxed);
        counters.pull_time_sum_ns.fetch_add(ns, Ordering::Relaxed);
        bump_max(&counters.pull_time_max_ns, ns);
    }

    pub fn note_pull_delay(&self, tag_id: u32, ns: u64) {
        let counters = self.entry(tag_id);
        counters.pull_delay_count.fetch_add(1, Ordering::Relaxed);
        counters.pull_delay_sum_ns.fetch_add(ns, Ordering::Relaxed);
        bump_max(&counters.pull_delay_max_ns, ns);
    }

    /// Appends a log-loss observation; drops the oldest entry once the
    /// bounded history is at capacity (§4.6, capped at 20 by default).
    pub fn note_log_lost(
        &self,
        wall_sec: i64,
        dropped_count: u32,
        error_code: u32,
        last_atom_tag: u32,
        uid: u32,
        pid: u32,
    ) {
        let mut h = self.histories.lock();
        if h.log_loss.len() >= self.log_loss_cap {
            h.log_loss.pop_front();
        }
        h.log_loss.push_back(LogLossRecord {
            wall_sec,
            dropped_count,
            error_code,
            last_atom_tag,
            uid,
            pid,
        });
    }

    pub fn note_event_queue_overflow(&self, oldest_elapsed_ns: i64) {
        let mut h = self.histories.lock();
        if h.overflow.len() >= self.overflow_cap {
            h.overflow.pop_front();
        }
        h.overflow.push_back(oldest_elapsed_ns);
    }

    /// Clears historical counters and histories but preserves the set of
    /// known tag ids (their entries reset to zero rather than being removed).
    pub fn reset(&self) {
        for mut entry in self.per_tag.iter_mut() {
            *entry.value_mut() = TagCounters::default();
        }
        let mut h = self.histories.lock();
        h.log_loss.clear();
        h.overflow.clear();
    }

    /// A stable-for-the-process-lifetime snapshot of every tracked tag plus
    /// the two bounded histories. Serialization format is left to the
    /// caller; this returns plain structured data (`serde`-derivable) rather
    /// than prescribing a wire format (§6: "No bit-exact schema is mandated").
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let tags = self
            .per_tag
            .iter()
            .map(|entry| {
                let tag_id = *entry.key();
                let c = entry.value();
                let pull_time_count = c.pull_time_count.load(Ordering::Relaxed);
                let pull_delay_count = c.pull_delay_count.load(Ordering::Relaxed);
                TagSnapshot {
                    tag_id,
                    total_pulls: c.total_pulls.load(Ordering::Relaxed),
                    cache_hits: c.cache_hits.load(Ordering::Relaxed),
                    pull_fail: c.pull_fail.load(Ordering::Relaxed),
                    pull_timeout: c.pull_timeout.load(Ordering::Relaxed),
                    empty_pulls: c.empty_pulls.load(Ordering::Relaxed),
                    avg_pull_time_ns: checked_avg(c.pull_time_sum_ns.load(Ordering::Relaxed), pull_time_count),
                    max_pull_time_ns: c.pull_time_max_ns.load(Ordering::Relaxed),
                    avg_pull_delay_ns: checked_avg(c.pull_delay_sum_ns.load(Ordering::Relaxed), pull_delay_count),
                    max_pull_delay_ns: c.pull_delay_max_ns.load(Ordering::Relaxed),
                    min_observed_interval_ns: match c.min_observed_interval_ns.load(Ordering::Relaxed) {
                        u64::MAX => 0,
                        ns => ns,
                    },
                    pushed_atoms: c.pushed_atoms.load(Ordering::Relaxed),
                }
            })
            .collect();
        let h = self.histories.lock();
        DiagnosticsSnapshot {
            tags,
            log_loss: h.log_loss.iter().copied().collect(),
            overflow: h.overflow.iter().copied().collect(),
        }
    }
}

fn checked_avg(sum: u64, count: u64) -> u64 {
    if count == 0 { 0 } else { sum / count }
}

/// Serializable diagnostic readout, returned by [`Diagnostics::snapshot`].
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DiagnosticsSnapshot {
    pub tags: Vec<TagSnapshot>,
    pub log_loss: Vec<LogLossRecordSer>,
    pub overflow: Vec<i64>,
}

// serde cannot derive Serialize on LogLossRecord directly without pulling the
// attribute onto the public type used across the non-serde call sites above,
// so the snapshot carries its own serializable mirror.
pub type LogLossRecordSer = LogLossRecord;

impl serde::Serialize for TagSnapshot {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("TagSnapshot", 12)?;
        s.serialize_field("tag_id", &self.tag_id)?;
        s.serialize_field("total_pulls", &self.total_pulls)?;
        s.serialize_field("cache_hits", &self.cache_hits)?;
        s.serialize_field("pull_fail", &self.pull_fail)?;
        s.serialize_field("pull_timeout", &self.pull_timeout)?;
        s.serialize_field("empty_pulls", &self.empty_pulls)?;
        s.serialize_field("avg_pull_time_ns", &self.avg_pull_time_ns)?;
        s.serialize_field("max_pull_time_ns", &self.max_pull_time_ns)?;
        s.serialize_field("avg_pull_delay_ns", &self.avg_pull_delay_ns)?;
        s.serialize_field("max_pull_delay_ns", &self.max_pull_delay_ns)?;
        s.serialize_field("min_observed_interval_ns", &self.min_observed_interval_ns)?;
        s.serialize_field("pushed_atoms", &self.pushed_atoms)?;
        s.end()
    }
}

impl serde::Serialize for LogLossRecord {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("LogLossRecord", 6)?;
        s.serialize_field("wall_sec", &self.wall_sec)?;
        s.serialize_field("dropped_count", &self.dropped_count)?;
        s.serialize_field("error_code", &self.error_code)?;
        s.serialize_field("last_atom_tag", &self.last_atom_tag)?;
        s.serialize_field("uid", &self.uid)?;
        s.serialize_field("pid", &self.pid)?;
        s.end()
    }
}
