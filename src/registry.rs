//! PullerRegistry (C5) and PullCache (C6): tag id -> puller + policy, and the
//! per-tag cooldown cache sitting in front of it.
//!
//! Grounded on `StatsPullerManager`/`StatsPullerManagerImpl`: one mutex
//! guards both the puller table and the cache, `pull_internal` runs while
//! that mutex is held (deliberately, per the design notes — it caps
//! concurrent pulls to one), and registration always invalidates the
//! existing cache entry for that tag.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::diagnostics::Diagnostics;
use crate::error::PullError;
use crate::event::{EventRecord, FieldValue};
use crate::puller::Puller;
use crate::uidmap::IsolatedUidProvider;

/// Per-tag registration: cooldown, timeout, additive-field policy, and the
/// puller itself (§3 "PullAtomInfo").
pub struct PullAtomInfo {
    pub cooldown_ns: i64,
    pub pull_timeout_ns: i64,
    pub additive_field_indices: BTreeSet<u16>,
    pub puller: Arc<dyn Puller>,
}

impl PullAtomInfo {
    pub fn new(cooldown_ns: i64, pull_timeout_ns: i64, puller: Arc<dyn Puller>) -> Self {
        assert!(cooldown_ns >= 0, "cooldown_ns must be non-negative");
        Self { cooldown_ns, pull_timeout_ns, additive_field_indices: BTreeSet::new(), puller }
    }

    pub fn with_additive_fields(mut self, indices: impl IntoIterator<Item = u16>) -> Self {
        self.additive_field_indices = indices.into_iter().collect();
        self
    }
}

/// Per-tag cache entry (§3 "PullCache entry", §4.4 state machine). At any
/// quiescent point this is either `Cold` (`last_pull_elapsed_ns == 0` or the
/// cache has been invalidated) or `Warm` (a batch is cached); `Pulling` is
/// never observable outside the registry lock, so it is not modeled as a
/// distinct variant here — it is simply "the mutex is held".
struct CacheEntry {
    last_pull_elapsed_ns: i64,
    cached_batch: Vec<EventRecord>,
}

impl CacheEntry {
    fn cold() -> Self {
        Self { last_pull_elapsed_ns: 0, cached_batch: Vec::new() }
    }
}

struct Table {
    infos: HashMap<u32, PullAtomInfo>,
    cache: HashMap<u32, CacheEntry>,
}

/// The registry: a single mutex serializing registration, cache reads, and
/// `pull_internal` invocation, exactly as the source does.
pub struct PullerRegistry {
    table: Mutex<Table>,
    diagnostics: Arc<Diagnostics>,
    uid_provider: Arc<dyn IsolatedUidProvider>,
}

impl PullerRegistry {
    pub fn new(diagnostics: Arc<Diagnostics>, uid_provider: Arc<dyn IsolatedUidProvider>) -> Self {
        Self {
            table: Mutex::new(Table { infos: HashMap::new(), cache: HashMap::new() }),
            diagnostics,
            uid_provider,
        }
    }

    /// Idempotent: a second registration for the same tag replaces the prior
    /// info and invalidates the cached batch.
    pub fn register(&self, tag_id: u32, info: PullAtomInfo) {
        let mut table = self.table.lock();
        table.infos.insert(tag_id, info);
        table.cache.insert(tag_id, CacheEntry::cold());
    }

    pub fn unregister(&self, tag_id: u32) {
        let mut table = self.table.lock();
        table.infos.remove(&tag_id);
        table.cache.remove(&tag_id);
    }

    /// The single user-facing pull entry point (§4.3).
    pub fn pull(&self, tag_id: u32, elapsed_ns: i64) -> Result<Vec<EventRecord>, PullError> {
        let mut table = self.table.lock();

        let Some(info) = table.infos.get(&tag_id) else {
            return Err(PullError::Unavailable);
        };
        let cooldown_ns = info.cooldown_ns;
        let pull_timeout_ns = info.pull_timeout_ns;
        let additive_field_indices = info.additive_field_indices.clone();
        let puller = info.puller.clone();

        self.diagnostics.note_pull(tag_id);

        let cache = table.cache.entry(tag_id).or_insert_with(CacheEntry::cold);

        if cache.last_pull_elapsed_ns != 0 {
            let interval = elapsed_ns - cache.last_pull_elapsed_ns;
            self.diagnostics.note_min_observed_interval(tag_id, interval);
        }

        if cache.last_pull_elapsed_ns != 0 && elapsed_ns - cache.last_pull_elapsed_ns < cooldown_ns {
            self.diagnostics.note_pull_from_cache(tag_id);
            let batch: Vec<EventRecord> = cache
                .cached_batch
                .iter()
                .map(|r| r.with_rewritten(elapsed_ns, elapsed_ns, None))
                .collect();
            if batch.is_empty() {
                self.diagnostics.note_empty_pull(tag_id);
            }
            return Ok(batch);
        }

        cache.last_pull_elapsed_ns = elapsed_ns;
        cache.cached_batch.clear();

        let deadline_ns = elapsed_ns + pull_timeout_ns;
        let start = std::time::Instant::now();
        let result = puller.pull_internal(tag_id, deadline_ns);
        let pull_time_ns = start.elapsed().as_nanos() as u64;
        self.diagnostics.note_pull_time(tag_id, pull_time_ns);

        match result {
            Ok(raw_batch) => {
                let rewritten: Vec<EventRecord> = raw_batch
                    .iter()
                    .map(|r| r.with_rewritten(elapsed_ns, elapsed_ns, None))
                    .collect();
                let merged = merge_isolated_uids(rewritten, &additive_field_indices, self.uid_provider.as_ref());
                if merged.is_empty() {
                    self.diagnostics.note_empty_pull(tag_id);
                }
                let cache = table.cache.get_mut(&tag_id).expect("cache entry present after insert");
                cache.cached_batch = merged.clone();
                Ok(merged)
            }
            Err(err) => {
                match err {
                    PullError::Timeout => self.diagnostics.note_pull_timeout(tag_id),
                    _ => self.diagnostics.note_pull_fail(tag_id),
                }
                let cache = table.cache.get_mut(&tag_id).expect("cache entry present after insert");
                cache.cached_batch.clear();
                Err(err)
            }
        }
    }

    /// Empties every entry's cached batch and resets `last_pull_elapsed_ns`,
    /// guaranteeing the next `pull` for any tag invokes `pull_internal`.
    pub fn force_clear_cache(&self) {
        let mut table = self.table.lock();
        for entry in table.cache.values_mut() {
            *entry = CacheEntry::cold();
        }
    }

    /// Reclaims memory for entries that have gone stale relative to their own
    /// cooldown. Exposed per §9's open question but intentionally never
    /// invoked from the alarm path (see [`crate::scheduler`]); invocation
    /// cadence is a collaborator decision.
    pub fn clear_cache_if_stale(&self, now: i64) {
        let mut table = self.table.lock();
        let stale_tags: Vec<u32> = table
            .infos
            .iter()
            .filter_map(|(tag_id, info)| {
                table.cache.get(tag_id).and_then(|entry| {
                    (entry.last_pull_elapsed_ns != 0 && now - entry.last_pull_elapsed_ns > info.cooldown_ns)
                        .then_some(*tag_id)
                })
            })
            .collect();
        for tag_id in stale_tags {
            table.cache.insert(tag_id, CacheEntry::cold());
        }
    }
}

/// Numeric value of one field, for the additive-merge sum; non-numeric
/// fields are never listed in `additive_field_indices` by a well-formed
/// registration, but this returns `None` defensively rather than panicking.
fn numeric_value(field: &FieldValue) -> Option<f64> {
    match field {
        FieldValue::Int32(v) => Some(*v as f64),
        FieldValue::Int64(v) => Some(*v as f64),
        FieldValue::Float(v) => Some(*v as f64),
        _ => None,
    }
}

fn set_numeric_value(field: &mut FieldValue, value: f64) {
    match field {
        FieldValue::Int32(v) => *v = value as i32,
        FieldValue::Int64(v) => *v = value as i64,
        FieldValue::Float(v) => *v = value as f32,
        _ => {}
    }
}

/// Isolated-uid merge policy (§4.3). Records whose uid resolves to a host uid
/// are rewritten to that host uid; records that then collapse to the same
/// (host_uid, non-additive fields) key have their additive fields summed,
/// keeping the first occurrence's non-additive fields. With no additive
/// indices the key is simply every field, so two records that become
/// identical after the uid rewrite collapse to the first occurrence.
fn merge_isolated_uids(
    batch: Vec<EventRecord>,
    additive_field_indices: &BTreeSet<u16>,
    uid_provider: &dyn IsolatedUidProvider,
) -> Vec<EventRecord> {
    let mut merged: Vec<EventRecord> = Vec::with_capacity(batch.len());
    let mut key_index: HashMap<(u32, Vec<String>), usize> = HashMap::new();

    for record in batch {
        let host_uid = uid_provider.resolve_host_uid(record.uid()).unwrap_or_else(|| record.uid());
        let rewritten = record.with_rewritten(record.elapsed_ns(), record.wall_ns(), Some(host_uid));

        let key_fields: Vec<String> = rewritten
            .fields()
            .iter()
            .enumerate()
            .filter(|(idx, _)| !additive_field_indices.contains(&(*idx as u16)))
            .map(|(_, f)| format!("{f:?}"))
            .collect();
        let key = (host_uid, key_fields);

        if let Some(&existing_idx) = key_index.get(&key) {
            let mut summed_fields = merged[existing_idx].fields().to_vec();
            for &idx in additive_field_indices.iter() {
                let idx = idx as usize;
                if let (Some(a), Some(b)) = (
                    summed_fields.get(idx).and_then(numeric_value),
                    rewritten.fields().get(idx).and_then(numeric_value),
                ) {
                    if let Some(slot) = summed_fields.get_mut(idx) {
                        set_numeric_value(slot, a + b);
                    }
                }
            }
            let existing = &merged[existing_idx];
            merged[existing_idx] =
                EventRecord::new(existing.tag_id(), existing.uid(), existing.pid(), existing.elapsed_ns(), existing.wall_ns(), summed_fields);
        } else {
            key_index.insert(key, merged.len());
            merged.push(rewritten);
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::puller::ClosurePuller;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn rec(tag: u32, elapsed_ns: i64, value: i32) -> EventRecord {
        EventRecord::new(tag, 0, 0, elapsed_ns, elapsed_ns, vec![FieldValue::Int32(value)])
    }

    fn diag() -> Arc<Diagnostics> {
        Arc::new(Diagnostics::new(1 << 16, 20, 20))
    }

    #[test]
    fn cooldown_hit_invokes_puller_once() {
        // Scenario 2: cooldown_ns = 1000, single pull then a second pull
        // within the cooldown window returns the same (rewritten) batch.
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let puller = Arc::new(ClosurePuller::new(move |_tag, _deadline| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok(vec![rec(7, 0, 42)])
        }));
        let registry = PullerRegistry::new(diag(), Arc::new(crate::uidmap::NoIsolatedUids));
        registry.register(7, PullAtomInfo::new(1_000, 10_000_000_000, puller));

        let first = registry.pull(7, 500).unwrap();
        assert_eq!(first.len(), 1);
        let second = registry.pull(7, 999).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].elapsed_ns(), 999);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn force_clear_cache_forces_next_pull_to_invoke_puller() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let puller = Arc::new(ClosurePuller::new(move |_tag, _deadline| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok(vec![rec(1, 0, 1)])
        }));
        let registry = PullerRegistry::new(diag(), Arc::new(crate::uidmap::NoIsolatedUids));
        registry.register(1, PullAtomInfo::new(1_000_000, 10_000_000_000, puller));

        registry.pull(1, 0).unwrap();
        registry.pull(1, 1).unwrap(); // within cooldown, cache hit
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        registry.force_clear_cache();
        registry.pull(1, 2).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unavailable_for_unregistered_tag() {
        let registry = PullerRegistry::new(diag(), Arc::new(crate::uidmap::NoIsolatedUids));
        assert_eq!(registry.pull(99, 0), Err(PullError::Unavailable));
    }

    #[test]
    fn zero_cooldown_always_invokes_puller() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let puller = Arc::new(ClosurePuller::new(move |_tag, _deadline| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok(vec![rec(2, 0, 1)])
        }));
        let registry = PullerRegistry::new(diag(), Arc::new(crate::uidmap::NoIsolatedUids));
        registry.register(2, PullAtomInfo::new(0, 10_000_000_000, puller));

        registry.pull(2, 100).unwrap();
        registry.pull(2, 100).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn min_observed_interval_surfaces_in_diagnostics() {
        let puller = Arc::new(ClosurePuller::new(|_t, _d| Ok(vec![rec(8, 0, 1)])));
        let diagnostics = diag();
        let registry = PullerRegistry::new(diagnostics.clone(), Arc::new(crate::uidmap::NoIsolatedUids));
        registry.register(8, PullAtomInfo::new(0, 10_000_000_000, puller));

        registry.pull(8, 1_000).unwrap();
        registry.pull(8, 1_300).unwrap();
        registry.pull(8, 2_000).unwrap();

        let snap = diagnostics.snapshot();
        let tag8 = snap.tags.iter().find(|t| t.tag_id == 8).unwrap();
        assert_eq!(tag8.min_observed_interval_ns, 300);
    }

    #[test]
    fn re_registration_invalidates_cache() {
        let puller_a = Arc::new(ClosurePuller::new(|_t, _d| Ok(vec![rec(4, 0, 1)])));
        let registry = PullerRegistry::new(diag(), Arc::new(crate::uidmap::NoIsolatedUids));
        registry.register(4, PullAtomInfo::new(1_000_000, 10_000_000_000, puller_a));
        registry.pull(4, 0).unwrap();

        let puller_b = Arc::new(ClosurePuller::new(|_t, _d| Ok(vec![rec(4, 0, 99)])));
        registry.register(4, PullAtomInfo::new(1_000_000, 10_000_000_000, puller_b));
        let result = registry.pull(4, 1).unwrap();
        assert_eq!(result[0].fields()[0], FieldValue::Int32(99));
    }

    struct BothIsolatedToHost;
    impl crate::uidmap::IsolatedUidProvider for BothIsolatedToHost {
        fn resolve_host_uid(&self, uid: u32) -> Option<u32> {
            matches!(uid, 1000 | 1001).then_some(10)
        }
    }

    #[test]
    fn isolated_uid_merge_dedupes_identical_records_with_no_additive_fields() {
        // Two isolated uids (1000, 1001) both resolve to host uid 10 and
        // carry identical non-uid fields: with no additive indices the key
        // is every field, so they must collapse to the first occurrence.
        let rec_a = EventRecord::new(9, 1000, 0, 0, 0, vec![FieldValue::Int32(7)]);
        let rec_b = EventRecord::new(9, 1001, 0, 0, 0, vec![FieldValue::Int32(7)]);
        let merged = merge_isolated_uids(vec![rec_a, rec_b], &BTreeSet::new(), &BothIsolatedToHost);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].uid(), 10);
    }

    #[test]
    fn isolated_uid_merge_sums_additive_fields_on_collapse() {
        let rec_a = EventRecord::new(9, 1000, 0, 0, 0, vec![FieldValue::Int32(5)]);
        let rec_b = EventRecord::new(9, 1001, 0, 0, 0, vec![FieldValue::Int32(7)]);
        let additive: BTreeSet<u16> = [0].into_iter().collect();
        let merged = merge_isolated_uids(vec![rec_a, rec_b], &additive, &BothIsolatedToHost);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].fields()[0], FieldValue::Int32(12));
    }
}
