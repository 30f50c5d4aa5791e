//! SubscriberTable (C8): per-tag list of receiver handles with per-subscriber
//! interval and next-fire time.
//!
//! §9 calls for replacing the source's reference-counted-receiver-plus-weak-
//! back-reference scheme with a **handle + generation counter arena**: the
//! table owns an arena of weak receiver slots, the metric producer holds
//! `(index, generation)` rather than the `Arc` itself, and promotion checks
//! both the generation (catches explicit unregistration and slot reuse) and
//! `Weak::upgrade` (catches the caller simply dropping its last strong
//! reference, scenario 6) before delivering.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::event::EventRecord;

/// A receiver that consumes pulled batches (the external metric-engine seam).
pub trait PullDataReceiver: Send + Sync {
    fn on_data_pulled(&self, batch: &[EventRecord], pull_ok: bool, original_pull_elapsed_ns: i64);
}

/// A stable reference to an arena slot. Promotion checks `generation` against
/// the slot's current generation; a mismatch means the original receiver was
/// unregistered (or the slot was reused) and the handle is dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberHandle {
    index: usize,
    generation: u64,
}

struct Slot {
    generation: u64,
    receiver: Option<Weak<dyn PullDataReceiver>>,
}

struct Subscription {
    handle: SubscriberHandle,
    interval_ns: i64,
    next_fire_elapsed_ns: i64,
}

/// Owns the receiver arena and the per-tag subscription lists. Not
/// thread-safe on its own — §5 requires this to share a mutex with the
/// registry and scheduler during fire dispatch, so callers wrap it (see
/// [`crate::scheduler::AlarmScheduler`]).
pub struct SubscriberTable {
    arena: Vec<Slot>,
    free_list: Vec<usize>,
    by_tag: HashMap<u32, Vec<Subscription>>,
    max_subscribers_per_tag: usize,
}

impl SubscriberTable {
    pub fn new(max_subscribers_per_tag: usize) -> Self {
        Self { arena: Vec::new(), free_list: Vec::new(), by_tag: HashMap::new(), max_subscribers_per_tag }
    }

    fn allocate(&mut self, receiver: &Arc<dyn PullDataReceiver>) -> SubscriberHandle {
        let weak = Arc::downgrade(receiver);
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.arena[index];
            slot.receiver = Some(weak);
            SubscriberHandle { index, generation: slot.generation }
        } else {
            let index = self.arena.len();
            self.arena.push(Slot { generation: 0, receiver: Some(weak) });
            SubscriberHandle { index, generation: 0 }
        }
    }

    /// Idempotent with respect to the receiver's pointer identity: calling
    /// this again for a receiver already subscribed to `tag_id` updates its
    /// interval/next-fire in place and returns the existing handle rather
    /// than allocating a duplicate subscription. The table holds only a weak
    /// reference (§9's arena + generation scheme stands in for the source's
    /// weak back-reference) — `receiver` is borrowed, not consumed, so it is
    /// the caller's own `Arc` that keeps the receiver alive; dropping every
    /// other strong reference to it is exactly scenario 6's cleanup trigger.
    pub fn register_receiver(
        &mut self,
        tag_id: u32,
        receiver: &Arc<dyn PullDataReceiver>,
        next_pull_elapsed_ns: i64,
        interval_ns: i64,
    ) -> Option<SubscriberHandle> {
        assert!(interval_ns > 0, "interval_ns must be positive");

        let subs = self.by_tag.entry(tag_id).or_default();
        if let Some(existing) = subs.iter_mut().find(|s| {
            self.arena[s.handle.index]
                .receiver
                .as_ref()
                .and_then(Weak::upgrade)
                .is_some_and(|r| Arc::ptr_eq(&r, receiver))
        }) {
            existing.interval_ns = interval_ns;
            existing.next_fire_elapsed_ns = next_pull_elapsed_ns;
            return Some(existing.handle);
        }

        if subs.len() >= self.max_subscribers_per_tag {
            return None;
        }

        let handle = self.allocate(receiver);
        self.by_tag.entry(tag_id).or_default().push(Subscription {
            handle,
            interval_ns,
            next_fire_elapsed_ns: next_pull_elapsed_ns,
        });
        Some(handle)
    }

    pub fn unregister_receiver(&mut self, tag_id: u32, handle: SubscriberHandle) {
        if let Some(subs) = self.by_tag.get_mut(&tag_id) {
            subs.retain(|s| s.handle != handle);
        }
        self.invalidate(handle);
    }

    fn invalidate(&mut self, handle: SubscriberHandle) {
        if let Some(slot) = self.arena.get_mut(handle.index) {
            if slot.generation == handle.generation {
                slot.generation += 1;
                slot.receiver = None;
                self.free_list.push(handle.index);
            }
        }
    }

    /// Promotes a handle to its receiver, or `None` if the slot's generation
    /// has moved on (unregistered) or the receiver's last strong reference
    /// was dropped (scenario 6).
    fn promote(&self, handle: SubscriberHandle) -> Option<Arc<dyn PullDataReceiver>> {
        self.arena.get(handle.index).and_then(|slot| {
            (slot.generation == handle.generation)
                .then(|| slot.receiver.as_ref().and_then(Weak::upgrade))
                .flatten()
        })
    }

    /// Returns the minimum `next_fire_elapsed_ns` across all live
    /// subscriptions, or `None` if there are none — the scheduler's
    /// reconciliation input (§4.5 step 1).
    pub fn min_next_fire(&self) -> Option<i64> {
        self.by_tag.values().flatten().map(|s| s.next_fire_elapsed_ns).min()
    }

    /// Returns the set of tag ids due to fire at or before `now`.
    pub fn due_tags(&self, now: i64) -> Vec<u32> {
        self.by_tag
            .iter()
            .filter(|(_, subs)| subs.iter().any(|s| s.next_fire_elapsed_ns <= now))
            .map(|(tag, _)| *tag)
            .collect()
    }

    /// Dispatches a pulled batch to every due subscription for `tag_id`,
    /// promoting each handle, dropping dead ones in place, and advancing
    /// `next_fire_elapsed_ns` by `interval_ns` with no catch-up (§4.5 step 2).
    /// Returns the dispatch delay (`now - next_fire_elapsed_ns`, always ≥ 0)
    /// observed at each live subscription, for the caller to forward to
    /// [`crate::diagnostics::Diagnostics::note_pull_delay`].
    pub fn dispatch(&mut self, tag_id: u32, now: i64, batch: &[EventRecord], pull_ok: bool) -> Vec<i64> {
        let Some(subs) = self.by_tag.get_mut(&tag_id) else { return Vec::new() };
        let mut dead = Vec::new();
        let mut delays = Vec::new();
        for sub in subs.iter_mut() {
            if sub.next_fire_elapsed_ns > now {
                continue;
            }
            match self.arena.get(sub.handle.index).and_then(|slot| {
                (slot.generation == sub.handle.generation)
                    .then(|| slot.receiver.as_ref().and_then(Weak::upgrade))
                    .flatten()
            }) {
                Some(receiver) => {
                    delays.push(now - sub.next_fire_elapsed_ns);
                    receiver.on_data_pulled(batch, pull_ok, now);
                    sub.next_fire_elapsed_ns = now + sub.interval_ns;
                }
                None => dead.push(sub.handle),
            }
        }
        subs.retain(|s| !dead.contains(&s.handle));
        for handle in dead {
            self.invalidate(handle);
        }
        delays
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingReceiver {
        count: AtomicUsize,
    }

    impl PullDataReceiver for CountingReceiver {
        fn on_data_pulled(&self, _batch: &[EventRecord], _pull_ok: bool, _ts: i64) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn registering_same_receiver_twice_is_idempotent() {
        let mut table = SubscriberTable::new(128);
        let receiver: Arc<dyn PullDataReceiver> = Arc::new(CountingReceiver { count: AtomicUsize::new(0) });
        let h1 = table.register_receiver(1, &receiver, 1_000, 1_000).unwrap();
        let h2 = table.register_receiver(1, &receiver, 2_000, 1_000).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(table.by_tag.get(&1).unwrap().len(), 1);
    }

    #[test]
    fn dead_handle_is_dropped_on_dispatch() {
        let mut table = SubscriberTable::new(128);
        let receiver: Arc<dyn PullDataReceiver> = Arc::new(CountingReceiver { count: AtomicUsize::new(0) });
        let handle = table.register_receiver(1, &receiver, 0, 1_000).unwrap();
        table.unregister_receiver(1, handle);

        assert!(table.promote(handle).is_none());
        table.dispatch(1, 0, &[], true);
        assert!(table.by_tag.get(&1).unwrap().is_empty());
    }

    #[test]
    fn dropped_strong_reference_is_removed_on_next_dispatch() {
        // Scenario 6: caller drops its Arc without calling unregister_receiver;
        // the table's weak reference fails to upgrade and is swept lazily.
        let mut table = SubscriberTable::new(128);
        let handle = {
            let receiver: Arc<dyn PullDataReceiver> = Arc::new(CountingReceiver { count: AtomicUsize::new(0) });
            table.register_receiver(1, &receiver, 0, 1_000).unwrap()
        };

        assert!(table.promote(handle).is_none());
        table.dispatch(1, 0, &[], true);
        assert!(table.by_tag.get(&1).unwrap().is_empty());
    }

    #[test]
    fn coalesced_fire_advances_each_subscription_independently() {
        // Scenario 5: A (interval 1s, next 1s), B (interval 2s, next 2s); at
        // t=2s both fire once, then A.next=3s, B.next=4s.
        let mut table = SubscriberTable::new(128);
        let a: Arc<dyn PullDataReceiver> = Arc::new(CountingReceiver { count: AtomicUsize::new(0) });
        let b: Arc<dyn PullDataReceiver> = Arc::new(CountingReceiver { count: AtomicUsize::new(0) });
        table.register_receiver(7, &a, 1_000_000_000, 1_000_000_000).unwrap();
        table.register_receiver(7, &b, 2_000_000_000, 2_000_000_000).unwrap();

        table.dispatch(7, 2_000_000_000, &[], true);

        let subs = table.by_tag.get(&7).unwrap();
        let next_fires: Vec<i64> = subs.iter().map(|s| s.next_fire_elapsed_ns).collect();
        assert!(next_fires.contains(&3_000_000_000));
        assert!(next_fires.contains(&4_000_000_000));
    }

    #[test]
    fn max_subscribers_per_tag_is_enforced() {
        let mut table = SubscriberTable::new(1);
        let a: Arc<dyn PullDataReceiver> = Arc::new(CountingReceiver { count: AtomicUsize::new(0) });
        let b: Arc<dyn PullDataReceiver> = Arc::new(CountingReceiver { count: AtomicUsize::new(0) });
        assert!(table.register_receiver(1, &a, 0, 1_000).is_some());
        assert!(table.register_receiver(1, &b, 0, 1_000).is_none());
    }
}
