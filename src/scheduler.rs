//! AlarmScheduler (C7): reconciles a single aligned wall-clock alarm against
//! the subscriber table, and runs the fire handler that pulls and dispatches.
//!
//! §5 asks for the registry, cache and subscriber table to share one mutex
//! to eliminate lock-order concerns during fire dispatch. [`PullerRegistry`]
//! already serializes its own table internally (so that `register`/`pull`
//! remain independently usable without going through the scheduler), so this
//! type instead takes two locks in a fixed order — subscriber table, then
//! (inside `Registry::pull`) the registry's own lock — and never the
//! reverse, which is deadlock-free without requiring a single shared mutex.

use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::diagnostics::Diagnostics;
use crate::registry::PullerRegistry;
use crate::subscriber::SubscriberTable;

/// A collaborator that exposes a single wall-clock alarm and fires a callback
/// on the scheduler thread when it elapses.
pub trait AlarmSource: Send + Sync {
    /// Arms the alarm to fire at `elapsed_ns`, replacing any previous setting.
    fn set_alarm(&self, elapsed_ns: i64);
    /// Cancels the alarm; no further fire until `set_alarm` is called again.
    fn cancel(&self);
}

/// The fire-handler + reconciliation logic, parameterized over an
/// [`AlarmSource`] collaborator. Owns the only mutex guarding the
/// [`SubscriberTable`].
pub struct AlarmScheduler {
    subscribers: Mutex<SubscriberTable>,
    registry: Arc<PullerRegistry>,
    diagnostics: Arc<Diagnostics>,
    alarm: Arc<dyn AlarmSource>,
    alignment_ns: i64,
}

impl AlarmScheduler {
    pub fn new(
        registry: Arc<PullerRegistry>,
        diagnostics: Arc<Diagnostics>,
        alarm: Arc<dyn AlarmSource>,
        alignment_ns: i64,
        max_subscribers_per_tag: usize,
    ) -> Self {
        assert!(alignment_ns > 0, "alignment_ns must be positive");
        Self {
            subscribers: Mutex::new(SubscriberTable::new(max_subscribers_per_tag)),
            registry,
            diagnostics,
            alarm,
            alignment_ns,
        }
    }

    /// §4.5 "Scheduler contract": aligns the next fire time up to a multiple
    /// of `alignment_ns` and (re)arms or cancels the alarm collaborator.
    fn reconcile_locked(&self, table: &SubscriberTable) {
        match table.min_next_fire() {
            None => self.alarm.cancel(),
            Some(t_next) => {
                let aligned = align_up(t_next, self.alignment_ns);
                self.alarm.set_alarm(aligned);
            }
        }
    }

    pub fn register_receiver(
        &self,
        tag_id: u32,
        receiver: &Arc<dyn crate::subscriber::PullDataReceiver>,
        next_pull_elapsed_ns: i64,
        interval_ns: i64,
    ) -> Option<crate::subscriber::SubscriberHandle> {
        let mut table = self.subscribers.lock();
        let handle = table.register_receiver(tag_id, receiver, next_pull_elapsed_ns, interval_ns);
        if handle.is_none() {
            warn!("tag {tag_id} at max_subscribers_per_tag, dropping registration");
        }
        self.reconcile_locked(&table);
        handle
    }

    pub fn unregister_receiver(&self, tag_id: u32, handle: crate::subscriber::SubscriberHandle) {
        let mut table = self.subscribers.lock();
        table.unregister_receiver(tag_id, handle);
        self.reconcile_locked(&table);
    }

    /// The fire handler (§4.5 "Fire handler"). Invoked by the scheduler
    /// thread when the alarm collaborator calls back.
    pub fn on_alarm_fired(&self, now: i64) {
        let mut table = self.subscribers.lock();
        let due = table.due_tags(now);
        for tag_id in due {
            let pull_result = self.registry.pull(tag_id, now);
            let (batch, pull_ok) = match pull_result {
                Ok(batch) => (batch, true),
                Err(_) => (Vec::new(), false),
            };
            let delays = table.dispatch(tag_id, now, &batch, pull_ok);
            for delay_ns in delays {
                self.diagnostics.note_pull_delay(tag_id, delay_ns.max(0) as u64);
            }
        }
        self.reconcile_locked(&table);
    }
}

fn align_up(t: i64, granularity: i64) -> i64 {
    if t <= 0 {
        return granularity;
    }
    let remainder = t % granularity;
    if remainder == 0 { t } else { t + (granularity - remainder) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostics;
    use crate::event::{EventRecord, FieldValue};
    use crate::puller::ClosurePuller;
    use crate::subscriber::PullDataReceiver;
    use crate::uidmap::NoIsolatedUids;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    struct RecordingAlarm {
        last_set: AtomicI64,
        cancelled: std::sync::atomic::AtomicBool,
    }

    impl RecordingAlarm {
        fn new() -> Self {
            Self { last_set: AtomicI64::new(-1), cancelled: std::sync::atomic::AtomicBool::new(false) }
        }
    }

    impl AlarmSource for RecordingAlarm {
        fn set_alarm(&self, elapsed_ns: i64) {
            self.last_set.store(elapsed_ns, Ordering::SeqCst);
            self.cancelled.store(false, Ordering::SeqCst);
        }
        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    struct CountingReceiver {
        count: AtomicUsize,
    }

    impl PullDataReceiver for CountingReceiver {
        fn on_data_pulled(&self, _batch: &[EventRecord], _pull_ok: bool, _ts: i64) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn align_up_rounds_to_next_granularity() {
        assert_eq!(align_up(1_000_000_001, 1_000_000_000), 2_000_000_000);
        assert_eq!(align_up(1_000_000_000, 1_000_000_000), 1_000_000_000);
        assert_eq!(align_up(0, 1_000_000_000), 1_000_000_000);
    }

    #[test]
    fn register_reconciles_alarm_to_next_fire() {
        let diag = Arc::new(Diagnostics::new(1 << 16, 20, 20));
        let registry = Arc::new(PullerRegistry::new(diag.clone(), Arc::new(NoIsolatedUids)));
        let alarm = Arc::new(RecordingAlarm::new());
        let scheduler = AlarmScheduler::new(registry, diag, alarm.clone(), 1_000_000_000, 128);

        let receiver: Arc<dyn PullDataReceiver> = Arc::new(CountingReceiver { count: AtomicUsize::new(0) });
        scheduler.register_receiver(7, &receiver, 500_000_000, 1_000_000_000);

        assert_eq!(alarm.last_set.load(Ordering::SeqCst), 1_000_000_000);
    }

    #[test]
    fn alarm_fire_pulls_once_and_dispatches_to_all_due_subscribers() {
        let diag = Arc::new(Diagnostics::new(1 << 16, 20, 20));
        let registry = Arc::new(PullerRegistry::new(diag.clone(), Arc::new(NoIsolatedUids)));
        let puller_calls = Arc::new(AtomicUsize::new(0));
        let puller_calls2 = puller_calls.clone();
        registry.register(
            7,
            crate::registry::PullAtomInfo::new(
                1_000,
                10_000_000_000,
                Arc::new(ClosurePuller::new(move |_t, _d| {
                    puller_calls2.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![EventRecord::new(7, 0, 0, 0, 0, vec![FieldValue::Int32(1)])])
                })),
            ),
        );

        let alarm = Arc::new(RecordingAlarm::new());
        let scheduler = AlarmScheduler::new(registry, diag, alarm, 1_000_000_000, 128);

        let a_count = Arc::new(AtomicUsize::new(0));
        let b_count = Arc::new(AtomicUsize::new(0));
        struct R(Arc<AtomicUsize>);
        impl PullDataReceiver for R {
            fn on_data_pulled(&self, _b: &[EventRecord], _ok: bool, _ts: i64) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let a: Arc<dyn PullDataReceiver> = Arc::new(R(a_count.clone()));
        let b: Arc<dyn PullDataReceiver> = Arc::new(R(b_count.clone()));
        scheduler.register_receiver(7, &a, 1_000_000_000, 1_000_000_000);
        scheduler.register_receiver(7, &b, 2_000_000_000, 2_000_000_000);

        scheduler.on_alarm_fired(2_000_000_000);

        assert_eq!(puller_calls.load(Ordering::SeqCst), 1);
        assert_eq!(a_count.load(Ordering::SeqCst), 1);
        assert_eq!(b_count.load(Ordering::SeqCst), 1);

        // B was scheduled for 2s and fired exactly at 2s: zero delay. A was
        // scheduled for 1s but coalesced into this same 2s fire: 1s of delay.
        let snap = diag.snapshot();
        let tag7 = snap.tags.iter().find(|t| t.tag_id == 7).unwrap();
        assert_eq!(tag7.max_pull_delay_ns, 1_000_000_000);
    }
}
