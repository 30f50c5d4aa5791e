//! Construction-time configuration for the core. No CLI/env parsing lives here;
//! the binary entry point is the only place allowed to build one of these from
//! the outside world.

/// Tunables for every core component, threaded through as `Arc<Config>` once
/// at startup and never mutated afterward.
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity `K` of the [`crate::queue::BoundedEventQueue`].
    pub queue_capacity: usize,
    /// Default puller cooldown when a registration omits one, in nanoseconds.
    pub default_cooldown_ns: i64,
    /// Default hard upper bound on `pull_internal` latency, in nanoseconds.
    pub default_pull_timeout_ns: i64,
    /// Upper bound (exclusive) for tag ids tracked by the per-atom push counter.
    pub max_pushed_atom_id: u32,
    /// Alarm fire alignment granularity, in nanoseconds.
    pub alarm_alignment_ns: i64,
    /// Capacity of the bounded log-loss history list.
    pub log_loss_history_cap: usize,
    /// Capacity of the bounded queue-overflow history list.
    pub overflow_history_cap: usize,
    /// Hard cap on subscribers per tag, bounding fire-handler cost.
    pub max_subscribers_per_tag: usize,
}

impl Config {
    /// Builds a config, asserting the invariants every constructor in this
    /// codebase checks at the boundary rather than clamping silently.
    pub fn new(
        queue_capacity: usize,
        default_cooldown_ns: i64,
        default_pull_timeout_ns: i64,
        max_pushed_atom_id: u32,
        alarm_alignment_ns: i64,
        log_loss_history_cap: usize,
        overflow_history_cap: usize,
        max_subscribers_per_tag: usize,
    ) -> Self {
        assert!(queue_capacity > 0, "queue_capacity must be positive");
        assert!(default_cooldown_ns >= 0, "default_cooldown_ns must be non-negative");
        assert!(default_pull_timeout_ns > 0, "default_pull_timeout_ns must be positive");
        assert!(alarm_alignment_ns > 0, "alarm_alignment_ns must be positive");
        assert!(max_subscribers_per_tag > 0, "max_subscribers_per_tag must be positive");

        Self {
            queue_capacity,
            default_cooldown_ns,
            default_pull_timeout_ns,
            max_pushed_atom_id,
            alarm_alignment_ns,
            log_loss_history_cap,
            overflow_history_cap,
            max_subscribers_per_tag,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_capacity: 2000,
            default_cooldown_ns: 1_000_000_000,
            default_pull_timeout_ns: 10_000_000_000,
            max_pushed_atom_id: 1 << 16,
            alarm_alignment_ns: 1_000_000_000,
            log_loss_history_cap: 20,
            overflow_history_cap: 20,
            max_subscribers_per_tag: 128,
        }
    }
}
