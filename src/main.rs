//! Entry point: builds a [`Config`], wires the core's threads, and blocks
//! until interrupted.
//!
//! Only this binary is allowed to read environment/CLI input (§12); the
//! library crate never parses either.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use log::info;

use statsd_core::clock::elapsed_ns;
use statsd_core::config::Config;
use statsd_core::scheduler::AlarmSource;
use statsd_core::socket::AtomParser;
use statsd_core::supervisor::{CoreHandles, Supervisor};
use statsd_core::uidmap::NoIsolatedUids;

/// A wall-clock alarm backed by a background thread sleeping to the next
/// armed deadline; good enough for a single-process core where the real OS
/// alarm integration is a deployment-specific collaborator.
struct ThreadAlarm {
    next_fire_ns: AtomicI64,
    scheduler: std::sync::OnceLock<Arc<statsd_core::scheduler::AlarmScheduler>>,
}

impl ThreadAlarm {
    fn new() -> Arc<Self> {
        Arc::new(Self { next_fire_ns: AtomicI64::new(-1), scheduler: std::sync::OnceLock::new() })
    }

    fn attach(&self, scheduler: Arc<statsd_core::scheduler::AlarmScheduler>) {
        let _ = self.scheduler.set(scheduler);
    }

    fn spawn_loop(self: Arc<Self>) {
        std::thread::spawn(move || loop {
            std::thread::sleep(std::time::Duration::from_millis(200));
            let target = self.next_fire_ns.load(Ordering::Relaxed);
            if target < 0 {
                continue;
            }
            let now = elapsed_ns();
            if now >= target {
                if let Some(scheduler) = self.scheduler.get() {
                    scheduler.on_alarm_fired(now);
                }
            }
        });
    }
}

impl AlarmSource for ThreadAlarm {
    fn set_alarm(&self, elapsed_ns: i64) {
        self.next_fire_ns.store(elapsed_ns, Ordering::Relaxed);
    }

    fn cancel(&self) {
        self.next_fire_ns.store(-1, Ordering::Relaxed);
    }
}

/// Placeholder atom parser: the wire schema is an external collaborator
/// concern (Non-goal (a)); this treats the whole body as one opaque field so
/// the pipeline is exercisable end to end without a real schema wired in.
struct OpaqueBodyParser;

impl AtomParser for OpaqueBodyParser {
    fn parse(
        &self,
        tag_id: u32,
        uid: u32,
        pid: u32,
        elapsed_ns: i64,
        wall_ns: i64,
        body: &[u8],
    ) -> Option<statsd_core::EventRecord> {
        if body.is_empty() {
            return None;
        }
        Some(statsd_core::EventRecord::new(
            tag_id,
            uid,
            pid,
            elapsed_ns,
            wall_ns,
            vec![statsd_core::FieldValue::Bytes(body.to_vec())],
        ))
    }
}

fn main() {
    env_logger::init();

    let config = Config::default();
    let alarm = ThreadAlarm::new();
    let handles = CoreHandles::new(&config, Arc::new(NoIsolatedUids), alarm.clone());
    alarm.attach(handles.scheduler.clone());
    alarm.clone().spawn_loop();

    let on_event = Arc::new(move |event: statsd_core::EventRecord| {
        // The downstream metric engine is an external collaborator (§1); the
        // core's responsibility ends at handing the record off.
        let _ = event;
    });

    let socket_path = std::env::temp_dir().join("statsdw");
    let supervisor = Supervisor::start(
        &socket_path,
        handles.queue.clone(),
        handles.diagnostics.clone(),
        Arc::new(OpaqueBodyParser),
        on_event,
    )
    .expect("failed to start statsd core");

    info!("statsd core running, socket at {:?}", socket_path);

    static SHUTDOWN_REQUESTED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);
    extern "C" fn handle_sigint(_sig: libc::c_int) {
        SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
    }
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
    }

    while !SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    supervisor.shutdown();
}
