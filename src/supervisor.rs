//! Wires the reader, consumer, and scheduler threads together (§5) and owns
//! their shutdown sequencing.
//!
//! Grounded on the teacher's top-level orchestration idiom: each role gets
//! its own dedicated thread, shutdown is a cooperative signal (here an
//! `AtomicBool` plus the queue's own close-on-shutdown wakeup rather than a
//! dropped-sender, since the socket reader has no upstream channel to drop),
//! and the supervisor joins every handle on teardown rather than detaching.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{error, info};

use crate::config::Config;
use crate::diagnostics::Diagnostics;
use crate::error::CoreError;
use crate::event::EventRecord;
use crate::queue::BoundedEventQueue;
use crate::registry::PullerRegistry;
use crate::scheduler::{AlarmScheduler, AlarmSource};
use crate::socket::{AtomParser, SocketListener};
use crate::uidmap::IsolatedUidProvider;

/// Everything a running core needs handed to it once at construction.
pub struct CoreHandles {
    pub queue: Arc<BoundedEventQueue>,
    pub diagnostics: Arc<Diagnostics>,
    pub registry: Arc<PullerRegistry>,
    pub scheduler: Arc<AlarmScheduler>,
}

impl CoreHandles {
    pub fn new(config: &Config, uid_provider: Arc<dyn IsolatedUidProvider>, alarm: Arc<dyn AlarmSource>) -> Self {
        let diagnostics = Arc::new(Diagnostics::new(
            config.max_pushed_atom_id,
            config.log_loss_history_cap,
            config.overflow_history_cap,
        ));
        let registry = Arc::new(PullerRegistry::new(diagnostics.clone(), uid_provider));
        let scheduler = Arc::new(AlarmScheduler::new(
            registry.clone(),
            diagnostics.clone(),
            alarm,
            config.alarm_alignment_ns,
            config.max_subscribers_per_tag,
        ));
        Self { queue: BoundedEventQueue::new(config.queue_capacity), diagnostics, registry, scheduler }
    }
}

/// Owns the reader and consumer thread handles and the shared shutdown flag.
/// The scheduler thread is driven by the [`AlarmSource`] collaborator and is
/// not spawned here.
pub struct Supervisor {
    shutdown: Arc<AtomicBool>,
    queue: Arc<BoundedEventQueue>,
    reader: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Spawns the reader thread (owns the socket, pushes into `queue`) and
    /// the consumer thread (blocks in `wait_pop`, hands records to
    /// `on_event`). Socket bind failures are fatal and returned directly
    /// rather than spawning a thread doomed to exit immediately.
    pub fn start(
        socket_path: &std::path::Path,
        queue: Arc<BoundedEventQueue>,
        diagnostics: Arc<Diagnostics>,
        parser: Arc<dyn AtomParser>,
        on_event: Arc<dyn Fn(EventRecord) + Send + Sync>,
    ) -> Result<Self, CoreError> {
        let shutdown = Arc::new(AtomicBool::new(false));

        let listener = SocketListener::bind(socket_path, queue.clone(), diagnostics, parser, shutdown.clone())?;
        let reader = std::thread::spawn(move || {
            if let Err(err) = listener.run() {
                error!("statsd reader thread terminated: {err}");
            }
        });

        let consumer_queue = queue.clone();
        let consumer = std::thread::spawn(move || {
            info!("statsd consumer thread started");
            while let Some(event) = consumer_queue.wait_pop() {
                on_event(event);
            }
            info!("statsd consumer thread draining complete, exiting");
        });

        Ok(Self { shutdown, queue, reader: Some(reader), consumer: Some(consumer) })
    }

    /// Signals both threads to stop, wakes the blocked consumer, and joins
    /// them. The reader's own socket recv will observe the shutdown flag on
    /// its next wake (see [`SocketListener::run`]); on platforms where recv
    /// blocks indefinitely with no incoming datagrams, closing the socket
    /// path is the caller's responsibility before calling this.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.queue.close();
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.consumer.take() {
            let _ = handle.join();
        }
        info!("statsd supervisor shutdown complete");
    }
}
