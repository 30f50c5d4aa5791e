//! Event-ingestion and pull-scheduling core of a system-wide statistics
//! daemon: a bounded queue between a socket listener and a consumer, and a
//! pull manager that caches puller output under a per-tag cooldown and
//! dispatches it to subscribed receivers on a single aligned alarm.
//!
//! Configuration parsing, metric aggregation, the condition tracker graph,
//! the uid-to-package map, on-disk persistence, and report serialization are
//! external collaborators; this crate only exposes the seams they plug into.

pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod event;
pub mod puller;
pub mod pullers;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod socket;
pub mod subscriber;
pub mod supervisor;
pub mod uidmap;

pub use config::Config;
pub use error::{CoreError, PullError, SocketError};
pub use event::{AttributionChain, AttributionNode, EventRecord, FieldValue};
