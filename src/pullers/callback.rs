//! Callback puller: dispatches to a registered client-side callback under
//! the same deadline contract as every other puller family.

use crossbeam::channel::RecvTimeoutError;

use crate::clock::elapsed_ns as now_elapsed_ns;
use crate::error::PullError;
use crate::event::EventRecord;
use crate::puller::Puller;

use super::remaining;

/// A client-registered callback invoked on demand for one tag id.
pub trait PullCallback: Send + Sync {
    fn invoke(&self, tag_id: u32) -> Result<Vec<EventRecord>, PullError>;
}

pub struct CallbackPuller {
    callback: Box<dyn PullCallback>,
}

impl CallbackPuller {
    pub fn new(callback: Box<dyn PullCallback>) -> Self {
        Self { callback }
    }
}

impl Puller for CallbackPuller {
    fn pull_internal(&self, tag_id: u32, deadline_ns: i64) -> Result<Vec<EventRecord>, PullError> {
        let (tx, rx) = crossbeam::channel::bounded(1);
        let callback = &self.callback;
        std::thread::scope(|scope| {
            scope.spawn(|| {
                let _ = tx.send(callback.invoke(tag_id));
            });

            let now = now_elapsed_ns();
            match rx.recv_timeout(remaining(deadline_ns, now)) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => Err(PullError::Timeout),
                Err(RecvTimeoutError::Disconnected) => Err(PullError::RemoteError("callback worker panicked".into())),
            }
        })
    }
}
