//! RPC puller: invokes a named remote service and awaits its reply up to the
//! registry-supplied deadline, converting wire records to [`EventRecord`]s.

use crossbeam::channel::RecvTimeoutError;

use crate::clock::elapsed_ns as now_elapsed_ns;
use crate::error::PullError;
use crate::event::EventRecord;
use crate::puller::Puller;

use super::remaining;

/// The remote-service seam; wire details (transport, serialization) are a
/// collaborator concern, same as every other puller family here.
pub trait RpcClient: Send + Sync {
    fn call(&self, tag_id: u32) -> Result<Vec<EventRecord>, PullError>;
}

pub struct RpcPuller {
    client: Box<dyn RpcClient>,
}

impl RpcPuller {
    pub fn new(client: Box<dyn RpcClient>) -> Self {
        Self { client }
    }
}

impl Puller for RpcPuller {
    fn pull_internal(&self, tag_id: u32, deadline_ns: i64) -> Result<Vec<EventRecord>, PullError> {
        let (tx, rx) = crossbeam::channel::bounded(1);
        let client = &self.client;
        let result = std::thread::scope(|scope| {
            scope.spawn(|| {
                let _ = tx.send(client.call(tag_id));
            });

            let now = now_elapsed_ns();
            match rx.recv_timeout(remaining(deadline_ns, now)) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => Err(PullError::Timeout),
                Err(RecvTimeoutError::Disconnected) => Err(PullError::RemoteError("rpc worker panicked".into())),
            }
        });
        result
    }
}
