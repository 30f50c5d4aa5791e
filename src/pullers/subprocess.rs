//! Subprocess puller: executes a named tool and decodes its stdout as a
//! length-delimited protocol message.

use std::io::Read;
use std::process::{Command, Stdio};

use crossbeam::channel::RecvTimeoutError;

use crate::clock::elapsed_ns as now_elapsed_ns;
use crate::error::PullError;
use crate::event::EventRecord;
use crate::puller::Puller;

use super::remaining;

/// Decodes the length-delimited body the subprocess wrote to stdout into
/// records. Wire format is a collaborator concern.
pub trait SubprocessDecoder: Send + Sync {
    fn decode(&self, tag_id: u32, body: &[u8]) -> Result<Vec<EventRecord>, PullError>;
}

pub struct SubprocessPuller {
    tool_path: String,
    args: Vec<String>,
    decoder: Box<dyn SubprocessDecoder>,
}

impl SubprocessPuller {
    pub fn new(tool_path: impl Into<String>, args: Vec<String>, decoder: Box<dyn SubprocessDecoder>) -> Self {
        Self { tool_path: tool_path.into(), args, decoder }
    }

    fn read_length_delimited(mut stdout: impl Read) -> std::io::Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        stdout.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        stdout.read_exact(&mut body)?;
        Ok(body)
    }
}

impl Puller for SubprocessPuller {
    /// Per §5's asymmetric cancellation contract, a deadline miss is reported
    /// as `Timeout` but the subprocess itself is never killed to force it:
    /// the reader thread below is a scoped thread, so this call does not
    /// return — and the registry mutex it is invoked under does not release —
    /// until the tool has actually finished writing (or the pipe closes).
    fn pull_internal(&self, tag_id: u32, deadline_ns: i64) -> Result<Vec<EventRecord>, PullError> {
        let mut child = Command::new(&self.tool_path)
            .args(&self.args)
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| PullError::RemoteError(format!("failed to spawn {}: {e}", self.tool_path)))?;

        let stdout = child.stdout.take().expect("piped stdout");
        let (tx, rx) = crossbeam::channel::bounded(1);
        let result = std::thread::scope(|scope| {
            scope.spawn(|| {
                let _ = tx.send(Self::read_length_delimited(stdout));
            });

            let now = now_elapsed_ns();
            match rx.recv_timeout(remaining(deadline_ns, now)) {
                Ok(Ok(body)) => self.decoder.decode(tag_id, &body),
                Ok(Err(io_err)) => Err(PullError::Malformed(format!("subprocess stdout read failed: {io_err}"))),
                Err(RecvTimeoutError::Timeout) => Err(PullError::Timeout),
                Err(RecvTimeoutError::Disconnected) => Err(PullError::RemoteError("subprocess reader thread panicked".into())),
            }
        });
        let _ = child.wait();
        result
    }
}
