//! SocketListener (C3): reads datagrams off the producer socket, demultiplexes
//! loss reports from atoms, and pushes parsed [`EventRecord`]s into the
//! queue.
//!
//! Grounded directly on `StatsSocketListener::onDataAvailable`: a `recvmsg`
//! with a control buffer sized for one `ucred`, SCM_CREDENTIALS extracted via
//! the `CMSG_*` macro family with a `fake_cred` fallback, and loss-report
//! detection by payload length plus a type-byte check (per the §9 design
//! note: length alone is fragile).

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use socket2::{Domain, SockAddr, Socket, Type};

use crate::clock::{elapsed_ns as now_elapsed_ns, wall_ns as now_wall_ns, wall_sec as now_wall_sec};
use crate::diagnostics::Diagnostics;
use crate::error::SocketError;
use crate::event::EventRecord;
use crate::queue::{BoundedEventQueue, PushResult};

/// Credentials substituted when SCM_CREDENTIALS is absent from the control
/// message — several legitimate producers run without it (§9).
pub const DEFAULT_OVERFLOW_UID: u32 = 65534;

/// Header size in bytes of the fixed framing prefix. Treated as a
/// configurable constant per §6 rather than hard-coded throughout.
pub const DEFAULT_HEADER_SIZE: usize = 28;

const MAX_PAYLOAD: usize = 4096;

/// A single long-scalar log event's payload, used to recognise loss-report
/// datagrams (§4.2): 8 bytes of type discriminator plus the composite
/// `(last_atom_tag << 32) | dropped_count` value.
const LONG_EVENT_PAYLOAD_LEN: usize = 9;
const EVENT_TYPE_LONG: u8 = 4;

/// Parses an atom body (everything after the header and the 4-byte
/// StatsEventTag prefix) into an [`EventRecord`]. The wire schema itself is
/// an external collaborator concern (Non-goal (a)); this is only the seam.
pub trait AtomParser: Send + Sync {
    fn parse(&self, tag_id: u32, uid: u32, pid: u32, elapsed_ns: i64, wall_ns: i64, body: &[u8]) -> Option<EventRecord>;
}

struct DatagramHeader {
    tag: u32,
}

fn parse_header(buf: &[u8], header_size: usize) -> Option<DatagramHeader> {
    if buf.len() < header_size || header_size < 5 {
        return None;
    }
    // magic: buf[0]; tag: next 4 bytes, little-endian, as in the source framing.
    let tag = u32::from_le_bytes(buf[1..5].try_into().ok()?);
    Some(DatagramHeader { tag })
}

/// Decodes `(last_atom_tag << 32) | dropped_count` from a loss-report
/// payload's trailing 8 bytes.
fn decode_loss_composite(payload: &[u8]) -> Option<(u32, u32)> {
    if payload.len() != LONG_EVENT_PAYLOAD_LEN {
        return None;
    }
    if payload[0] != EVENT_TYPE_LONG {
        return None;
    }
    let composite = i64::from_le_bytes(payload[1..9].try_into().ok()?) as u64;
    let dropped_count = (composite & 0xFFFF_FFFF) as u32;
    let last_atom_tag = (composite >> 32) as u32;
    Some((last_atom_tag, dropped_count))
}

/// Owns the datagram socket and the reader loop.
pub struct SocketListener {
    socket: Socket,
    queue: Arc<BoundedEventQueue>,
    diagnostics: Arc<Diagnostics>,
    parser: Arc<dyn AtomParser>,
    header_size: usize,
    shutdown: Arc<AtomicBool>,
}

impl SocketListener {
    /// Binds a `SOCK_DGRAM` unix socket at `path`, named `statsdw` in the
    /// source; here the name is whatever path the caller supplies, since a
    /// real abstract/namespaced socket name is a deployment concern.
    pub fn bind(
        path: &std::path::Path,
        queue: Arc<BoundedEventQueue>,
        diagnostics: Arc<Diagnostics>,
        parser: Arc<dyn AtomParser>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, SocketError> {
        let socket = Socket::new(Domain::UNIX, Type::DGRAM, None).map_err(SocketError::Bind)?;
        let _ = std::fs::remove_file(path);
        let addr = SockAddr::unix(path).map_err(SocketError::Bind)?;
        socket.bind(&addr).map_err(SocketError::Bind)?;
        enable_passcred(&socket);
        info!("statsd socket bound at {:?}", path);
        Ok(Self { socket, queue, diagnostics, parser, header_size: DEFAULT_HEADER_SIZE, shutdown })
    }

    pub fn with_header_size(mut self, header_size: usize) -> Self {
        self.header_size = header_size;
        self
    }

    /// The reader loop (§4.2, §5 "Reader thread"). Runs until the socket is
    /// closed (via `shutdown`) or a fatal recv error occurs.
    pub fn run(&self) -> Result<(), SocketError> {
        let mut buf = [0u8; MAX_PAYLOAD];
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                info!("statsd socket reader shutting down");
                return Ok(());
            }

            let (n, creds) = match recv_with_credentials(&self.socket, &mut buf) {
                Ok(result) => result,
                Err(err) if self.shutdown.load(Ordering::Relaxed) => {
                    let _ = err;
                    return Ok(());
                }
                Err(err) => {
                    error!("fatal statsd socket error: {err}");
                    return Err(SocketError::Recv(err));
                }
            };

            let (uid, pid) = creds.unwrap_or((DEFAULT_OVERFLOW_UID, 0));
            self.handle_datagram(&buf[..n], uid, pid);
        }
    }

    fn handle_datagram(&self, datagram: &[u8], uid: u32, pid: u32) {
        let Some(header) = parse_header(datagram, self.header_size) else {
            warn!("dropped short/malformed statsd datagram ({} bytes)", datagram.len());
            return;
        };
        let payload = &datagram[self.header_size..];

        if let Some((last_atom_tag, dropped_count)) = decode_loss_composite(payload) {
            let wall_sec = now_wall_sec();
            self.diagnostics.note_log_lost(wall_sec, dropped_count, header.tag, last_atom_tag, uid, pid);
            return;
        }

        // Atom body: skip the 4-byte StatsEventTag prefix (§4.2 step 3).
        if payload.len() < 4 {
            warn!("dropped atom datagram shorter than StatsEventTag prefix");
            return;
        }
        let body = &payload[4..];

        let elapsed_ns = now_elapsed_ns();
        let wall_ns = now_wall_ns();
        let Some(record) = self.parser.parse(header.tag, uid, pid, elapsed_ns, wall_ns, body) else {
            warn!("dropped unparseable atom for tag {}", header.tag);
            return;
        };

        self.diagnostics.note_pushed_atom(header.tag);
        match self.queue.push(record) {
            PushResult::Accepted => {}
            PushResult::Rejected { oldest_elapsed_ns } => {
                self.diagnostics.note_event_queue_overflow(oldest_elapsed_ns);
            }
        }
    }
}

fn enable_passcred(socket: &Socket) {
    let fd = socket.as_raw_fd();
    let enable: libc::c_int = 1;
    // SAFETY: fd is owned by `socket` and remains valid for the call;
    // `enable` is a valid c_int of the size setsockopt expects.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PASSCRED,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        warn!("failed to set SO_PASSCRED on statsd socket: {}", std::io::Error::last_os_error());
    }
}

/// Performs one `recvmsg` and extracts SCM_CREDENTIALS if present.
fn recv_with_credentials(socket: &Socket, buf: &mut [u8]) -> std::io::Result<(usize, Option<(u32, u32)>)> {
    let fd = socket.as_raw_fd();
    let mut iov = libc::iovec { iov_base: buf.as_mut_ptr() as *mut libc::c_void, iov_len: buf.len() };
    // SAFETY: sized for exactly one `ucred` ancillary record, matching what
    // SO_PASSCRED delivers.
    let cmsg_space = unsafe { libc::CMSG_SPACE(std::mem::size_of::<libc::ucred>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov as *mut libc::iovec;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    // SAFETY: `msg` is fully initialized and its buffers outlive the call.
    let n = unsafe { libc::recvmsg(fd, &mut msg as *mut libc::msghdr, 0) };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let mut creds = None;
    // SAFETY: iterating the control message chain produced by the kernel
    // for this exact `msg`.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_CREDENTIALS {
                let data = libc::CMSG_DATA(cmsg) as *const libc::ucred;
                let ucred = data.read_unaligned();
                creds = Some((ucred.uid, ucred.pid as u32));
                break;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok((n as usize, creds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_of_exact_size_parses() {
        let mut buf = vec![0u8; DEFAULT_HEADER_SIZE];
        buf[0] = 1; // magic
        buf[1..5].copy_from_slice(&42u32.to_le_bytes());
        let header = parse_header(&buf, DEFAULT_HEADER_SIZE).unwrap();
        assert_eq!(header.tag, 42);
    }

    #[test]
    fn header_shorter_than_size_is_rejected() {
        let buf = vec![0u8; DEFAULT_HEADER_SIZE - 1];
        assert!(parse_header(&buf, DEFAULT_HEADER_SIZE).is_none());
    }

    #[test]
    fn loss_report_requires_both_length_and_type_byte() {
        // Right length but wrong type byte: must not be treated as a loss report.
        let mut payload = vec![0u8; LONG_EVENT_PAYLOAD_LEN];
        payload[0] = 0; // not EVENT_TYPE_LONG
        assert!(decode_loss_composite(&payload).is_none());
    }

    #[test]
    fn longer_payload_with_matching_type_byte_is_not_a_loss_report() {
        // An atom whose body happens to start with EVENT_TYPE_LONG but is
        // longer than a single long-scalar log event must not be misread as
        // a loss report and dropped — length must match exactly.
        let mut payload = vec![0u8; LONG_EVENT_PAYLOAD_LEN + 1];
        payload[0] = EVENT_TYPE_LONG;
        assert!(decode_loss_composite(&payload).is_none());
    }

    #[test]
    fn loss_report_decodes_composite() {
        let dropped_count: u32 = 7;
        let last_atom_tag: u32 = 100;
        let composite: i64 = ((last_atom_tag as i64) << 32) | dropped_count as i64;
        let mut payload = vec![EVENT_TYPE_LONG];
        payload.extend_from_slice(&composite.to_le_bytes());
        let (tag, count) = decode_loss_composite(&payload).unwrap();
        assert_eq!(tag, last_atom_tag);
        assert_eq!(count, dropped_count);
    }
}
