//! Conntrack netlink socket ownership and message parsing.
//!
//! This is the only module issuing socket system calls, and every call is
//! made from the consumer's namespace-pinned worker thread. The socket is
//! built on raw libc netlink syscalls with RAII file-descriptor cleanup;
//! receives block in `poll()` on both the socket and a shutdown eventfd so
//! a concurrent stop wakes the read instead of leaving it hung.
//!
//! Receive errors are classified structurally from the OS error code, never
//! from message text: `ENOBUFS` means the kernel-side receive buffer
//! overflowed (the consumer is falling behind), a signaled shutdown fd or
//! zero-length read means end-of-stream, anything else is passed through.

use std::{io, mem, ops::Range, os::fd::RawFd, sync::Arc};

use libc::{
    AF_NETLINK, NETLINK_ADD_MEMBERSHIP, NETLINK_DROP_MEMBERSHIP, POLLERR, POLLHUP, POLLIN,
    POLLNVAL, SOL_NETLINK, SOL_SOCKET, c_int, c_void, pollfd, sockaddr_nl,
};
use netlink_packet_core::NetlinkBuffer;
use nix::errno::Errno;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::conntrack::{
    IPCTNL_MSG_CT_GET, NFNETLINK_V0, NFNL_SUBSYS_CTNETLINK, NLM_F_DUMP, NLM_F_REQUEST,
    NLMSG_ERROR, NLMSG_HDRLEN, nlmsg_align, pool::BufferPool,
};

/// Classified outcome of a failed receive.
#[derive(Debug, Error)]
pub enum RecvError {
    /// The socket was closed, locally via shutdown or by the kernel.
    #[error("netlink socket closed")]
    Closed,
    /// The kernel receive buffer could not hold pending data (ENOBUFS).
    #[error("netlink receive buffer overrun")]
    Overrun,
    /// Any other receive failure.
    #[error("netlink receive failed: {0}")]
    Os(Errno),
}

/// Errors raised while building or driving a socket.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("failed to create netlink socket: {0}")]
    Create(#[source] io::Error),

    #[error("failed to bind netlink socket: {0}")]
    Bind(#[source] io::Error),

    #[error("failed to create shutdown eventfd: {0}")]
    ShutdownFd(#[source] io::Error),

    #[error("failed to attach sampling filter: {0}")]
    Filter(#[source] io::Error),

    #[error("failed to update membership for netlink group {group}: {source}")]
    Membership {
        group: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to send conntrack dump request: {0}")]
    Send(#[source] io::Error),

    #[error("conntrack dump request truncated: sent {sent} of {len} bytes")]
    ShortSend { sent: usize, len: usize },
}

/// Protocol-level error carried by an individual message in a batch.
#[derive(Debug, Error)]
pub enum MessageError {
    /// An NLMSG_ERROR payload too short to contain an error code.
    #[error("not enough data for netlink error code")]
    Truncated,
    /// A kernel-reported error code, mapped back to the OS errno.
    #[error("kernel reported error: {0}")]
    Kernel(Errno),
}

/// One netlink message inside a received batch: header fields plus the
/// payload's byte range within the batch buffer.
#[derive(Debug, Clone)]
pub struct Message {
    pub message_type: u16,
    pub flags: u16,
    pub payload: Range<usize>,
}

/// The result of a single successful socket read: the pooled buffer the
/// kernel wrote into and the messages parsed out of it.
pub struct Batch {
    buffer: Vec<u8>,
    messages: Vec<Message>,
}

impl Batch {
    pub fn new(buffer: Vec<u8>, messages: Vec<Message>) -> Self {
        Self { buffer, messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_parts(self) -> (Vec<u8>, Vec<Message>) {
        (self.buffer, self.messages)
    }
}

/// The socket surface the consumer drives. Production uses
/// [`ConntrackSocket`]; tests substitute a scripted implementation.
pub trait EventSocket: Send {
    /// Block until a batch of messages arrives or the socket dies.
    fn receive(&mut self) -> Result<Batch, RecvError>;

    /// Send a one-shot conntrack table dump request for `family`.
    fn send_dump(&mut self, family: u8) -> Result<(), SocketError>;

    fn join_group(&mut self, group: u32) -> Result<(), SocketError>;

    fn leave_group(&mut self, group: u32) -> Result<(), SocketError>;
}

/// Builds a socket at the given sampling rate. Called once at construction
/// and again on every throttle step, always on the worker thread.
pub type SocketFactory = Box<dyn FnMut(f64) -> Result<Box<dyn EventSocket>, SocketError> + Send>;

/// RAII wrapper for the netlink socket descriptor so every exit path closes
/// it exactly once.
struct NetlinkFd(RawFd);

impl NetlinkFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for NetlinkFd {
    fn drop(&mut self) {
        // SAFETY: self.0 is a valid descriptor we own and are done using.
        unsafe {
            libc::close(self.0);
        }
        trace!(
            event.name = "conntrack.socket.closed",
            socket_fd = self.0,
            "netlink socket closed"
        );
    }
}

/// Eventfd used to wake a blocked receive when the consumer stops. Shared
/// across socket generations: once signaled, every current and future poll
/// reports end-of-stream, which is exactly the terminal stop semantics.
pub struct ShutdownFd(RawFd);

impl ShutdownFd {
    pub fn new() -> Result<Self, SocketError> {
        // SAFETY: eventfd() is safe to call; the return value is checked.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(SocketError::ShutdownFd(io::Error::last_os_error()));
        }
        Ok(Self(fd))
    }

    fn as_raw_fd(&self) -> RawFd {
        self.0
    }

    /// Wake any poll watching this fd. Signaling more than once is harmless.
    pub fn signal(&self) {
        let val: u64 = 1;
        // SAFETY: self.0 is valid and val is properly initialized. A failed
        // write only delays shutdown until the next poll wakeup.
        let ret = unsafe {
            libc::write(
                self.0,
                &val as *const u64 as *const c_void,
                mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            warn!(
                event.name = "conntrack.socket.shutdown_signal_failed",
                error = %io::Error::last_os_error(),
                "failed to signal shutdown eventfd"
            );
        }
    }
}

impl Drop for ShutdownFd {
    fn drop(&mut self) {
        // SAFETY: self.0 is a valid descriptor we own.
        unsafe {
            libc::close(self.0);
        }
    }
}

/// A netlink socket bound to the NETLINK_NETFILTER protocol, receiving into
/// pool-owned page buffers.
pub struct ConntrackSocket {
    fd: NetlinkFd,
    shutdown: Arc<ShutdownFd>,
    pool: Arc<BufferPool>,
    seq: u32,
}

impl ConntrackSocket {
    /// Create and bind the socket, raising its kernel receive buffer to
    /// `recv_buffer_size`. Never allocates receive memory itself: reads go
    /// into buffers borrowed from `pool`.
    pub fn open(
        pool: Arc<BufferPool>,
        shutdown: Arc<ShutdownFd>,
        recv_buffer_size: usize,
    ) -> Result<Self, SocketError> {
        // SAFETY: socket() is safe to call; the return value is checked.
        let raw = unsafe {
            libc::socket(
                AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_NETFILTER,
            )
        };
        if raw < 0 {
            return Err(SocketError::Create(io::Error::last_os_error()));
        }
        let fd = NetlinkFd(raw);

        // SAFETY: sockaddr_nl is a plain C struct, safe to zero-initialize.
        let mut addr: sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = AF_NETLINK as u16;
        addr.nl_pid = 0; // kernel assigns the port id
        addr.nl_groups = 0; // memberships are added per stream via setsockopt

        // SAFETY: fd is valid, addr is initialized, and the size matches.
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(SocketError::Bind(io::Error::last_os_error()));
        }

        // A larger receive buffer widens the window before ENOBUFS under
        // bursty churn. Failure is not fatal: the default-sized socket still
        // works, the throttle path just engages sooner.
        let requested = recv_buffer_size as c_int;
        // SAFETY: fd is valid and the option value is a properly sized int.
        let ret = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                SOL_SOCKET,
                libc::SO_RCVBUF,
                &requested as *const c_int as *const c_void,
                mem::size_of::<c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            warn!(
                event.name = "conntrack.socket.rcvbuf_failed",
                error = %io::Error::last_os_error(),
                requested_bytes = recv_buffer_size,
                "failed to raise netlink receive buffer size"
            );
        }

        let mut effective: c_int = 0;
        let mut len = mem::size_of::<c_int>() as libc::socklen_t;
        // SAFETY: fd is valid; effective/len are properly sized out params.
        let ret = unsafe {
            libc::getsockopt(
                fd.as_raw_fd(),
                SOL_SOCKET,
                libc::SO_RCVBUF,
                &mut effective as *mut c_int as *mut c_void,
                &mut len,
            )
        };
        if ret == 0 {
            debug!(
                event.name = "conntrack.socket.created",
                socket_fd = fd.as_raw_fd(),
                receive_buffer_bytes = effective,
                "netlink socket created and bound"
            );
        }

        Ok(Self {
            fd,
            shutdown,
            pool,
            seq: 0,
        })
    }

    /// Install a classic BPF sampling program on the socket. Only called
    /// for rates below 1.0; a full-rate socket carries no filter.
    pub fn attach_filter(&self, filter: &[libc::sock_filter]) -> Result<(), SocketError> {
        let prog = libc::sock_fprog {
            len: filter.len() as libc::c_ushort,
            filter: filter.as_ptr() as *mut libc::sock_filter,
        };

        // SAFETY: prog points into `filter`, which outlives this call; the
        // kernel copies the program during setsockopt.
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &prog as *const libc::sock_fprog as *const c_void,
                mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(SocketError::Filter(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn membership(&self, group: u32, option: c_int) -> Result<(), SocketError> {
        let value = group as c_int;
        // SAFETY: fd is valid and the option value is a properly sized int.
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                SOL_NETLINK,
                option,
                &value as *const c_int as *const c_void,
                mem::size_of::<c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(SocketError::Membership {
                group,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

impl EventSocket for ConntrackSocket {
    fn receive(&mut self) -> Result<Batch, RecvError> {
        loop {
            let mut fds = [
                pollfd {
                    fd: self.fd.as_raw_fd(),
                    events: POLLIN,
                    revents: 0,
                },
                pollfd {
                    fd: self.shutdown.as_raw_fd(),
                    events: POLLIN,
                    revents: 0,
                },
            ];

            // SAFETY: fds is properly initialized; timeout -1 blocks until
            // the socket is readable or shutdown is signaled.
            let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(classify_os(err));
            }

            if (fds[1].revents & POLLIN) != 0 {
                trace!(
                    event.name = "conntrack.socket.shutdown_signaled",
                    "receive woken by shutdown signal"
                );
                return Err(RecvError::Closed);
            }
            if (fds[0].revents & (POLLHUP | POLLNVAL)) != 0 {
                return Err(RecvError::Closed);
            }
            // POLLERR is not terminal here: a pending ENOBUFS surfaces as a
            // socket error and must be read out via recv() to classify it.
            if (fds[0].revents & (POLLIN | POLLERR)) == 0 {
                continue;
            }

            let mut buf = self.pool.get();
            // SAFETY: fd is valid, buf is a properly sized mutable buffer.
            let n = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut c_void,
                    buf.len(),
                    0,
                )
            };

            if n < 0 {
                self.pool.put(buf);
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(classify_os(err));
            }
            if n == 0 {
                self.pool.put(buf);
                return Err(RecvError::Closed);
            }

            let messages = parse_batch(&buf[..n as usize]);
            return Ok(Batch::new(buf, messages));
        }
    }

    fn send_dump(&mut self, family: u8) -> Result<(), SocketError> {
        self.seq = self.seq.wrapping_add(1);
        let req = encode_dump_request(family, self.seq);

        // SAFETY: sockaddr_nl is a plain C struct, safe to zero-initialize.
        let mut addr: sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = AF_NETLINK as u16;
        addr.nl_pid = 0; // destination: the kernel

        // SAFETY: req lives on the stack for the duration of the call and
        // the address length matches sockaddr_nl.
        let ret = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                req.as_ptr() as *const c_void,
                req.len(),
                0,
                &addr as *const sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(SocketError::Send(io::Error::last_os_error()));
        }
        let sent = ret as usize;
        if sent != req.len() {
            return Err(SocketError::ShortSend {
                sent,
                len: req.len(),
            });
        }

        trace!(
            event.name = "conntrack.socket.dump_requested",
            family = family,
            sequence = self.seq,
            "conntrack table dump request sent"
        );
        Ok(())
    }

    fn join_group(&mut self, group: u32) -> Result<(), SocketError> {
        self.membership(group, NETLINK_ADD_MEMBERSHIP)
    }

    fn leave_group(&mut self, group: u32) -> Result<(), SocketError> {
        self.membership(group, NETLINK_DROP_MEMBERSHIP)
    }
}

fn classify_os(err: io::Error) -> RecvError {
    match err.raw_os_error() {
        Some(libc::ENOBUFS) => RecvError::Overrun,
        Some(code) => RecvError::Os(Errno::from_raw(code)),
        None => RecvError::Os(Errno::UnknownErrno),
    }
}

const DUMP_REQUEST_LEN: usize = NLMSG_HDRLEN + 4;

/// Encode a conntrack dump request: netlink header with request+dump flags
/// and an nfgenmsg payload selecting the address family.
fn encode_dump_request(family: u8, seq: u32) -> [u8; DUMP_REQUEST_LEN] {
    let mut req = [0u8; DUMP_REQUEST_LEN];
    {
        let mut hdr = NetlinkBuffer::new(&mut req[..]);
        hdr.set_length(DUMP_REQUEST_LEN as u32);
        hdr.set_message_type((NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_GET);
        hdr.set_flags(NLM_F_REQUEST | NLM_F_DUMP);
        hdr.set_sequence_number(seq);
        hdr.set_port_number(0);
    }
    // nfgenmsg: family, version, reserved resource id
    req[NLMSG_HDRLEN] = family;
    req[NLMSG_HDRLEN + 1] = NFNETLINK_V0;
    req
}

/// Split one kernel read into its constituent messages. A read may carry
/// several 4-byte-aligned netlink messages back to back; a malformed or
/// truncated tail ends the walk with what was parsed so far.
pub fn parse_batch(data: &[u8]) -> Vec<Message> {
    let mut messages = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let bytes = &data[offset..];
        match NetlinkBuffer::new_checked(bytes) {
            Ok(hdr) => {
                let msg_len = hdr.length() as usize;
                if msg_len < NLMSG_HDRLEN {
                    warn!(
                        event.name = "conntrack.socket.invalid_message_length",
                        message_length = msg_len,
                        offset = offset,
                        "message shorter than its own header, dropping rest of read"
                    );
                    break;
                }

                messages.push(Message {
                    message_type: hdr.message_type(),
                    flags: hdr.flags(),
                    payload: offset + NLMSG_HDRLEN..offset + msg_len,
                });
                offset = offset.saturating_add(nlmsg_align(msg_len));
            }
            Err(e) => {
                trace!(
                    event.name = "conntrack.socket.partial_message",
                    error = %e,
                    offset = offset,
                    remaining = data.len() - offset,
                    "not enough bytes for a complete message, ending parse"
                );
                break;
            }
        }
    }

    messages
}

/// Check one message for an embedded protocol error. Only NLMSG_ERROR
/// messages can carry a code; a zero code is an ACK and passes through.
pub(crate) fn check_message(buffer: &[u8], message: &Message) -> Result<(), MessageError> {
    if message.message_type != NLMSG_ERROR {
        return Ok(());
    }

    let Some(payload) = buffer.get(message.payload.clone()) else {
        return Err(MessageError::Truncated);
    };
    if payload.len() < 4 {
        return Err(MessageError::Truncated);
    }

    // The code is a negative errno in host byte order.
    let code = i32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]);
    if code == 0 {
        return Ok(());
    }
    Err(MessageError::Kernel(Errno::from_raw(-code)))
}
