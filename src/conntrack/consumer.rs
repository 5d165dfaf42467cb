//! Conntrack consumer orchestration.
//!
//! A [`Consumer`] owns exactly one live socket at a time and one dedicated
//! worker thread, created inside the target network namespace and pinned
//! there for the consumer's whole lifetime. Socket descriptors are
//! namespace-scoped, so every socket operation is marshaled onto that
//! thread through a task queue; nothing else ever touches the socket.
//!
//! Two streams are exposed: [`events`](Consumer::events) joins the
//! new-connection multicast group and streams until shutdown, and
//! [`dump_table`](Consumer::dump_table) walks the conntrack table once,
//! closing its channel after the multi-part terminator. Both run the same
//! receive loop. When the kernel signals receive-buffer overrun, or the
//! circuit breaker trips on sustained throughput, the loop re-creates the
//! socket with a progressively more aggressive kernel-side sampling filter
//! (×0.8 per step); below a 0.2 acceptance rate it gives up and closes the
//! stream, trading completeness for bounded CPU.

use std::{fs::File, io, sync::Arc, thread};

use crossbeam::channel::{self, Receiver, Sender};
use nix::{
    errno::Errno,
    sched::{CloneFlags, setns},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::conntrack::{
    NFNLGRP_CONNTRACK_NEW, NLMSG_DONE,
    breaker::CircuitBreaker,
    pool::BufferPool,
    sampler,
    socket::{
        self, ConntrackSocket, EventSocket, Message, RecvError, ShutdownFd, SocketError,
        SocketFactory,
    },
};
use crate::runtime::conf::ConntrackConf;

/// Every socket starts unfiltered; only throttling installs a sampler.
const INITIAL_SAMPLING_RATE: f64 = 1.0;

/// Per-throttle reduction of the sampling rate, so successive rebuilds
/// visit 1.0, 0.8, 0.64, 0.512, ...
const THROTTLING_FACTOR: f64 = 0.8;

/// Floor under which throttling gives up: a socket sampling a fifth of the
/// event flow that still overruns is not worth keeping alive.
const MIN_SAMPLING_RATE: f64 = 0.2;

/// Unclassified receive errors are retried, but a socket failing this many
/// times in a row is dead and ends the stream instead of spinning.
const MAX_CONSECUTIVE_RECV_ERRORS: u32 = 10;

#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The throttle protocol ran out of sustainable sampling rates.
    #[error("sampling rate {rate:.7} is at or below the minimum sustainable threshold")]
    SamplingExhausted { rate: f64 },

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error("failed to open network namespace handle {path}: {source}")]
    Namespace {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to enter network namespace: {0}")]
    EnterNamespace(Errno),

    #[error("failed to spawn conntrack worker thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("conntrack worker thread is gone")]
    WorkerGone,
}

/// One batch of raw netlink messages handed to the stream consumer.
///
/// The event borrows a page buffer from the consumer's pool; the buffer is
/// only recycled once the event is released, either explicitly via
/// [`done`](Event::done) or implicitly on drop. Releasing twice is a no-op.
pub struct Event {
    messages: Vec<Message>,
    buffer: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

/// A view of one message inside an [`Event`].
pub struct MessageRef<'a> {
    pub message_type: u16,
    pub flags: u16,
    pub payload: &'a [u8],
}

impl Event {
    pub fn messages(&self) -> impl Iterator<Item = MessageRef<'_>> {
        let buffer = self.buffer.as_deref().unwrap_or(&[]);
        self.messages.iter().map(move |m| MessageRef {
            message_type: m.message_type,
            flags: m.flags,
            payload: buffer.get(m.payload.clone()).unwrap_or(&[]),
        })
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Return the underlying buffer to the pool. Must be called once the
    /// messages have been decoded; afterwards the payload views are gone.
    pub fn done(&mut self) {
        if let Some(buf) = self.buffer.take() {
            self.pool.put(buf);
        }
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        self.done();
    }
}

type Task = Box<dyn FnOnce(&mut Worker) + Send>;

/// Worker-thread state. Exclusively owned by the namespace-pinned thread,
/// so none of it is synchronized.
struct Worker {
    factory: SocketFactory,
    socket: Option<Box<dyn EventSocket>>,
    sampling_rate: f64,
    breaker: CircuitBreaker,
    pool: Arc<BufferPool>,
}

impl Worker {
    /// Build a socket at `rate`, refusing rates at or below the floor.
    fn build_socket(&mut self, rate: f64) -> Result<(), ConsumerError> {
        if rate <= MIN_SAMPLING_RATE {
            return Err(ConsumerError::SamplingExhausted { rate });
        }

        let socket = (self.factory)(rate)?;
        self.sampling_rate = rate;
        self.socket = Some(socket);
        Ok(())
    }

    /// Replace the current socket with one sampling at ×0.8 the rate.
    /// On failure the consumer is done creating sockets: the caller ends
    /// its loop and the stream closes.
    fn throttle(&mut self) -> Result<(), ConsumerError> {
        if let Some(sock) = self.socket.as_mut()
            && let Err(e) = sock.leave_group(NFNLGRP_CONNTRACK_NEW)
        {
            warn!(
                event.name = "conntrack.consumer.leave_group_failed",
                error = %e,
                "failed to leave conntrack group before socket rebuild"
            );
        }
        // Close the old socket before building its replacement: there is
        // exactly one live socket at any time.
        self.socket = None;

        let next = self.sampling_rate * THROTTLING_FACTOR;
        if let Err(e) = self.build_socket(next) {
            error!(
                event.name = "conntrack.consumer.throttle_failed",
                error = %e,
                "failed to re-create netlink socket, giving up on conntrack events"
            );
            return Err(e);
        }

        self.breaker.reset();
        if let Some(sock) = self.socket.as_mut() {
            sock.join_group(NFNLGRP_CONNTRACK_NEW)?;
        }

        info!(
            event.name = "conntrack.consumer.throttled",
            sampling_rate = self.sampling_rate,
            "socket re-created with lower sampling rate"
        );
        Ok(())
    }

    /// Receive batches and flush them to `output` until the stream ends.
    ///
    /// In dump mode the loop ends at the multi-part terminator and never
    /// throttles: a dump interrupted by an overrun cannot be resumed
    /// mid-table, so it is abandoned with a log entry. In streaming mode
    /// overruns and breaker trips both run the throttle protocol and the
    /// loop carries on against the replacement socket.
    fn receive_loop(&mut self, output: &Sender<Event>, dump: bool) {
        let mut batches_emitted = 0u64;
        let mut messages_emitted = 0u64;
        let mut batches_dropped = 0u64;
        let mut consecutive_errors = 0u32;

        loop {
            let Some(sock) = self.socket.as_mut() else {
                debug!(
                    event.name = "conntrack.consumer.no_socket",
                    "no live socket, ending receive loop"
                );
                break;
            };

            let batch = match sock.receive() {
                Ok(batch) => batch,
                Err(RecvError::Closed) => {
                    debug!(
                        event.name = "conntrack.consumer.stream_closed",
                        "socket closed, ending receive loop"
                    );
                    break;
                }
                Err(RecvError::Overrun) => {
                    if dump {
                        warn!(
                            event.name = "conntrack.consumer.dump_overrun",
                            "receive buffer overrun during conntrack table dump, \
                             consider raising the receive buffer size"
                        );
                        break;
                    }

                    warn!(
                        event.name = "conntrack.consumer.stream_overrun",
                        sampling_rate = self.sampling_rate,
                        "receive buffer overrun while streaming, \
                         re-creating socket with a lower sampling rate"
                    );
                    if self.throttle().is_err() {
                        break;
                    }
                    continue;
                }
                Err(RecvError::Os(errno)) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= MAX_CONSECUTIVE_RECV_ERRORS {
                        error!(
                            event.name = "conntrack.consumer.socket_dead",
                            error = %errno,
                            "receive failed {consecutive_errors} times in a row, ending stream"
                        );
                        break;
                    }
                    warn!(
                        event.name = "conntrack.consumer.receive_error",
                        error = %errno,
                        "transient receive error, retrying"
                    );
                    continue;
                }
            };
            consecutive_errors = 0;

            // Proactive throttling: a tripped breaker discards the batch
            // that tripped it and rebuilds the socket, same as an overrun.
            if !dump {
                self.breaker.tick(batch.messages().len());
                if self.breaker.is_open() {
                    warn!(
                        event.name = "conntrack.consumer.breaker_open",
                        sampling_rate = self.sampling_rate,
                        "message rate ceiling exceeded, \
                         re-creating socket with a lower sampling rate"
                    );
                    if self.throttle().is_err() {
                        break;
                    }
                    continue;
                }
            }

            let (buffer, mut messages) = batch.into_parts();

            // A message carrying an embedded error code poisons its whole
            // batch: drop the batch, recycle the buffer, read again.
            if let Some(err) = messages
                .iter()
                .find_map(|m| socket::check_message(&buffer, m).err())
            {
                debug!(
                    event.name = "conntrack.consumer.message_error",
                    error = %err,
                    "discarding batch carrying a protocol error"
                );
                batches_dropped += 1;
                self.pool.put(buffer);
                continue;
            }

            // Strip the multi-part terminator; it is bookkeeping, not data.
            let mut terminal = false;
            if messages
                .last()
                .is_some_and(|m| m.message_type == NLMSG_DONE)
            {
                messages.pop();
                terminal = true;
            }

            messages_emitted += messages.len() as u64;
            batches_emitted += 1;
            let event = Event {
                messages,
                buffer: Some(buffer),
                pool: Arc::clone(&self.pool),
            };

            // Bounded send: a slow consumer blocks the worker here, which
            // stops draining the kernel socket. That is the intended
            // backpressure path, not an accident.
            if output.send(event).is_err() {
                debug!(
                    event.name = "conntrack.consumer.output_dropped",
                    "output channel dropped, ending receive loop"
                );
                break;
            }

            if dump && terminal {
                break;
            }
        }

        debug!(
            event.name = "conntrack.consumer.receive_loop_ended",
            dump = dump,
            batches_emitted = batches_emitted,
            messages_emitted = messages_emitted,
            batches_dropped = batches_dropped,
            "receive loop ended"
        );
    }
}

/// Streams conntrack events and table dumps from one network namespace.
pub struct Consumer {
    tasks: Sender<Task>,
    shutdown: Arc<ShutdownFd>,
    output_capacity: usize,
}

impl Consumer {
    /// Create a consumer for the namespace named by the configuration,
    /// blocking until the first socket is ready. This is the only point
    /// where an error is surfaced to the caller; every later failure is
    /// handled internally or ends the stream by closing its channel.
    pub fn new(conf: &ConntrackConf) -> Result<Self, ConsumerError> {
        let netns = match &conf.netns_path {
            Some(path) => Some(
                File::open(path).map_err(|source| ConsumerError::Namespace {
                    path: path.display().to_string(),
                    source,
                })?,
            ),
            None => None,
        };

        let pool = Arc::new(BufferPool::new());
        let shutdown = Arc::new(ShutdownFd::new()?);

        let factory_pool = Arc::clone(&pool);
        let factory_shutdown = Arc::clone(&shutdown);
        let recv_buffer_size = conf.receive_buffer_size;
        let factory: SocketFactory = Box::new(move |rate| {
            let socket = ConntrackSocket::open(
                Arc::clone(&factory_pool),
                Arc::clone(&factory_shutdown),
                recv_buffer_size,
            )?;
            if rate < 1.0 {
                info!(
                    event.name = "conntrack.consumer.filter_attached",
                    sampling_rate = rate,
                    "attaching kernel sampling filter"
                );
                socket.attach_filter(&sampler::sampling_filter(rate))?;
            }
            Ok(Box::new(socket) as Box<dyn EventSocket>)
        });

        Self::with_factory(
            factory,
            pool,
            shutdown,
            netns,
            conf.max_messages_per_second,
            conf.output_channel_capacity,
        )
    }

    /// Create a consumer over an arbitrary socket factory. This is the
    /// seam integration tests drive with a scripted socket; production
    /// goes through [`new`](Self::new).
    pub fn with_factory(
        factory: SocketFactory,
        pool: Arc<BufferPool>,
        shutdown: Arc<ShutdownFd>,
        netns: Option<File>,
        message_rate_limit: u64,
        output_capacity: usize,
    ) -> Result<Self, ConsumerError> {
        let (task_tx, task_rx) = channel::unbounded::<Task>();
        let (ready_tx, ready_rx) = channel::bounded::<Result<(), ConsumerError>>(1);

        thread::Builder::new()
            .name("ctmon-conntrack".to_string())
            .spawn(move || {
                // Enter the target namespace once and stay: the socket fds
                // created here are only valid in this namespace context.
                if let Some(netns) = &netns {
                    if let Err(e) = setns(netns, CloneFlags::CLONE_NEWNET) {
                        let _ = ready_tx.send(Err(ConsumerError::EnterNamespace(e)));
                        return;
                    }
                }
                info!(
                    event.name = "conntrack.consumer.worker_started",
                    "conntrack worker pinned to target network namespace"
                );
                let _ = ready_tx.send(Ok(()));

                let mut worker = Worker {
                    factory,
                    socket: None,
                    sampling_rate: INITIAL_SAMPLING_RATE,
                    breaker: CircuitBreaker::new(message_rate_limit),
                    pool,
                };
                while let Ok(task) = task_rx.recv() {
                    task(&mut worker);
                }
                debug!(
                    event.name = "conntrack.consumer.worker_stopped",
                    "conntrack worker stopped"
                );
            })
            .map_err(ConsumerError::Spawn)?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(ConsumerError::WorkerGone),
        }

        let consumer = Self {
            tasks: task_tx,
            shutdown,
            output_capacity,
        };

        // The first socket is built synchronously at full rate, so the
        // only error a caller ever sees is this one failing.
        consumer.dispatch_sync(|worker| worker.build_socket(INITIAL_SAMPLING_RATE))??;

        Ok(consumer)
    }

    /// Join the new-connection multicast group and stream live events.
    /// Returns the bounded output channel immediately; the channel closes
    /// when the stream ends (shutdown, or sampling exhaustion).
    pub fn events(&self) -> Receiver<Event> {
        let (tx, rx) = channel::bounded(self.output_capacity);

        self.dispatch(Box::new(move |worker| {
            match worker.socket.as_mut() {
                Some(sock) => {
                    if let Err(e) = sock.join_group(NFNLGRP_CONNTRACK_NEW) {
                        error!(
                            event.name = "conntrack.consumer.join_group_failed",
                            error = %e,
                            "failed to join conntrack events group"
                        );
                        return;
                    }
                }
                None => {
                    warn!(
                        event.name = "conntrack.consumer.no_socket",
                        "cannot stream events without a live socket"
                    );
                    return;
                }
            }
            worker.receive_loop(&tx, false);
        }));

        rx
    }

    /// Dump the conntrack table for one address family. Returns the
    /// bounded output channel immediately; it closes exactly once, after
    /// the batch carrying the multi-part terminator has been delivered.
    pub fn dump_table(&self, family: u8) -> Receiver<Event> {
        let (tx, rx) = channel::bounded(self.output_capacity);

        self.dispatch(Box::new(move |worker| {
            let Some(sock) = worker.socket.as_mut() else {
                warn!(
                    event.name = "conntrack.consumer.no_socket",
                    "cannot dump conntrack table without a live socket"
                );
                return;
            };
            if let Err(e) = sock.send_dump(family) {
                error!(
                    event.name = "conntrack.consumer.dump_request_failed",
                    error = %e,
                    family = family,
                    "conntrack dump request failed"
                );
                return;
            }
            worker.receive_loop(&tx, true);
        }));

        rx
    }

    /// Stop the consumer. Wakes the worker's in-flight receive, which then
    /// reports end-of-stream; the stream channel closes cleanly.
    pub fn stop(&self) {
        info!(
            event.name = "conntrack.consumer.stopping",
            "stopping conntrack consumer"
        );
        self.shutdown.signal();
    }

    fn dispatch(&self, task: Task) {
        if self.tasks.send(task).is_err() {
            error!(
                event.name = "conntrack.consumer.worker_gone",
                "conntrack worker is gone, dropping dispatched task"
            );
        }
    }

    fn dispatch_sync<R, F>(&self, task: F) -> Result<R, ConsumerError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Worker) -> R + Send + 'static,
    {
        let (done_tx, done_rx) = channel::bounded(1);
        let wrapped: Task = Box::new(move |worker| {
            let _ = done_tx.send(task(worker));
        });

        if self.tasks.send(wrapped).is_err() {
            return Err(ConsumerError::WorkerGone);
        }
        done_rx.recv().map_err(|_| ConsumerError::WorkerGone)
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        // Wake any in-flight receive; the worker thread itself exits when
        // the task channel disconnects.
        self.shutdown.signal();
    }
}
