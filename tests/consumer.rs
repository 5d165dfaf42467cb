//! Consumer behavior against a scripted socket.
//!
//! The mock encodes real netlink wire bytes into pool buffers so the full
//! parse-and-emit path is exercised; only the syscalls are substituted.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use crossbeam::channel::{Receiver, RecvTimeoutError};

use ctmon::conntrack::{
    Batch, Consumer, Event, EventSocket, Message, RecvError, SocketError,
    pool::BufferPool,
    socket::{ShutdownFd, SocketFactory, parse_batch},
};

const NLMSG_HDRLEN: usize = 16;
const NLMSG_DONE: u16 = 3;
const NLMSG_ERROR: u16 = 2;

/// IPCTNL_MSG_CT_NEW within the conntrack subsystem.
const CT_NEW: u16 = 0x0100;

const AF_INET: u8 = 2;

fn align(len: usize) -> usize {
    (len + 3) & !3
}

/// Write one wire-format netlink message at `offset`, returning the offset
/// of the next message. Header fields are native-endian, as on the wire.
fn put_message(buf: &mut [u8], offset: usize, message_type: u16, payload: &[u8]) -> usize {
    let len = NLMSG_HDRLEN + payload.len();
    buf[offset..offset + 4].copy_from_slice(&(len as u32).to_ne_bytes());
    buf[offset + 4..offset + 6].copy_from_slice(&message_type.to_ne_bytes());
    buf[offset + 16..offset + 16 + payload.len()].copy_from_slice(payload);
    offset + align(len)
}

enum Step {
    /// One kernel read carrying these (type, payload) messages.
    Batch(Vec<(u16, Vec<u8>)>),
    /// A batch of `n` pre-parsed empty messages, for volumes that would not
    /// fit a real page buffer.
    Synthetic(usize),
    Overrun,
    Closed,
}

#[derive(Debug, PartialEq)]
enum Action {
    Built(f64),
    Join(u32),
    Leave(u32),
    Dump(u8),
}

struct MockSocket {
    script: Arc<Mutex<VecDeque<Step>>>,
    pool: Arc<BufferPool>,
    log: Arc<Mutex<Vec<Action>>>,
}

impl EventSocket for MockSocket {
    fn receive(&mut self) -> Result<Batch, RecvError> {
        let step = self.script.lock().unwrap().pop_front();
        match step {
            None | Some(Step::Closed) => Err(RecvError::Closed),
            Some(Step::Overrun) => Err(RecvError::Overrun),
            Some(Step::Batch(msgs)) => {
                let mut buf = self.pool.get();
                let mut offset = 0;
                for (message_type, payload) in &msgs {
                    offset = put_message(&mut buf, offset, *message_type, payload);
                }
                let parsed = parse_batch(&buf[..offset]);
                assert_eq!(parsed.len(), msgs.len());
                Ok(Batch::new(buf, parsed))
            }
            Some(Step::Synthetic(n)) => {
                let messages = (0..n)
                    .map(|_| Message {
                        message_type: CT_NEW,
                        flags: 0,
                        payload: 0..0,
                    })
                    .collect();
                Ok(Batch::new(self.pool.get(), messages))
            }
        }
    }

    fn send_dump(&mut self, family: u8) -> Result<(), SocketError> {
        self.log.lock().unwrap().push(Action::Dump(family));
        Ok(())
    }

    fn join_group(&mut self, group: u32) -> Result<(), SocketError> {
        self.log.lock().unwrap().push(Action::Join(group));
        Ok(())
    }

    fn leave_group(&mut self, group: u32) -> Result<(), SocketError> {
        self.log.lock().unwrap().push(Action::Leave(group));
        Ok(())
    }
}

struct Harness {
    consumer: Consumer,
    log: Arc<Mutex<Vec<Action>>>,
    pool: Arc<BufferPool>,
}

impl Harness {
    fn new(steps: Vec<Step>, message_rate_limit: u64) -> Self {
        let pool = Arc::new(BufferPool::new());
        let shutdown = Arc::new(ShutdownFd::new().unwrap());
        let script = Arc::new(Mutex::new(VecDeque::from(steps)));
        let log = Arc::new(Mutex::new(Vec::new()));

        let factory: SocketFactory = {
            let script = Arc::clone(&script);
            let log = Arc::clone(&log);
            let pool = Arc::clone(&pool);
            Box::new(move |rate| {
                log.lock().unwrap().push(Action::Built(rate));
                Ok(Box::new(MockSocket {
                    script: Arc::clone(&script),
                    pool: Arc::clone(&pool),
                    log: Arc::clone(&log),
                }) as Box<dyn EventSocket>)
            })
        };

        let consumer = Consumer::with_factory(
            factory,
            Arc::clone(&pool),
            shutdown,
            None,
            message_rate_limit,
            100,
        )
        .unwrap();

        Self {
            consumer,
            log,
            pool,
        }
    }

    fn built_rates(&self) -> Vec<f64> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|a| match a {
                Action::Built(rate) => Some(*rate),
                _ => None,
            })
            .collect()
    }

    fn count(&self, want: fn(&Action) -> bool) -> usize {
        self.log.lock().unwrap().iter().filter(|a| want(a)).count()
    }
}

/// Drain a stream until its channel closes, failing instead of hanging.
fn collect(rx: &Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(event) => events.push(event),
            Err(RecvTimeoutError::Disconnected) => return events,
            Err(RecvTimeoutError::Timeout) => panic!("timed out waiting for the stream to end"),
        }
    }
}

#[test]
fn throttle_rates_until_exhaustion() {
    // Every read overruns, so each socket generation survives exactly one
    // receive before being rebuilt at 0.8x the rate.
    let steps = (0..10).map(|_| Step::Overrun).collect();
    let harness = Harness::new(steps, 1000);

    let events = harness.consumer.events();
    let emitted = collect(&events);
    assert!(emitted.is_empty());

    // Rates visited before the floor refuses the ninth build.
    let expected = [
        1.0, 0.8, 0.64, 0.512, 0.4096, 0.32768, 0.262144, 0.2097152,
    ];
    let built = harness.built_rates();
    assert_eq!(built.len(), expected.len());
    for (got, want) in built.iter().zip(expected) {
        assert!(
            (got - want).abs() < 1e-6,
            "expected rate {want}, built socket at {got}"
        );
    }

    // One leave per throttle attempt (including the final, refused one),
    // one join for the stream plus one per successful rebuild.
    assert_eq!(harness.count(|a| matches!(a, Action::Leave(_))), 8);
    assert_eq!(harness.count(|a| matches!(a, Action::Join(_))), 8);
}

#[test]
fn dump_emits_batches_and_closes() {
    let steps = vec![
        Step::Batch(vec![(CT_NEW, vec![1, 1, 1, 1]), (CT_NEW, vec![2, 2])]),
        Step::Batch(vec![(CT_NEW, vec![3, 3, 3])]),
        Step::Batch(vec![(CT_NEW, vec![4]), (NLMSG_DONE, vec![0, 0, 0, 0])]),
    ];
    let harness = Harness::new(steps, 1000);

    let rx = harness.consumer.dump_table(AF_INET);
    let events = collect(&rx);

    assert_eq!(events.len(), 3);
    assert_eq!(events[0].len(), 2);
    assert_eq!(events[1].len(), 1);
    // The terminal batch is emitted without its done marker.
    assert_eq!(events[2].len(), 1);
    for event in &events {
        for msg in event.messages() {
            assert_ne!(msg.message_type, NLMSG_DONE);
        }
    }

    // Payload bytes survive the pool round-trip untouched.
    let payloads: Vec<Vec<u8>> = events[0].messages().map(|m| m.payload.to_vec()).collect();
    assert_eq!(payloads, vec![vec![1, 1, 1, 1], vec![2, 2]]);

    // Channel is closed exactly once, strictly after the terminal batch.
    assert!(rx.recv().is_err());

    // The request went out with the family selector before any receive.
    let log = harness.log.lock().unwrap();
    assert_eq!(log[0], Action::Built(1.0));
    assert_eq!(log[1], Action::Dump(AF_INET));
}

#[test]
fn events_preserve_kernel_order() {
    let steps = (1..=5)
        .map(|n| Step::Batch((0..n).map(|i| (CT_NEW, vec![n as u8, i as u8])).collect()))
        .collect();
    let harness = Harness::new(steps, 1000);

    let rx = harness.consumer.events();
    let events = collect(&rx);

    let sizes: Vec<usize> = events.iter().map(Event::len).collect();
    assert_eq!(sizes, vec![1, 2, 3, 4, 5]);

    // First payload byte tags the batch each message came from.
    for (idx, event) in events.iter().enumerate() {
        for msg in event.messages() {
            assert_eq!(msg.payload[0] as usize, idx + 1);
        }
    }
}

#[test]
fn breaker_trip_throttles_once_and_drops_batch() {
    // 5000 messages land within one observation window against a ceiling
    // of 1000: the breaker opens, the offending batch is discarded, and
    // the stream resumes on the rebuilt socket.
    let steps = vec![
        Step::Synthetic(5000),
        Step::Batch(vec![(CT_NEW, vec![7]), (CT_NEW, vec![8])]),
        Step::Closed,
    ];
    let harness = Harness::new(steps, 1000);

    let rx = harness.consumer.events();
    let events = collect(&rx);

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].len(), 2);

    // Exactly one throttle before the next successful receive.
    let built = harness.built_rates();
    assert_eq!(built.len(), 2);
    assert!((built[1] - 0.8).abs() < 1e-6);
    assert_eq!(harness.count(|a| matches!(a, Action::Leave(_))), 1);
    assert_eq!(harness.count(|a| matches!(a, Action::Join(_))), 2);
}

#[test]
fn batches_with_error_messages_are_discarded() {
    let enoent = (-2i32).to_ne_bytes().to_vec();
    let steps = vec![
        // Embedded kernel error code poisons the whole batch.
        Step::Batch(vec![(CT_NEW, vec![1]), (NLMSG_ERROR, enoent)]),
        // An error message too short for a code is discarded as malformed.
        Step::Batch(vec![(NLMSG_ERROR, vec![0xff, 0xff])]),
        // An ACK (code zero) is an ordinary message and passes through.
        Step::Batch(vec![(NLMSG_ERROR, vec![0, 0, 0, 0]), (CT_NEW, vec![9])]),
        Step::Closed,
    ];
    let harness = Harness::new(steps, 1000);

    let rx = harness.consumer.events();
    let events = collect(&rx);

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].len(), 2);
    // No throttling happened along the way.
    assert_eq!(harness.built_rates().len(), 1);
}

#[test]
fn done_marker_is_stripped_in_streaming_mode() {
    let steps = vec![
        Step::Batch(vec![(CT_NEW, vec![1]), (NLMSG_DONE, vec![0, 0, 0, 0])]),
        Step::Batch(vec![(CT_NEW, vec![2])]),
        Step::Closed,
    ];
    let harness = Harness::new(steps, 1000);

    let rx = harness.consumer.events();
    let events = collect(&rx);

    // Unlike a dump, the stream keeps going after a done marker.
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].len(), 1);
    assert_eq!(events[1].len(), 1);
    for event in &events {
        for msg in event.messages() {
            assert_ne!(msg.message_type, NLMSG_DONE);
        }
    }
}

#[test]
fn dump_batch_of_only_done_marker_is_emitted_empty() {
    let steps = vec![
        Step::Batch(vec![(CT_NEW, vec![1])]),
        Step::Batch(vec![(NLMSG_DONE, vec![0, 0, 0, 0])]),
    ];
    let harness = Harness::new(steps, 1000);

    let rx = harness.consumer.dump_table(AF_INET);
    let events = collect(&rx);

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].len(), 1);
    assert!(events[1].is_empty());
}

#[test]
fn dump_overrun_aborts_without_throttling() {
    let steps = vec![
        Step::Batch(vec![(CT_NEW, vec![1])]),
        Step::Overrun,
        Step::Batch(vec![(CT_NEW, vec![2])]),
    ];
    let harness = Harness::new(steps, 1000);

    let rx = harness.consumer.dump_table(AF_INET);
    let events = collect(&rx);

    // The dump cannot resume mid-table: one event, then the channel closes
    // with no socket rebuild.
    assert_eq!(events.len(), 1);
    assert_eq!(harness.built_rates().len(), 1);
    assert_eq!(harness.count(|a| matches!(a, Action::Leave(_))), 0);
}

#[test]
fn event_release_is_idempotent() {
    let steps = vec![Step::Batch(vec![(CT_NEW, vec![1, 2, 3])]), Step::Closed];
    let harness = Harness::new(steps, 1000);

    let rx = harness.consumer.events();
    let mut events = collect(&rx);
    let mut event = events.pop().unwrap();

    let before = harness.pool.available();
    event.done();
    assert_eq!(harness.pool.available(), before + 1);

    // A second release must not double-count availability.
    event.done();
    assert_eq!(harness.pool.available(), before + 1);

    // Nor may the drop after an explicit release.
    drop(event);
    assert_eq!(harness.pool.available(), before + 1);
}

#[test]
fn dropped_event_returns_its_buffer() {
    let steps = vec![Step::Batch(vec![(CT_NEW, vec![1])]), Step::Closed];
    let harness = Harness::new(steps, 1000);

    let rx = harness.consumer.events();
    let events = collect(&rx);
    let before = harness.pool.available();

    drop(events);
    assert_eq!(harness.pool.available(), before + 1);
}
