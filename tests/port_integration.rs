//! Integration tests for the port layer.
//!
//! Drives `StreamPort`, `AggregatingPort` and `ChunkedFlowBuffer` through
//! their public API with mock streams and a recording GATT characteristic.

mod common;

use common::{wait_until, Collector, StateLog};
use flightlink::port::{
    AggregatingPort, ChunkedFlowBuffer, FlowConfig, GattCharacteristic, HealthState, MockStream,
    Port, PortError, PortOptions, StreamPort, WriterConfig,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn small_writer(capacity: usize, write_timeout: Duration) -> PortOptions {
    PortOptions {
        read_chunk_size: 64,
        writer: WriterConfig {
            capacity,
            write_timeout,
            drain_timeout: Duration::from_secs(3),
        },
    }
}

// ============================================================================
// StreamPort
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_writes_reach_sink_in_order(
        chunks in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..48), 1..16),
        max_write in 1usize..24,
    ) {
        let stream = MockStream::new("MOCK0");
        stream.set_max_write(max_write);
        let port = StreamPort::open("MOCK0", stream.pair(), small_writer(32, Duration::from_secs(3)))
            .unwrap();

        for chunk in &chunks {
            port.write_all(chunk).unwrap();
        }
        port.drain().unwrap();

        prop_assert_eq!(stream.written(), chunks.concat());
        prop_assert!(stream.write_log().iter().all(|w| w.len() <= max_write));
        port.close();
    }
}

#[test]
fn test_full_buffer_blocks_instead_of_dropping() {
    let stream = MockStream::new("MOCK0");
    stream.stall();
    let port = Arc::new(
        StreamPort::open("MOCK0", stream.pair(), small_writer(8, Duration::from_secs(3))).unwrap(),
    );

    let payload: Vec<u8> = (0u8..40).collect();
    let writer = {
        let port = port.clone();
        let payload = payload.clone();
        thread::spawn(move || port.write_all(&payload))
    };

    thread::sleep(Duration::from_millis(100));
    assert!(stream.written().is_empty());
    stream.resume();

    writer.join().unwrap().unwrap();
    port.drain().unwrap();
    assert_eq!(stream.written(), payload);
}

#[test]
fn test_lossy_writer_fails_fast() {
    let stream = MockStream::new("MOCK0");
    stream.stall();
    let options = small_writer(8, Duration::from_secs(3)).lossy();
    let port = StreamPort::open("MOCK0", stream.pair(), options).unwrap();

    let mut accepted = 0;
    let result = loop {
        match port.write(b"0123456789") {
            Ok(n) => accepted += n,
            Err(e) => break e,
        }
        assert!(accepted <= 16, "a stalled lossy port kept accepting");
    };
    assert!(matches!(result, PortError::Timeout(d) if d.is_zero()));
    port.close();
}

#[test]
fn test_input_and_hang_up() {
    let stream = MockStream::new("MOCK0");
    let port = StreamPort::open("MOCK0", stream.pair(), PortOptions::default()).unwrap();
    let input = Collector::new();
    let log = StateLog::new();
    port.set_input_listener(Some(input.clone()));
    port.set_listener(Some(log.clone()));

    stream.push_incoming(b"$GPRMC,123519,A");
    assert!(wait_until(|| input.len() == 15));
    assert_eq!(input.data(), b"$GPRMC,123519,A".to_vec());

    stream.hang_up();
    assert!(wait_until(|| log.changes() == 1));
    assert_eq!(port.state(), HealthState::Failed);
    assert_eq!(log.errors().len(), 1);

    port.close();
    port.close();
    assert!(matches!(port.write(b"x"), Err(PortError::NotOpen)));
}

#[test]
fn test_baud_rate_goes_to_the_line() {
    let stream = MockStream::new("MOCK0");
    let port = StreamPort::open("MOCK0", stream.pair(), PortOptions::default()).unwrap();
    assert_eq!(port.baud_rate(), 9600);

    port.set_baud_rate(38400).unwrap();
    assert_eq!(port.baud_rate(), 38400);
    assert_eq!(stream.baud_history(), vec![38400]);
    port.close();
}

// ============================================================================
// AggregatingPort
// ============================================================================

#[test]
fn test_aggregate_isolates_failed_member() {
    let healthy = MockStream::new("client-a");
    let doomed = MockStream::new("client-b");
    let aggregate = AggregatingPort::new("fanout");
    for stream in [&healthy, &doomed] {
        let port = StreamPort::open(stream.name(), stream.pair(), PortOptions::default()).unwrap();
        aggregate.add_member(Arc::new(port));
    }
    let input = Collector::new();
    aggregate.set_input_listener(Some(input.clone()));
    assert_eq!(aggregate.state(), HealthState::Ready);

    doomed.hang_up();
    assert!(wait_until(|| {
        aggregate.write(b"x").is_ok() && aggregate.member_count() == 1
    }));
    aggregate.drain().unwrap();

    assert_eq!(aggregate.state(), HealthState::Ready);
    assert!(healthy.written().ends_with(b"x"));

    healthy.push_incoming(b"$PFLAU");
    assert!(wait_until(|| input.len() == 6));

    aggregate.close();
    assert_eq!(aggregate.state(), HealthState::Failed);
}

#[test]
fn test_aggregate_without_members_is_not_connected() {
    let aggregate = AggregatingPort::new("fanout");
    assert_eq!(aggregate.state(), HealthState::Limbo);
    assert!(matches!(aggregate.write(b"x"), Err(PortError::NotConnected)));
}

#[test]
fn test_aggregate_closed_from_one_member_while_another_delivers() {
    use flightlink::port::InputListener;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Weak};

    // "slow" parks a callback on one member; "stop" closes from another.
    struct CloseOnStop {
        aggregate: Mutex<Weak<AggregatingPort>>,
        slow_started: AtomicBool,
        slow_finished: AtomicBool,
        report: Mutex<mpsc::Sender<bool>>,
    }

    impl InputListener for CloseOnStop {
        fn on_data_received(&self, data: &[u8]) {
            if data == b"slow" {
                self.slow_started.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(150));
                self.slow_finished.store(true, Ordering::SeqCst);
            } else if data == b"stop" {
                let aggregate = self.aggregate.lock().upgrade();
                if let Some(aggregate) = aggregate {
                    aggregate.close();
                }
                let _ = self
                    .report
                    .lock()
                    .send(self.slow_finished.load(Ordering::SeqCst));
            }
        }
    }

    let slow = MockStream::new("client-a");
    let stopper = MockStream::new("client-b");
    let aggregate = Arc::new(AggregatingPort::new("fanout"));
    for stream in [&slow, &stopper] {
        let port = StreamPort::open(stream.name(), stream.pair(), PortOptions::default()).unwrap();
        aggregate.add_member(Arc::new(port));
    }

    let (tx, rx) = mpsc::channel();
    let listener = Arc::new(CloseOnStop {
        aggregate: Mutex::new(Arc::downgrade(&aggregate)),
        slow_started: AtomicBool::new(false),
        slow_finished: AtomicBool::new(false),
        report: Mutex::new(tx),
    });
    aggregate.set_input_listener(Some(listener.clone()));

    slow.push_incoming(b"slow");
    assert!(wait_until(|| listener.slow_started.load(Ordering::SeqCst)));
    stopper.push_incoming(b"stop");

    let slow_done_before_close_returned = rx
        .recv_timeout(common::TIMEOUT)
        .expect("close from a member callback never returned");
    assert!(slow_done_before_close_returned);

    aggregate.close();
    assert_eq!(aggregate.state(), HealthState::Failed);
    assert_eq!(aggregate.member_count(), 0);
}

// ============================================================================
// ChunkedFlowBuffer
// ============================================================================

/// Records chunk writes; completions are driven by the test.
#[derive(Default)]
struct Characteristic {
    reads: Mutex<usize>,
    chunks: Mutex<Vec<Vec<u8>>>,
}

impl Characteristic {
    fn delivered(&self) -> usize {
        self.chunks.lock().iter().map(Vec::len).sum()
    }
}

impl GattCharacteristic for Characteristic {
    fn request_read(&self) -> Result<(), PortError> {
        *self.reads.lock() += 1;
        Ok(())
    }

    fn write_chunk(&self, chunk: &[u8]) -> Result<(), PortError> {
        self.chunks.lock().push(chunk.to_vec());
        Ok(())
    }
}

fn flow(link: &Arc<Characteristic>, capacity: usize, chunk_size: usize) -> ChunkedFlowBuffer {
    ChunkedFlowBuffer::new(
        link.clone(),
        FlowConfig {
            capacity,
            chunk_size,
            write_timeout: Duration::from_secs(3),
            drain_timeout: Duration::from_secs(3),
        },
    )
    .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_chunks_respect_mtu(
        writes in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..40), 1..6),
        chunk_size in 1usize..32,
    ) {
        let link = Arc::new(Characteristic::default());
        let buffer = flow(&link, 256, chunk_size);

        for data in &writes {
            let mut rest = data.as_slice();
            while !rest.is_empty() {
                let n = buffer.write(rest).unwrap();
                rest = &rest[n..];
            }
        }
        while buffer.begin_write_next_chunk() {}

        let chunks = link.chunks.lock().clone();
        prop_assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= chunk_size));
        prop_assert_eq!(chunks.concat(), writes.concat());
        prop_assert_eq!(*link.reads.lock(), 1);
        prop_assert!(!buffer.is_busy());
    }
}

#[test]
fn test_mtu_20_splits_45_bytes_into_three_chunks() {
    let link = Arc::new(Characteristic::default());
    let buffer = flow(&link, 256, 20);

    let payload = [0x55u8; 45];
    assert_eq!(buffer.write(&payload).unwrap(), 45);
    while buffer.begin_write_next_chunk() {}

    let sizes: Vec<usize> = link.chunks.lock().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![20, 20, 5]);
    buffer.drain().unwrap();
}

#[test]
fn test_writer_blocks_until_chunks_free_space() {
    let link = Arc::new(Characteristic::default());
    let buffer = Arc::new(flow(&link, 16, 5));
    let payload: Vec<u8> = (0u8..100).collect();

    let writer = {
        let buffer = buffer.clone();
        let payload = payload.clone();
        thread::spawn(move || -> Result<(), PortError> {
            let mut rest = payload.as_slice();
            while !rest.is_empty() {
                let n = buffer.write(rest)?;
                rest = &rest[n..];
            }
            Ok(())
        })
    };

    // play the link: complete one operation at a time
    assert!(wait_until(|| {
        buffer.begin_write_next_chunk();
        link.delivered() == payload.len()
    }));
    writer.join().unwrap().unwrap();

    assert_eq!(link.chunks.lock().concat(), payload);
}
