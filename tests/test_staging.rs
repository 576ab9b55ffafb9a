#![allow(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use quickcheck::{Arbitrary, Gen, QuickCheck};

use nanolog::StagingBuffer;

fn produce(buf: &StagingBuffer, bytes: &[u8]) {
    let ptr = buf.reserve_producer_space(bytes.len());
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
    }
    buf.finish_reservation(bytes.len());
}

#[derive(Debug, Clone)]
enum Op {
    Produce(u8),
    Drain,
}

impl Arbitrary for Op {
    fn arbitrary(g: &mut Gen) -> Op {
        if bool::arbitrary(g) {
            Op::Produce(u8::arbitrary(g))
        } else {
            Op::Drain
        }
    }
}

/// Single-threaded model check: every byte committed comes back out exactly
/// once and in commit order, across arbitrary interleavings of fills and
/// drains, wraps included.
#[test]
fn model_check_against_byte_queue() {
    fn prop(ops: Vec<Op>) -> bool {
        let buf = StagingBuffer::with_capacity(0, 512);
        let mut expected: VecDeque<u8> = VecDeque::new();
        let mut next_byte: u8 = 0;

        for op in ops {
            match op {
                Op::Produce(raw) => {
                    let len = 1 + (raw as usize % 64);
                    let ptr = match buf.try_reserve(len) {
                        Some(ptr) => ptr,
                        None => continue, // full behind the consumer
                    };
                    for i in 0..len {
                        unsafe { *ptr.add(i) = next_byte };
                        expected.push_back(next_byte);
                        next_byte = next_byte.wrapping_add(1);
                    }
                    buf.finish_reservation(len);
                }
                Op::Drain => {
                    let (ptr, len) = buf.peek();
                    let span = unsafe { std::slice::from_raw_parts(ptr, len) };
                    for &byte in span {
                        assert_eq!(Some(byte), expected.pop_front(), "out of order");
                    }
                    buf.consume(len);
                }
            }
        }

        // drain the tail; one extra peek picks up a span beyond a wrap
        for _ in 0..2 {
            let (ptr, len) = buf.peek();
            let span = unsafe { std::slice::from_raw_parts(ptr, len) };
            for &byte in span {
                assert_eq!(Some(byte), expected.pop_front(), "tail out of order");
            }
            buf.consume(len);
        }
        expected.is_empty()
    }

    QuickCheck::new()
        .tests(500)
        .quickcheck(prop as fn(Vec<Op>) -> bool);
}

/// A producer pounding a tiny ring while the consumer dawdles must block
/// (visible in the stall metric), and still lose or reorder nothing.
#[test]
fn blocked_producer_loses_nothing() {
    const RECORDS: usize = 2_000;
    const RECORD_LEN: usize = 513;

    let buf = Arc::new(StagingBuffer::with_capacity(1, 4096));

    let producer = thread::spawn({
        let buf = buf.clone();
        move || {
            for i in 0..RECORDS {
                let fill = (i % 251) as u8;
                let record = [fill; RECORD_LEN];
                produce(&buf, &record);
            }
        }
    });

    let mut collected = Vec::with_capacity(RECORDS * RECORD_LEN);
    let mut spans_seen = 0u64;
    while collected.len() < RECORDS * RECORD_LEN {
        let (ptr, len) = buf.peek();
        if len == 0 {
            thread::yield_now();
            continue;
        }
        collected.extend_from_slice(unsafe { std::slice::from_raw_parts(ptr, len) });
        buf.consume(len);

        spans_seen += 1;
        if spans_seen % 8 == 0 {
            // make the producer overrun us
            thread::sleep(Duration::from_micros(200));
        }
    }

    producer.join().unwrap();

    for (i, chunk) in collected.chunks(RECORD_LEN).enumerate() {
        let fill = (i % 251) as u8;
        assert!(chunk.iter().all(|&b| b == fill), "record {} corrupted", i);
    }
    assert!(
        buf.cycles_producer_blocked() > 0,
        "producer never blocked behind the slow consumer"
    );
}

/// Two-thread stream check with varying record sizes, enough volume to wrap
/// the ring hundreds of times.
#[test]
fn concurrent_stream_is_exact() {
    const TOTAL_BYTES: usize = 1 << 20;

    let buf = Arc::new(StagingBuffer::with_capacity(2, 8192));

    let producer = thread::spawn({
        let buf = buf.clone();
        move || {
            let mut sent = 0usize;
            let mut record = 0usize;
            while sent < TOTAL_BYTES {
                let len = 1 + (record * 37) % 700;
                let len = len.min(TOTAL_BYTES - sent).max(1);
                let ptr = buf.reserve_producer_space(len);
                for i in 0..len {
                    unsafe { *ptr.add(i) = ((sent + i) % 256) as u8 };
                }
                buf.finish_reservation(len);
                sent += len;
                record += 1;
            }
        }
    });

    let mut received = 0usize;
    while received < TOTAL_BYTES {
        let (ptr, len) = buf.peek();
        if len == 0 {
            thread::yield_now();
            continue;
        }
        let span = unsafe { std::slice::from_raw_parts(ptr, len) };
        for (i, &byte) in span.iter().enumerate() {
            assert_eq!(byte, ((received + i) % 256) as u8, "mismatch at byte {}", received + i);
        }
        buf.consume(len);
        received += len;
    }

    producer.join().unwrap();
    let (_, len) = buf.peek();
    assert_eq!(len, 0);
}

/// A buffer abandoned mid-stream stays alive for the consumer until it is
/// fully drained.
#[test]
fn abandoned_buffer_drains_before_reclaim() {
    let buf = Arc::new(StagingBuffer::with_capacity(3, 4096));

    thread::spawn({
        let buf = buf.clone();
        move || {
            for i in 0..10u8 {
                produce(&buf, &[i; 100]);
            }
            buf.mark_for_deallocation();
        }
    })
    .join()
    .unwrap();

    assert!(!buf.can_delete());

    let mut drained = 0;
    for _ in 0..2 {
        let (ptr, len) = buf.peek();
        let span = unsafe { std::slice::from_raw_parts(ptr, len) };
        drained += span.len();
        buf.consume(len);
    }
    assert_eq!(drained, 1000);
    assert!(buf.can_delete());
}
