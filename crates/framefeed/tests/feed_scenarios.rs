// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 framefeed contributors

//! Cross-thread feed scenarios: wake-on-publish, parallel consumers,
//! frame integrity under load, and teardown liveness.
//!
//! The locks under test are process-shared futex words, so threads in one
//! process exercise exactly the same code paths as separate processes
//! mapping the same segment.

use framefeed::{FeedError, Frame, FrameFeed, RING_DEPTH};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

fn unique_name(tag: &str) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("framefeed-it-{tag}-{ts}")
}

#[test]
fn blocking_read_wakes_on_publish() {
    let name = unique_name("wake");
    let feed = FrameFeed::create(&name, 2, 2, 1).expect("create");

    let reader = {
        let name = name.clone();
        thread::spawn(move || {
            let feed = FrameFeed::open(&name).expect("open");
            let mut frame = Frame::new();
            feed.read(&mut frame, true).expect("blocking read");
            (frame.frame_uid(), frame.pixels().to_vec())
        })
    };

    // Let the reader park on the condvar before the publish lands.
    thread::sleep(Duration::from_millis(50));
    feed.publish(2, 2, 1, 1, &[5, 6, 7, 8]).expect("publish");

    let (uid, pixels) = reader.join().expect("reader panicked");
    assert_eq!(uid, 1);
    assert_eq!(pixels, vec![5, 6, 7, 8]);

    feed.destroy().expect("destroy");
}

#[test]
fn two_readers_observe_the_same_sequence() {
    let name = unique_name("pair");
    let feed = FrameFeed::create(&name, 4, 4, 1).expect("create");
    let rounds = 20u64;

    // Lockstep: the producer publishes the next frame only after both
    // consumers acknowledged the previous one, so neither can fall behind
    // the ring and the full uid sequence must be observed by both.
    let (ack_tx, ack_rx) = mpsc::channel::<u64>();
    let mut readers = Vec::new();
    for _ in 0..2 {
        let name = name.clone();
        let ack = ack_tx.clone();
        readers.push(thread::spawn(move || {
            let feed = FrameFeed::open(&name).expect("open");
            let mut frame = Frame::new();
            let mut seen = Vec::new();
            for _ in 0..rounds {
                feed.read(&mut frame, true).expect("read");
                seen.push(frame.frame_uid());
                ack.send(frame.frame_uid()).expect("ack");
            }
            seen
        }));
    }
    drop(ack_tx);

    for i in 1..=rounds {
        feed.publish(4, 4, 1, i, &[i as u8; 16]).expect("publish");
        for _ in 0..2 {
            assert_eq!(ack_rx.recv().expect("ack"), i);
        }
    }

    let expected: Vec<u64> = (1..=rounds).collect();
    for reader in readers {
        assert_eq!(reader.join().expect("reader panicked"), expected);
    }

    feed.destroy().expect("destroy");
}

#[test]
fn frames_are_never_torn_under_load() {
    let name = unique_name("integrity");
    let width = 64u32;
    let height = 64u32;
    let feed = FrameFeed::create(&name, width, height, 1).expect("create");
    let total = 2000u64;
    let image = feed.image_size();

    let mut readers = Vec::new();
    for _ in 0..2 {
        let name = name.clone();
        readers.push(thread::spawn(move || {
            let feed = FrameFeed::open(&name).expect("open");
            let mut frame = Frame::new();
            let mut last = 0u64;
            let mut reads = 0u64;
            while last < total {
                feed.read(&mut frame, true).expect("read");

                // Uids must advance strictly even when the catch-up rule
                // skipped ahead.
                assert!(frame.frame_uid() > last, "uid went backwards");
                last = frame.frame_uid();
                reads += 1;

                // Every published image is one repeated byte, so any mix of
                // two publishes is detectable in a single frame.
                let fill = (last % 251) as u8;
                assert!(
                    frame.pixels().iter().all(|&b| b == fill),
                    "torn frame at uid {last}"
                );
                assert_eq!(frame.acquisition_time(), last);
            }
            reads
        }));
    }

    for i in 1..=total {
        let fill = (i % 251) as u8;
        feed.publish(width, height, 1, i, &vec![fill; image])
            .expect("publish");
    }

    for reader in readers {
        let reads = reader.join().expect("reader panicked");
        assert!(reads > 0);
        assert!(reads <= total);
    }

    feed.destroy().expect("destroy");
}

#[test]
fn catch_up_skips_to_oldest_survivor() {
    let name = unique_name("skip");
    let feed = FrameFeed::create(&name, 2, 2, 1).expect("create");
    let published = 10u64;
    for i in 1..=published {
        feed.publish(2, 2, 1, i, &[i as u8; 4]).expect("publish");
    }

    let late = FrameFeed::open(&name).expect("open");
    let mut frame = Frame::new();
    late.read(&mut frame, true).expect("read");
    assert_eq!(frame.frame_uid(), published - RING_DEPTH as u64 + 1);
    drop(late);

    feed.destroy().expect("destroy");
}

#[test]
fn destroy_wakes_blocked_reader() {
    let name = unique_name("teardown");
    let feed = FrameFeed::create(&name, 2, 2, 1).expect("create");

    let reader = {
        let name = name.clone();
        thread::spawn(move || {
            let feed = FrameFeed::open(&name).expect("open");
            let mut frame = Frame::new();
            // Nothing was ever published; only teardown can end this wait.
            feed.read(&mut frame, true)
        })
    };

    thread::sleep(Duration::from_millis(50));
    feed.destroy().expect("destroy");

    let result = reader.join().expect("reader panicked");
    assert!(matches!(result, Err(FeedError::NotActive)));
}

#[test]
fn publish_refused_after_teardown_begins() {
    let name = unique_name("deadpub");
    let owner = FrameFeed::create(&name, 2, 2, 1).expect("create");
    let second = FrameFeed::open(&name).expect("open");

    owner.destroy().expect("destroy");

    assert!(matches!(
        second.publish(2, 2, 1, 1, &[0; 4]),
        Err(FeedError::NotActive)
    ));
    drop(second);
}
