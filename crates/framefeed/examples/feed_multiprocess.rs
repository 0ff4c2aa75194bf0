// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 framefeed contributors

//! Multi-process frame feed demo.
//!
//! Terminal 1 (producer):
//! ```bash
//! cargo run --example feed_multiprocess -- produce
//! ```
//!
//! Terminal 2..n (consumers):
//! ```bash
//! cargo run --example feed_multiprocess -- consume
//! ```
//!
//! The producer creates `/dev/shm/buffer-demo` and publishes a synthetic
//! moving gradient at ~30 fps; consumers block on new frames and print
//! uid, producer timestamp, and publish-to-read latency. Kill the producer
//! with Ctrl+C and run `status` / `cleanup` to watch poisoning and
//! recovery.

use framefeed::{feed_exists, feed_is_alive, feed_is_poisoned, FeedError, Frame, FrameFeed};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const FEED_NAME: &str = "demo";
const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;
const DEPTH: u32 = 1;

fn main() {
    env_logger::init();
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("produce") => produce(),
        Some("consume") => consume(),
        Some("status") => status(),
        Some("cleanup") => cleanup(),
        _ => {
            println!("Usage: {} <produce|consume|status|cleanup>", args[0]);
            println!();
            println!("  produce - create the feed and publish synthetic frames");
            println!("  consume - read frames and print latency");
            println!("  status  - report exists/alive/poisoned for the feed");
            println!("  cleanup - destroy the feed if its producer died");
        }
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn produce() {
    let feed = match FrameFeed::create(FEED_NAME, WIDTH, HEIGHT, DEPTH) {
        Ok(feed) => feed,
        Err(e) => {
            eprintln!("cannot create feed {FEED_NAME:?}: {e}");
            eprintln!("hint: run `cleanup` if a previous producer crashed");
            return;
        }
    };
    println!("producing {WIDTH}x{HEIGHT}x{DEPTH} frames at {}", feed.path().display());
    println!("press Ctrl+C to stop (consumers will see the feed as poisoned)");

    let mut pixels = vec![0u8; feed.image_size()];
    let mut tick = 0u64;
    loop {
        // Horizontal gradient scrolling one pixel per frame.
        for (i, px) in pixels.iter_mut().enumerate() {
            let x = i as u64 % WIDTH as u64;
            *px = ((x + tick) % 256) as u8;
        }

        match feed.publish(WIDTH, HEIGHT, DEPTH, now_nanos(), &pixels) {
            Ok(uid) => {
                if uid % 30 == 0 {
                    println!("[TX] frame {uid}");
                }
            }
            Err(e) => {
                eprintln!("[TX] publish failed: {e}");
                return;
            }
        }

        tick += 1;
        std::thread::sleep(Duration::from_millis(33));
    }
}

fn consume() {
    let wait_start = Instant::now();
    while !feed_exists(FEED_NAME) {
        if wait_start.elapsed() > Duration::from_secs(10) {
            eprintln!("no feed after 10s; is the producer running?");
            return;
        }
        println!("waiting for producer...");
        std::thread::sleep(Duration::from_millis(500));
    }

    let feed = match FrameFeed::open(FEED_NAME) {
        Ok(feed) => feed,
        Err(e) => {
            eprintln!("cannot open feed: {e}");
            return;
        }
    };
    println!(
        "consuming {}x{}x{} frames from {}",
        feed.width(),
        feed.height(),
        feed.depth(),
        feed.path().display()
    );

    let mut frame = Frame::new();
    let mut received = 0u64;
    let started = Instant::now();
    loop {
        match feed.read(&mut frame, true) {
            Ok(()) => {
                received += 1;
                let latency_us =
                    now_nanos().saturating_sub(frame.acquisition_time()) / 1_000;
                if frame.frame_uid() % 30 == 0 {
                    let rate = received as f64 / started.elapsed().as_secs_f64();
                    println!(
                        "[RX] frame {} latency {latency_us} us ({rate:.1} fps)",
                        frame.frame_uid()
                    );
                }
            }
            Err(FeedError::NotActive) => {
                println!("feed went away after {received} frames");
                if feed.is_poisoned() {
                    println!("feed is poisoned; destroying it");
                    if let Err(e) = feed.destroy() {
                        eprintln!("destroy failed: {e}");
                    }
                }
                return;
            }
            Err(e) => {
                eprintln!("[RX] read failed: {e}");
                return;
            }
        }
    }
}

fn status() {
    println!("feed {FEED_NAME:?}:");
    println!("  exists:   {}", feed_exists(FEED_NAME));
    match feed_is_alive(FEED_NAME) {
        Ok(alive) => println!("  alive:    {alive}"),
        Err(e) => println!("  alive:    ({e})"),
    }
    match feed_is_poisoned(FEED_NAME) {
        Ok(poisoned) => println!("  poisoned: {poisoned}"),
        Err(e) => println!("  poisoned: ({e})"),
    }
}

fn cleanup() {
    if !feed_exists(FEED_NAME) {
        println!("nothing to clean up");
        return;
    }
    let feed = match FrameFeed::open(FEED_NAME) {
        Ok(feed) => feed,
        Err(e) => {
            eprintln!("cannot open feed: {e}");
            return;
        }
    };
    if feed.is_owner() || feed.is_poisoned() {
        match feed.destroy() {
            Ok(()) => println!("feed destroyed"),
            Err(e) => eprintln!("destroy failed: {e}"),
        }
    } else {
        println!(
            "feed is healthy and owned by PID {}; stop the producer instead",
            feed.owner_pid()
        );
    }
}
