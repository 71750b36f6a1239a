// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Demonstration driver: producer and consumer threads sharing a pipe, woken by a
//! condvar-based activation transport.
//!
//! The activation transport itself is explicitly out of scope for the library —
//! this demo wires the simplest possible one (a `Condvar`) so the example is
//! self-contained without pulling in an eventfd/epoll dependency.
//!
//! # Usage
//!
//! ```text
//! cargo run --example producer_consumer
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use flowpipe::{Pipe, SharedPool};

struct Kick {
    mutex: Mutex<bool>,
    condvar: Condvar,
}

impl Kick {
    fn new() -> Self {
        Self {
            mutex: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn notify(&self) {
        let mut ready = self.mutex.lock().unwrap();
        *ready = true;
        self.condvar.notify_all();
    }

    fn wait_timeout(&self, timeout: Duration) {
        let mut ready = self.mutex.lock().unwrap();
        if !*ready {
            let (guard, _) = self.condvar.wait_timeout(ready, timeout).unwrap();
            ready = guard;
        }
        *ready = false;
    }
}

fn run_producer(pipe: Pipe, pool: SharedPool, run: Arc<AtomicBool>, id: usize) {
    let mut sequence: u64 = 0;
    while run.load(Ordering::Relaxed) {
        sequence += 1;
        let payload = format!("producer {id} - number {sequence}");
        if let Some(mut msg) = pool.allocate(payload.len()) {
            msg.data_mut()[..payload.len()].copy_from_slice(payload.as_bytes());
            msg.set_len(payload.len());
            pipe.submit(msg);
        }
        thread::sleep(Duration::from_micros(200));
    }
}

fn run_consumer(pipe: Pipe, kick: Arc<Kick>, run: Arc<AtomicBool>, id: usize) {
    while run.load(Ordering::Relaxed) {
        kick.wait_timeout(Duration::from_millis(200));
        while let Some(msg) = pipe.peek() {
            let text = String::from_utf8_lossy(msg.data()).into_owned();
            log::info!("consumer {id} - {text}");
        }
    }
}

fn main() {
    env_logger::init();

    let pool = SharedPool::new(128).unwrap();
    let kick = Arc::new(Kick::new());
    let activation_kick = kick.clone();
    let pipe = Pipe::with_activation(&pool, 2, Some(move |_: &Pipe| activation_kick.notify()))
        .unwrap();

    let run = Arc::new(AtomicBool::new(true));
    let mut workers = Vec::new();

    for id in 0..2 {
        let pipe = pipe.clone();
        let kick = kick.clone();
        let run = run.clone();
        workers.push(thread::spawn(move || run_consumer(pipe, kick, run, id)));
    }
    for id in 0..2 {
        let pipe = pipe.clone();
        let pool = pool.clone();
        let run = run.clone();
        workers.push(thread::spawn(move || run_producer(pipe, pool, run, id)));
    }

    thread::sleep(Duration::from_secs(3));
    run.store(false, Ordering::Relaxed);
    kick.notify();

    for worker in workers {
        worker.join().unwrap();
    }

    log::info!("{} messages left in pipe", pipe.count());
    while let Some(msg) = pipe.peek() {
        log::info!("main - {}", String::from_utf8_lossy(msg.data()));
    }
}
