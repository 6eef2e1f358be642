// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-size worker pool for blocking handshakes.
//!
//! The reactor submits one job per accepted connection. Workers pull jobs
//! from an unbounded crossbeam channel; a job runs to completion even when
//! the pool is being dropped.
//!
//! ```text
//!   reactor ──submit(job)──► [channel] ──► prototls-hs-0
//!                                      ├─► prototls-hs-1
//!                                      └─► prototls-hs-N
//! ```

use std::fmt;
use std::io;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};

/// Unit of work run on a pool thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of named worker threads.
pub struct HandshakePool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl HandshakePool {
    /// Spawn `size` workers (at least one).
    pub fn new(size: usize) -> io::Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = channel::unbounded::<Job>();

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("prototls-hs-{}", index))
                .spawn(move || worker_loop(&receiver))?;
            workers.push(handle);
        }

        log::debug!("[POOL] started {} handshake workers", size);
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Queue a job. Returns it back if the pool is shutting down.
    pub fn submit(&self, job: Job) -> Result<(), Job> {
        match &self.sender {
            Some(sender) => sender.send(job).map_err(|e| e.into_inner()),
            None => Err(job),
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Jobs submitted but not yet picked up by a worker.
    pub fn queued(&self) -> usize {
        self.sender.as_ref().map_or(0, Sender::len)
    }
}

fn worker_loop(receiver: &Receiver<Job>) {
    // Ends once every sender is dropped and the queue is drained.
    while let Ok(job) = receiver.recv() {
        job();
    }
}

impl Drop for HandshakePool {
    fn drop(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::warn!("[POOL] handshake worker panicked");
            }
        }
        log::debug!("[POOL] stopped");
    }
}

impl fmt::Debug for HandshakePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakePool")
            .field("size", &self.size())
            .field("queued", &self.queued())
            .finish()
    }
}
