// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Readiness multiplexing over `poll(2)`.
//!
//! Each reactor tick runs one cycle:
//!
//! ```text
//! reset() ──► mark(fd)* ──► wait(timeout) ──► can_read(fd)*
//!    ▲                                              │
//!    └──────────────────── next tick ───────────────┘
//! ```
//!
//! Marks never survive a `reset()`, so a descriptor closed during one tick
//! cannot be reported ready in the next.

use std::fmt;
use std::io;
use std::time::Duration;

use crate::connection::Descriptor;

/// Events that make a descriptor worth reading: data, hangup, or error.
const READ_EVENTS: libc::c_short = libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL;

/// Set of descriptors watched for readability.
#[derive(Default)]
pub struct ReadinessSet {
    fds: Vec<libc::pollfd>,
    max: Option<Descriptor>,
    /// Indexed by descriptor, valid after `wait`
    ready: Vec<bool>,
}

impl ReadinessSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fds: Vec::with_capacity(capacity),
            max: None,
            ready: Vec::new(),
        }
    }

    /// Forget every mark and every readiness result.
    pub fn reset(&mut self) {
        self.fds.clear();
        self.ready.clear();
        self.max = None;
    }

    /// Watch `fd` for readability. Negative descriptors are ignored.
    pub fn mark(&mut self, fd: Descriptor) {
        if fd < 0 {
            return;
        }
        self.fds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
        self.max = Some(self.max.map_or(fd, |m| m.max(fd)));
    }

    /// Number of marked descriptors.
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Highest descriptor marked since the last reset.
    pub fn max_descriptor(&self) -> Option<Descriptor> {
        self.max
    }

    /// Block until a marked descriptor is readable or `timeout` elapses.
    ///
    /// Returns the number of ready descriptors, 0 on timeout. `EINTR`
    /// surfaces as an `Interrupted` error.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<usize> {
        self.ready.clear();
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        // SAFETY: `fds` is a live, exclusively borrowed buffer of `fds.len()`
        // pollfd entries for the duration of the call.
        let rc = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };

        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        if rc > 0 {
            let slots = self.max.map_or(0, |m| m as usize + 1);
            self.ready.resize(slots, false);
            for pfd in &self.fds {
                if pfd.revents & READ_EVENTS != 0 {
                    self.ready[pfd.fd as usize] = true;
                }
            }
        }

        Ok(rc as usize)
    }

    /// Whether `fd` was reported readable by the last `wait`.
    pub fn can_read(&self, fd: Descriptor) -> bool {
        usize::try_from(fd)
            .ok()
            .and_then(|i| self.ready.get(i).copied())
            .unwrap_or(false)
    }
}

impl fmt::Debug for ReadinessSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessSet")
            .field("marked", &self.fds.len())
            .field("max", &self.max)
            .finish()
    }
}
