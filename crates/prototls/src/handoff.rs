// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Worker-to-reactor hand-off queue.
//!
//! Handshake workers push established connections; the reactor pops them
//! without blocking at the start of its next tick. The lock is held only
//! for the push/pop itself.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Mutex-guarded FIFO shared between producers and a single consumer.
#[derive(Debug)]
pub struct HandoffQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> HandoffQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Append an item. Callable from any thread.
    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
    }

    /// Remove the front item if there is one. Never blocks on emptiness.
    pub fn try_pop_front(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T> Default for HandoffQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
