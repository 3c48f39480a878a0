// SPDX-License-Identifier: Apache-2.0

//! Sleep/wake primitives keyed by an opaque id.
//!
//! The secure OS implements its internal mutexes by parking normal-world
//! threads here: one call loop sleeps on a key while another wakes it.
//! The scheduler may deliver the wake before the sleep, so whichever side
//! arrives first creates the block; the latched event absorbs the race.

use crate::sync::Event;

use std::sync::{Arc, Mutex};

use tracing::trace;

struct WaitBlock {
    key: u64,
    event: Event,
}

/// The process-wide wait-block collection, one lock around it.
#[derive(Default)]
pub struct WaitQueues {
    blocks: Mutex<Vec<Arc<WaitBlock>>>,
}

impl WaitQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the block for `key`, creating it if it does not exist yet.
    fn get_or_create(&self, key: u64) -> Arc<WaitBlock> {
        let mut blocks = self.blocks.lock().unwrap();
        if let Some(block) = blocks.iter().find(|block| block.key == key) {
            return Arc::clone(block);
        }
        let block = Arc::new(WaitBlock {
            key,
            event: Event::new(),
        });
        blocks.push(Arc::clone(&block));
        block
    }

    /// Blocks the calling thread until `key` is woken. The sleeper
    /// destroys the block after waking.
    pub fn sleep(&self, key: u64) {
        trace!(key, "wait queue sleep");
        let block = self.get_or_create(key);
        block.event.wait();

        let mut blocks = self.blocks.lock().unwrap();
        if let Some(index) = blocks.iter().position(|other| Arc::ptr_eq(other, &block)) {
            blocks.remove(index);
        }
        trace!(key, "wait queue woke");
    }

    /// Wakes the sleeper for `key`, current or future.
    pub fn wake(&self, key: u64) {
        trace!(key, "wait queue wake");
        self.get_or_create(key).event.set();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }
}
