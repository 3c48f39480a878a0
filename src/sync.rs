// SPDX-License-Identifier: Apache-2.0

//! Thread synchronization primitives.

use std::sync::{Condvar, Mutex};

/// An auto-reset event.
///
/// `set` releases exactly one waiter; if nobody is waiting the signal is
/// latched until the next `wait` consumes it. This mirrors the kernel
/// synchronization-event semantics the wait-queue and out-call protocols
/// are specified against: a wake arriving before the sleep must not be
/// lost.
#[derive(Debug, Default)]
pub struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals the event, releasing one current or future waiter.
    pub fn set(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.cond.notify_one();
    }

    /// Blocks until the event is signaled, consuming the signal.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.cond.wait(signaled).unwrap();
        }
        *signaled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn set_before_wait_is_latched() {
        let event = Event::new();
        event.set();
        event.wait();
    }

    #[test]
    fn wait_blocks_until_set() {
        let event = Arc::new(Event::new());
        let setter = {
            let event = Arc::clone(&event);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                event.set();
            })
        };
        event.wait();
        setter.join().unwrap();
    }

    #[test]
    fn signal_is_consumed() {
        let event = Arc::new(Event::new());
        event.set();
        event.wait();

        // A second wait must block again until the next set.
        let waiter = {
            let event = Arc::clone(&event);
            thread::spawn(move || event.wait())
        };
        thread::sleep(Duration::from_millis(10));
        assert!(!waiter.is_finished());
        event.set();
        waiter.join().unwrap();
    }
}
