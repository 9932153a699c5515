// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Time source and bounded register polling.

use std::time::Duration;
use std::time::Instant;

/// A monotonic time source with blocking and busy-wait delays.
pub trait Clock: Send + Sync {
    /// Time elapsed since an arbitrary fixed point.
    fn now(&self) -> Duration;
    /// Blocks the calling thread. Not for use in interrupt context.
    fn sleep(&self, duration: Duration);
    /// Spins without yielding. Safe in interrupt context and under spinlocks.
    fn delay(&self, duration: Duration);
}

/// [`Clock`] backed by the host's monotonic clock.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    /// Creates a new clock.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn delay(&self, duration: Duration) {
        let end = Instant::now() + duration;
        while Instant::now() < end {
            std::hint::spin_loop();
        }
    }
}

/// A bounded poll that ran out of time.
#[derive(Debug, Copy, Clone)]
pub struct PollTimeout {
    /// The last value read.
    pub last: u32,
    /// Time spent polling.
    pub elapsed: Duration,
}

/// How a poll waits between reads.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PollWait {
    /// Sleep between reads.
    Sleep,
    /// Busy-wait between reads.
    Spin,
}

/// Bounds for a register poll.
#[derive(Debug, Copy, Clone)]
pub struct Poll {
    /// Interval between reads.
    pub interval: Duration,
    /// Overall timeout.
    pub timeout: Duration,
    /// Waiting style.
    pub wait: PollWait,
}

impl Poll {
    /// A sleeping poll.
    pub const fn sleeping(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            wait: PollWait::Sleep,
        }
    }

    /// A busy-wait poll.
    pub const fn spinning(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            wait: PollWait::Spin,
        }
    }

    /// Calls `read` until `done` accepts the value or the timeout expires.
    ///
    /// Once the deadline has passed the value is read one final time, so a
    /// condition that became true during the last wait is still observed.
    /// Never waits more than one interval past the timeout.
    pub fn run(
        &self,
        clock: &dyn Clock,
        mut read: impl FnMut() -> u32,
        mut done: impl FnMut(u32) -> bool,
    ) -> Result<u32, PollTimeout> {
        let start = clock.now();
        loop {
            let value = read();
            if done(value) {
                return Ok(value);
            }
            let elapsed = clock.now().saturating_sub(start);
            if elapsed > self.timeout {
                let value = read();
                return if done(value) {
                    Ok(value)
                } else {
                    Err(PollTimeout {
                        last: value,
                        elapsed,
                    })
                };
            }
            match self.wait {
                PollWait::Sleep => clock.sleep(self.interval),
                PollWait::Spin => clock.delay(self.interval),
            }
        }
    }
}
