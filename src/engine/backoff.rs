// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! What an engine does while it has nothing to do
use crate::socket::{Doorbell, Interest};
use anyhow::Result;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configured way of idling, see [`Backoff`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum IdleStrategy {
    /// Busy loop
    Spin,

    /// Give up the time slice
    #[default]
    Yield,

    /// Bounded wait in `poll()`
    Block,
}

/// Idle strategy shared by all engines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Busy loop, lowest latency at the cost of a full core
    Spin,

    /// Give up the time slice
    Yield,

    /// Wait in `poll()` for the socket to become ready, at most the given time
    Block(Duration),
}

impl Backoff {
    /// Backoff for `strategy`, `timeout` only applies to blocking
    #[must_use]
    pub const fn new(strategy: IdleStrategy, timeout: Duration) -> Self {
        match strategy {
            IdleStrategy::Spin => Self::Spin,
            IdleStrategy::Yield => Self::Yield,
            IdleStrategy::Block => Self::Block(timeout),
        }
    }

    /// Back off once
    ///
    /// # Errors
    ///
    /// Will return `Err` if waiting on the socket fails.
    pub fn idle<D: Doorbell + ?Sized>(self, doorbell: &D, interest: Interest) -> Result<()> {
        match self {
            Self::Spin => std::hint::spin_loop(),
            Self::Yield => std::thread::yield_now(),
            Self::Block(timeout) => {
                if !doorbell.wait(interest, timeout)? {
                    log::trace!("No {interest:?} event within {timeout:?}");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::MockDoorbell;
    use mockall::predicate::eq;

    #[test]
    fn test_block_waits_on_socket() -> Result<()> {
        let mut doorbell = MockDoorbell::new();
        doorbell
            .expect_wait()
            .with(eq(Interest::Readable), eq(Duration::from_millis(5)))
            .times(1)
            .returning(|_, _| Ok(false));

        Backoff::new(IdleStrategy::Block, Duration::from_millis(5))
            .idle(&doorbell, Interest::Readable)
    }

    #[test]
    fn test_yield_and_spin_never_touch_socket() -> Result<()> {
        let doorbell = MockDoorbell::new();
        let backoff = Backoff::new(IdleStrategy::Yield, Duration::from_secs(1));
        assert_eq!(backoff, Backoff::Yield);
        backoff.idle(&doorbell, Interest::Writable)?;

        let backoff = Backoff::new(IdleStrategy::Spin, Duration::from_secs(1));
        assert_eq!(backoff, Backoff::Spin);
        backoff.idle(&doorbell, Interest::Readable)
    }

    #[test]
    fn test_wait_error_propagates() {
        let mut doorbell = MockDoorbell::new();
        doorbell
            .expect_wait()
            .returning(|_, _| Err(anyhow::anyhow!("poll failed")));
        assert!(Backoff::Block(Duration::ZERO)
            .idle(&doorbell, Interest::Writable)
            .is_err());
    }
}
