// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
//! Access to the system clock that timestamps and launch times refer to
//!
//! The clock is expected to be disciplined by an external PTP stack
//! (e.g. `phc2sys`), so it is only read here and never adjusted.
//!
//! ```
//! use tsn_txrx::clock::{Clock, ClockKind, SystemClock, NSEC_PER_SEC};
//! let clock = SystemClock::new(ClockKind::Realtime);
//! let now = clock.now_ns()?;
//! assert!(tsn_txrx::clock::seconds_aligned(now) <= now);
//! clock.sleep_until(now)?; // already passed, returns immediately
//! # Ok::<(), anyhow::Error>(())
//! ```
use anyhow::{anyhow, Context, Result};
use clap::ValueEnum;
use nix::errno::Errno;
use nix::libc;
use nix::sys::time::TimeSpec;
use nix::time::{clock_gettime, ClockId};
use serde::{Deserialize, Serialize};
use std::ptr;

#[cfg(test)]
use mockall::automock;

/// Nanoseconds per second
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Clock that all timestamps, wake-ups and launch times of a session refer to
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ClockKind {
    /// `CLOCK_REALTIME`
    #[default]
    Realtime,

    /// `CLOCK_TAI`, what the ETF qdisc expects for launch times
    Tai,
}

impl ClockKind {
    /// Corresponding clock id
    #[must_use]
    pub const fn id(self) -> ClockId {
        match self {
            Self::Realtime => ClockId::CLOCK_REALTIME,
            Self::Tai => ClockId::CLOCK_TAI,
        }
    }
}

/// Source of the current time and of absolute-time sleeps
#[cfg_attr(test, automock)]
pub trait Clock {
    /// Current time in nanoseconds
    ///
    /// # Errors
    ///
    /// Will return `Err` if the clock can not be read.
    fn now_ns(&self) -> Result<u64>;

    /// Sleep until the clock reaches `deadline_ns`
    ///
    /// Returns immediately if the deadline has already passed.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the sleep fails for any other reason than an interruption.
    fn sleep_until(&self, deadline_ns: u64) -> Result<()>;
}

/// The operating system clock
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    kind: ClockKind,
}

impl SystemClock {
    /// Create a new `SystemClock` for the given clock
    #[must_use]
    pub const fn new(kind: ClockKind) -> Self {
        Self { kind }
    }
}

impl Clock for SystemClock {
    fn now_ns(&self) -> Result<u64> {
        let ts = clock_gettime(self.kind.id()).context("Reading clock")?;
        timespec_to_ns(&ts)
    }

    fn sleep_until(&self, deadline_ns: u64) -> Result<()> {
        let deadline = ns_to_timespec(deadline_ns)?;

        loop {
            // SAFETY:
            // deadline is a valid timespec for the whole call and the remaining
            // time is never written for TIMER_ABSTIME, so it may be null.
            let ret = unsafe {
                libc::clock_nanosleep(
                    self.kind.id().as_raw(),
                    libc::TIMER_ABSTIME,
                    &deadline,
                    ptr::null_mut(),
                )
            };

            match ret {
                0 => return Ok(()),
                libc::EINTR => continue,
                errno => {
                    return Err(anyhow!(Errno::from_i32(errno)))
                        .context("Sleeping until absolute deadline")
                }
            }
        }
    }
}

/// Start of the second `now_ns` lies in
#[must_use]
pub const fn seconds_aligned(now_ns: u64) -> u64 {
    now_ns - now_ns % NSEC_PER_SEC
}

fn timespec_to_ns(ts: &TimeSpec) -> Result<u64> {
    let sec = u64::try_from(ts.tv_sec()).context("Negative clock seconds")?;
    let nsec = u64::try_from(ts.tv_nsec()).context("Negative clock nanoseconds")?;
    sec.checked_mul(NSEC_PER_SEC)
        .and_then(|ns| ns.checked_add(nsec))
        .ok_or_else(|| anyhow!("Clock value out of range"))
}

#[allow(clippy::integer_division)]
fn ns_to_timespec(ns: u64) -> Result<libc::timespec> {
    Ok(libc::timespec {
        tv_sec: (ns / NSEC_PER_SEC).try_into()?,
        tv_nsec: (ns % NSEC_PER_SEC).try_into()?,
    })
}

/// Test clock that only moves when it is read or slept on
#[cfg(test)]
pub(crate) mod fake {
    use super::Clock;
    use anyhow::Result;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug)]
    pub(crate) struct FakeClock {
        now: AtomicU64,
        step: u64,
    }

    impl FakeClock {
        /// Every read advances the clock by `step` nanoseconds
        pub(crate) const fn new(start: u64, step: u64) -> Self {
            Self {
                now: AtomicU64::new(start),
                step,
            }
        }

        pub(crate) fn peek(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }

        /// Jump forward without a read
        pub(crate) fn advance(&self, delta: u64) {
            self.now.fetch_add(delta, Ordering::SeqCst);
        }
    }

    impl Clock for FakeClock {
        fn now_ns(&self) -> Result<u64> {
            Ok(self.now.fetch_add(self.step, Ordering::SeqCst) + self.step)
        }

        fn sleep_until(&self, deadline_ns: u64) -> Result<()> {
            self.now.fetch_max(deadline_ns, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::time::TimeValLike;

    #[test]
    fn test_seconds_aligned() {
        assert_eq!(seconds_aligned(0), 0);
        assert_eq!(seconds_aligned(1_999_999_999), NSEC_PER_SEC);
        assert_eq!(seconds_aligned(5 * NSEC_PER_SEC), 5 * NSEC_PER_SEC);
    }

    #[test]
    fn test_timespec_conversion() -> Result<()> {
        let ts = ns_to_timespec(3 * NSEC_PER_SEC + 42)?;
        assert_eq!(ts.tv_sec, 3);
        assert_eq!(ts.tv_nsec, 42);
        assert_eq!(
            timespec_to_ns(&TimeSpec::nanoseconds(3_000_000_042))?,
            3 * NSEC_PER_SEC + 42
        );
        Ok(())
    }

    #[test]
    fn test_system_clock_sleep_in_the_past_returns() -> Result<()> {
        let clock = SystemClock::new(ClockKind::Realtime);
        let before = clock.now_ns()?;
        clock.sleep_until(before - NSEC_PER_SEC)?;
        assert!(clock.now_ns()? >= before);
        Ok(())
    }

    #[test]
    fn test_system_clock_sleeps_until_deadline() -> Result<()> {
        let clock = SystemClock::new(ClockKind::Tai);
        let deadline = clock.now_ns()? + 2_000_000;
        clock.sleep_until(deadline)?;
        assert!(clock.now_ns()? >= deadline);
        Ok(())
    }

    #[test]
    fn test_fake_clock() -> Result<()> {
        let clock = fake::FakeClock::new(100, 10);
        assert_eq!(clock.now_ns()?, 110);
        clock.sleep_until(50)?;
        assert_eq!(clock.peek(), 110);
        clock.sleep_until(500)?;
        assert_eq!(clock.now_ns()?, 510);
        clock.advance(90);
        assert_eq!(clock.peek(), 600);
        Ok(())
    }
}
