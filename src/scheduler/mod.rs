// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
//! Launch times on an absolute grid
//!
//! All deadlines lie on `anchor + k * cycle_time`. The anchor is the next full
//! second after a startup margin, shifted by the TX offset, so independent
//! senders synchronized via PTP share the same grid.
//!
//! ```
//! use tsn_txrx::scheduler::LaunchScheduler;
//! let mut scheduler = LaunchScheduler::new(1_200_000_000, 100_000, 20_000, 50_000)?;
//! let first = scheduler.next_launch();
//! assert_eq!(first.deadline, 3_000_020_000);
//! assert_eq!(first.wake_at, 2_999_970_000);
//! assert_eq!(scheduler.next_launch().deadline, 3_000_120_000);
//! # Ok::<(), anyhow::Error>(())
//! ```
use crate::clock::NSEC_PER_SEC;
use anyhow::{anyhow, Result};

/// Minimum time between creation of the schedule and the first deadline
pub const STARTUP_MARGIN_NS: u64 = NSEC_PER_SEC;

/// When to wake up and when the frame has to leave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchTime {
    /// Absolute wake-up time, `early_wake_offset` before the deadline
    pub wake_at: u64,

    /// Absolute launch time of the frame
    pub deadline: u64,
}

/// Iterates the deadlines of a cyclic schedule
#[derive(Debug, Clone)]
pub struct LaunchScheduler {
    cycle_time: u64,
    tx_offset: u64,
    early_wake_offset: u64,
    next_deadline: u64,
}

impl LaunchScheduler {
    /// Create a schedule whose first deadline lies at least [`STARTUP_MARGIN_NS`] after `now`
    ///
    /// # Errors
    ///
    /// Will return `Err` if the cycle time is zero or the grid overflows.
    pub fn new(now: u64, cycle_time: u64, tx_offset: u64, early_wake_offset: u64) -> Result<Self> {
        if cycle_time == 0 {
            return Err(anyhow!("Cycle time must not be zero"));
        }

        let anchor = now
            .checked_add(STARTUP_MARGIN_NS)
            .map(crate::clock::seconds_aligned)
            .and_then(|second| second.checked_add(NSEC_PER_SEC))
            .and_then(|second| second.checked_add(tx_offset))
            .ok_or_else(|| anyhow!("Schedule anchor out of range"))?;

        log::debug!("First deadline at {anchor}, cycle time {cycle_time} ns");

        Ok(Self {
            cycle_time,
            tx_offset,
            early_wake_offset,
            next_deadline: anchor,
        })
    }

    /// The next launch time
    ///
    /// Always advances by exactly one cycle, regardless of how late it is called.
    pub fn next_launch(&mut self) -> LaunchTime {
        let deadline = self.next_deadline;
        self.next_deadline = deadline.saturating_add(self.cycle_time);
        LaunchTime {
            wake_at: deadline.saturating_sub(self.early_wake_offset),
            deadline,
        }
    }

    /// First grid point strictly after `arrival + turnaround`
    ///
    /// Used to retransmit a received frame on the same grid the sender uses.
    #[must_use]
    #[allow(clippy::integer_division)]
    pub fn forward_deadline(&self, arrival: u64, turnaround: u64) -> u64 {
        let earliest = arrival.saturating_add(turnaround);
        if earliest < self.tx_offset {
            return self.tx_offset;
        }
        let base = earliest - self.tx_offset;
        (base / self.cycle_time + 1)
            .saturating_mul(self.cycle_time)
            .saturating_add(self.tx_offset)
    }
}
