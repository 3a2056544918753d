// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Transmit, receive and forward loops
//!
//! The loops in this module are transport agnostic. They talk to the
//! transports through [`FrameSender`] and [`FrameReceiver`], implemented for
//! the ring transport in [`xsk`] and for raw sockets in [`packet`].
//! The forwarder only exists for the ring transport since it resubmits the
//! received buffer without copying.
use crate::clock::Clock;
use crate::frame::{self, DropReason, Payload};
use crate::scheduler::LaunchScheduler;
use anyhow::{Context, Result};
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

pub mod backoff;
pub mod packet;
pub mod xsk;

#[cfg(test)]
mod testing;

pub use backoff::{Backoff, IdleStrategy};

/// Maximum number of frames handled per ring operation
pub const BATCH_SIZE: u32 = 64;

/// Shared flag telling all engines to keep going
///
/// Once stopped, it never runs again.
#[derive(Debug, Clone)]
pub struct RunControl {
    running: Arc<AtomicBool>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    /// A running flag
    #[must_use]
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Ask every engine to stop
    ///
    /// Returns `true` only for the call that actually stopped the run.
    pub fn stop(&self) -> bool {
        self.running.swap(false, Ordering::SeqCst)
    }

    /// `false` once [`stop`](Self::stop) was called
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

/// Measurement of one received frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyRecord {
    /// Software receive time minus sender transmit time
    pub latency_ns: i64,

    /// Sequence number of the frame
    pub sequence: u32,

    /// Queue the frame was sent on
    pub queue_id: u32,

    /// Transmit time stamped by the sender
    pub tx_timestamp: u64,

    /// Raw hardware receive timestamp, 0 if not available
    pub hw_rx_timestamp: u64,

    /// Software receive time
    pub sw_rx_timestamp: u64,
}

impl fmt::Display for LatencyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.latency_ns,
            self.sequence,
            self.queue_id,
            self.tx_timestamp,
            self.hw_rx_timestamp,
            self.sw_rx_timestamp
        )
    }
}

/// Destination of the latency records
#[cfg_attr(test, automock)]
pub trait RecordSink {
    /// Store one record
    ///
    /// # Errors
    ///
    /// Will return `Err` if the record could not be written.
    fn record(&mut self, record: &LatencyRecord) -> Result<()>;

    /// Write out everything buffered
    ///
    /// # Errors
    ///
    /// Will return `Err` if flushing fails.
    fn flush(&mut self) -> Result<()>;
}

/// Writes one tab-separated line per record
#[derive(Debug)]
pub struct WriterSink<W> {
    writer: W,
}

impl<W: Write> WriterSink<W> {
    /// Write records into `writer`, usually a buffered stdout
    pub const fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write> RecordSink for WriterSink<W> {
    fn record(&mut self, record: &LatencyRecord) -> Result<()> {
        writeln!(self.writer, "{record}").context("Writing latency record")
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().context("Flushing latency records")
    }
}

impl<S: RecordSink + ?Sized> RecordSink for &mut S {
    fn record(&mut self, record: &LatencyRecord) -> Result<()> {
        (**self).record(record)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// Collects records in memory
impl RecordSink for Vec<LatencyRecord> {
    fn record(&mut self, record: &LatencyRecord) -> Result<()> {
        self.push(*record);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Number of dropped frames per reason
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DropStats {
    /// See [`DropReason::Empty`]
    pub empty: u64,

    /// See [`DropReason::Truncated`]
    pub truncated: u64,

    /// See [`DropReason::ForeignEtherType`]
    pub foreign_ether_type: u64,

    /// See [`DropReason::SequenceOutOfRange`]
    pub sequence_out_of_range: u64,

    /// See [`DropReason::QueueOutOfRange`]
    pub queue_out_of_range: u64,
}

impl DropStats {
    /// Count one dropped frame
    pub fn count(&mut self, reason: DropReason) {
        log::debug!("Dropping {reason}");
        let counter = match reason {
            DropReason::Empty => &mut self.empty,
            DropReason::Truncated => &mut self.truncated,
            DropReason::ForeignEtherType(_) => &mut self.foreign_ether_type,
            DropReason::SequenceOutOfRange(_) => &mut self.sequence_out_of_range,
            DropReason::QueueOutOfRange(_) => &mut self.queue_out_of_range,
        };
        *counter += 1;
    }

    /// Number of all dropped frames
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.empty
            + self.truncated
            + self.foreign_ether_type
            + self.sequence_out_of_range
            + self.queue_out_of_range
    }
}

impl fmt::Display for DropStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} empty, {} truncated, {} foreign ethertype, {} sequence out of range, {} queue out of range",
            self.empty,
            self.truncated,
            self.foreign_ether_type,
            self.sequence_out_of_range,
            self.queue_out_of_range
        )
    }
}

/// Result of a transmit run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TxSummary {
    /// Frames handed to the kernel
    pub sent: u64,

    /// Frames the kernel reported as transmitted, equal to `sent` for raw sockets
    pub completed: u64,
}

/// Result of a receive run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RxSummary {
    /// Valid frames, one record each
    pub received: u64,

    /// Discarded frames
    pub drops: DropStats,
}

/// Result of a forward run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForwardSummary {
    /// Frames resubmitted for transmission
    pub forwarded: u64,

    /// Discarded frames
    pub drops: DropStats,
}

/// Signed difference `a - b`, saturating
fn signed_difference(a: u64, b: u64) -> i64 {
    if a >= b {
        i64::try_from(a - b).unwrap_or(i64::MAX)
    } else {
        i64::try_from(b - a).map_or(i64::MIN, |d| -d)
    }
}

/// Validates received frames and turns them into records
#[derive(Debug)]
pub struct RxProcessor<'a, C, S> {
    clock: &'a C,
    sink: S,
    frame_count: u32,
    received: u64,
    drops: DropStats,
    done: bool,
}

impl<'a, C: Clock, S: RecordSink> RxProcessor<'a, C, S> {
    /// Processor that is done after the frame with sequence `frame_count`
    pub fn new(clock: &'a C, sink: S, frame_count: u32) -> Self {
        Self {
            clock,
            sink,
            frame_count,
            received: 0,
            drops: DropStats::default(),
            done: false,
        }
    }

    /// Handle one received frame
    ///
    /// # Errors
    ///
    /// Will return `Err` if the clock can not be read or the record not be written.
    pub fn process(&mut self, frame: &[u8], hw_rx_timestamp: u64) -> Result<()> {
        let sw_rx_timestamp = self.clock.now_ns()?;
        let payload = match frame::parse(frame) {
            Ok(payload) => payload,
            Err(reason) => {
                self.drops.count(reason);
                return Ok(());
            }
        };

        self.sink.record(&LatencyRecord {
            latency_ns: signed_difference(sw_rx_timestamp, payload.tx_timestamp),
            sequence: payload.sequence,
            queue_id: payload.queue_id,
            tx_timestamp: payload.tx_timestamp,
            hw_rx_timestamp,
            sw_rx_timestamp,
        })?;
        self.received += 1;

        if payload.sequence >= self.frame_count {
            log::debug!("Received last expected sequence {}", payload.sequence);
            self.done = true;
        }
        Ok(())
    }

    /// The last expected frame arrived
    #[must_use]
    pub const fn done(&self) -> bool {
        self.done
    }

    /// Flush the sink and report
    ///
    /// # Errors
    ///
    /// Will return `Err` if the sink can not be flushed.
    pub fn finish(mut self) -> Result<RxSummary> {
        self.sink.flush()?;
        log::info!(
            "Received {} frames, dropped {} ({})",
            self.received,
            self.drops.total(),
            self.drops
        );
        Ok(RxSummary {
            received: self.received,
            drops: self.drops,
        })
    }
}

/// Transport side of the transmit loop
pub trait FrameSender {
    /// Queue a frame carrying `payload` for transmission at `deadline`
    ///
    /// Returns `false` if the run was stopped while waiting for room.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the frame could not be queued.
    fn send(&mut self, payload: &Payload, deadline: u64, run: &RunControl) -> Result<bool>;

    /// Wait a bounded time for outstanding frames
    ///
    /// Returns the number of frames the kernel reported as transmitted.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the completions can not be read.
    fn finish(&mut self) -> Result<u64>;
}

/// Transport side of the receive loop
pub trait FrameReceiver {
    /// Pass up to `limit` received frames together with their hardware timestamp to `handler`
    ///
    /// Returns the number of frames passed.
    ///
    /// # Errors
    ///
    /// Will return `Err` if receiving fails or `handler` does.
    fn poll_batch(
        &mut self,
        limit: u32,
        handler: &mut dyn FnMut(&[u8], u64) -> Result<()>,
    ) -> Result<u32>;

    /// Called when nothing was received
    ///
    /// # Errors
    ///
    /// Will return `Err` if waiting fails.
    fn idle(&mut self) -> Result<()>;
}

/// Send `frame_count` frames on the grid of `scheduler`
///
/// Sequence numbers start at 1. Stops early when `run` is stopped.
///
/// # Errors
///
/// Will return `Err` if sleeping or sending fails.
pub fn transmit<C: Clock, S: FrameSender + ?Sized>(
    clock: &C,
    scheduler: &mut LaunchScheduler,
    sender: &mut S,
    frame_count: u32,
    queue_id: u32,
    run: &RunControl,
) -> Result<TxSummary> {
    let mut sent = 0;

    for sequence in 1..=frame_count {
        if !run.is_running() {
            log::info!("Stopping transmission after {sent} frames");
            break;
        }

        let launch = scheduler.next_launch();
        clock.sleep_until(launch.wake_at)?;

        let payload = Payload {
            queue_id,
            sequence,
            tx_timestamp: clock.now_ns()?,
            rx_timestamp: 0,
        };
        if !sender.send(&payload, launch.deadline, run)? {
            break;
        }
        sent += 1;
    }

    let completed = sender.finish()?;
    log::info!("Transmitted {sent} frames, {completed} completed");
    Ok(TxSummary { sent, completed })
}

/// Receive until the last expected frame arrived or `run` is stopped
///
/// # Errors
///
/// Will return `Err` if receiving or writing a record fails.
pub fn receive<C: Clock, S: RecordSink, R: FrameReceiver + ?Sized>(
    mut processor: RxProcessor<'_, C, S>,
    receiver: &mut R,
    run: &RunControl,
) -> Result<RxSummary> {
    while run.is_running() && !processor.done() {
        let count = receiver.poll_batch(BATCH_SIZE, &mut |frame, hw_rx_timestamp| {
            processor.process(frame, hw_rx_timestamp)
        })?;
        if count == 0 {
            receiver.idle()?;
        }
    }

    processor.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fake::FakeClock;
    use crate::clock::MockClock;
    use crate::frame::FrameTemplateBuilder;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::collections::VecDeque;

    fn frame(sequence: u32, tx_timestamp: u64) -> Result<Vec<u8>> {
        FrameTemplateBuilder::new().build().build(&Payload {
            queue_id: 1,
            sequence,
            tx_timestamp,
            rx_timestamp: 0,
        })
    }

    /// Hands out queued frames one batch at a time
    struct QueuedReceiver {
        frames: VecDeque<Vec<u8>>,
        idles: u32,
        run: Option<RunControl>,
    }

    impl FrameReceiver for QueuedReceiver {
        fn poll_batch(
            &mut self,
            limit: u32,
            handler: &mut dyn FnMut(&[u8], u64) -> Result<()>,
        ) -> Result<u32> {
            let mut count = 0;
            while count < limit {
                let Some(frame) = self.frames.pop_front() else {
                    break;
                };
                handler(&frame, 42)?;
                count += 1;
            }
            Ok(count)
        }

        fn idle(&mut self) -> Result<()> {
            self.idles += 1;
            if let Some(run) = &self.run {
                run.stop();
            }
            Ok(())
        }
    }

    #[test]
    fn test_stop_is_idempotent() {
        let run = RunControl::new();
        let clone = run.clone();
        assert!(clone.is_running());
        assert!(run.stop());
        assert!(!clone.stop());
        assert!(!run.is_running());
        assert!(!clone.is_running());
    }

    #[test]
    fn test_record_format() -> Result<()> {
        let mut sink = WriterSink::new(Vec::new());
        sink.record(&LatencyRecord {
            latency_ns: -5,
            sequence: 7,
            queue_id: 2,
            tx_timestamp: 100,
            hw_rx_timestamp: 0,
            sw_rx_timestamp: 95,
        })?;
        sink.flush()?;
        assert_eq!(String::from_utf8(sink.writer)?, "-5\t7\t2\t100\t0\t95\n");
        Ok(())
    }

    #[test]
    fn test_signed_difference() {
        assert_eq!(signed_difference(10, 3), 7);
        assert_eq!(signed_difference(3, 10), -7);
        assert_eq!(signed_difference(u64::MAX, 0), i64::MAX);
        assert_eq!(signed_difference(0, u64::MAX), i64::MIN);
    }

    #[test_log::test]
    fn test_processor_records_and_drops() -> Result<()> {
        let clock = FakeClock::new(1_000, 10);
        let mut sink = MockRecordSink::new();
        sink.expect_record()
            .withf(|r| r.sequence == 1 && r.latency_ns == 510 && r.hw_rx_timestamp == 9)
            .times(1)
            .returning(|_| Ok(()));
        sink.expect_flush().times(1).returning(|| Ok(()));

        let mut processor = RxProcessor::new(&clock, sink, 2);
        processor.process(&frame(1, 500)?, 9)?;
        assert!(!processor.done());

        let mut foreign = frame(2, 500)?;
        foreign[16..18].copy_from_slice(&0x88f7_u16.to_be_bytes());
        processor.process(&foreign, 0)?;
        processor.process(&[], 0)?;
        assert!(!processor.done());

        let summary = processor.finish()?;
        assert_eq!(summary.received, 1);
        assert_eq!(summary.drops.foreign_ether_type, 1);
        assert_eq!(summary.drops.empty, 1);
        assert_eq!(summary.drops.total(), 2);
        Ok(())
    }

    #[test]
    fn test_fresh_processor_has_no_drops() -> Result<()> {
        let clock = FakeClock::new(0, 1);
        let summary = RxProcessor::new(&clock, Vec::new(), 10).finish()?;
        assert_eq!(summary, RxSummary::default());
        assert_eq!(summary.drops.total(), 0);
        Ok(())
    }

    #[test]
    fn test_receive_stops_at_frame_count() -> Result<()> {
        let clock = FakeClock::new(0, 1);
        let mut receiver = QueuedReceiver {
            frames: (1..=10).map(|s| frame(s, 0)).collect::<Result<_>>()?,
            idles: 0,
            run: None,
        };
        let mut records = Vec::new();
        let summary = receive(
            RxProcessor::new(&clock, &mut records, 5),
            &mut receiver,
            &RunControl::new(),
        )?;

        // the whole batch is handled, sequence 5 ends the run afterwards
        assert_eq!(summary.received, 10);
        assert_eq!(receiver.idles, 0);
        assert!(records.windows(2).all(|w| w[0].sequence < w[1].sequence));
        Ok(())
    }

    #[test]
    fn test_receive_stops_on_run_control() -> Result<()> {
        let clock = FakeClock::new(0, 1);
        let run = RunControl::new();
        let mut receiver = QueuedReceiver {
            frames: VecDeque::from([frame(1, 0)?]),
            idles: 0,
            run: Some(run.clone()),
        };
        let summary = receive(
            RxProcessor::new(&clock, Vec::new(), 1000),
            &mut receiver,
            &run,
        )?;
        assert_eq!(summary.received, 1);
        assert_eq!(receiver.idles, 1);
        Ok(())
    }

    struct RecordingSender {
        sent: Vec<(Payload, u64)>,
        stop_after: Option<(usize, RunControl)>,
    }

    impl FrameSender for RecordingSender {
        fn send(&mut self, payload: &Payload, deadline: u64, _run: &RunControl) -> Result<bool> {
            self.sent.push((*payload, deadline));
            if let Some((limit, run)) = &self.stop_after {
                if self.sent.len() == *limit {
                    run.stop();
                }
            }
            Ok(true)
        }

        fn finish(&mut self) -> Result<u64> {
            Ok(u64::try_from(self.sent.len())?)
        }
    }

    #[test]
    fn test_transmit_follows_grid() -> Result<()> {
        let clock = FakeClock::new(0, 3);
        let mut scheduler = LaunchScheduler::new(0, 100_000, 0, 10_000)?;
        let mut sender = RecordingSender {
            sent: Vec::new(),
            stop_after: None,
        };

        let summary = transmit(
            &clock,
            &mut scheduler,
            &mut sender,
            100,
            3,
            &RunControl::new(),
        )?;
        assert_eq!(summary.sent, 100);
        assert_eq!(summary.completed, 100);

        for (i, (payload, deadline)) in sender.sent.iter().enumerate() {
            assert_eq!(payload.sequence, u32::try_from(i)? + 1);
            assert_eq!(payload.queue_id, 3);
            // woken 10 us early, the clock only moves a few ns per read
            assert!(payload.tx_timestamp < *deadline);
            assert!(payload.tx_timestamp >= deadline - 10_000);
        }
        assert!(sender
            .sent
            .windows(2)
            .all(|w| w[1].1 - w[0].1 == 100_000));
        Ok(())
    }

    #[test]
    fn test_transmit_sleeps_absolute() -> Result<()> {
        let mut clock = MockClock::new();
        let mut seq = Sequence::new();
        clock
            .expect_sleep_until()
            .with(eq(2_000_000_000 - 500))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        clock
            .expect_now_ns()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(1_999_999_600));

        let mut scheduler = LaunchScheduler::new(0, 100_000, 0, 500)?;
        let mut sender = RecordingSender {
            sent: Vec::new(),
            stop_after: None,
        };
        transmit(
            &clock,
            &mut scheduler,
            &mut sender,
            1,
            0,
            &RunControl::new(),
        )?;
        assert_eq!(sender.sent[0].0.tx_timestamp, 1_999_999_600);
        Ok(())
    }

    #[test]
    fn test_transmit_stops_within_one_iteration() -> Result<()> {
        let clock = FakeClock::new(0, 1);
        let run = RunControl::new();
        let mut scheduler = LaunchScheduler::new(0, 100_000, 0, 0)?;
        let mut sender = RecordingSender {
            sent: Vec::new(),
            stop_after: Some((3, run.clone())),
        };
        let summary = transmit(&clock, &mut scheduler, &mut sender, 1000, 0, &run)?;
        assert_eq!(summary.sent, 3);

        // stopping again changes nothing
        assert!(!run.stop());
        let summary = transmit(&clock, &mut scheduler, &mut sender, 1000, 0, &run)?;
        assert_eq!(summary.sent, 0);
        Ok(())
    }
}
