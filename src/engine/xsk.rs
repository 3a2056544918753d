// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Engines on top of the `AF_XDP` ring transport
use super::{
    Backoff, DropStats, ForwardSummary, FrameReceiver, FrameSender, RunControl, BATCH_SIZE,
};
use crate::clock::Clock;
use crate::frame::{self, FrameTemplate, Payload};
use crate::scheduler::LaunchScheduler;
use crate::socket::xsk::{Outgoing, XskRx, XskTx};
use crate::socket::{Doorbell, Interest};
use crate::umem::Frame;
use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

/// How long outstanding frames are waited for when stopping
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Sends frames from the TX half of a socket
///
/// All frames are written with the template once, per packet only the
/// payload is updated.
#[derive(Debug)]
pub struct XskTransmitter<D> {
    tx: XskTx<D>,
    packet_len: u32,
    launch_time: bool,
    backoff: Backoff,
    pending: Vec<Outgoing>,
    drain_timeout: Duration,
}

impl<D: Doorbell> XskTransmitter<D> {
    /// Prepare all free frames of `tx` with `template`
    ///
    /// # Errors
    ///
    /// Will return `Err` if there are no frames for transmission or the
    /// packets do not fit into them.
    pub fn new(
        mut tx: XskTx<D>,
        template: &FrameTemplate,
        launch_time: bool,
        backoff: Backoff,
    ) -> Result<Self> {
        let mut frames = Vec::with_capacity(tx.free_frames());
        while let Some(frame) = tx.take_frame() {
            frames.push(frame);
        }
        if frames.is_empty() {
            return Err(anyhow!("No frames left for transmission"));
        }

        for mut frame in frames {
            template.write(tx.umem().buffer_mut(&mut frame)?, &Payload::default())?;
            tx.give_back(frame);
        }

        Ok(Self {
            tx,
            packet_len: u32::try_from(template.packet_size())?,
            launch_time,
            backoff,
            pending: Vec::with_capacity(1),
            drain_timeout: DRAIN_TIMEOUT,
        })
    }

    /// Wait at most `timeout` for outstanding frames in [`finish`](FrameSender::finish)
    #[must_use]
    pub const fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    fn next_free_frame(&mut self, run: &RunControl) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.tx.take_frame() {
                return Ok(Some(frame));
            }
            if self.tx.reclaim(BATCH_SIZE)? > 0 {
                continue;
            }
            if !run.is_running() {
                return Ok(None);
            }
            self.tx.wakeup()?;
            self.backoff.idle(self.tx.doorbell(), Interest::Writable)?;
        }
    }
}

impl<D: Doorbell> FrameSender for XskTransmitter<D> {
    fn send(&mut self, payload: &Payload, deadline: u64, run: &RunControl) -> Result<bool> {
        let Some(mut frame) = self.next_free_frame(run)? else {
            return Ok(false);
        };
        frame.set_len(self.packet_len);
        payload.write_to(self.tx.umem().data_mut(&mut frame)?)?;
        self.pending.push(Outgoing {
            frame,
            launch_time: self.launch_time.then_some(deadline),
        });

        while !self.pending.is_empty() {
            if self.tx.transmit(&mut self.pending)? > 0 {
                continue;
            }
            if !run.is_running() {
                for outgoing in self.pending.drain(..) {
                    self.tx.give_back(outgoing.frame);
                }
                return Ok(false);
            }
            // TX ring full
            self.tx.reclaim(BATCH_SIZE)?;
            self.tx.wakeup()?;
            self.backoff.idle(self.tx.doorbell(), Interest::Writable)?;
        }

        self.tx.reclaim(BATCH_SIZE)?;
        Ok(true)
    }

    fn finish(&mut self) -> Result<u64> {
        let started = Instant::now();
        while self.tx.outstanding() > 0 {
            if started.elapsed() > self.drain_timeout {
                log::warn!(
                    "{} frames not completed within {:?}",
                    self.tx.outstanding(),
                    self.drain_timeout
                );
                break;
            }
            if self.tx.reclaim(BATCH_SIZE)? == 0 {
                self.tx.wakeup()?;
                self.backoff.idle(self.tx.doorbell(), Interest::Writable)?;
            }
        }
        Ok(self.tx.completed())
    }
}

/// Receives frames from the RX half of a socket
#[derive(Debug)]
pub struct XskReceiver<D> {
    rx: XskRx<D>,
    backoff: Backoff,
    received: Vec<Frame>,
}

impl<D: Doorbell> XskReceiver<D> {
    /// Receive on `rx`
    pub fn new(rx: XskRx<D>, backoff: Backoff) -> Self {
        Self {
            rx,
            backoff,
            received: Vec::new(),
        }
    }
}

impl<D: Doorbell> FrameReceiver for XskReceiver<D> {
    fn poll_batch(
        &mut self,
        limit: u32,
        handler: &mut dyn FnMut(&[u8], u64) -> Result<()>,
    ) -> Result<u32> {
        let count = self.rx.receive(limit, &mut self.received)?;
        for frame in &self.received {
            handler(self.rx.umem().data(frame)?, self.rx.hw_timestamp(frame))?;
        }

        // the same buffers go straight back to the fill ring
        let recycled = self.rx.recycle(&mut self.received)?;
        if !self.received.is_empty() {
            return Err(anyhow!(
                "Fill ring took only {recycled} of {count} received frames"
            ));
        }
        Ok(count)
    }

    fn idle(&mut self) -> Result<()> {
        self.rx.wakeup()?;
        self.backoff.idle(self.rx.doorbell(), Interest::Readable)
    }
}

/// Parameters of the forwarder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOptions {
    /// Minimum time between arrival and retransmission
    pub turnaround: u64,

    /// Attach the forward deadline as launch time
    pub launch_time: bool,

    /// Stop after the frame with this sequence was forwarded
    pub frame_count: u32,
}

/// Sends every received frame back to its sender
///
/// The received buffer itself is retransmitted. It returns to the fill ring
/// once the kernel completed the transmission.
#[derive(Debug)]
pub struct XskForwarder<'a, C, D> {
    clock: &'a C,
    scheduler: LaunchScheduler,
    options: ForwardOptions,
    tx: XskTx<D>,
    rx: XskRx<D>,
    backoff: Backoff,
    received: Vec<Frame>,
    outgoing: Vec<Outgoing>,
    to_fill: Vec<Frame>,
    drops: DropStats,
    forwarded: u64,
    last_seen: bool,
}

impl<'a, C: Clock, D: Doorbell> XskForwarder<'a, C, D> {
    /// Forward between both halves of the same socket
    pub fn new(
        clock: &'a C,
        scheduler: LaunchScheduler,
        tx: XskTx<D>,
        rx: XskRx<D>,
        options: ForwardOptions,
        backoff: Backoff,
    ) -> Self {
        Self {
            clock,
            scheduler,
            options,
            tx,
            rx,
            backoff,
            received: Vec::new(),
            outgoing: Vec::new(),
            to_fill: Vec::new(),
            drops: DropStats::default(),
            forwarded: 0,
            last_seen: false,
        }
    }

    /// Forward until `run` is stopped or the last expected frame is out
    ///
    /// # Errors
    ///
    /// Will return `Err` on ring protocol violations or if the kernel can not be notified.
    pub fn run(&mut self, run: &RunControl) -> Result<ForwardSummary> {
        while run.is_running() && !(self.last_seen && self.outgoing.is_empty()) {
            if !self.step()? {
                self.idle()?;
            }
        }
        self.drain()?;

        log::info!(
            "Forwarded {} frames, dropped {} ({})",
            self.forwarded,
            self.drops.total(),
            self.drops
        );
        Ok(ForwardSummary {
            forwarded: self.forwarded,
            drops: self.drops,
        })
    }

    /// One pass over all four rings, returns `false` if nothing happened
    fn step(&mut self) -> Result<bool> {
        let reclaimed = self.tx.reclaim(BATCH_SIZE)?;
        while let Some(frame) = self.tx.take_frame() {
            self.to_fill.push(frame);
        }
        self.rx.recycle(&mut self.to_fill)?;

        let received = self.rx.receive(BATCH_SIZE, &mut self.received)?;
        for mut frame in self.received.drain(..) {
            let arrival = self.clock.now_ns()?;
            let data = self.rx.umem().data_mut(&mut frame)?;
            let payload = match frame::parse(data) {
                Ok(payload) => payload,
                Err(reason) => {
                    self.drops.count(reason);
                    self.to_fill.push(frame);
                    continue;
                }
            };

            frame::swap_addresses(data)?;
            frame::set_rx_timestamp(data, arrival)?;
            let deadline = self
                .scheduler
                .forward_deadline(arrival, self.options.turnaround);
            log::trace!(
                "Forwarding sequence {} arrived at {arrival} for {deadline}",
                payload.sequence
            );

            if payload.sequence >= self.options.frame_count {
                self.last_seen = true;
            }
            self.outgoing.push(Outgoing {
                frame,
                launch_time: self.options.launch_time.then_some(deadline),
            });
        }

        let sent = self.tx.transmit(&mut self.outgoing)?;
        self.forwarded += u64::from(sent);

        Ok(reclaimed > 0 || received > 0 || sent > 0)
    }

    fn idle(&mut self) -> Result<()> {
        self.tx.wakeup()?;
        self.rx.wakeup()?;
        self.backoff.idle(self.rx.doorbell(), Interest::Readable)
    }

    fn drain(&mut self) -> Result<()> {
        let started = Instant::now();
        while !self.outgoing.is_empty() || self.tx.outstanding() > 0 {
            if started.elapsed() > DRAIN_TIMEOUT {
                log::warn!(
                    "{} frames not forwarded, {} not completed",
                    self.outgoing.len(),
                    self.tx.outstanding()
                );
                break;
            }

            let sent = self.tx.transmit(&mut self.outgoing)?;
            self.forwarded += u64::from(sent);
            if self.tx.reclaim(BATCH_SIZE)? == 0 && sent == 0 {
                self.tx.wakeup()?;
                self.backoff.idle(self.tx.doorbell(), Interest::Writable)?;
            }
        }
        Ok(())
    }
}
