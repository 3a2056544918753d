// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Engines on top of raw `AF_PACKET` sockets
use super::{Backoff, FrameReceiver, FrameSender, RunControl};
use crate::frame::{FrameTemplate, Payload};
use crate::socket::packet::PacketIo;
use crate::socket::{is_transient, Doorbell, Interest};
use anyhow::Result;
use nix::errno::Errno;
use std::time::Duration;

/// How long to wait for the hardware timestamp of a transmitted frame
pub const TX_TIMESTAMP_TIMEOUT: Duration = Duration::from_millis(10);

/// Large enough for every supported packet size
const RECEIVE_BUFFER_LEN: usize = 2048;

fn is_backpressure(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<Errno>()
        .map_or(false, |errno| is_transient(*errno))
}

/// Sends copies of a prepared frame
#[derive(Debug)]
pub struct PacketTransmitter<S> {
    socket: S,
    frame: Vec<u8>,
    launch_time: bool,
    hw_timestamps: bool,
    backoff: Backoff,
    sent: u64,
}

impl<S: PacketIo + Doorbell> PacketTransmitter<S> {
    /// Send frames built from `template` on `socket`
    ///
    /// # Errors
    ///
    /// Will return `Err` if the template can not be built.
    pub fn new(
        socket: S,
        template: &FrameTemplate,
        launch_time: bool,
        hw_timestamps: bool,
        backoff: Backoff,
    ) -> Result<Self> {
        Ok(Self {
            socket,
            frame: template.build(&Payload::default())?,
            launch_time,
            hw_timestamps,
            backoff,
            sent: 0,
        })
    }
}

impl<S: PacketIo + Doorbell> FrameSender for PacketTransmitter<S> {
    fn send(&mut self, payload: &Payload, deadline: u64, run: &RunControl) -> Result<bool> {
        payload.write_to(&mut self.frame)?;
        let launch_time = self.launch_time.then_some(deadline);

        loop {
            match self.socket.send(&self.frame, launch_time) {
                Ok(()) => break,
                Err(e) if is_backpressure(&e) => {
                    if !run.is_running() {
                        return Ok(false);
                    }
                    self.backoff.idle(&self.socket, Interest::Writable)?;
                }
                Err(e) => return Err(e),
            }
        }
        self.sent += 1;

        if self.hw_timestamps {
            match self.socket.tx_hw_timestamp(TX_TIMESTAMP_TIMEOUT)? {
                Some(timestamp) => log::debug!(
                    "Sequence {} transmitted at {timestamp} (deadline {deadline})",
                    payload.sequence
                ),
                None => log::debug!("No TX timestamp for sequence {}", payload.sequence),
            }
        }
        Ok(true)
    }

    fn finish(&mut self) -> Result<u64> {
        Ok(self.sent)
    }
}

/// Receives frames one by one into a buffer
#[derive(Debug)]
pub struct PacketReceiver<S> {
    socket: S,
    buffer: Vec<u8>,
    backoff: Backoff,
}

impl<S: PacketIo + Doorbell> PacketReceiver<S> {
    /// Receive on `socket`
    pub fn new(socket: S, backoff: Backoff) -> Self {
        Self {
            socket,
            buffer: vec![0; RECEIVE_BUFFER_LEN],
            backoff,
        }
    }
}

impl<S: PacketIo + Doorbell> FrameReceiver for PacketReceiver<S> {
    fn poll_batch(
        &mut self,
        limit: u32,
        handler: &mut dyn FnMut(&[u8], u64) -> Result<()>,
    ) -> Result<u32> {
        let mut count = 0;
        while count < limit {
            let Some(received) = self.socket.recv(&mut self.buffer)? else {
                break;
            };
            handler(&self.buffer[..received.len], received.hw_timestamp)?;
            count += 1;
        }
        Ok(count)
    }

    fn idle(&mut self) -> Result<()> {
        self.backoff.idle(&self.socket, Interest::Readable)
    }
}
