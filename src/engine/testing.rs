// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! A kernel simulation driving the real ring code
//!
//! The kernel side of all four rings lives in [`FakeKernel`]. It only makes
//! progress when the application rings the [`FakeDoorbell`], which is what
//! the real kernel does with need-wakeup enabled.
use crate::socket::sys::{self, XdpDesc};
use crate::socket::xsk::{XskOptions, XskRx, XskTx};
use crate::socket::{Doorbell, Interest};
use crate::umem::ring::{test_ring, ConsumerRing, ProducerRing};
use crate::umem::{Umem, UmemGeometry, TX_METADATA_LEN};
use anyhow::{anyhow, Result};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Where the simulated driver places received packets inside a frame
pub(crate) const RX_HEADROOM: u64 = 256;

/// A frame the simulated NIC put on the wire
#[derive(Debug, Clone)]
pub(crate) struct Transmitted {
    pub(crate) data: Vec<u8>,
    pub(crate) launch_time: Option<u64>,
}

#[derive(Debug)]
pub(crate) struct FakeKernel {
    umem: Arc<Umem>,
    tx: ConsumerRing<XdpDesc>,
    completion: ProducerRing<u64>,
    rx: ProducerRing<XdpDesc>,
    fill: ConsumerRing<u64>,
    offered: VecDeque<u64>,
    wire: VecDeque<Vec<u8>>,
    owned: HashSet<u64>,
    max_owned: usize,
    hw_clock: u64,

    /// Transmitted frames are received again
    pub(crate) loopback: bool,

    /// Complete each batch in reverse order
    pub(crate) reverse_completions: bool,

    /// Never complete transmitted frames
    pub(crate) hold_completions: bool,

    /// Everything transmitted so far
    pub(crate) transmitted: Vec<Transmitted>,

    /// Frames handed to the kernel while it already owned them
    pub(crate) violations: u32,
}

impl FakeKernel {
    /// Queue a frame for reception
    pub(crate) fn inject(&mut self, frame: Vec<u8>) {
        self.wire.push_back(frame);
    }

    /// Most frames the kernel owned at the same time
    pub(crate) const fn max_owned(&self) -> usize {
        self.max_owned
    }

    fn take_ownership(&mut self, addr: u64) -> Result<()> {
        if !self.owned.insert(slot_base(&self.umem, addr)?) {
            self.violations += 1;
        }
        self.max_owned = self.max_owned.max(self.owned.len());
        Ok(())
    }

    /// Process all four rings once
    pub(crate) fn step(&mut self) -> Result<()> {
        let peeked = self.fill.peek(u32::MAX)?;
        let offered: Vec<u64> = peeked.iter().collect();
        peeked.release();
        for addr in offered {
            self.take_ownership(addr)?;
            self.offered.push_back(addr);
        }

        let peeked = self.tx.peek(u32::MAX)?;
        let descs: Vec<XdpDesc> = peeked.iter().collect();
        peeked.release();

        let mut done = Vec::with_capacity(descs.len());
        for desc in descs {
            self.take_ownership(desc.addr)?;
            let frame = self.umem.claim(desc.addr, desc.len)?;
            let data = self.umem.data(&frame)?.to_vec();
            let launch_time = if desc.options & sys::XDP_TX_METADATA == 0 {
                None
            } else {
                let meta = self.umem.headroom(&frame, TX_METADATA_LEN)?;
                Some(u64::from_ne_bytes(meta[16..24].try_into()?))
            };
            if self.loopback {
                self.wire.push_back(data.clone());
            }
            self.transmitted.push(Transmitted { data, launch_time });
            done.push(desc.addr);
        }

        if !self.hold_completions {
            if self.reverse_completions {
                done.reverse();
            }
            let mut reservation = self.completion.reserve(u32::try_from(done.len())?);
            for addr in done {
                self.owned.remove(&slot_base(&self.umem, addr)?);
                reservation
                    .push(addr)
                    .map_err(|_| anyhow!("completion ring full"))?;
            }
            reservation.submit();
        }

        self.deliver()
    }

    fn deliver(&mut self) -> Result<()> {
        let wanted = self.wire.len().min(self.offered.len());
        let mut reservation = self.rx.reserve(u32::try_from(wanted)?);
        while reservation.remaining() > 0 {
            let (Some(base), Some(packet)) = (self.offered.pop_front(), self.wire.pop_front())
            else {
                break;
            };
            let addr = base + RX_HEADROOM;
            let len = u32::try_from(packet.len())?;
            let mut frame = self.umem.claim(addr, len)?;
            self.umem.data_mut(&mut frame)?.copy_from_slice(&packet);
            self.hw_clock += 1;
            self.umem
                .headroom_mut(&mut frame, 8)?
                .copy_from_slice(&self.hw_clock.to_ne_bytes());

            self.owned.remove(&base);
            reservation
                .push(XdpDesc {
                    addr,
                    len,
                    options: 0,
                })
                .map_err(|_| anyhow!("RX ring full"))?;
        }
        reservation.submit();
        Ok(())
    }
}

fn slot_base(umem: &Umem, addr: u64) -> Result<u64> {
    Ok(umem.base_addr(umem.slot_of(addr)?))
}

/// Runs the kernel on every syscall
#[derive(Debug, Clone)]
pub(crate) struct FakeDoorbell {
    kernel: Arc<Mutex<FakeKernel>>,
}

impl FakeDoorbell {
    fn step(&self) -> Result<()> {
        self.kernel
            .lock()
            .map_err(|_| anyhow!("kernel poisoned"))?
            .step()
    }
}

impl Doorbell for FakeDoorbell {
    fn kick_tx(&self) -> Result<()> {
        self.step()
    }

    fn kick_rx(&self) -> Result<()> {
        self.step()
    }

    fn wait(&self, _interest: Interest, _timeout: Duration) -> Result<bool> {
        self.step()?;
        Ok(true)
    }
}

/// Both halves of a socket with `fill_frames` frames offered for reception
pub(crate) fn setup(
    geometry: UmemGeometry,
    fill_frames: u32,
    options: XskOptions,
) -> Result<(
    XskTx<FakeDoorbell>,
    XskRx<FakeDoorbell>,
    Arc<Mutex<FakeKernel>>,
)> {
    let (umem, mut pool) = Umem::new(geometry)?;
    let umem = Arc::new(umem);
    let size = geometry.frame_count;

    let (tx, kernel_tx) = test_ring(size)?;
    let (kernel_completion, completion) = test_ring(size)?;
    let (kernel_rx, rx) = test_ring(size)?;
    let (fill, kernel_fill) = test_ring(size)?;

    let kernel = Arc::new(Mutex::new(FakeKernel {
        umem: umem.clone(),
        tx: kernel_tx,
        completion: kernel_completion,
        rx: kernel_rx,
        fill: kernel_fill,
        offered: VecDeque::new(),
        wire: VecDeque::new(),
        owned: HashSet::new(),
        max_owned: 0,
        hw_clock: 0,
        loopback: false,
        reverse_completions: false,
        hold_completions: false,
        transmitted: Vec::new(),
        violations: 0,
    }));
    let doorbell = FakeDoorbell {
        kernel: kernel.clone(),
    };

    let tx_frames = pool.split_off(usize::try_from(size - fill_frames)?);
    let mut rx = XskRx::new(umem.clone(), rx, fill, doorbell.clone(), options)?;
    rx.prefill(pool)?;
    let tx = XskTx::new(umem, tx, completion, tx_frames, doorbell, options)?;
    Ok((tx, rx, kernel))
}
