// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! `AF_XDP` socket bound to one queue of one interface
//!
//! After binding, the socket is split into a TX half owning the TX and
//! completion rings and an RX half owning the RX and fill rings. Both halves
//! can be moved to different threads without any locking. The remaining
//! [`XskGuard`] releases the socket and its classifier.
use super::sys::{
    self, SockaddrXdp, XdpBindFlags, XdpDesc, XdpMmapOffsets, XdpRingOffset, XdpStatistics,
    XdpUmemReg, SOL_XDP,
};
use super::{raise_memlock_limit, Doorbell, SocketDoorbell};
use crate::classifier::Classifier;
use crate::umem::ring::{ConsumerRing, ProducerRing, RingLayout};
use crate::umem::{Frame, FramePool, MmapRegion, SlotLedger, Umem, UmemGeometry, TX_METADATA_LEN};
use anyhow::{anyhow, Context, Result};
use clap::ValueEnum;
use flagset::FlagSet;
use nix::errno::Errno;
use nix::libc;
use serde::{Deserialize, Serialize};
use std::mem::size_of;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::ptr;
use std::sync::Arc;

/// How the socket is bound to the driver
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum XdpMode {
    /// Generic XDP, frames are copied by the stack
    SkbCopy,

    /// Driver XDP, frames are copied by the driver
    NativeCopy,

    /// Driver XDP, the NIC DMAs directly into the UMEM
    #[default]
    ZeroCopy,
}

impl XdpMode {
    /// Flags for `bind`
    #[must_use]
    pub fn bind_flags(self, need_wakeup: bool) -> FlagSet<XdpBindFlags> {
        let mut flags = match self {
            Self::SkbCopy | Self::NativeCopy => FlagSet::from(XdpBindFlags::Copy),
            Self::ZeroCopy => FlagSet::from(XdpBindFlags::ZeroCopy),
        };
        if need_wakeup {
            flags |= XdpBindFlags::UseNeedWakeup;
        }
        flags
    }
}

/// Everything needed to bind an [`XskSocket`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XskConfig {
    /// Interface to bind to
    pub interface: String,

    /// Queue of the interface
    pub queue: u32,

    /// Binding mode
    pub mode: XdpMode,

    /// Only kick the kernel if it asks for it
    pub need_wakeup: bool,

    /// Hardware receive timestamps are stored in front of the packet data
    pub hw_timestamps: bool,

    /// UMEM dimensions, the frame count also sizes all rings
    pub geometry: UmemGeometry,

    /// Number of frames offered for reception, the rest is kept for transmission
    pub fill_frames: u32,
}

/// Options shared by both halves
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XskOptions {
    /// See [`XskConfig::need_wakeup`]
    pub need_wakeup: bool,

    /// See [`XskConfig::hw_timestamps`]
    pub hw_timestamps: bool,
}

/// A frame queued for transmission
#[derive(Debug)]
pub struct Outgoing {
    /// The packet, its length must be set
    pub frame: Frame,

    /// Absolute launch time on the session clock
    pub launch_time: Option<u64>,
}

/// A bound socket before splitting
#[derive(Debug)]
pub struct XskSocket {
    tx: XskTx<SocketDoorbell>,
    rx: XskRx<SocketDoorbell>,
    guard: XskGuard,
}

impl XskSocket {
    /// Register a UMEM, set up all rings, bind and install the classifier
    ///
    /// # Errors
    ///
    /// Will return `Err` if any step fails, e.g. due to missing privileges,
    /// an unavailable queue or missing zero-copy support of the driver.
    pub fn bind(config: &XskConfig, classifier: Box<dyn Classifier + Send>) -> Result<Self> {
        config.geometry.validate()?;
        let ifindex = super::nametoindex(&config.interface)?;
        raise_memlock_limit()?;

        let (umem, mut pool) = Umem::new(config.geometry)?;
        let umem = Arc::new(umem);

        // SAFETY:
        // Plain socket creation, the returned fd is checked below.
        let fd = unsafe { libc::socket(libc::AF_XDP, libc::SOCK_RAW | libc::SOCK_CLOEXEC, 0) };
        let fd = Errno::result(fd).context("Creating AF_XDP socket")?;
        // SAFETY:
        // The fd was just returned by the kernel and is owned by nothing else.
        let fd = Arc::new(unsafe { OwnedFd::from_raw_fd(fd) });

        register_umem(&fd, &umem)?;

        let size = config.geometry.frame_count;
        for (option, name) in [
            (sys::XDP_UMEM_FILL_RING, "fill"),
            (sys::XDP_UMEM_COMPLETION_RING, "completion"),
            (sys::XDP_RX_RING, "RX"),
            (sys::XDP_TX_RING, "TX"),
        ] {
            sys::setsockopt(fd.as_fd(), SOL_XDP, option, &size)
                .with_context(|| format!("Setting size of {name} ring to {size}"))?;
        }

        let offsets: XdpMmapOffsets = sys::getsockopt(fd.as_fd(), SOL_XDP, sys::XDP_MMAP_OFFSETS)
            .context("Reading ring offsets")?;

        let fill = ProducerRing::new(
            map_ring::<u64>(&fd, &offsets.fr, size, sys::XDP_UMEM_PGOFF_FILL_RING)?,
            layout(&offsets.fr)?,
            size,
        )?;
        let completion = ConsumerRing::new(
            map_ring::<u64>(&fd, &offsets.cr, size, sys::XDP_UMEM_PGOFF_COMPLETION_RING)?,
            layout(&offsets.cr)?,
            size,
        )?;
        let rx_ring = ConsumerRing::new(
            map_ring::<XdpDesc>(&fd, &offsets.rx, size, sys::XDP_PGOFF_RX_RING)?,
            layout(&offsets.rx)?,
            size,
        )?;
        let tx_ring = ProducerRing::new(
            map_ring::<XdpDesc>(&fd, &offsets.tx, size, sys::XDP_PGOFF_TX_RING)?,
            layout(&offsets.tx)?,
            size,
        )?;
        log::debug!("Mapped rings of {size} entries");

        let options = XskOptions {
            need_wakeup: config.need_wakeup,
            hw_timestamps: config.hw_timestamps,
        };
        let doorbell = SocketDoorbell::new(fd.clone());

        // lower slots are offered for reception, upper slots kept for transmission
        let tx_frames = pool.split_off(usize::try_from(
            config.geometry.frame_count.saturating_sub(config.fill_frames),
        )?);
        let mut rx = XskRx::new(umem.clone(), rx_ring, fill, doorbell.clone(), options)?;
        rx.prefill(pool)?;
        let tx = XskTx::new(umem.clone(), tx_ring, completion, tx_frames, doorbell, options)?;

        let flags = config.mode.bind_flags(config.need_wakeup);
        let addr = SockaddrXdp {
            family: u16::try_from(libc::AF_XDP)?,
            flags: flags.bits(),
            ifindex,
            queue_id: config.queue,
            shared_umem_fd: 0,
        };
        // SAFETY:
        // addr is a valid sockaddr_xdp of the given length for the duration of the call.
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                libc::socklen_t::try_from(size_of::<SockaddrXdp>())?,
            )
        };
        Errno::result(ret).with_context(|| {
            format!(
                "Binding to {} queue {} in {:?} mode",
                config.interface, config.queue, config.mode
            )
        })?;
        log::debug!(
            "Bound AF_XDP socket to {} queue {} with flags {:?}",
            config.interface,
            config.queue,
            flags
        );

        let mut guard = XskGuard {
            fd,
            classifier,
            umem,
        };
        guard
            .classifier
            .install(&config.interface, config.queue, guard.fd.as_raw_fd())?;

        Ok(Self { tx, rx, guard })
    }

    /// Split into independently usable halves
    ///
    /// The guard must be dropped after both halves.
    #[must_use]
    pub fn split(self) -> (XskTx<SocketDoorbell>, XskRx<SocketDoorbell>, XskGuard) {
        (self.tx, self.rx, self.guard)
    }
}

fn register_umem(fd: &OwnedFd, umem: &Umem) -> Result<()> {
    let geometry = umem.geometry();
    #[allow(clippy::as_conversions)] // pointer to address
    let addr = umem.region().as_ptr() as usize;
    let reg = XdpUmemReg {
        addr: u64::try_from(addr)?,
        len: u64::try_from(umem.region().len())?,
        chunk_size: geometry.frame_size,
        headroom: 0,
        flags: if geometry.tx_metadata {
            sys::XDP_UMEM_TX_METADATA_LEN
        } else {
            0
        },
        tx_metadata_len: if geometry.tx_metadata {
            TX_METADATA_LEN
        } else {
            0
        },
    };

    sys::setsockopt(fd.as_fd(), SOL_XDP, sys::XDP_UMEM_REG, &reg).with_context(|| {
        format!(
            "Registering UMEM of {} frames with {} bytes",
            geometry.frame_count, geometry.frame_size
        )
    })?;
    log::debug!("Registered UMEM {reg:?}");
    Ok(())
}

fn layout(offset: &XdpRingOffset) -> Result<RingLayout> {
    Ok(RingLayout {
        producer: usize::try_from(offset.producer)?,
        consumer: usize::try_from(offset.consumer)?,
        flags: usize::try_from(offset.flags)?,
        desc: usize::try_from(offset.desc)?,
    })
}

fn map_ring<T>(
    fd: &OwnedFd,
    offset: &XdpRingOffset,
    size: u32,
    pgoff: i64,
) -> Result<Arc<MmapRegion>> {
    let len = layout(offset)?.mapping_len::<T>(size)?;
    Ok(Arc::new(
        MmapRegion::shared(fd.as_fd(), len, pgoff)
            .with_context(|| format!("Mapping ring at {pgoff:#x}"))?,
    ))
}

/// Write the `xsk_tx_metadata` block requesting `launch_time`
fn write_launch_time(umem: &Umem, frame: &mut Frame, launch_time: u64) -> Result<()> {
    let meta = umem.headroom_mut(frame, TX_METADATA_LEN)?;
    meta.fill(0);
    meta[0..8].copy_from_slice(&sys::XDP_TXMD_FLAGS_LAUNCH_TIME.to_ne_bytes());
    meta[16..24].copy_from_slice(&launch_time.to_ne_bytes());
    Ok(())
}

/// Transmitting half, owns the TX and completion rings
#[derive(Debug)]
pub struct XskTx<D> {
    umem: Arc<Umem>,
    tx: ProducerRing<XdpDesc>,
    completion: ConsumerRing<u64>,
    ledger: SlotLedger,
    free: FramePool,
    doorbell: D,
    options: XskOptions,
    completed: u64,
}

impl<D: Doorbell> XskTx<D> {
    /// Create the TX half from its rings
    ///
    /// # Errors
    ///
    /// Will return `Err` if the UMEM is too large.
    pub(crate) fn new(
        umem: Arc<Umem>,
        tx: ProducerRing<XdpDesc>,
        completion: ConsumerRing<u64>,
        free: FramePool,
        doorbell: D,
        options: XskOptions,
    ) -> Result<Self> {
        let ledger = SlotLedger::new("TX ring", umem.geometry().frame_count)?;
        Ok(Self {
            umem,
            tx,
            completion,
            ledger,
            free,
            doorbell,
            options,
            completed: 0,
        })
    }

    /// The shared UMEM
    #[must_use]
    pub fn umem(&self) -> &Umem {
        &self.umem
    }

    /// Doorbell of the socket
    #[must_use]
    pub const fn doorbell(&self) -> &D {
        &self.doorbell
    }

    /// Take a frame that is not in use
    pub fn take_frame(&mut self) -> Option<Frame> {
        self.free.pop()
    }

    /// Return a frame that was taken but not transmitted
    pub fn give_back(&mut self, frame: Frame) {
        self.free.push(frame);
    }

    /// Number of frames ready for use
    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.free.len()
    }

    /// Number of frames handed to the kernel and not completed yet
    #[must_use]
    pub const fn outstanding(&self) -> usize {
        self.ledger.in_flight()
    }

    /// Total number of completed frames
    #[must_use]
    pub const fn completed(&self) -> u64 {
        self.completed
    }

    /// Kick the kernel if frames are outstanding and it may be waiting for it
    ///
    /// # Errors
    ///
    /// Will return `Err` if the kernel could not be notified.
    pub fn wakeup(&self) -> Result<()> {
        if self.outstanding() > 0 && (!self.options.need_wakeup || self.tx.needs_wakeup()) {
            self.doorbell.kick_tx()?;
        }
        Ok(())
    }

    /// Move up to `limit` completed frames back into the free pool
    ///
    /// Completions are accepted in any order.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the kernel completes a frame that was not transmitted.
    pub fn reclaim(&mut self, limit: u32) -> Result<u32> {
        let peeked = self.completion.peek(limit)?;
        for addr in peeked.iter() {
            let slot = self.umem.slot_of(addr)?;
            self.ledger.take_back(slot)?;
            let mut frame = self.umem.claim(self.umem.base_addr(slot), 0)?;
            self.umem.reset_for_tx(&mut frame);
            self.free.push(frame);
        }
        let count = peeked.release();
        self.completed += u64::from(count);
        Ok(count)
    }

    /// Hand as many frames from the front of `outgoing` to the kernel as fit
    ///
    /// Frames that did not fit stay in `outgoing`, order is preserved.
    /// Returns the number of submitted frames.
    ///
    /// # Errors
    ///
    /// Will return `Err` if a launch time is requested without TX metadata
    /// or the kernel could not be notified.
    pub fn transmit(&mut self, outgoing: &mut Vec<Outgoing>) -> Result<u32> {
        if outgoing.is_empty() {
            return Ok(0);
        }

        let mut reservation = self.tx.reserve(u32::try_from(outgoing.len())?);
        let granted = usize::try_from(reservation.len())?;

        for Outgoing {
            mut frame,
            launch_time,
        } in outgoing.drain(..granted)
        {
            let options = match launch_time {
                Some(launch_time) if self.umem.geometry().tx_metadata => {
                    write_launch_time(&self.umem, &mut frame, launch_time)?;
                    sys::XDP_TX_METADATA
                }
                Some(_) => return Err(anyhow!("Launch time requires UMEM with TX metadata")),
                None => 0,
            };

            self.ledger.hand_over(frame.slot())?;
            reservation
                .push(XdpDesc {
                    addr: self.umem.addr(&frame),
                    len: frame.len(),
                    options,
                })
                .map_err(|desc| anyhow!("TX ring full despite reservation for {desc:?}"))?;
        }

        let count = reservation.submit();
        if count > 0 && (!self.options.need_wakeup || self.tx.needs_wakeup()) {
            self.doorbell.kick_tx()?;
        }
        Ok(count)
    }
}

/// Receiving half, owns the RX and fill rings
#[derive(Debug)]
pub struct XskRx<D> {
    umem: Arc<Umem>,
    rx: ConsumerRing<XdpDesc>,
    fill: ProducerRing<u64>,
    ledger: SlotLedger,
    doorbell: D,
    options: XskOptions,
}

impl<D: Doorbell> XskRx<D> {
    /// Create the RX half from its rings
    ///
    /// # Errors
    ///
    /// Will return `Err` if the UMEM is too large.
    pub(crate) fn new(
        umem: Arc<Umem>,
        rx: ConsumerRing<XdpDesc>,
        fill: ProducerRing<u64>,
        doorbell: D,
        options: XskOptions,
    ) -> Result<Self> {
        let ledger = SlotLedger::new("fill ring", umem.geometry().frame_count)?;
        Ok(Self {
            umem,
            rx,
            fill,
            ledger,
            doorbell,
            options,
        })
    }

    /// Offer all frames of `pool` for reception
    ///
    /// # Errors
    ///
    /// Will return `Err` if the fill ring can not take all frames.
    pub(crate) fn prefill(&mut self, mut pool: FramePool) -> Result<()> {
        let mut frames = Vec::with_capacity(pool.len());
        while let Some(frame) = pool.pop() {
            frames.push(frame);
        }
        let offered = self.recycle(&mut frames)?;
        if !frames.is_empty() {
            return Err(anyhow!(
                "Fill ring took only {offered} of {} frames",
                frames.len() + usize::try_from(offered)?
            ));
        }
        log::debug!("Offered {offered} frames for reception");
        Ok(())
    }

    /// The shared UMEM
    #[must_use]
    pub fn umem(&self) -> &Umem {
        &self.umem
    }

    /// Doorbell of the socket
    #[must_use]
    pub const fn doorbell(&self) -> &D {
        &self.doorbell
    }

    /// Number of frames offered to or filled by the kernel
    #[must_use]
    pub const fn offered(&self) -> usize {
        self.ledger.in_flight()
    }

    /// Take up to `limit` received frames out of the RX ring
    ///
    /// # Errors
    ///
    /// Will return `Err` if the kernel delivers a frame that was not offered.
    pub fn receive(&mut self, limit: u32, out: &mut Vec<Frame>) -> Result<u32> {
        let peeked = self.rx.peek(limit)?;
        for desc in peeked.iter() {
            let frame = self.umem.claim(desc.addr, desc.len)?;
            self.ledger.take_back(frame.slot())?;
            out.push(frame);
        }
        Ok(peeked.release())
    }

    /// Offer as many frames from the front of `frames` for reception as fit
    ///
    /// Returns the number of offered frames.
    ///
    /// # Errors
    ///
    /// Will return `Err` if a frame is already offered or the kernel could not be notified.
    pub fn recycle(&mut self, frames: &mut Vec<Frame>) -> Result<u32> {
        if frames.is_empty() {
            return Ok(0);
        }

        let mut reservation = self.fill.reserve(u32::try_from(frames.len())?);
        let granted = usize::try_from(reservation.len())?;
        for frame in frames.drain(..granted) {
            self.ledger.hand_over(frame.slot())?;
            reservation
                .push(self.umem.base_addr(frame.slot()))
                .map_err(|addr| anyhow!("Fill ring full despite reservation for {addr:#x}"))?;
        }
        let count = reservation.submit();

        if count > 0 && self.options.need_wakeup && self.fill.needs_wakeup() {
            self.doorbell.kick_rx()?;
        }
        Ok(count)
    }

    /// Kick the kernel if it asked for it to process the fill ring
    ///
    /// # Errors
    ///
    /// Will return `Err` if the kernel could not be notified.
    pub fn wakeup(&self) -> Result<()> {
        if self.options.need_wakeup && self.fill.needs_wakeup() {
            self.doorbell.kick_rx()?;
        }
        Ok(())
    }

    /// Hardware receive timestamp of `frame`, 0 if not available
    #[must_use]
    pub fn hw_timestamp(&self, frame: &Frame) -> u64 {
        if !self.options.hw_timestamps {
            return 0;
        }

        self.umem
            .headroom(frame, 8)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .map_or(0, u64::from_ne_bytes)
    }
}

/// Keeps the socket bound and the classifier installed
///
/// Logs the socket statistics and removes the classifier on drop.
pub struct XskGuard {
    fd: Arc<OwnedFd>,
    classifier: Box<dyn Classifier + Send>,
    umem: Arc<Umem>,
}

impl std::fmt::Debug for XskGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XskGuard")
            .field("fd", &self.fd)
            .field("umem", &self.umem)
            .finish_non_exhaustive()
    }
}

impl XskGuard {
    /// Current statistics of the socket
    ///
    /// # Errors
    ///
    /// Will return `Err` if the statistics can not be read.
    pub fn statistics(&self) -> Result<XdpStatistics> {
        sys::getsockopt(self.fd.as_fd(), SOL_XDP, sys::XDP_STATISTICS)
            .context("Reading XDP statistics")
    }
}

impl Drop for XskGuard {
    fn drop(&mut self) {
        match self.statistics() {
            Ok(stats) => log::info!(
                "XDP socket statistics: rx_dropped {}, rx_invalid_descs {}, tx_invalid_descs {}, rx_ring_full {}, rx_fill_ring_empty_descs {}, tx_ring_empty_descs {}",
                stats.rx_dropped,
                stats.rx_invalid_descs,
                stats.tx_invalid_descs,
                stats.rx_ring_full,
                stats.rx_fill_ring_empty_descs,
                stats.tx_ring_empty_descs
            ),
            Err(e) => log::warn!("{e:#}"),
        }

        if let Err(e) = self.classifier.remove() {
            log::warn!("Failed to remove classifier: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::MockDoorbell;
    use crate::umem::ring::{set_need_wakeup, test_ring};

    const GEOMETRY: UmemGeometry = UmemGeometry {
        frame_count: 16,
        frame_size: 2048,
        tx_metadata: true,
    };

    struct TxFixture {
        tx: XskTx<MockDoorbell>,
        kernel_tx: ConsumerRing<XdpDesc>,
        kernel_completion: ProducerRing<u64>,
    }

    fn tx_fixture(doorbell: MockDoorbell, need_wakeup: bool) -> Result<TxFixture> {
        let (umem, pool) = Umem::new(GEOMETRY)?;
        let (tx, kernel_tx) = test_ring(16)?;
        let (kernel_completion, completion) = test_ring(16)?;
        let tx = XskTx::new(
            Arc::new(umem),
            tx,
            completion,
            pool,
            doorbell,
            XskOptions {
                need_wakeup,
                hw_timestamps: false,
            },
        )?;
        Ok(TxFixture {
            tx,
            kernel_tx,
            kernel_completion,
        })
    }

    fn outgoing(tx: &mut XskTx<MockDoorbell>, launch_time: Option<u64>) -> Result<Outgoing> {
        let mut frame = tx.take_frame().ok_or_else(|| anyhow!("no frame"))?;
        frame.set_len(64);
        Ok(Outgoing { frame, launch_time })
    }

    #[test]
    fn test_bind_flags() {
        assert_eq!(
            XdpMode::ZeroCopy.bind_flags(true),
            XdpBindFlags::ZeroCopy | XdpBindFlags::UseNeedWakeup
        );
        assert_eq!(XdpMode::SkbCopy.bind_flags(false).bits(), 2);
        assert_eq!(XdpMode::NativeCopy.bind_flags(true).bits(), 10);
    }

    #[test]
    fn test_transmit_with_launch_time() -> Result<()> {
        let mut doorbell = MockDoorbell::new();
        doorbell.expect_kick_tx().times(1).returning(|| Ok(()));
        let mut f = tx_fixture(doorbell, false)?;

        let mut pending = vec![outgoing(&mut f.tx, Some(123_456))?];
        assert_eq!(f.tx.transmit(&mut pending)?, 1);
        assert!(pending.is_empty());
        assert_eq!(f.tx.outstanding(), 1);

        let peeked = f.kernel_tx.peek(16)?;
        let descs: Vec<_> = peeked.iter().collect();
        peeked.release();
        assert_eq!(descs.len(), 1);
        assert_eq!(descs[0].options, sys::XDP_TX_METADATA);
        assert_eq!(descs[0].len, 64);

        // metadata lives right in front of the packet data
        let frame = f.tx.umem().claim(descs[0].addr, descs[0].len)?;
        let meta = f.tx.umem().headroom(&frame, TX_METADATA_LEN)?;
        assert_eq!(meta[0..8], sys::XDP_TXMD_FLAGS_LAUNCH_TIME.to_ne_bytes());
        assert_eq!(meta[16..24], 123_456_u64.to_ne_bytes());
        Ok(())
    }

    #[test]
    fn test_need_wakeup_suppresses_kick() -> Result<()> {
        let mut doorbell = MockDoorbell::new();
        doorbell.expect_kick_tx().times(1).returning(|| Ok(()));
        let mut f = tx_fixture(doorbell, true)?;

        let mut pending = vec![outgoing(&mut f.tx, None)?];
        f.tx.transmit(&mut pending)?;

        set_need_wakeup(&f.kernel_tx, true);
        let mut pending = vec![outgoing(&mut f.tx, None)?];
        f.tx.transmit(&mut pending)?;
        Ok(())
    }

    #[test]
    fn test_reclaim_in_reverse_order() -> Result<()> {
        let mut doorbell = MockDoorbell::new();
        doorbell.expect_kick_tx().returning(|| Ok(()));
        let mut f = tx_fixture(doorbell, false)?;

        let mut pending = Vec::new();
        for _ in 0..4 {
            pending.push(outgoing(&mut f.tx, None)?);
        }
        assert_eq!(f.tx.transmit(&mut pending)?, 4);
        assert_eq!(f.tx.free_frames(), 12);

        let peeked = f.kernel_tx.peek(16)?;
        let mut addrs: Vec<_> = peeked.iter().map(|d| d.addr).collect();
        peeked.release();
        addrs.reverse();

        let mut reservation = f.kernel_completion.reserve(4);
        for addr in &addrs {
            assert!(reservation.push(*addr).is_ok());
        }
        reservation.submit();

        assert_eq!(f.tx.reclaim(64)?, 4);
        assert_eq!(f.tx.free_frames(), 16);
        assert_eq!(f.tx.outstanding(), 0);
        assert_eq!(f.tx.completed(), 4);

        // reclaimed frames are ready for the next packet
        let frame = f.tx.take_frame().ok_or_else(|| anyhow!("no frame"))?;
        assert_eq!(frame.offset(), TX_METADATA_LEN);
        assert_eq!(frame.len(), 0);
        Ok(())
    }

    #[test]
    fn test_duplicate_completion_is_fatal() -> Result<()> {
        let mut doorbell = MockDoorbell::new();
        doorbell.expect_kick_tx().returning(|| Ok(()));
        let mut f = tx_fixture(doorbell, false)?;

        let mut pending = vec![outgoing(&mut f.tx, None)?];
        f.tx.transmit(&mut pending)?;
        let addr = f.kernel_tx.peek(1)?.iter().map(|d| d.addr).sum::<u64>();

        let mut reservation = f.kernel_completion.reserve(2);
        assert!(reservation.push(addr).is_ok());
        assert!(reservation.push(addr).is_ok());
        reservation.submit();

        assert!(f.tx.reclaim(64).is_err());
        Ok(())
    }

    #[test]
    fn test_full_tx_ring_keeps_remaining() -> Result<()> {
        let mut doorbell = MockDoorbell::new();
        doorbell.expect_kick_tx().returning(|| Ok(()));
        let (umem, pool) = Umem::new(UmemGeometry {
            tx_metadata: false,
            ..GEOMETRY
        })?;
        let (tx, mut kernel_tx) = test_ring(4)?;
        let (_kernel_completion, completion) = test_ring(4)?;
        let mut tx = XskTx::new(
            Arc::new(umem),
            tx,
            completion,
            pool,
            doorbell,
            XskOptions::default(),
        )?;

        let mut pending = Vec::new();
        for _ in 0..6 {
            pending.push(outgoing(&mut tx, None)?);
        }
        let first_slot = pending[4].frame.slot();
        assert_eq!(tx.transmit(&mut pending)?, 4);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].frame.slot(), first_slot);

        // launch time without metadata headroom is rejected
        let mut pending = vec![outgoing(&mut tx, Some(1))?];
        kernel_tx.peek(4)?.release();
        assert!(tx.transmit(&mut pending).is_err());
        Ok(())
    }

    #[test]
    fn test_rx_receive_and_recycle() -> Result<()> {
        let mut doorbell = MockDoorbell::new();
        doorbell.expect_kick_rx().times(0);
        let (umem, pool) = Umem::new(GEOMETRY)?;
        let (kernel_rx, rx) = test_ring(16)?;
        let (fill, mut kernel_fill) = test_ring(16)?;
        let mut rx = XskRx::new(
            Arc::new(umem),
            rx,
            fill,
            doorbell,
            XskOptions {
                need_wakeup: true,
                hw_timestamps: true,
            },
        )?;
        let mut kernel_rx: ProducerRing<XdpDesc> = kernel_rx;
        rx.prefill(pool)?;
        assert_eq!(rx.offered(), 16);

        let peeked = kernel_fill.peek(16)?;
        let addrs: Vec<u64> = peeked.iter().collect();
        peeked.release();
        assert_eq!(addrs.len(), 16);

        // kernel puts a timestamp in front of the data at offset 256
        let mut reservation = kernel_rx.reserve(2);
        for addr in &addrs[..2] {
            assert!(reservation
                .push(XdpDesc {
                    addr: addr + 256,
                    len: 60,
                    options: 0
                })
                .is_ok());
        }
        reservation.submit();
        let mut stamped = rx.umem().claim(addrs[0] + 256, 0)?;
        rx.umem()
            .headroom_mut(&mut stamped, 8)?
            .copy_from_slice(&777_u64.to_ne_bytes());

        let mut frames = Vec::new();
        assert_eq!(rx.receive(64, &mut frames)?, 2);
        assert_eq!(rx.offered(), 14);
        assert_eq!(frames[0].len(), 60);
        assert_eq!(rx.hw_timestamp(&frames[0]), 777);

        assert_eq!(rx.recycle(&mut frames)?, 2);
        assert!(frames.is_empty());
        assert_eq!(rx.offered(), 16);
        Ok(())
    }

    #[test]
    fn test_rx_rejects_unoffered_frame() -> Result<()> {
        let doorbell = MockDoorbell::new();
        let (umem, _pool) = Umem::new(GEOMETRY)?;
        let (mut kernel_rx, rx) = test_ring::<XdpDesc>(16)?;
        let (fill, _kernel_fill) = test_ring(16)?;
        let mut rx = XskRx::new(Arc::new(umem), rx, fill, doorbell, XskOptions::default())?;

        let mut reservation = kernel_rx.reserve(1);
        assert!(reservation
            .push(XdpDesc {
                addr: 0,
                len: 64,
                options: 0
            })
            .is_ok());
        reservation.submit();

        let mut frames = Vec::new();
        assert!(rx.receive(64, &mut frames).is_err());
        Ok(())
    }
}
