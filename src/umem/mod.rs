// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
//! Packet buffer pool (UMEM) shared with the kernel for zero-copy I/O
//!
//! The pool is one page-aligned arena divided into equally sized frames.
//! A frame is addressed by its [`SlotId`]; byte offsets are only computed
//! here, at the point of memory access, and every access is bounds-checked.
//!
//! Ownership of a frame is explicit: while the application owns it, it is
//! represented by a [`Frame`] token which is neither `Clone` nor `Copy`.
//! Tokens are minted once when the pool is created and afterwards only when
//! a descriptor is taken out of a kernel-to-application ring. Handing a frame
//! to the kernel consumes the token.
//!
//! ```
//! use tsn_txrx::umem::{Umem, UmemGeometry};
//! let geometry = UmemGeometry { frame_count: 64, frame_size: 2048, tx_metadata: false };
//! let (umem, mut pool) = Umem::new(geometry)?;
//! assert_eq!(pool.len(), 64);
//! let mut frame = pool.pop().ok_or_else(|| anyhow::anyhow!("empty pool"))?;
//! frame.set_len(4);
//! umem.data_mut(&mut frame)?.copy_from_slice(&[1, 2, 3, 4]);
//! assert_eq!(umem.data(&frame)?, &[1, 2, 3, 4]);
//! # Ok::<(), anyhow::Error>(())
//! ```
use anyhow::{anyhow, Context, Result};
use std::slice;

mod mmap;
pub use mmap::MmapRegion;

pub mod ring;

/// Default number of frames, also the size of every ring
pub const DEFAULT_FRAME_COUNT: u32 = 4096;

/// Default size of a single frame
pub const DEFAULT_FRAME_SIZE: u32 = 4096;

/// Smallest frame size the kernel accepts in aligned mode
pub const MIN_FRAME_SIZE: u32 = 2048;

/// Largest frame size, one page
pub const MAX_FRAME_SIZE: u32 = 4096;

/// Size of the TX metadata block in front of the packet data
pub const TX_METADATA_LEN: u32 = 24;

/// Dimensions of a [`Umem`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UmemGeometry {
    /// Number of frames, a power of two
    pub frame_count: u32,

    /// Size of a frame in bytes, a power of two
    pub frame_size: u32,

    /// Reserve [`TX_METADATA_LEN`] bytes of TX metadata in front of outgoing packets
    pub tx_metadata: bool,
}

impl Default for UmemGeometry {
    fn default() -> Self {
        Self {
            frame_count: DEFAULT_FRAME_COUNT,
            frame_size: DEFAULT_FRAME_SIZE,
            tx_metadata: false,
        }
    }
}

impl UmemGeometry {
    /// Check the geometry can be registered with the kernel
    ///
    /// # Errors
    ///
    /// Will return `Err` if frame size or count are not supported.
    pub fn validate(&self) -> Result<()> {
        if !self.frame_count.is_power_of_two() {
            return Err(anyhow!(
                "Frame count {} is not a power of two",
                self.frame_count
            ));
        }

        if !self.frame_size.is_power_of_two()
            || !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&self.frame_size)
        {
            return Err(anyhow!(
                "Frame size {} is not a power of two within {MIN_FRAME_SIZE}..={MAX_FRAME_SIZE}",
                self.frame_size
            ));
        }

        Ok(())
    }

    /// Size of the whole arena in bytes
    ///
    /// # Errors
    ///
    /// Will return `Err` if the size does not fit into the address space.
    pub fn len(&self) -> Result<usize> {
        usize::try_from(u64::from(self.frame_count) * u64::from(self.frame_size))
            .context("UMEM too large")
    }

    /// Offset of outgoing packet data inside a frame
    #[must_use]
    pub const fn tx_data_offset(&self) -> u32 {
        if self.tx_metadata {
            TX_METADATA_LEN
        } else {
            0
        }
    }
}

/// Index of a frame inside the [`Umem`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(u32);

impl SlotId {
    /// Create from a raw index
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Raw index
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }

    #[allow(clippy::as_conversions)] // u32 always fits into usize on supported targets
    const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// A frame currently owned by the application
///
/// Packet data starts at `offset` bytes into the frame and is `len` bytes long.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame {
    slot: SlotId,
    offset: u32,
    len: u32,
}

impl Frame {
    /// The frame this token grants access to
    #[must_use]
    pub const fn slot(&self) -> SlotId {
        self.slot
    }

    /// Offset of the packet data inside the frame
    #[must_use]
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    /// Length of the packet data
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.len
    }

    /// True if the frame carries no packet data
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the length of the packet data
    ///
    /// The length is checked against the frame size on the next access.
    pub fn set_len(&mut self, len: u32) {
        self.len = len;
    }
}

/// Frames owned by the application that are currently unused
#[derive(Debug, Default)]
pub struct FramePool {
    frames: Vec<Frame>,
}

impl FramePool {
    /// Number of frames in the pool
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True if no frame is left
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Take a frame out of the pool
    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    /// Put a frame back into the pool
    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Move up to `count` frames into a new pool
    pub fn split_off(&mut self, count: usize) -> Self {
        let at = self.frames.len().saturating_sub(count);
        Self {
            frames: self.frames.split_off(at),
        }
    }

    /// Move all frames of `other` into this pool
    pub fn append(&mut self, other: &mut Self) {
        self.frames.append(&mut other.frames);
    }
}

/// The buffer arena
#[derive(Debug)]
pub struct Umem {
    region: MmapRegion,
    geometry: UmemGeometry,
}

impl Umem {
    /// Allocate a new arena and hand out a token for every frame in it
    ///
    /// # Errors
    ///
    /// Will return `Err` if the geometry is invalid or the memory can not be mapped.
    pub fn new(geometry: UmemGeometry) -> Result<(Self, FramePool)> {
        geometry.validate()?;
        let region = MmapRegion::anonymous(geometry.len()?).context("Allocating UMEM")?;

        let frames = (0..geometry.frame_count)
            .map(|index| Frame {
                slot: SlotId(index),
                offset: geometry.tx_data_offset(),
                len: 0,
            })
            .collect();

        log::debug!(
            "Allocated UMEM of {} frames with {} bytes each",
            geometry.frame_count,
            geometry.frame_size
        );

        Ok((Self { region, geometry }, FramePool { frames }))
    }

    /// Dimensions of the arena
    #[must_use]
    pub const fn geometry(&self) -> &UmemGeometry {
        &self.geometry
    }

    /// The underlying memory, e.g. for registration with the kernel
    #[must_use]
    pub const fn region(&self) -> &MmapRegion {
        &self.region
    }

    /// Descriptor address of the packet data of `frame`
    #[must_use]
    pub fn addr(&self, frame: &Frame) -> u64 {
        self.base_addr(frame.slot) + u64::from(frame.offset)
    }

    /// Descriptor address of the start of a frame
    #[must_use]
    pub fn base_addr(&self, slot: SlotId) -> u64 {
        u64::from(slot.0) * u64::from(self.geometry.frame_size)
    }

    /// Frame containing the descriptor address `addr`
    ///
    /// # Errors
    ///
    /// Will return `Err` if `addr` lies outside of the arena.
    pub fn slot_of(&self, addr: u64) -> Result<SlotId> {
        let frame_size = u64::from(self.geometry.frame_size);
        let index = addr
            .checked_div(frame_size)
            .and_then(|i| u32::try_from(i).ok())
            .filter(|i| *i < self.geometry.frame_count)
            .ok_or_else(|| anyhow!("Descriptor address {addr:#x} outside of UMEM"))?;
        Ok(SlotId(index))
    }

    /// Take ownership of a frame from a descriptor the kernel handed over
    ///
    /// # Errors
    ///
    /// Will return `Err` if the descriptor does not describe a region inside one frame.
    pub(crate) fn claim(&self, addr: u64, len: u32) -> Result<Frame> {
        let slot = self.slot_of(addr)?;
        let offset = u32::try_from(addr - self.base_addr(slot))?;
        if offset.checked_add(len).map_or(true, |end| end > self.geometry.frame_size) {
            return Err(anyhow!(
                "Descriptor {addr:#x}+{len} exceeds frame of {} bytes",
                self.geometry.frame_size
            ));
        }
        Ok(Frame { slot, offset, len })
    }

    /// Prepare a frame for transmission of a new packet
    pub fn reset_for_tx(&self, frame: &mut Frame) {
        frame.offset = self.geometry.tx_data_offset();
        frame.len = 0;
    }

    /// Packet data of `frame`
    ///
    /// # Errors
    ///
    /// Will return `Err` if the packet length exceeds the frame.
    pub fn data<'a>(&'a self, frame: &'a Frame) -> Result<&'a [u8]> {
        let ptr = self.span(frame.slot, frame.offset, frame.len)?;
        // SAFETY:
        // span checked that the bytes lie inside one frame of the arena and the
        // frame token guarantees the kernel is not writing to it.
        Ok(unsafe { slice::from_raw_parts(ptr, usize::try_from(frame.len)?) })
    }

    /// Mutable packet data of `frame`
    ///
    /// # Errors
    ///
    /// Will return `Err` if the packet length exceeds the frame.
    pub fn data_mut<'a>(&'a self, frame: &'a mut Frame) -> Result<&'a mut [u8]> {
        let ptr = self.span(frame.slot, frame.offset, frame.len)?;
        // SAFETY:
        // span checked the bounds, and the exclusive borrow of the token (which
        // exists only once per frame) guarantees no other access to these bytes.
        Ok(unsafe { slice::from_raw_parts_mut(ptr, usize::try_from(frame.len)?) })
    }

    /// Bytes between the start of the packet data and the end of the frame
    ///
    /// # Errors
    ///
    /// Will return `Err` if the frame offset is invalid.
    pub fn buffer_mut<'a>(&'a self, frame: &'a mut Frame) -> Result<&'a mut [u8]> {
        let len = self
            .geometry
            .frame_size
            .checked_sub(frame.offset)
            .ok_or_else(|| anyhow!("Frame offset {} out of range", frame.offset))?;
        let ptr = self.span(frame.slot, frame.offset, len)?;
        // SAFETY:
        // Same as for data_mut.
        Ok(unsafe { slice::from_raw_parts_mut(ptr, usize::try_from(len)?) })
    }

    /// The `len` bytes right in front of the packet data
    ///
    /// # Errors
    ///
    /// Will return `Err` if there is not enough headroom in the frame.
    pub fn headroom_mut<'a>(&'a self, frame: &'a mut Frame, len: u32) -> Result<&'a mut [u8]> {
        let start = frame
            .offset
            .checked_sub(len)
            .ok_or_else(|| anyhow!("Only {} bytes of headroom, {len} needed", frame.offset))?;
        let ptr = self.span(frame.slot, start, len)?;
        // SAFETY:
        // Same as for data_mut.
        Ok(unsafe { slice::from_raw_parts_mut(ptr, usize::try_from(len)?) })
    }

    /// The `len` bytes right in front of the packet data, read-only
    ///
    /// # Errors
    ///
    /// Will return `Err` if there is not enough headroom in the frame.
    pub fn headroom<'a>(&'a self, frame: &'a Frame, len: u32) -> Result<&'a [u8]> {
        let start = frame
            .offset
            .checked_sub(len)
            .ok_or_else(|| anyhow!("Only {} bytes of headroom, {len} needed", frame.offset))?;
        let ptr = self.span(frame.slot, start, len)?;
        // SAFETY:
        // Same as for data.
        Ok(unsafe { slice::from_raw_parts(ptr, usize::try_from(len)?) })
    }

    fn span(&self, slot: SlotId, start: u32, len: u32) -> Result<*mut u8> {
        if start
            .checked_add(len)
            .map_or(true, |end| end > self.geometry.frame_size)
        {
            return Err(anyhow!(
                "Access {start}+{len} exceeds frame of {} bytes",
                self.geometry.frame_size
            ));
        }

        let offset = slot
            .as_usize()
            .checked_mul(usize::try_from(self.geometry.frame_size)?)
            .and_then(|base| base.checked_add(usize::try_from(start).ok()?))
            .ok_or_else(|| anyhow!("Frame offset overflow"))?;

        self.region
            .checked_ptr(offset, usize::try_from(len)?)
            .ok_or_else(|| anyhow!("Slot {} outside of UMEM", slot.0))
    }
}

/// Tracks which frames are currently owned by the kernel on one ring side
///
/// Handing over a frame twice or taking back a frame that was never handed
/// over means the ring protocol is broken, which is reported as error.
#[derive(Debug)]
pub(crate) struct SlotLedger {
    name: &'static str,
    kernel_owned: Vec<bool>,
    in_flight: usize,
}

impl SlotLedger {
    pub(crate) fn new(name: &'static str, frame_count: u32) -> Result<Self> {
        Ok(Self {
            name,
            kernel_owned: vec![false; usize::try_from(frame_count)?],
            in_flight: 0,
        })
    }

    pub(crate) fn hand_over(&mut self, slot: SlotId) -> Result<()> {
        let owned = self
            .kernel_owned
            .get_mut(slot.as_usize())
            .ok_or_else(|| anyhow!("Slot {} outside of UMEM", slot.0))?;
        if *owned {
            return Err(anyhow!(
                "Ring protocol violation: slot {} handed to {} twice",
                slot.0,
                self.name
            ));
        }
        *owned = true;
        self.in_flight += 1;
        Ok(())
    }

    pub(crate) fn take_back(&mut self, slot: SlotId) -> Result<()> {
        let owned = self
            .kernel_owned
            .get_mut(slot.as_usize())
            .ok_or_else(|| anyhow!("Slot {} outside of UMEM", slot.0))?;
        if !*owned {
            return Err(anyhow!(
                "Ring protocol violation: {} returned slot {} it did not own",
                self.name,
                slot.0
            ));
        }
        *owned = false;
        self.in_flight -= 1;
        Ok(())
    }

    pub(crate) const fn in_flight(&self) -> usize {
        self.in_flight
    }
}
