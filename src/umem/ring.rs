// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Single-producer single-consumer descriptor rings shared with the kernel
//!
//! Each ring consists of a producer cursor, a consumer cursor, a flags word and
//! a power-of-two sized array of descriptors. Cursors are free-running `u32`
//! values, the array index is the cursor masked by the capacity. The producer
//! publishes descriptors with a release store of its cursor after writing them,
//! the consumer acquires the producer cursor before reading them and releases
//! its own cursor only after it is done with them.
//!
//! Both sides cache the cursor of the other side and only refresh it when the
//! cached value is not sufficient.
//!
//! ```
//! use std::sync::Arc;
//! use tsn_txrx::umem::MmapRegion;
//! use tsn_txrx::umem::ring::{ConsumerRing, ProducerRing, RingLayout};
//! let layout = RingLayout { producer: 0, consumer: 64, flags: 128, desc: 192 };
//! let region = Arc::new(MmapRegion::anonymous(layout.mapping_len::<u64>(8)?)?);
//! let mut producer = ProducerRing::<u64>::new(region.clone(), layout, 8)?;
//! let mut consumer = ConsumerRing::<u64>::new(region, layout, 8)?;
//!
//! let mut reservation = producer.reserve(3);
//! for addr in [0x1000, 0x2000, 0x3000] {
//!     reservation.push(addr).map_err(|_| anyhow::anyhow!("ring full"))?;
//! }
//! assert_eq!(reservation.submit(), 3);
//!
//! let peeked = consumer.peek(8)?;
//! assert_eq!(peeked.iter().collect::<Vec<_>>(), vec![0x1000, 0x2000, 0x3000]);
//! assert_eq!(peeked.release(), 3);
//! # Ok::<(), anyhow::Error>(())
//! ```
use super::MmapRegion;
use anyhow::{anyhow, Result};
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Ring flag set by the kernel if it needs a syscall to make progress
pub const XDP_RING_NEED_WAKEUP: u32 = 1;

/// Byte offsets of the ring fields inside its mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    /// Producer cursor
    pub producer: usize,

    /// Consumer cursor
    pub consumer: usize,

    /// Flags word
    pub flags: usize,

    /// Descriptor array
    pub desc: usize,
}

impl RingLayout {
    /// Bytes to map for a ring of `size` descriptors of type `T`
    ///
    /// # Errors
    ///
    /// Will return `Err` on overflow.
    pub fn mapping_len<T>(&self, size: u32) -> Result<usize> {
        usize::try_from(size)?
            .checked_mul(size_of::<T>())
            .and_then(|len| len.checked_add(self.desc))
            .ok_or_else(|| anyhow!("Ring of {size} entries too large"))
    }
}

#[derive(Debug)]
struct RingMemory<T> {
    producer: NonNull<AtomicU32>,
    consumer: NonNull<AtomicU32>,
    flags: NonNull<AtomicU32>,
    descs: NonNull<T>,
    mask: u32,
    size: u32,
    // keeps the pointers above valid
    _region: Arc<MmapRegion>,
    _marker: PhantomData<T>,
}

// SAFETY:
// The pointers refer into the mapping owned by _region, which is Send + Sync.
// Each RingMemory is owned by exactly one side (producer or consumer) of a ring.
unsafe impl<T: Send> Send for RingMemory<T> {}

impl<T: Copy> RingMemory<T> {
    fn new(region: Arc<MmapRegion>, layout: RingLayout, size: u32) -> Result<Self> {
        if !size.is_power_of_two() {
            return Err(anyhow!("Ring size {size} is not a power of two"));
        }

        let cursor = |offset: usize, what: &str| -> Result<NonNull<AtomicU32>> {
            region
                .checked_ptr(offset, size_of::<AtomicU32>())
                .filter(|p| p.align_offset(align_of::<AtomicU32>()) == 0)
                .and_then(|p| NonNull::new(p.cast::<AtomicU32>()))
                .ok_or_else(|| anyhow!("Invalid {what} offset {offset:#x} in ring mapping"))
        };

        let descs = region
            .checked_ptr(
                layout.desc,
                usize::try_from(size)?
                    .checked_mul(size_of::<T>())
                    .ok_or_else(|| anyhow!("Ring too large"))?,
            )
            .filter(|p| p.align_offset(align_of::<T>()) == 0)
            .and_then(|p| NonNull::new(p.cast::<T>()))
            .ok_or_else(|| anyhow!("Invalid descriptor offset {:#x}", layout.desc))?;

        Ok(Self {
            producer: cursor(layout.producer, "producer")?,
            consumer: cursor(layout.consumer, "consumer")?,
            flags: cursor(layout.flags, "flags")?,
            descs,
            mask: size - 1,
            size,
            _region: region,
            _marker: PhantomData,
        })
    }

    fn producer(&self) -> &AtomicU32 {
        // SAFETY:
        // In bounds and aligned as checked in new, kept mapped by _region,
        // and only ever accessed atomically by both sides.
        unsafe { self.producer.as_ref() }
    }

    fn consumer(&self) -> &AtomicU32 {
        // SAFETY:
        // See producer.
        unsafe { self.consumer.as_ref() }
    }

    fn flags(&self) -> &AtomicU32 {
        // SAFETY:
        // See producer.
        unsafe { self.flags.as_ref() }
    }

    #[allow(clippy::as_conversions)] // masked u32 index always fits into usize
    const fn index(&self, cursor: u32) -> usize {
        (cursor & self.mask) as usize
    }

    fn read(&self, cursor: u32) -> T {
        // SAFETY:
        // The masked index is below size, for which the array was bounds-checked
        // in new. The entry was published by the producer before its cursor was
        // acquired, and is not reused before the consumer cursor is released.
        unsafe { self.descs.as_ptr().add(self.index(cursor)).read() }
    }

    fn write(&self, cursor: u32, desc: T) {
        // SAFETY:
        // In bounds as in read. The entry is free since it lies between the
        // producer cursor and the acquired consumer cursor plus size.
        unsafe { self.descs.as_ptr().add(self.index(cursor)).write(desc) }
    }

    fn needs_wakeup(&self) -> bool {
        self.flags().load(Ordering::Relaxed) & XDP_RING_NEED_WAKEUP != 0
    }
}

/// The application side of a ring the application produces into (fill, TX)
#[derive(Debug)]
pub struct ProducerRing<T> {
    mem: RingMemory<T>,
    cached_prod: u32,
    cached_cons: u32,
}

impl<T: Copy> ProducerRing<T> {
    /// Take over the producer side of the ring described by `layout`
    ///
    /// # Errors
    ///
    /// Will return `Err` if the layout does not fit into the region or `size`
    /// is not a power of two.
    pub fn new(region: Arc<MmapRegion>, layout: RingLayout, size: u32) -> Result<Self> {
        let mem = RingMemory::new(region, layout, size)?;
        let cached_prod = mem.producer().load(Ordering::Relaxed);
        let cached_cons = mem.consumer().load(Ordering::Relaxed).wrapping_add(size);
        Ok(Self {
            mem,
            cached_prod,
            cached_cons,
        })
    }

    /// Number of descriptors the ring can hold
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.mem.size
    }

    /// Number of free entries
    ///
    /// The consumer cursor is only read if less than `wanted` entries are
    /// known to be free.
    pub fn free(&mut self, wanted: u32) -> u32 {
        let free = self.cached_cons.wrapping_sub(self.cached_prod);
        if free >= wanted {
            return free;
        }

        self.cached_cons = self
            .mem
            .consumer()
            .load(Ordering::Acquire)
            .wrapping_add(self.mem.size);
        self.cached_cons.wrapping_sub(self.cached_prod)
    }

    /// Claim up to `wanted` entries
    ///
    /// The reservation may be shorter than requested, or even empty if the
    /// ring is full. Nothing is visible to the consumer before
    /// [`Reservation::submit`].
    pub fn reserve(&mut self, wanted: u32) -> Reservation<'_, T> {
        let granted = self.free(wanted).min(wanted);
        Reservation {
            start: self.cached_prod,
            granted,
            filled: 0,
            ring: self,
        }
    }

    /// True if the kernel asks for a wakeup syscall
    #[must_use]
    pub fn needs_wakeup(&self) -> bool {
        self.mem.needs_wakeup()
    }

    /// The published producer cursor
    #[must_use]
    pub fn cursor(&self) -> u32 {
        self.mem.producer().load(Ordering::Relaxed)
    }
}

/// Entries claimed in a [`ProducerRing`]
///
/// Consumed by [`submit`](Self::submit), which publishes exactly the entries
/// that were pushed. Dropping it publishes nothing.
#[derive(Debug)]
pub struct Reservation<'r, T: Copy> {
    ring: &'r mut ProducerRing<T>,
    start: u32,
    granted: u32,
    filled: u32,
}

impl<T: Copy> Reservation<'_, T> {
    /// Number of entries granted
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.granted
    }

    /// True if the ring was full
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.granted == 0
    }

    /// Granted entries not filled yet
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.granted - self.filled
    }

    /// Write the next descriptor
    ///
    /// # Errors
    ///
    /// Hands the descriptor back if all granted entries are filled.
    pub fn push(&mut self, desc: T) -> Result<(), T> {
        if self.filled == self.granted {
            return Err(desc);
        }
        self.ring.mem.write(self.start.wrapping_add(self.filled), desc);
        self.filled += 1;
        Ok(())
    }

    /// Publish the pushed descriptors to the consumer
    ///
    /// Returns the number of published descriptors.
    pub fn submit(mut self) -> u32 {
        let count = self.filled;
        self.ring.cached_prod = self.start.wrapping_add(count);
        self.ring
            .mem
            .producer()
            .store(self.ring.cached_prod, Ordering::Release);
        self.filled = 0;
        count
    }
}

impl<T: Copy> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if self.filled > 0 {
            log::warn!(
                "Discarding {} descriptors that were never submitted",
                self.filled
            );
        }
    }
}

/// The application side of a ring the application consumes from (completion, RX)
#[derive(Debug)]
pub struct ConsumerRing<T> {
    mem: RingMemory<T>,
    cached_prod: u32,
    cached_cons: u32,
}

impl<T: Copy> ConsumerRing<T> {
    /// Take over the consumer side of the ring described by `layout`
    ///
    /// # Errors
    ///
    /// Will return `Err` if the layout does not fit into the region or `size`
    /// is not a power of two.
    pub fn new(region: Arc<MmapRegion>, layout: RingLayout, size: u32) -> Result<Self> {
        let mem = RingMemory::new(region, layout, size)?;
        let cached_prod = mem.producer().load(Ordering::Relaxed);
        let cached_cons = mem.consumer().load(Ordering::Relaxed);
        Ok(Self {
            mem,
            cached_prod,
            cached_cons,
        })
    }

    /// Number of descriptors the ring can hold
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.mem.size
    }

    /// Number of available entries, at most `wanted`
    ///
    /// # Errors
    ///
    /// Will return `Err` if the producer claims more entries than the ring can hold.
    pub fn available(&mut self, wanted: u32) -> Result<u32> {
        let mut entries = self.cached_prod.wrapping_sub(self.cached_cons);
        if entries == 0 {
            self.cached_prod = self.mem.producer().load(Ordering::Acquire);
            entries = self.cached_prod.wrapping_sub(self.cached_cons);
        }

        if entries > self.mem.size {
            return Err(anyhow!(
                "Ring protocol violation: {entries} entries in ring of {} (producer {}, consumer {})",
                self.mem.size,
                self.cached_prod,
                self.cached_cons
            ));
        }

        Ok(entries.min(wanted))
    }

    /// Look at up to `wanted` available descriptors without removing them
    ///
    /// # Errors
    ///
    /// Will return `Err` if the ring is corrupted, see [`available`](Self::available).
    pub fn peek(&mut self, wanted: u32) -> Result<Peeked<'_, T>> {
        let len = self.available(wanted)?;
        Ok(Peeked {
            start: self.cached_cons,
            len,
            ring: self,
        })
    }

    /// True if the kernel asks for a wakeup syscall
    #[must_use]
    pub fn needs_wakeup(&self) -> bool {
        self.mem.needs_wakeup()
    }

    /// The published consumer cursor
    #[must_use]
    pub fn cursor(&self) -> u32 {
        self.mem.consumer().load(Ordering::Relaxed)
    }
}

/// Descriptors looked at in a [`ConsumerRing`]
///
/// Consumed by [`release`](Self::release). Dropping it leaves the entries in
/// the ring, so the next peek returns them again.
#[derive(Debug)]
pub struct Peeked<'r, T: Copy> {
    ring: &'r mut ConsumerRing<T>,
    start: u32,
    len: u32,
}

impl<T: Copy> Peeked<'_, T> {
    /// Number of descriptors
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.len
    }

    /// True if nothing was available
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The descriptors in ring order
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.len).map(|i| self.ring.mem.read(self.start.wrapping_add(i)))
    }

    /// Hand the entries back to the producer
    ///
    /// Returns the number of released entries.
    pub fn release(self) -> u32 {
        self.ring.cached_cons = self.start.wrapping_add(self.len);
        self.ring
            .mem
            .consumer()
            .store(self.ring.cached_cons, Ordering::Release);
        self.len
    }
}

/// Layout used for rings that live in plain memory instead of a kernel mapping
#[cfg(test)]
pub(crate) const TEST_LAYOUT: RingLayout = RingLayout {
    producer: 0,
    consumer: 64,
    flags: 128,
    desc: 192,
};

/// Both sides of one ring in one private anonymous mapping
///
/// Lets tests play the kernel side with the very same ring code.
#[cfg(test)]
pub(crate) fn test_ring<T: Copy>(size: u32) -> Result<(ProducerRing<T>, ConsumerRing<T>)> {
    let region = Arc::new(MmapRegion::anonymous(TEST_LAYOUT.mapping_len::<T>(size)?)?);
    Ok((
        ProducerRing::new(region.clone(), TEST_LAYOUT, size)?,
        ConsumerRing::new(region, TEST_LAYOUT, size)?,
    ))
}

/// Set or clear the wakeup flag, as the kernel would
#[cfg(test)]
pub(crate) fn set_need_wakeup<T: Copy>(ring: &ConsumerRing<T>, need: bool) {
    let value = if need { XDP_RING_NEED_WAKEUP } else { 0 };
    ring.mem.flags().store(value, Ordering::Relaxed);
}
