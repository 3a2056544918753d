// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Kernel ABI of `AF_XDP` and the timestamping related parts of `AF_PACKET`
//!
//! Mirrors `linux/if_xdp.h`, `linux/net_tstamp.h` and `linux/sockios.h`.
#![allow(missing_docs)] // names follow the kernel headers
use anyhow::{anyhow, Result};
use flagset::flags;
use nix::errno::Errno;
use nix::libc::{self, c_int, c_ulong, c_void, socklen_t};
use std::mem::{size_of, MaybeUninit};
use std::os::fd::{AsRawFd, BorrowedFd};

/// Socket option level of `AF_XDP`
pub const SOL_XDP: c_int = 283;

/// Option numbers on [`SOL_XDP`]
pub const XDP_MMAP_OFFSETS: c_int = 1;
pub const XDP_RX_RING: c_int = 2;
pub const XDP_TX_RING: c_int = 3;
pub const XDP_UMEM_REG: c_int = 4;
pub const XDP_UMEM_FILL_RING: c_int = 5;
pub const XDP_UMEM_COMPLETION_RING: c_int = 6;
pub const XDP_STATISTICS: c_int = 7;

/// mmap page offsets of the rings
pub const XDP_PGOFF_RX_RING: i64 = 0;
pub const XDP_PGOFF_TX_RING: i64 = 0x8000_0000;
pub const XDP_UMEM_PGOFF_FILL_RING: i64 = 0x1_0000_0000;
pub const XDP_UMEM_PGOFF_COMPLETION_RING: i64 = 0x1_8000_0000;

/// UMEM registration flag: reserve TX metadata in front of the packet data
pub const XDP_UMEM_TX_METADATA_LEN: u32 = 1 << 2;

/// Descriptor option: a `xsk_tx_metadata` block precedes the packet data
pub const XDP_TX_METADATA: u32 = 1 << 1;

/// `xsk_tx_metadata` flag: the launch time field is valid
pub const XDP_TXMD_FLAGS_LAUNCH_TIME: u64 = 1 << 2;

flags! {
    /// Flags of `sockaddr_xdp`
    pub enum XdpBindFlags: u16 {
        /// Share the UMEM of another socket
        SharedUmem = 1,
        /// Force copy mode
        Copy = 2,
        /// Force zero-copy mode
        ZeroCopy = 4,
        /// The application kicks the kernel only when asked to
        UseNeedWakeup = 8,
    }
}

/// `struct xdp_umem_reg`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct XdpUmemReg {
    pub addr: u64,
    pub len: u64,
    pub chunk_size: u32,
    pub headroom: u32,
    pub flags: u32,
    pub tx_metadata_len: u32,
}

/// `struct sockaddr_xdp`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SockaddrXdp {
    pub family: u16,
    pub flags: u16,
    pub ifindex: u32,
    pub queue_id: u32,
    pub shared_umem_fd: u32,
}

/// `struct xdp_ring_offset`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct XdpRingOffset {
    pub producer: u64,
    pub consumer: u64,
    pub desc: u64,
    pub flags: u64,
}

/// `struct xdp_mmap_offsets`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct XdpMmapOffsets {
    pub rx: XdpRingOffset,
    pub tx: XdpRingOffset,
    pub fr: XdpRingOffset,
    pub cr: XdpRingOffset,
}

/// `struct xdp_desc`, the element of RX and TX rings
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct XdpDesc {
    pub addr: u64,
    pub len: u32,
    pub options: u32,
}

/// `struct xdp_statistics`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct XdpStatistics {
    pub rx_dropped: u64,
    pub rx_invalid_descs: u64,
    pub tx_invalid_descs: u64,
    pub rx_ring_full: u64,
    pub rx_fill_ring_empty_descs: u64,
    pub tx_ring_empty_descs: u64,
}

/// `SO_TXTIME` and its control message type
pub const SO_TXTIME: c_int = 61;
pub const SCM_TXTIME: c_int = SO_TXTIME;

/// `struct sock_txtime`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SockTxtime {
    pub clockid: libc::clockid_t,
    pub flags: u32,
}

/// ioctl to configure hardware timestamping of a NIC
pub const SIOCSHWTSTAMP: c_ulong = 0x89b0;

/// `SO_TIMESTAMPING` flags
pub const SOF_TIMESTAMPING_TX_HARDWARE: u32 = 1 << 0;
pub const SOF_TIMESTAMPING_RX_HARDWARE: u32 = 1 << 2;
pub const SOF_TIMESTAMPING_RAW_HARDWARE: u32 = 1 << 6;

/// `HWTSTAMP_TX_ON`
pub const HWTSTAMP_TX_ON: c_int = 1;

/// `HWTSTAMP_FILTER_ALL`
pub const HWTSTAMP_FILTER_ALL: c_int = 1;

/// `struct hwtstamp_config`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct HwtstampConfig {
    pub flags: c_int,
    pub tx_type: c_int,
    pub rx_filter: c_int,
}

/// `struct ifreq` with `ifr_data` as the active member
#[repr(C)]
#[derive(Debug)]
pub struct IfreqData {
    pub name: [u8; libc::IFNAMSIZ],
    pub data: *mut c_void,
    // rest of the ifr_ifru union
    pub pad: [u8; 16],
}

impl IfreqData {
    /// Request for `interface` pointing to `data`
    ///
    /// # Errors
    ///
    /// Will return `Err` if the interface name is too long.
    pub fn new(interface: &str, data: *mut c_void) -> Result<Self> {
        let mut name = [0_u8; libc::IFNAMSIZ];
        if interface.len() >= name.len() {
            return Err(anyhow!("Interface name {interface} too long"));
        }
        name[..interface.len()].copy_from_slice(interface.as_bytes());
        Ok(Self {
            name,
            data,
            pad: [0; 16],
        })
    }
}

fn optlen<T>() -> Result<socklen_t> {
    Ok(socklen_t::try_from(size_of::<T>())?)
}

/// Set a socket option from a plain old data struct
///
/// # Errors
///
/// Will return `Err` if the kernel rejects the option.
pub fn setsockopt<T: Copy>(fd: BorrowedFd<'_>, level: c_int, name: c_int, value: &T) -> Result<()> {
    // SAFETY:
    // value points to an initialized T of exactly optlen bytes, which the
    // kernel only reads.
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            name,
            (value as *const T).cast::<c_void>(),
            optlen::<T>()?,
        )
    };
    Errno::result(ret)?;
    Ok(())
}

/// Read a socket option into a plain old data struct
///
/// # Errors
///
/// Will return `Err` if the kernel rejects the option or returns less data than expected.
pub fn getsockopt<T: Copy + Default>(fd: BorrowedFd<'_>, level: c_int, name: c_int) -> Result<T> {
    let mut value = MaybeUninit::new(T::default());
    let mut len = optlen::<T>()?;
    // SAFETY:
    // value is valid for writes of len bytes and len is updated by the kernel
    // to the number of bytes written.
    let ret = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            level,
            name,
            value.as_mut_ptr().cast::<c_void>(),
            &mut len,
        )
    };
    Errno::result(ret)?;

    if len != optlen::<T>()? {
        return Err(anyhow!(
            "Socket option {level}/{name} returned {len} bytes, {} expected",
            size_of::<T>()
        ));
    }

    // SAFETY:
    // Initialized with the default value and partially or fully overwritten
    // by the kernel with a valid representation.
    Ok(unsafe { value.assume_init() })
}
