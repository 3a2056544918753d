// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Raw `AF_PACKET` sockets with launch time and hardware timestamps
//!
//! Launch times are passed per frame as `SCM_TXTIME` control message, so the
//! kernel (usually the ETF qdisc) holds the frame until the given instant.
//! Hardware timestamps are reported as `SCM_TIMESTAMPING` control messages,
//! for transmitted frames on the error queue of the socket.
use super::sys::{self, HwtstampConfig, IfreqData, SockTxtime};
use super::{Doorbell, Interest, SocketDoorbell};
use crate::clock::ClockKind;
use crate::frame::ETH_P_TSN_UADP;
use anyhow::{anyhow, Context, Result};
use eui48::MacAddress;
use nix::errno::Errno;
use nix::libc::{self, c_int, c_void};
use nix::poll::{poll, PollFd, PollFlags};
use std::mem::{size_of, zeroed};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

/// Socket receive buffer, large enough to absorb a burst of a few thousand frames
const RX_BUFFER_SIZE: c_int = 4 * 1024 * 1024;

const ETH_P_8021Q: u16 = 0x8100;

/// Room for a few control messages, u64 for alignment
type ControlBuffer = [u64; 32];

/// Everything needed to open a [`PacketSocket`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketConfig {
    /// Interface to send or receive on
    pub interface: String,

    /// Socket priority, selects the traffic class
    pub priority: u32,

    /// Clock launch times refer to
    pub clock: ClockKind,

    /// Pass launch times to the kernel
    pub launch_time: bool,

    /// Enable hardware timestamps
    pub hw_timestamps: bool,

    /// Destination of transmitted frames and multicast group to join for reception
    pub destination: MacAddress,
}

/// A received frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Received {
    /// Number of bytes written to the buffer
    pub len: usize,

    /// Raw hardware timestamp, 0 if not available
    pub hw_timestamp: u64,
}

/// Frame based I/O of a copying socket
pub trait PacketIo {
    /// Transmit `frame`, held back by the kernel until `launch_time` if given
    ///
    /// # Errors
    ///
    /// Will return `Err` if the frame could not be queued.
    fn send(&self, frame: &[u8], launch_time: Option<u64>) -> Result<()>;

    /// Hardware timestamp of the last transmitted frame
    ///
    /// Returns `None` if it did not arrive within `timeout`.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the error queue can not be read.
    fn tx_hw_timestamp(&self, timeout: Duration) -> Result<Option<u64>>;

    /// Receive one frame into `buffer` without blocking
    ///
    /// Returns `None` if no frame is pending.
    ///
    /// # Errors
    ///
    /// Will return `Err` if receiving fails.
    fn recv(&self, buffer: &mut [u8]) -> Result<Option<Received>>;
}

/// A raw socket bound to one interface
#[derive(Debug)]
pub struct PacketSocket {
    fd: Arc<OwnedFd>,
    ifindex: c_int,
    destination: MacAddress,
}

fn open(protocol: u16) -> Result<OwnedFd> {
    // SAFETY:
    // Plain socket creation, the returned fd is checked below.
    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            c_int::from(protocol.to_be()),
        )
    };
    let fd = Errno::result(fd).context("Creating AF_PACKET socket (missing CAP_NET_RAW?)")?;
    // SAFETY:
    // The fd was just returned by the kernel and is owned by nothing else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn link_address(ifindex: c_int, protocol: u16, destination: Option<MacAddress>) -> libc::sockaddr_ll {
    // SAFETY:
    // sockaddr_ll is plain old data for which all zeroes is valid.
    let mut addr: libc::sockaddr_ll = unsafe { zeroed() };
    addr.sll_family = libc::AF_PACKET.try_into().unwrap_or_default();
    addr.sll_protocol = protocol.to_be();
    addr.sll_ifindex = ifindex;
    if let Some(destination) = destination {
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(destination.as_bytes());
    }
    addr
}

fn enable_hw_timestamping(fd: &OwnedFd, interface: &str, flags: u32) -> Result<()> {
    let mut config = HwtstampConfig {
        flags: 0,
        tx_type: sys::HWTSTAMP_TX_ON,
        rx_filter: sys::HWTSTAMP_FILTER_ALL,
    };
    let mut ifreq = IfreqData::new(interface, ptr::addr_of_mut!(config).cast::<c_void>())?;

    // SAFETY:
    // ifreq points to config, both stay valid for the duration of the call.
    let ret = unsafe {
        libc::ioctl(
            fd.as_raw_fd(),
            sys::SIOCSHWTSTAMP.try_into()?,
            ptr::addr_of_mut!(ifreq),
        )
    };
    Errno::result(ret)
        .with_context(|| format!("Enabling hardware timestamping on {interface}"))?;
    log::debug!("Hardware timestamping on {interface}: {config:?}");

    sys::setsockopt(
        fd.as_fd(),
        libc::SOL_SOCKET,
        libc::SO_TIMESTAMPING,
        &c_int::try_from(flags)?,
    )
    .context("Setting SO_TIMESTAMPING")
}

/// Raw hardware timestamp of the first `SCM_TIMESTAMPING` message in `msg`
///
/// # Safety
///
/// `msg` must have been filled by a successful `recvmsg` and its control
/// buffer must still be valid.
unsafe fn hw_timestamp_of(msg: &libc::msghdr) -> Result<Option<u64>> {
    // SAFETY:
    // The caller guarantees a valid control buffer, CMSG_FIRSTHDR/CMSG_NXTHDR
    // only return headers inside it and the data is read unaligned.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET
                && (*cmsg).cmsg_type == libc::SO_TIMESTAMPING
            {
                // software, deprecated, raw hardware
                let stamps =
                    ptr::read_unaligned(libc::CMSG_DATA(cmsg).cast::<[libc::timespec; 3]>());
                let raw = stamps[2];
                let ns = u64::try_from(raw.tv_sec)?
                    .checked_mul(crate::clock::NSEC_PER_SEC)
                    .and_then(|ns| ns.checked_add(u64::try_from(raw.tv_nsec).ok()?))
                    .ok_or_else(|| anyhow!("Hardware timestamp out of range"))?;
                return Ok((ns != 0).then_some(ns));
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
    }
    Ok(None)
}

impl PacketSocket {
    /// Open a socket for transmission
    ///
    /// # Errors
    ///
    /// Will return `Err` if the socket can not be created or configured.
    pub fn open_tx(config: &PacketConfig) -> Result<Self> {
        let ifindex = c_int::try_from(super::nametoindex(&config.interface)?)?;
        let fd = open(ETH_P_8021Q)?;

        sys::setsockopt(
            fd.as_fd(),
            libc::SOL_SOCKET,
            libc::SO_PRIORITY,
            &c_int::try_from(config.priority)?,
        )
        .with_context(|| format!("Setting socket priority {}", config.priority))?;

        if config.launch_time {
            let txtime = SockTxtime {
                clockid: config.clock.id().as_raw(),
                flags: 0,
            };
            sys::setsockopt(fd.as_fd(), libc::SOL_SOCKET, sys::SO_TXTIME, &txtime)
                .context("Setting SO_TXTIME (kernel too old?)")?;
        }

        if config.hw_timestamps {
            enable_hw_timestamping(
                &fd,
                &config.interface,
                sys::SOF_TIMESTAMPING_TX_HARDWARE | sys::SOF_TIMESTAMPING_RAW_HARDWARE,
            )?;
        }

        log::debug!(
            "Opened AF_PACKET TX socket on {} with priority {}",
            config.interface,
            config.priority
        );

        Ok(Self {
            fd: Arc::new(fd),
            ifindex,
            destination: config.destination,
        })
    }

    /// Open a socket receiving the test traffic
    ///
    /// # Errors
    ///
    /// Will return `Err` if the socket can not be created, bound or configured.
    pub fn open_rx(config: &PacketConfig) -> Result<Self> {
        let ifindex = c_int::try_from(super::nametoindex(&config.interface)?)?;
        let fd = open(ETH_P_TSN_UADP)?;

        let addr = link_address(ifindex, ETH_P_TSN_UADP, None);
        // SAFETY:
        // addr is a valid sockaddr_ll of the given length for the duration of the call.
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                ptr::addr_of!(addr).cast::<libc::sockaddr>(),
                libc::socklen_t::try_from(size_of::<libc::sockaddr_ll>())?,
            )
        };
        Errno::result(ret).with_context(|| format!("Binding to {}", config.interface))?;

        sys::setsockopt(
            fd.as_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVBUFFORCE,
            &RX_BUFFER_SIZE,
        )
        .context("Setting SO_RCVBUFFORCE")?;

        let mut mreq = libc::packet_mreq {
            mr_ifindex: ifindex,
            mr_type: libc::PACKET_MR_MULTICAST.try_into()?,
            mr_alen: 6,
            mr_address: [0; 8],
        };
        mreq.mr_address[..6].copy_from_slice(config.destination.as_bytes());
        sys::setsockopt(
            fd.as_fd(),
            libc::SOL_PACKET,
            libc::PACKET_ADD_MEMBERSHIP,
            &mreq,
        )
        .with_context(|| format!("Joining multicast group {}", config.destination))?;

        if config.hw_timestamps {
            enable_hw_timestamping(
                &fd,
                &config.interface,
                sys::SOF_TIMESTAMPING_RX_HARDWARE | sys::SOF_TIMESTAMPING_RAW_HARDWARE,
            )?;
        }

        log::debug!("Opened AF_PACKET RX socket on {}", config.interface);

        Ok(Self {
            fd: Arc::new(fd),
            ifindex,
            destination: config.destination,
        })
    }

    /// Doorbell of this socket, only used for waiting
    #[must_use]
    pub fn doorbell(&self) -> SocketDoorbell {
        SocketDoorbell::new(self.fd.clone())
    }
}

impl Doorbell for PacketSocket {
    // frames are handed to the driver synchronously, nothing to kick
    fn kick_tx(&self) -> Result<()> {
        Ok(())
    }

    fn kick_rx(&self) -> Result<()> {
        Ok(())
    }

    fn wait(&self, interest: Interest, timeout: Duration) -> Result<bool> {
        self.doorbell().wait(interest, timeout)
    }
}

impl PacketIo for PacketSocket {
    fn send(&self, frame: &[u8], launch_time: Option<u64>) -> Result<()> {
        let mut addr = link_address(self.ifindex, ETH_P_8021Q, Some(self.destination));
        let mut iov = libc::iovec {
            iov_base: frame.as_ptr().cast_mut().cast::<c_void>(),
            iov_len: frame.len(),
        };
        let mut control: ControlBuffer = [0; 32];

        // SAFETY:
        // msghdr is plain old data for which all zeroes is valid.
        let mut msg: libc::msghdr = unsafe { zeroed() };
        msg.msg_name = ptr::addr_of_mut!(addr).cast::<c_void>();
        msg.msg_namelen = libc::socklen_t::try_from(size_of::<libc::sockaddr_ll>())?;
        msg.msg_iov = ptr::addr_of_mut!(iov);
        msg.msg_iovlen = 1;

        if let Some(launch_time) = launch_time {
            msg.msg_control = control.as_mut_ptr().cast::<c_void>();
            // SAFETY:
            // Pure size computations.
            let (space, len) = unsafe {
                (
                    libc::CMSG_SPACE(u32::try_from(size_of::<u64>())?),
                    libc::CMSG_LEN(u32::try_from(size_of::<u64>())?),
                )
            };
            msg.msg_controllen = space.try_into()?;

            // SAFETY:
            // The control buffer is large enough for one u64 message, so
            // CMSG_FIRSTHDR is non-null and CMSG_DATA lies within the buffer.
            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&msg);
                if cmsg.is_null() {
                    return Err(anyhow!("Control buffer too small"));
                }
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = sys::SCM_TXTIME;
                (*cmsg).cmsg_len = len.try_into()?;
                ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<u64>(), launch_time);
            }
        }

        // SAFETY:
        // msg and everything it points to stay valid for the duration of the call.
        let ret = unsafe { libc::sendmsg(self.fd.as_raw_fd(), &msg, 0) };
        let sent = Errno::result(ret).context("Sending frame")?;
        if usize::try_from(sent)? != frame.len() {
            return Err(anyhow!("Sent only {sent} of {} bytes", frame.len()));
        }
        Ok(())
    }

    fn tx_hw_timestamp(&self, timeout: Duration) -> Result<Option<u64>> {
        // errors are always reported, no events needed
        let mut fds = [PollFd::new(self.fd.as_raw_fd(), PollFlags::empty())];
        let timeout = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        match poll(&mut fds, timeout) {
            Ok(0) | Err(Errno::EINTR) => return Ok(None),
            Ok(_) => {}
            Err(e) => return Err(anyhow!(e)).context("Polling error queue"),
        }

        let mut data = [0_u8; 64];
        let mut iov = libc::iovec {
            iov_base: data.as_mut_ptr().cast::<c_void>(),
            iov_len: data.len(),
        };
        let mut control: ControlBuffer = [0; 32];
        // SAFETY:
        // msghdr is plain old data for which all zeroes is valid.
        let mut msg: libc::msghdr = unsafe { zeroed() };
        msg.msg_iov = ptr::addr_of_mut!(iov);
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast::<c_void>();
        msg.msg_controllen = size_of::<ControlBuffer>().try_into()?;

        // SAFETY:
        // msg and all buffers it points to stay valid for the duration of the call.
        let ret = unsafe {
            libc::recvmsg(
                self.fd.as_raw_fd(),
                &mut msg,
                libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT,
            )
        };
        match Errno::result(ret) {
            Ok(_) => {}
            Err(Errno::EAGAIN) => return Ok(None),
            Err(e) => return Err(anyhow!(e)).context("Reading error queue"),
        }

        // SAFETY:
        // msg was just filled by recvmsg and control is still alive.
        unsafe { hw_timestamp_of(&msg) }
    }

    fn recv(&self, buffer: &mut [u8]) -> Result<Option<Received>> {
        let mut iov = libc::iovec {
            iov_base: buffer.as_mut_ptr().cast::<c_void>(),
            iov_len: buffer.len(),
        };
        let mut control: ControlBuffer = [0; 32];
        // SAFETY:
        // msghdr is plain old data for which all zeroes is valid.
        let mut msg: libc::msghdr = unsafe { zeroed() };
        msg.msg_iov = ptr::addr_of_mut!(iov);
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr().cast::<c_void>();
        msg.msg_controllen = size_of::<ControlBuffer>().try_into()?;

        // SAFETY:
        // msg and all buffers it points to stay valid for the duration of the call.
        let ret = unsafe { libc::recvmsg(self.fd.as_raw_fd(), &mut msg, libc::MSG_DONTWAIT) };
        let len = match Errno::result(ret) {
            Ok(len) => usize::try_from(len)?,
            Err(Errno::EAGAIN | Errno::EINTR) => return Ok(None),
            Err(e) => return Err(anyhow!(e)).context("Receiving frame"),
        };

        // SAFETY:
        // msg was just filled by recvmsg and control is still alive.
        let hw_timestamp = unsafe { hw_timestamp_of(&msg) }?.unwrap_or(0);
        Ok(Some(Received {
            len: len.min(buffer.len()),
            hw_timestamp,
        }))
    }
}
