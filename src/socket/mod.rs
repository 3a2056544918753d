// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
//! Sockets the engines send and receive through
//!
//! Two transports are available:
//! * [`xsk::XskSocket`] binds an `AF_XDP` socket to one queue of an interface
//!   and exchanges frames with the kernel over shared descriptor rings.
//! * [`packet::PacketSocket`] is a raw `AF_PACKET` socket that copies every
//!   frame, but supports `SO_TXTIME` and hardware timestamps on any NIC.
//!
//! The kernel is notified through a [`Doorbell`], so engines can be tested
//! against a simulated kernel.
use anyhow::{anyhow, Context, Result};
use nix::errno::Errno;
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags};
use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;

pub mod packet;
pub mod sys;
pub mod xsk;

/// What to wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Data to receive
    Readable,

    /// Room to transmit
    Writable,
}

/// Notifications between application and kernel
#[cfg_attr(test, automock)]
pub trait Doorbell {
    /// Ask the kernel to process the TX ring
    ///
    /// # Errors
    ///
    /// Will return `Err` for other errors than transient backpressure.
    fn kick_tx(&self) -> Result<()>;

    /// Ask the kernel to process the fill ring
    ///
    /// # Errors
    ///
    /// Will return `Err` for other errors than transient backpressure.
    fn kick_rx(&self) -> Result<()>;

    /// Block until the socket becomes ready or `timeout` expires
    ///
    /// Returns `true` if the socket is ready.
    ///
    /// # Errors
    ///
    /// Will return `Err` if waiting fails for other reasons than an interruption.
    fn wait(&self, interest: Interest, timeout: Duration) -> Result<bool>;
}

/// [`Doorbell`] of a real socket
#[derive(Debug, Clone)]
pub struct SocketDoorbell {
    fd: Arc<OwnedFd>,
}

impl SocketDoorbell {
    /// Create a new `SocketDoorbell` sharing the socket `fd`
    #[must_use]
    pub const fn new(fd: Arc<OwnedFd>) -> Self {
        Self { fd }
    }
}

/// Errors that only signal the kernel is busy
pub(crate) fn is_transient(errno: Errno) -> bool {
    matches!(
        errno,
        Errno::ENOBUFS | Errno::EAGAIN | Errno::EBUSY | Errno::ENETDOWN | Errno::EINTR
    )
}

impl Doorbell for SocketDoorbell {
    fn kick_tx(&self) -> Result<()> {
        // SAFETY:
        // A zero-length send without buffer or address only triggers TX processing.
        let ret = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                ptr::null(),
                0,
                libc::MSG_DONTWAIT,
                ptr::null(),
                0,
            )
        };

        match Errno::result(ret) {
            Ok(_) => Ok(()),
            Err(e) if is_transient(e) => Ok(()),
            Err(e) => Err(anyhow!(e)).context("Kicking TX ring"),
        }
    }

    fn kick_rx(&self) -> Result<()> {
        // SAFETY:
        // A zero-length receive without buffer or address only triggers fill ring processing.
        let ret = unsafe {
            libc::recvfrom(
                self.fd.as_raw_fd(),
                ptr::null_mut(),
                0,
                libc::MSG_DONTWAIT,
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };

        match Errno::result(ret) {
            Ok(_) => Ok(()),
            Err(e) if is_transient(e) => Ok(()),
            Err(e) => Err(anyhow!(e)).context("Kicking fill ring"),
        }
    }

    fn wait(&self, interest: Interest, timeout: Duration) -> Result<bool> {
        let events = match interest {
            Interest::Readable => PollFlags::POLLIN,
            Interest::Writable => PollFlags::POLLOUT,
        };
        let mut fds = [PollFd::new(self.fd.as_raw_fd(), events)];
        let timeout = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);

        match poll(&mut fds, timeout) {
            Ok(0) | Err(Errno::EINTR) => Ok(false),
            Ok(_) => Ok(fds[0].revents().map_or(false, |r| r.intersects(events))),
            Err(e) => Err(anyhow!(e)).context("Polling socket"),
        }
    }
}

/// Allow locking as much memory as needed for the packet buffers
///
/// # Errors
///
/// Will return `Err` if the limit can not be raised, usually due to missing privileges.
pub fn raise_memlock_limit() -> Result<()> {
    let unlimited = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };

    // SAFETY:
    // unlimited is a valid rlimit for the duration of the call.
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &unlimited) };
    Errno::result(ret).context("Raising RLIMIT_MEMLOCK (missing CAP_IPC_LOCK?)")?;
    Ok(())
}

/// Interface index of `interface`
///
/// # Errors
///
/// Will return `Err` if the interface does not exist.
pub fn nametoindex(interface: &str) -> Result<u32> {
    nix::net::if_::if_nametoindex(interface)
        .with_context(|| format!("Interface {interface} not found"))
}
