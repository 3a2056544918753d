// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
//! Steering of received frames into an `AF_XDP` socket
//!
//! An `AF_XDP` socket only sees frames an XDP program redirects to it.
//! The classifier installs such a program on the interface and removes it
//! again when the socket is released.
#![cfg_attr(not(feature = "bpf"), doc = "```ignore")]
#![cfg_attr(feature = "bpf", doc = "```no_run")]
//! use tsn_txrx::classifier::{Classifier, XdpClassifier};
//! use tsn_txrx::socket::xsk::XdpMode;
//! let mut classifier = XdpClassifier::new(XdpMode::NativeCopy);
//! classifier.install("eth0", 2, 7)?;
//! classifier.remove()?;
//! # Ok::<(), anyhow::Error>(())
//! ```
use anyhow::Result;
use std::os::fd::RawFd;

#[cfg(test)]
use mockall::automock;

/// Defines how received frames are steered into a socket
#[cfg_attr(test, automock)]
pub trait Classifier {
    /// Redirect all frames arriving on `queue` of `interface` into `socket_fd`
    ///
    /// # Errors
    ///
    /// Will return `Err` if the interface does not exist or a program
    /// could not be loaded or attached.
    fn install(&mut self, interface: &str, queue: u32, socket_fd: RawFd) -> Result<()>;

    /// Undo [`install`](Self::install)
    ///
    /// Does nothing if nothing is installed.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the program could not be detached.
    fn remove(&mut self) -> Result<()>;
}

#[cfg(feature = "bpf")]
mod xdp;
#[cfg(feature = "bpf")]
pub use xdp::XdpClassifier;

/// A classifier doing nothing, but still providing the `Classifier` trait
///
/// Useful if the redirection is set up externally, e.g. by another program
/// already attached to the interface.
#[derive(Debug, Default)]
pub struct DummyClassifier;

impl Classifier for DummyClassifier {
    fn install(&mut self, interface: &str, queue: u32, _socket_fd: RawFd) -> Result<()> {
        log::info!("Expecting frames of {interface} queue {queue} to be redirected externally");
        Ok(())
    }

    fn remove(&mut self) -> Result<()> {
        Ok(())
    }
}
