// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::classifier::Classifier;
use crate::socket::xsk::XdpMode;
use anyhow::{anyhow, Context, Result};
use libbpf_rs::XdpFlags;
use std::os::fd::{OwnedFd, RawFd};

#[cfg(not(test))]
use {
    libbpf_rs::{libbpf_sys, set_print, MapFlags, MapHandle, MapType, PrintLevel, Xdp},
    nix::errno::Errno,
    std::ffi::CString,
    std::mem::size_of,
    std::os::fd::{AsFd, FromRawFd},
    std::ptr,
};

#[cfg(test)]
use mockall::automock;

#[cfg(not(test))]
type XskMap = MapHandle;
#[cfg(test)]
type XskMap = ();

/// Number of queues the XSKMAP can address
const MAX_QUEUES: u32 = 64;

/// `BPF_PSEUDO_MAP_FD`
const PSEUDO_MAP_FD: u8 = 1;

/// `BPF_FUNC_redirect_map`
const FUNC_REDIRECT_MAP: i32 = 51;

/// `XDP_PASS`
const XDP_PASS: i32 = 2;

/// Offset of `rx_queue_index` in `struct xdp_md`
const XDP_MD_RX_QUEUE_INDEX: i16 = 16;

/// One eBPF instruction, same layout as `struct bpf_insn`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct BpfInsn {
    code: u8,
    regs: u8,
    off: i16,
    imm: i32,
}

impl BpfInsn {
    const fn new(code: u8, dst: u8, src: u8, off: i16, imm: i32) -> Self {
        Self {
            code,
            regs: dst | (src << 4),
            off,
            imm,
        }
    }
}

/// `return bpf_redirect_map(&xsks_map, ctx->rx_queue_index, XDP_PASS);`
///
/// Frames of queues without socket in the map keep going to the stack.
fn redirect_program(map_fd: RawFd) -> [BpfInsn; 6] {
    [
        // r2 = *(u32 *)(r1 + rx_queue_index)
        BpfInsn::new(0x61, 2, 1, XDP_MD_RX_QUEUE_INDEX, 0),
        // r1 = map_fd ll
        BpfInsn::new(0x18, 1, PSEUDO_MAP_FD, 0, map_fd),
        BpfInsn::default(),
        // r3 = XDP_PASS
        BpfInsn::new(0xb7, 3, 0, 0, XDP_PASS),
        // call bpf_redirect_map
        BpfInsn::new(0x85, 0, 0, 0, FUNC_REDIRECT_MAP),
        // exit
        BpfInsn::new(0x95, 0, 0, 0, 0),
    ]
}

/// Attach flags matching the socket binding
fn attach_flags(mode: XdpMode) -> XdpFlags {
    let mode_flags = match mode {
        XdpMode::SkbCopy => XdpFlags::SKB_MODE,
        XdpMode::NativeCopy => XdpFlags::DRV_MODE,
        XdpMode::ZeroCopy => XdpFlags::NONE,
    };
    mode_flags | XdpFlags::UPDATE_IF_NOEXIST
}

/// The kernel operations needed to manage the program
#[cfg_attr(test, automock)]
trait XdpKernel {
    fn nametoindex(&self, interface: &str) -> Result<i32>;
    fn create_xskmap(&self) -> Result<XskMap>;
    fn update_xskmap(&self, map: &XskMap, queue: u32, socket_fd: RawFd) -> Result<()>;
    fn load_program(&self, map: &XskMap) -> Result<OwnedFd>;
    fn attach(&self, prog: &OwnedFd, ifindex: i32, flags: XdpFlags) -> Result<()>;
    fn query_id(&self, prog: &OwnedFd, ifindex: i32, flags: XdpFlags) -> Result<u32>;
    fn detach(&self, prog: &OwnedFd, ifindex: i32, flags: XdpFlags) -> Result<()>;
}

#[cfg(not(test))]
struct Libbpf;

#[cfg(not(test))]
impl XdpKernel for Libbpf {
    fn nametoindex(&self, interface: &str) -> Result<i32> {
        Ok(i32::try_from(crate::socket::nametoindex(interface)?)?)
    }

    fn create_xskmap(&self) -> Result<XskMap> {
        let opts = libbpf_sys::bpf_map_create_opts {
            sz: size_of::<libbpf_sys::bpf_map_create_opts>().try_into()?,
            ..Default::default()
        };

        Ok(MapHandle::create(
            MapType::Xskmap,
            Some("xsks_map"),
            4,
            4,
            MAX_QUEUES,
            &opts,
        )?)
    }

    fn update_xskmap(&self, map: &XskMap, queue: u32, socket_fd: RawFd) -> Result<()> {
        map.update(&queue.to_ne_bytes(), &socket_fd.to_ne_bytes(), MapFlags::ANY)?;
        Ok(())
    }

    fn load_program(&self, map: &XskMap) -> Result<OwnedFd> {
        use std::os::fd::AsRawFd;

        let insns = redirect_program(map.as_fd().as_raw_fd());
        let name = CString::new("xsk_redirect")?;
        let license = CString::new("GPL")?;

        // SAFETY:
        // All pointers are valid for the duration of the call, BpfInsn has
        // the layout of struct bpf_insn and no options are passed.
        let fd = unsafe {
            libbpf_sys::bpf_prog_load(
                libbpf_sys::BPF_PROG_TYPE_XDP,
                name.as_ptr(),
                license.as_ptr(),
                insns.as_ptr().cast::<libbpf_sys::bpf_insn>(),
                insns.len().try_into()?,
                ptr::null(),
            )
        };

        if fd < 0 {
            return Err(anyhow!(Errno::from_i32(-fd))).context("Loading XDP program");
        }

        // SAFETY:
        // The fd was just returned by the kernel and is owned by nothing else.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn attach(&self, prog: &OwnedFd, ifindex: i32, flags: XdpFlags) -> Result<()> {
        Ok(Xdp::new(prog.as_fd()).attach(ifindex, flags)?)
    }

    fn query_id(&self, prog: &OwnedFd, ifindex: i32, flags: XdpFlags) -> Result<u32> {
        Ok(Xdp::new(prog.as_fd()).query_id(ifindex, flags)?)
    }

    fn detach(&self, prog: &OwnedFd, ifindex: i32, flags: XdpFlags) -> Result<()> {
        Ok(Xdp::new(prog.as_fd()).detach(ifindex, flags)?)
    }
}

#[derive(Debug)]
struct Attachment {
    ifindex: i32,
    flags: XdpFlags,
    prog_id: u32,
    prog: OwnedFd,
    _map: XskMap,
}

/// Installs a minimal XDP program redirecting one queue into an XSKMAP
pub struct XdpClassifier {
    kernel: Box<dyn XdpKernel + Send>,
    mode: XdpMode,
    attachment: Option<Attachment>,
}

impl XdpClassifier {
    /// Create a new `XdpClassifier` attaching in the mode matching `mode`
    #[cfg(not(test))]
    #[must_use]
    pub fn new(mode: XdpMode) -> Self {
        set_print(Some((PrintLevel::Debug, print_to_log)));
        Self::with_kernel(Box::new(Libbpf), mode)
    }

    fn with_kernel(kernel: Box<dyn XdpKernel + Send>, mode: XdpMode) -> Self {
        Self {
            kernel,
            mode,
            attachment: None,
        }
    }
}

impl Classifier for XdpClassifier {
    fn install(&mut self, interface: &str, queue: u32, socket_fd: RawFd) -> Result<()> {
        if self.attachment.is_some() {
            return Err(anyhow!("Classifier already installed"));
        }

        if queue >= MAX_QUEUES {
            return Err(anyhow!("Queue {queue} can not be redirected"));
        }

        let ifindex = self.kernel.nametoindex(interface)?;
        let map = self
            .kernel
            .create_xskmap()
            .context("Failed to create XSKMAP")?;
        self.kernel
            .update_xskmap(&map, queue, socket_fd)
            .with_context(|| format!("Failed to insert socket for queue {queue}"))?;

        let prog = self.kernel.load_program(&map)?;
        let flags = attach_flags(self.mode);
        self.kernel.attach(&prog, ifindex, flags).with_context(|| {
            format!("Failed to attach XDP program to {interface} (another program attached?)")
        })?;

        let prog_id = match self.kernel.query_id(&prog, ifindex, flags) {
            Ok(id) => id,
            Err(e) => {
                if let Err(detach_err) = self.kernel.detach(&prog, ifindex, flags) {
                    log::warn!("Failed to detach XDP program from {interface}: {detach_err:#}");
                }
                return Err(e).context("Failed to query attached XDP program");
            }
        };

        log::debug!(
            "Attached XDP program {prog_id} to {interface} ({ifindex}) redirecting queue {queue}"
        );

        self.attachment = Some(Attachment {
            ifindex,
            flags,
            prog_id,
            prog,
            _map: map,
        });

        Ok(())
    }

    fn remove(&mut self) -> Result<()> {
        let Some(attachment) = self.attachment.take() else {
            return Ok(());
        };

        let current = self
            .kernel
            .query_id(&attachment.prog, attachment.ifindex, attachment.flags)
            .context("Failed to query attached XDP program")?;

        if current != attachment.prog_id {
            log::warn!(
                "XDP program {} was replaced by {current} on interface {}, leaving it attached",
                attachment.prog_id,
                attachment.ifindex
            );
            return Ok(());
        }

        self.kernel
            .detach(&attachment.prog, attachment.ifindex, attachment.flags)
            .context("Failed to detach XDP program")?;
        log::debug!(
            "Detached XDP program {} from interface {}",
            attachment.prog_id,
            attachment.ifindex
        );
        Ok(())
    }
}

impl Drop for XdpClassifier {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            log::warn!("{e:#}");
        }
    }
}

#[cfg(not(test))]
#[allow(clippy::needless_pass_by_value)] // interface defined by libbpf-rs
fn print_to_log(level: PrintLevel, msg: String) {
    match level {
        PrintLevel::Debug => log::debug!("{}", msg.trim_end()),
        PrintLevel::Info => log::info!("{}", msg.trim_end()),
        PrintLevel::Warn => log::warn!("{}", msg.trim_end()),
    }
}
