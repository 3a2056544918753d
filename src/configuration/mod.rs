// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
//! Provides the session configuration
//!
//! Options are collected from the command line and an optional YAML file,
//! merged and then resolved into an immutable [`Session`]:
//!
//! ```
//! use tsn_txrx::configuration::{read_yaml, Mode, Operation, SessionOptions};
//! # #[path = "doctest.rs"]
//! # mod doctest;
//! # let tmpfile = doctest::generate_example_yaml()?;
//! # let filepath = tmpfile.path();
//! use std::fs::File;
//!
//! let cli = SessionOptions {
//!     mode: Some(Mode::Receive),
//!     ..SessionOptions::default()
//! };
//! let session = cli.merge(read_yaml(File::open(filepath)?)?).resolve()?;
//! assert_eq!(session.interface, "eth0");
//! assert!(matches!(session.operation(), Operation::Receive { .. }));
//! # Ok::<(), anyhow::Error>(())
//! ```
use crate::clock::ClockKind;
use crate::engine::{Backoff, IdleStrategy};
use crate::frame::{
    FrameTemplate, FrameTemplateBuilder, DEFAULT_DESTINATION, DEFAULT_SOURCE, DEFAULT_VLAN_ID,
    MAX_PACKET_SIZE, MAX_QUEUE_ID, MIN_PACKET_SIZE,
};
use crate::socket::packet::PacketConfig;
use crate::socket::xsk::{XdpMode, XskConfig};
use crate::umem::{UmemGeometry, MAX_FRAME_SIZE, MIN_FRAME_SIZE};
use anyhow::{anyhow, Result};
use clap::ValueEnum;
use eui48::MacAddress;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::RangeInclusive;
use std::time::Duration;

mod yaml;
pub use yaml::read_yaml;

const QUEUE_RANGE: RangeInclusive<u32> = 0..=MAX_QUEUE_ID;
const PCP_RANGE: RangeInclusive<u8> = 0..=7;
const VLAN_ID_RANGE: RangeInclusive<u16> = 0..=4095;
const CYCLE_TIME_RANGE: RangeInclusive<u64> = 25_000..=50_000_000;
const FRAME_COUNT_RANGE: RangeInclusive<u32> = 1..=10_000_000;
const TX_OFFSET_RANGE: RangeInclusive<u64> = 0..=100_000_000;
const EARLY_WAKE_OFFSET_RANGE: RangeInclusive<u64> = 0..=10_000_000;
const TURNAROUND_RANGE: RangeInclusive<u64> = 0..=100_000_000;
const RING_SIZE_RANGE: RangeInclusive<u32> = 64..=16_384;

const DEFAULT_CYCLE_TIME_NS: u64 = 100_000;
const DEFAULT_FRAME_COUNT: u32 = 1000;
const DEFAULT_EARLY_WAKE_OFFSET_NS: u64 = 100_000;
const DEFAULT_TURNAROUND_NS: u64 = 50_000;
const DEFAULT_SETTLE_TIME_MS: u64 = 7000;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 1000;

/// Which kind of socket carries the traffic
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    /// `AF_XDP` socket with shared packet buffers
    #[default]
    ZeroCopyRing,

    /// `AF_PACKET` socket, every frame is copied
    RawSocket,
}

/// What the session does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Send frames on the grid
    Transmit,

    /// Receive frames and print their latency
    Receive,

    /// Send received frames back on the grid
    Forward,

    /// Transmit and receive at the same time over one socket
    Bidirectional,
}

/// The resolved operation, carrying only what it needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Send `frame_count` frames
    Transmit {
        /// Number of frames
        frame_count: u32,
    },

    /// Receive until sequence `frame_count` arrives
    Receive {
        /// Last expected sequence
        frame_count: u32,
    },

    /// Forward until sequence `frame_count` was sent back
    Forward {
        /// Last expected sequence
        frame_count: u32,

        /// Minimum time between arrival and retransmission
        turnaround: u64,
    },

    /// Transmit and receive `frame_count` frames
    Bidirectional {
        /// Number of frames in each direction
        frame_count: u32,
    },
}

/// Unresolved options, every field may be missing
///
/// The field names are also the keys of the YAML file.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionOptions {
    /// Network interface
    pub interface: Option<String>,

    /// Socket kind
    pub transport: Option<Transport>,

    /// Operating mode
    pub mode: Option<Mode>,

    /// Binding of the `AF_XDP` socket
    pub xdp_mode: Option<XdpMode>,

    /// Queue id, also the socket priority
    pub queue: Option<u32>,

    /// Priority code point in the VLAN tag, defaults to the queue
    pub vlan_priority: Option<u8>,

    /// VLAN identifier
    pub vlan_id: Option<u16>,

    /// On-wire size of every frame without FCS
    pub packet_size: Option<usize>,

    /// Cycle time in nanoseconds
    pub cycle_time_ns: Option<u64>,

    /// Frames to send, or last expected sequence
    pub frame_count: Option<u32>,

    /// Phase of the grid in nanoseconds
    pub tx_offset_ns: Option<u64>,

    /// Wake up this long before the deadline
    pub early_wake_offset_ns: Option<u64>,

    /// Minimum time between arrival and retransmission when forwarding
    pub turnaround_ns: Option<u64>,

    /// Destination address
    #[serde(with = "serialize_mac_address")]
    pub destination: Option<MacAddress>,

    /// Source address
    #[serde(with = "serialize_mac_address")]
    pub source: Option<MacAddress>,

    /// Size of each packet buffer
    pub frame_size: Option<u32>,

    /// Number of packet buffers, also the size of every ring
    pub ring_size: Option<u32>,

    /// Clock for timestamps and launch times
    pub clock: Option<ClockKind>,

    /// Wait after binding before zero-copy transmission starts
    pub settle_time_ms: Option<u64>,

    /// Maximum time to block in `poll()`
    pub poll_timeout_ms: Option<u64>,

    /// Pass the deadline to the kernel as launch time
    pub launch_time: Option<bool>,

    /// Enable hardware timestamps
    pub hw_timestamps: Option<bool>,

    /// Shorthand for `idle: block`
    pub poll: Option<bool>,

    /// What the engines do while the rings are empty or full
    pub idle: Option<IdleStrategy>,

    /// Only kick the kernel when it asks for it
    pub need_wakeup: Option<bool>,

    /// Install the XDP redirect program
    pub classifier: Option<bool>,
}

mod serialize_mac_address {
    use eui48::MacAddress;
    use serde::{self, Deserialize, Deserializer, Serializer};

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub(super) fn serialize<S>(addr: &Option<MacAddress>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match addr {
            Some(addr) => serializer.serialize_str(&addr.to_hex_string()),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Option<MacAddress>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| MacAddress::parse_str(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Collects all range violations instead of stopping at the first one
#[derive(Debug, Default)]
struct Validator {
    errors: Vec<String>,
}

impl Validator {
    fn range<T>(&mut self, name: &str, value: T, range: &RangeInclusive<T>) -> T
    where
        T: PartialOrd + Display + Copy,
    {
        if !range.contains(&value) {
            self.errors.push(format!(
                "{name} {value} not within {}..={}",
                range.start(),
                range.end()
            ));
        }
        value
    }

    fn power_of_two(&mut self, name: &str, value: u32, range: &RangeInclusive<u32>) -> u32 {
        if !value.is_power_of_two() {
            self.errors
                .push(format!("{name} {value} is not a power of two"));
        }
        self.range(name, value, range)
    }

    fn required<T>(&mut self, name: &str, value: Option<T>) -> Option<T> {
        if value.is_none() {
            self.errors.push(format!("{name} is required"));
        }
        value
    }

    fn check(&mut self, condition: bool, message: &str) {
        if !condition {
            self.errors.push(message.to_owned());
        }
    }

    fn finish(self) -> Result<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "Invalid configuration:\n  {}",
                self.errors.join("\n  ")
            ))
        }
    }
}

impl SessionOptions {
    /// Fill every missing field from `fallback`
    #[must_use]
    pub fn merge(self, fallback: Self) -> Self {
        Self {
            interface: self.interface.or(fallback.interface),
            transport: self.transport.or(fallback.transport),
            mode: self.mode.or(fallback.mode),
            xdp_mode: self.xdp_mode.or(fallback.xdp_mode),
            queue: self.queue.or(fallback.queue),
            vlan_priority: self.vlan_priority.or(fallback.vlan_priority),
            vlan_id: self.vlan_id.or(fallback.vlan_id),
            packet_size: self.packet_size.or(fallback.packet_size),
            cycle_time_ns: self.cycle_time_ns.or(fallback.cycle_time_ns),
            frame_count: self.frame_count.or(fallback.frame_count),
            tx_offset_ns: self.tx_offset_ns.or(fallback.tx_offset_ns),
            early_wake_offset_ns: self.early_wake_offset_ns.or(fallback.early_wake_offset_ns),
            turnaround_ns: self.turnaround_ns.or(fallback.turnaround_ns),
            destination: self.destination.or(fallback.destination),
            source: self.source.or(fallback.source),
            frame_size: self.frame_size.or(fallback.frame_size),
            ring_size: self.ring_size.or(fallback.ring_size),
            clock: self.clock.or(fallback.clock),
            settle_time_ms: self.settle_time_ms.or(fallback.settle_time_ms),
            poll_timeout_ms: self.poll_timeout_ms.or(fallback.poll_timeout_ms),
            launch_time: self.launch_time.or(fallback.launch_time),
            hw_timestamps: self.hw_timestamps.or(fallback.hw_timestamps),
            poll: self.poll.or(fallback.poll),
            idle: self.idle.or(fallback.idle),
            need_wakeup: self.need_wakeup.or(fallback.need_wakeup),
            classifier: self.classifier.or(fallback.classifier),
        }
    }

    /// Apply defaults and validate
    ///
    /// # Errors
    ///
    /// Will return `Err` listing every missing or out-of-range value.
    pub fn resolve(self) -> Result<Session> {
        let mut v = Validator::default();

        let interface = v.required("interface", self.interface);
        let mode = v.required("mode", self.mode);
        let transport = self.transport.unwrap_or_default();
        if let Some(mode @ (Mode::Forward | Mode::Bidirectional)) = mode {
            v.check(
                transport == Transport::ZeroCopyRing,
                &format!("{mode:?} mode requires the zero-copy-ring transport"),
            );
        }

        let queue = v.range("queue", self.queue.unwrap_or(0), &QUEUE_RANGE);
        let default_pcp = u8::try_from(queue).unwrap_or(0);
        let vlan_priority = v.range(
            "VLAN priority",
            self.vlan_priority.unwrap_or(default_pcp),
            &PCP_RANGE,
        );
        let vlan_id = v.range(
            "VLAN id",
            self.vlan_id.unwrap_or(DEFAULT_VLAN_ID),
            &VLAN_ID_RANGE,
        );
        let packet_size = v.range(
            "packet size",
            self.packet_size.unwrap_or(MIN_PACKET_SIZE),
            &(MIN_PACKET_SIZE..=MAX_PACKET_SIZE),
        );
        let cycle_time = v.range(
            "cycle time",
            self.cycle_time_ns.unwrap_or(DEFAULT_CYCLE_TIME_NS),
            &CYCLE_TIME_RANGE,
        );
        let frame_count = v.range(
            "frame count",
            self.frame_count.unwrap_or(DEFAULT_FRAME_COUNT),
            &FRAME_COUNT_RANGE,
        );
        let tx_offset = v.range(
            "TX offset",
            self.tx_offset_ns.unwrap_or(0),
            &TX_OFFSET_RANGE,
        );
        let early_wake_offset = v.range(
            "early wake offset",
            self.early_wake_offset_ns
                .unwrap_or(DEFAULT_EARLY_WAKE_OFFSET_NS),
            &EARLY_WAKE_OFFSET_RANGE,
        );
        let turnaround = v.range(
            "turnaround",
            self.turnaround_ns.unwrap_or(DEFAULT_TURNAROUND_NS),
            &TURNAROUND_RANGE,
        );
        let frame_size = v.power_of_two(
            "frame size",
            self.frame_size.unwrap_or(crate::umem::DEFAULT_FRAME_SIZE),
            &(MIN_FRAME_SIZE..=MAX_FRAME_SIZE),
        );
        let ring_size = v.power_of_two(
            "ring size",
            self.ring_size.unwrap_or(crate::umem::DEFAULT_FRAME_COUNT),
            &RING_SIZE_RANGE,
        );

        v.finish()?;
        let (Some(interface), Some(mode)) = (interface, mode) else {
            return Err(anyhow!("Invalid configuration"));
        };

        let launch_time = self.launch_time.unwrap_or(false);
        Ok(Session {
            interface,
            transport,
            mode,
            xdp_mode: self.xdp_mode.unwrap_or_default(),
            queue,
            vlan_priority,
            vlan_id,
            packet_size,
            cycle_time,
            frame_count,
            tx_offset,
            early_wake_offset,
            turnaround,
            destination: self.destination.unwrap_or(DEFAULT_DESTINATION),
            source: self.source.unwrap_or(DEFAULT_SOURCE),
            geometry: UmemGeometry {
                frame_count: ring_size,
                frame_size,
                tx_metadata: launch_time && mode != Mode::Receive,
            },
            clock: self.clock.unwrap_or_default(),
            settle_time: Duration::from_millis(
                self.settle_time_ms.unwrap_or(DEFAULT_SETTLE_TIME_MS),
            ),
            poll_timeout: Duration::from_millis(
                self.poll_timeout_ms.unwrap_or(DEFAULT_POLL_TIMEOUT_MS),
            ),
            launch_time,
            hw_timestamps: self.hw_timestamps.unwrap_or(false),
            idle: self.idle.unwrap_or(if self.poll.unwrap_or(false) {
                IdleStrategy::Block
            } else {
                IdleStrategy::Yield
            }),
            need_wakeup: self.need_wakeup.unwrap_or(false),
            classifier: self.classifier.unwrap_or(true),
        })
    }
}

/// Validated configuration of one run, never changed afterwards
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Session {
    /// Network interface
    pub interface: String,

    /// Socket kind
    pub transport: Transport,

    /// Operating mode
    pub mode: Mode,

    /// Binding of the `AF_XDP` socket
    pub xdp_mode: XdpMode,

    /// Queue id, also the socket priority
    pub queue: u32,

    /// Priority code point in the VLAN tag
    pub vlan_priority: u8,

    /// VLAN identifier
    pub vlan_id: u16,

    /// On-wire size of every frame
    pub packet_size: usize,

    /// Cycle time in nanoseconds
    pub cycle_time: u64,

    /// Frames to send, or last expected sequence
    pub frame_count: u32,

    /// Phase of the grid in nanoseconds
    pub tx_offset: u64,

    /// Wake up this long before the deadline
    pub early_wake_offset: u64,

    /// Minimum time between arrival and retransmission
    pub turnaround: u64,

    /// Destination address
    pub destination: MacAddress,

    /// Source address
    pub source: MacAddress,

    /// Packet buffer dimensions
    pub geometry: UmemGeometry,

    /// Clock for timestamps and launch times
    pub clock: ClockKind,

    /// Wait after binding before zero-copy transmission starts
    pub settle_time: Duration,

    /// Maximum time to block in `poll()`
    pub poll_timeout: Duration,

    /// Pass the deadline to the kernel as launch time
    pub launch_time: bool,

    /// Enable hardware timestamps
    pub hw_timestamps: bool,

    /// What the engines do while the rings are empty or full
    pub idle: IdleStrategy,

    /// Only kick the kernel when it asks for it
    pub need_wakeup: bool,

    /// Install the XDP redirect program
    pub classifier: bool,
}

impl Session {
    /// What to run
    #[must_use]
    pub const fn operation(&self) -> Operation {
        let frame_count = self.frame_count;
        match self.mode {
            Mode::Transmit => Operation::Transmit { frame_count },
            Mode::Receive => Operation::Receive { frame_count },
            Mode::Forward => Operation::Forward {
                frame_count,
                turnaround: self.turnaround,
            },
            Mode::Bidirectional => Operation::Bidirectional { frame_count },
        }
    }

    /// Template of the transmitted frames
    ///
    /// # Errors
    ///
    /// Will return `Err` if VLAN or packet size are out of range.
    pub fn frame_template(&self) -> Result<FrameTemplate> {
        Ok(FrameTemplateBuilder::new()
            .source(self.source)
            .destination(self.destination)
            .vlan_tci(self.vlan_id, self.vlan_priority)?
            .packet_size(self.packet_size)?
            .build())
    }

    /// Number of packet buffers offered for reception
    #[must_use]
    pub const fn fill_frames(&self) -> u32 {
        match self.mode {
            Mode::Transmit => 0,
            Mode::Receive | Mode::Forward => self.geometry.frame_count,
            Mode::Bidirectional => self.geometry.frame_count >> 1,
        }
    }

    /// Binding of the `AF_XDP` socket
    #[must_use]
    pub fn xsk_config(&self) -> XskConfig {
        XskConfig {
            interface: self.interface.clone(),
            queue: self.queue,
            mode: self.xdp_mode,
            need_wakeup: self.need_wakeup,
            hw_timestamps: self.hw_timestamps,
            geometry: self.geometry,
            fill_frames: self.fill_frames(),
        }
    }

    /// Options of the `AF_PACKET` sockets
    #[must_use]
    pub fn packet_config(&self) -> PacketConfig {
        PacketConfig {
            interface: self.interface.clone(),
            priority: self.queue,
            clock: self.clock,
            launch_time: self.launch_time,
            hw_timestamps: self.hw_timestamps,
            destination: self.destination,
        }
    }

    /// Idle strategy of all engines
    #[must_use]
    pub const fn backoff(&self) -> Backoff {
        Backoff::new(self.idle, self.poll_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> SessionOptions {
        SessionOptions {
            interface: Some("eth0".to_owned()),
            mode: Some(Mode::Transmit),
            ..SessionOptions::default()
        }
    }

    #[test]
    fn test_defaults() -> Result<()> {
        let session = minimal().resolve()?;
        assert_eq!(session.transport, Transport::ZeroCopyRing);
        assert_eq!(session.xdp_mode, XdpMode::ZeroCopy);
        assert_eq!(session.queue, 0);
        assert_eq!(session.vlan_id, 3);
        assert_eq!(session.packet_size, 64);
        assert_eq!(session.cycle_time, 100_000);
        assert_eq!(session.frame_count, 1000);
        assert_eq!(session.early_wake_offset, 100_000);
        assert_eq!(session.turnaround, 50_000);
        assert_eq!(session.destination, DEFAULT_DESTINATION);
        assert_eq!(session.geometry, UmemGeometry::default());
        assert_eq!(session.settle_time, Duration::from_secs(7));
        assert_eq!(session.backoff(), Backoff::Yield);
        assert!(session.classifier);
        assert_eq!(
            session.operation(),
            Operation::Transmit { frame_count: 1000 }
        );
        Ok(())
    }

    #[test]
    fn test_vlan_priority_follows_queue() -> Result<()> {
        let session = SessionOptions {
            queue: Some(5),
            ..minimal()
        }
        .resolve()?;
        assert_eq!(session.vlan_priority, 5);
        assert_eq!(session.packet_config().priority, 5);

        let session = SessionOptions {
            queue: Some(5),
            vlan_priority: Some(1),
            ..minimal()
        }
        .resolve()?;
        assert_eq!(session.vlan_priority, 1);
        Ok(())
    }

    #[test]
    fn test_merge_prefers_first() {
        let cli = SessionOptions {
            queue: Some(2),
            ..SessionOptions::default()
        };
        let file = SessionOptions {
            queue: Some(4),
            interface: Some("eth1".to_owned()),
            ..SessionOptions::default()
        };
        let merged = cli.merge(file);
        assert_eq!(merged.queue, Some(2));
        assert_eq!(merged.interface.as_deref(), Some("eth1"));
    }

    #[test]
    fn test_all_errors_reported() {
        let result = SessionOptions {
            queue: Some(8),
            packet_size: Some(63),
            cycle_time_ns: Some(1000),
            ring_size: Some(100),
            ..SessionOptions::default()
        }
        .resolve();

        let message = result.err().map(|e| e.to_string()).unwrap_or_default();
        for expected in [
            "interface is required",
            "mode is required",
            "queue 8 not within 0..=7",
            "packet size 63 not within 64..=1500",
            "cycle time 1000 not within 25000..=50000000",
            "ring size 100 is not a power of two",
        ] {
            assert!(message.contains(expected), "{expected} missing in {message}");
        }
    }

    #[test]
    fn test_raw_socket_restrictions() -> Result<()> {
        for mode in [Mode::Forward, Mode::Bidirectional] {
            assert!(SessionOptions {
                transport: Some(Transport::RawSocket),
                mode: Some(mode),
                ..minimal()
            }
            .resolve()
            .is_err());
        }

        let session = SessionOptions {
            transport: Some(Transport::RawSocket),
            mode: Some(Mode::Receive),
            ..minimal()
        }
        .resolve()?;
        assert_eq!(session.operation(), Operation::Receive { frame_count: 1000 });
        Ok(())
    }

    #[test]
    fn test_slot_partitioning() -> Result<()> {
        let fill = |mode| -> Result<u32> {
            Ok(SessionOptions {
                mode: Some(mode),
                ring_size: Some(256),
                ..minimal()
            }
            .resolve()?
            .fill_frames())
        };
        assert_eq!(fill(Mode::Transmit)?, 0);
        assert_eq!(fill(Mode::Receive)?, 256);
        assert_eq!(fill(Mode::Forward)?, 256);
        assert_eq!(fill(Mode::Bidirectional)?, 128);
        Ok(())
    }

    #[test]
    fn test_tx_metadata_only_when_sending_with_launch_time() -> Result<()> {
        let with = |mode, launch_time| -> Result<bool> {
            Ok(SessionOptions {
                mode: Some(mode),
                launch_time: Some(launch_time),
                ..minimal()
            }
            .resolve()?
            .geometry
            .tx_metadata)
        };
        assert!(with(Mode::Transmit, true)?);
        assert!(with(Mode::Forward, true)?);
        assert!(!with(Mode::Receive, true)?);
        assert!(!with(Mode::Transmit, false)?);
        Ok(())
    }

    #[test]
    fn test_frame_template() -> Result<()> {
        let session = SessionOptions {
            packet_size: Some(1500),
            vlan_id: Some(100),
            ..minimal()
        }
        .resolve()?;
        let frame = session.frame_template()?.build(&crate::frame::Payload::default())?;
        assert_eq!(frame.len(), 1500);
        assert_eq!(u16::from_be_bytes([frame[14], frame[15]]) & 0x0fff, 100);
        Ok(())
    }

    #[test]
    fn test_idle_strategy() -> Result<()> {
        let timeout = Duration::from_millis(20);
        for (idle, poll, expected) in [
            (Some(IdleStrategy::Spin), None, Backoff::Spin),
            (Some(IdleStrategy::Yield), Some(true), Backoff::Yield),
            (Some(IdleStrategy::Block), None, Backoff::Block(timeout)),
            (None, Some(true), Backoff::Block(timeout)),
            (None, None, Backoff::Yield),
        ] {
            let session = SessionOptions {
                idle,
                poll,
                poll_timeout_ms: Some(20),
                ..minimal()
            }
            .resolve()?;
            assert_eq!(session.backoff(), expected);
        }
        Ok(())
    }
}
