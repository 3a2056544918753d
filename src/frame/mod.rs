// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later
//
//! Wire format of the test traffic
//!
//! Every frame is an 802.1Q tagged Ethernet frame with the UADP ethertype
//! followed by a small payload and padding up to the configured size:
//!
//! ```text
//! | dst (6) | src (6) | 0x8100 | PCP/VID | 0xb62c | queue | seq | tx_ts | rx_ts | 0xab ... |
//! ```
//!
//! The payload fields are in host byte order since both ends run this tool.
//!
//! ```
//! use tsn_txrx::frame::{FrameTemplateBuilder, Payload, parse};
//! let template = FrameTemplateBuilder::new()
//!     .destination("22:bb:22:bb:22:bb".parse()?)
//!     .vlan_tci(3, 2)?
//!     .packet_size(64)?
//!     .build();
//! let payload = Payload { queue_id: 2, sequence: 1, tx_timestamp: 100, rx_timestamp: 0 };
//! let frame = template.build(&payload)?;
//! assert_eq!(frame.len(), 64);
//! assert_eq!(parse(&frame), Ok(payload));
//! # Ok::<(), anyhow::Error>(())
//! ```
use anyhow::{anyhow, Result};
use etherparse::{EtherType, Ethernet2Header, SingleVlanHeader, VlanId, VlanPcp};
use eui48::MacAddress;
use std::fmt;

/// Ethertype of the test traffic
///
/// OPC UA UADP is used instead of the IEEE 1722 ethertype since some NICs
/// steer 1722 frames into queue 0 regardless of their VLAN priority.
pub const ETH_P_TSN_UADP: u16 = 0xb62c;

/// Length of Ethernet header plus VLAN tag
pub const HEADER_LEN: usize = 18;

/// Length of the serialized [`Payload`]
pub const PAYLOAD_LEN: usize = 24;

/// Smallest frame that can be configured
pub const MIN_PACKET_SIZE: usize = 64;

/// Largest frame that can be configured
pub const MAX_PACKET_SIZE: usize = 1500;

/// Highest sequence number a receiver accepts
pub const MAX_SEQUENCE: u32 = 50_000_000;

/// Highest queue id a receiver accepts
pub const MAX_QUEUE_ID: u32 = 7;

/// Default source address
pub const DEFAULT_SOURCE: MacAddress = MacAddress::new([0xaa, 0x00, 0xaa, 0x00, 0xaa, 0x00]);

/// Default destination address
pub const DEFAULT_DESTINATION: MacAddress = MacAddress::new([0x22, 0xbb, 0x22, 0xbb, 0x22, 0xbb]);

/// Default VLAN identifier
pub const DEFAULT_VLAN_ID: u16 = 3;

const PADDING: u8 = 0xab;

/// Measurement data carried by every frame
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Payload {
    /// Queue the sender transmitted on
    pub queue_id: u32,

    /// Per-sender sequence number, starting at 1
    pub sequence: u32,

    /// Software time right before the frame was handed to the kernel
    pub tx_timestamp: u64,

    /// Arrival time at a forwarding node, 0 otherwise
    pub rx_timestamp: u64,
}

impl Payload {
    /// Convert into fixed-size array
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PAYLOAD_LEN] {
        let mut result = [0; PAYLOAD_LEN];
        result[0..4].copy_from_slice(&self.queue_id.to_ne_bytes());
        result[4..8].copy_from_slice(&self.sequence.to_ne_bytes());
        result[8..16].copy_from_slice(&self.tx_timestamp.to_ne_bytes());
        result[16..24].copy_from_slice(&self.rx_timestamp.to_ne_bytes());
        result
    }

    /// Parse from the start of `bytes`, `None` if too short
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; PAYLOAD_LEN] = bytes.get(..PAYLOAD_LEN)?.try_into().ok()?;
        Some(Self {
            queue_id: u32::from_ne_bytes(bytes[0..4].try_into().ok()?),
            sequence: u32::from_ne_bytes(bytes[4..8].try_into().ok()?),
            tx_timestamp: u64::from_ne_bytes(bytes[8..16].try_into().ok()?),
            rx_timestamp: u64::from_ne_bytes(bytes[16..24].try_into().ok()?),
        })
    }

    /// Write into a complete frame right behind the headers
    ///
    /// # Errors
    ///
    /// Will return `Err` if the frame is too short to hold the payload.
    pub fn write_to(&self, frame: &mut [u8]) -> Result<()> {
        let frame_len = frame.len();
        frame
            .get_mut(HEADER_LEN..HEADER_LEN + PAYLOAD_LEN)
            .ok_or_else(|| anyhow!("Frame of {} bytes too short for payload", frame_len))?
            .copy_from_slice(&self.to_bytes());
        Ok(())
    }

    /// Read from a complete frame with VLAN tag
    #[must_use]
    pub fn read_from(frame: &[u8]) -> Option<Self> {
        Self::from_bytes(frame.get(HEADER_LEN..)?)
    }
}

/// Precomputed headers of the outgoing traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameTemplate {
    header: [u8; HEADER_LEN],
    packet_size: usize,
}

impl FrameTemplate {
    /// On-wire size of every frame (without FCS)
    #[must_use]
    pub const fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Write headers, payload and padding into `buffer`
    ///
    /// Returns the number of bytes written, i.e. the packet size.
    ///
    /// # Errors
    ///
    /// Will return `Err` if `buffer` is shorter than the packet size.
    pub fn write(&self, buffer: &mut [u8], payload: &Payload) -> Result<usize> {
        let buffer_len = buffer.len();
        let frame = buffer.get_mut(..self.packet_size).ok_or_else(|| {
            anyhow!(
                "Buffer of {} bytes too short for packet of {} bytes",
                buffer_len,
                self.packet_size
            )
        })?;
        let (header, rest) = frame.split_at_mut(HEADER_LEN);
        header.copy_from_slice(&self.header);
        rest.fill(PADDING);
        payload.write_to(frame)?;
        Ok(self.packet_size)
    }

    /// Build a complete frame
    ///
    /// # Errors
    ///
    /// Only fails if the template is inconsistent, which the builder prevents.
    pub fn build(&self, payload: &Payload) -> Result<Vec<u8>> {
        let mut frame = vec![0; self.packet_size];
        self.write(&mut frame, payload)?;
        Ok(frame)
    }
}

/// Builds a [`FrameTemplate`]
#[derive(Debug)]
pub struct FrameTemplateBuilder {
    ethernet_header: Ethernet2Header,
    vlan_header: SingleVlanHeader,
    packet_size: usize,
}

impl Default for FrameTemplateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTemplateBuilder {
    /// Start with the default addresses, VLAN 3, priority 0 and minimal size
    #[must_use]
    pub fn new() -> Self {
        let mut vlan_header = SingleVlanHeader {
            ether_type: EtherType(ETH_P_TSN_UADP),
            ..Default::default()
        };
        if let Ok(vlan_id) = VlanId::try_new(DEFAULT_VLAN_ID) {
            vlan_header.vlan_id = vlan_id;
        }

        Self {
            ethernet_header: Ethernet2Header {
                source: DEFAULT_SOURCE.to_array(),
                destination: DEFAULT_DESTINATION.to_array(),
                ether_type: EtherType::VLAN_TAGGED_FRAME,
            },
            vlan_header,
            packet_size: MIN_PACKET_SIZE,
        }
    }

    /// Source address
    #[must_use]
    pub fn source(mut self, source: MacAddress) -> Self {
        self.ethernet_header.source = source.to_array();
        self
    }

    /// Destination address
    #[must_use]
    pub fn destination(mut self, destination: MacAddress) -> Self {
        self.ethernet_header.destination = destination.to_array();
        self
    }

    /// VLAN identifier and priority code point
    ///
    /// # Errors
    ///
    /// Will return `Err` if `vlan` does not fit in 12 bit or `pcp` not in 3 bit.
    pub fn vlan_tci(mut self, vlan: u16, pcp: u8) -> Result<Self> {
        self.vlan_header.pcp = VlanPcp::try_new(pcp)?;
        self.vlan_header.vlan_id = VlanId::try_new(vlan)?;
        Ok(self)
    }

    /// On-wire size of the frame
    ///
    /// # Errors
    ///
    /// Will return `Err` if `size` is outside of the supported range.
    pub fn packet_size(mut self, size: usize) -> Result<Self> {
        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&size) {
            return Err(anyhow!(
                "Packet size {size} not within {MIN_PACKET_SIZE}..={MAX_PACKET_SIZE}"
            ));
        }
        self.packet_size = size;
        Ok(self)
    }

    /// Build the template
    #[must_use]
    pub fn build(self) -> FrameTemplate {
        let mut header = [0; HEADER_LEN];
        header[..Ethernet2Header::LEN].copy_from_slice(&self.ethernet_header.to_bytes());
        header[Ethernet2Header::LEN..].copy_from_slice(&self.vlan_header.to_bytes());
        FrameTemplate {
            header,
            packet_size: self.packet_size,
        }
    }
}

/// Why a received frame was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Zero-length frame
    Empty,

    /// Frame ends before the payload does
    Truncated,

    /// Not test traffic
    ForeignEtherType(u16),

    /// Sequence number 0 or implausibly high
    SequenceOutOfRange(u32),

    /// Queue id that no sender can use
    QueueOutOfRange(u32),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty frame"),
            Self::Truncated => write!(f, "truncated frame"),
            Self::ForeignEtherType(t) => write!(f, "foreign ethertype {t:#06x}"),
            Self::SequenceOutOfRange(s) => write!(f, "sequence {s} out of range"),
            Self::QueueOutOfRange(q) => write!(f, "queue {q} out of range"),
        }
    }
}

impl std::error::Error for DropReason {}

/// Validate a received frame and extract its payload
///
/// The VLAN tag may be missing if the NIC stripped it on receive.
///
/// # Errors
///
/// Returns the [`DropReason`] if the frame is not valid test traffic.
pub fn parse(frame: &[u8]) -> Result<Payload, DropReason> {
    if frame.is_empty() {
        return Err(DropReason::Empty);
    }

    let (ethernet, rest) =
        Ethernet2Header::from_slice(frame).map_err(|_e| DropReason::Truncated)?;

    let (ether_type, rest) = if ethernet.ether_type == EtherType::VLAN_TAGGED_FRAME {
        let (vlan, rest) = SingleVlanHeader::from_slice(rest).map_err(|_e| DropReason::Truncated)?;
        (vlan.ether_type, rest)
    } else {
        (ethernet.ether_type, rest)
    };

    if ether_type != EtherType(ETH_P_TSN_UADP) {
        return Err(DropReason::ForeignEtherType(ether_type.0));
    }

    let payload = Payload::from_bytes(rest).ok_or(DropReason::Truncated)?;

    if payload.sequence == 0 || payload.sequence > MAX_SEQUENCE {
        return Err(DropReason::SequenceOutOfRange(payload.sequence));
    }

    if payload.queue_id > MAX_QUEUE_ID {
        return Err(DropReason::QueueOutOfRange(payload.queue_id));
    }

    Ok(payload)
}

/// Swap source and destination address in place
///
/// # Errors
///
/// Will return `Err` if the frame is shorter than two addresses.
pub fn swap_addresses(frame: &mut [u8]) -> Result<()> {
    let addresses = frame
        .get_mut(..12)
        .ok_or_else(|| anyhow!("Frame too short to swap addresses"))?;
    let (destination, source) = addresses.split_at_mut(6);
    destination.swap_with_slice(source);
    Ok(())
}

/// Store the arrival time in the payload of a frame accepted by [`parse`]
///
/// # Errors
///
/// Will return `Err` if the frame is too short to hold the payload.
pub fn set_rx_timestamp(frame: &mut [u8], rx_timestamp: u64) -> Result<()> {
    let tagged = frame.get(12..14) == Some(&EtherType::VLAN_TAGGED_FRAME.0.to_be_bytes()[..]);
    let payload_start = if tagged {
        HEADER_LEN
    } else {
        Ethernet2Header::LEN
    };
    let frame_len = frame.len();
    frame
        .get_mut(payload_start + 16..payload_start + PAYLOAD_LEN)
        .ok_or_else(|| anyhow!("Frame of {} bytes too short for payload", frame_len))?
        .copy_from_slice(&rx_timestamp.to_ne_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(size: usize) -> Result<FrameTemplate> {
        Ok(FrameTemplateBuilder::new()
            .source("aa:00:aa:00:aa:00".parse()?)
            .destination("22:bb:22:bb:22:bb".parse()?)
            .vlan_tci(3, 5)?
            .packet_size(size)?
            .build())
    }

    const PAYLOAD: Payload = Payload {
        queue_id: 5,
        sequence: 17,
        tx_timestamp: 1_700_000_000_000_000_000,
        rx_timestamp: 0,
    };

    #[test]
    fn test_header_layout() -> Result<()> {
        let frame = template(64)?.build(&PAYLOAD)?;
        assert_eq!(frame[0..6], [0x22, 0xbb, 0x22, 0xbb, 0x22, 0xbb]);
        assert_eq!(frame[6..12], [0xaa, 0x00, 0xaa, 0x00, 0xaa, 0x00]);
        assert_eq!(frame[12..14], [0x81, 0x00]);
        // PCP 5, DEI 0, VID 3
        assert_eq!(frame[14..16], [0xa0, 0x03]);
        assert_eq!(frame[16..18], [0xb6, 0x2c]);
        assert_eq!(Payload::read_from(&frame), Some(PAYLOAD));
        assert!(frame[HEADER_LEN + PAYLOAD_LEN..].iter().all(|b| *b == 0xab));
        Ok(())
    }

    #[test]
    fn test_packet_size_boundaries() -> Result<()> {
        assert_eq!(template(64)?.build(&PAYLOAD)?.len(), 64);
        assert_eq!(template(1500)?.build(&PAYLOAD)?.len(), 1500);
        assert!(template(63).is_err());
        assert!(template(1501).is_err());
        Ok(())
    }

    #[test]
    fn test_write_into_short_buffer() -> Result<()> {
        let mut buffer = [0; 32];
        assert!(template(64)?.write(&mut buffer, &PAYLOAD).is_err());
        Ok(())
    }

    #[test]
    fn test_invalid_vlan() {
        assert!(FrameTemplateBuilder::new().vlan_tci(4096, 0).is_err());
        assert!(FrameTemplateBuilder::new().vlan_tci(3, 8).is_err());
    }

    #[test]
    fn test_parse_tagged_and_untagged() -> Result<()> {
        let tagged = template(128)?.build(&PAYLOAD)?;
        assert_eq!(parse(&tagged), Ok(PAYLOAD));

        // as delivered by AF_PACKET when the tag got stripped
        let mut untagged = tagged[..12].to_vec();
        untagged.extend_from_slice(&tagged[16..]);
        assert_eq!(parse(&untagged), Ok(PAYLOAD));
        Ok(())
    }

    #[test]
    fn test_parse_rejects_foreign_traffic() -> Result<()> {
        let mut frame = template(64)?.build(&PAYLOAD)?;
        frame[16..18].copy_from_slice(&0x0800_u16.to_be_bytes());
        assert_eq!(parse(&frame), Err(DropReason::ForeignEtherType(0x0800)));
        assert_eq!(parse(&[]), Err(DropReason::Empty));
        assert_eq!(parse(&frame[..10]), Err(DropReason::Truncated));
        assert_eq!(parse(&frame[..30]), Err(DropReason::Truncated));
        Ok(())
    }

    #[test]
    fn test_parse_rejects_out_of_range_fields() -> Result<()> {
        let template = template(64)?;
        for (payload, reason) in [
            (
                Payload {
                    sequence: 0,
                    ..PAYLOAD
                },
                DropReason::SequenceOutOfRange(0),
            ),
            (
                Payload {
                    sequence: MAX_SEQUENCE + 1,
                    ..PAYLOAD
                },
                DropReason::SequenceOutOfRange(MAX_SEQUENCE + 1),
            ),
            (
                Payload {
                    queue_id: 8,
                    ..PAYLOAD
                },
                DropReason::QueueOutOfRange(8),
            ),
        ] {
            assert_eq!(parse(&template.build(&payload)?), Err(reason));
        }
        Ok(())
    }

    #[test]
    fn test_swap_addresses() -> Result<()> {
        let mut frame = template(64)?.build(&PAYLOAD)?;
        swap_addresses(&mut frame)?;
        assert_eq!(frame[0..6], [0xaa, 0x00, 0xaa, 0x00, 0xaa, 0x00]);
        assert_eq!(frame[6..12], [0x22, 0xbb, 0x22, 0xbb, 0x22, 0xbb]);
        assert_eq!(Payload::read_from(&frame), Some(PAYLOAD));
        assert!(swap_addresses(&mut [0; 11]).is_err());
        Ok(())
    }

    #[test]
    fn test_set_rx_timestamp() -> Result<()> {
        let mut tagged = template(64)?.build(&PAYLOAD)?;
        set_rx_timestamp(&mut tagged, 4711)?;
        assert_eq!(parse(&tagged)?.rx_timestamp, 4711);

        let mut untagged = tagged[..12].to_vec();
        untagged.extend_from_slice(&tagged[16..]);
        set_rx_timestamp(&mut untagged, 815)?;
        let payload = parse(&untagged)?;
        assert_eq!(payload.rx_timestamp, 815);
        assert_eq!(payload.sequence, PAYLOAD.sequence);

        assert!(set_rx_timestamp(&mut tagged[..30], 1).is_err());
        Ok(())
    }
}
