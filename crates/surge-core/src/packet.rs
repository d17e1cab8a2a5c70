//! Traffic Units and IPv4 Wire Encoding
//!
//! A [`TrafficUnit`] describes one packet or request completely: addresses,
//! port, payload size, header fields and the anomaly (if any) applied to it.
//! Raw protocols are encoded into a full IPv4 datagram by [`encode_ipv4`];
//! HTTP/HTTPS units are turned into requests by the emitter.

use crate::error::TransmissionError;
use crate::profile::{Mutator, Protocol};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const ICMP_HEADER_LEN: usize = 8;

const IPPROTO_ICMP: u8 = 1;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;
pub const TCP_URG: u8 = 0x20;

pub const ICMP_ECHO_REQUEST: u8 = 8;

const PAYLOAD_PATTERN: &[u8] = b"surge-traffic-unit:";

/// IP-level fields shared by every raw unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpFields {
    pub ttl: u8,
    pub id: u16,
    /// Write a deliberately wrong header checksum.
    pub corrupt_checksum: bool,
}

/// Protocol-specific shape of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Shape {
    Tcp {
        source_port: u16,
        sequence: u32,
        flags: u8,
    },
    Udp {
        source_port: u16,
    },
    Icmp {
        icmp_type: u8,
        code: u8,
        ident: u16,
    },
    Http {
        method: &'static str,
        path: &'static str,
        user_agent: &'static str,
        forwarded_for: Option<IpAddr>,
        oversized_header: bool,
    },
}

/// One constructed packet or request, consumed by the emitter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficUnit {
    pub sequence_number: u64,
    pub protocol: Protocol,
    pub source_address: IpAddr,
    pub destination_address: IpAddr,
    /// `None` for ICMP
    pub port: Option<u16>,
    pub payload_size_bytes: u32,
    pub is_anomalous: bool,
    pub anomaly: Option<Mutator>,
    pub ip: IpFields,
    pub shape: Shape,
}

impl TrafficUnit {
    /// Bytes handed to the OS for this unit, headers included.
    pub fn wire_size(&self) -> usize {
        let payload = self.payload_size_bytes as usize;
        match self.protocol {
            Protocol::Tcp => IPV4_HEADER_LEN + TCP_HEADER_LEN + payload,
            Protocol::Udp => IPV4_HEADER_LEN + UDP_HEADER_LEN + payload,
            Protocol::Icmp => IPV4_HEADER_LEN + ICMP_HEADER_LEN + payload,
            Protocol::Http | Protocol::Https => payload,
        }
    }

    /// Deterministic payload body of `payload_size_bytes`.
    pub fn payload(&self) -> Vec<u8> {
        let offset = (self.sequence_number % PAYLOAD_PATTERN.len() as u64) as usize;
        PAYLOAD_PATTERN
            .iter()
            .cycle()
            .skip(offset)
            .take(self.payload_size_bytes as usize)
            .copied()
            .collect()
    }
}

/// Largest payload that fits a single IPv4 datagram for `protocol`.
pub fn max_datagram_payload(protocol: Protocol) -> u32 {
    let transport = match protocol {
        Protocol::Tcp => TCP_HEADER_LEN,
        Protocol::Udp => UDP_HEADER_LEN,
        Protocol::Icmp => ICMP_HEADER_LEN,
        Protocol::Http | Protocol::Https => return 1 << 20,
    };
    (u16::MAX as usize - IPV4_HEADER_LEN - transport) as u32
}

/// RFC 1071 internet checksum.
pub fn checksum(data: &[u8]) -> u16 {
    !fold(sum_words(data, 0))
}

fn sum_words(data: &[u8], initial: u32) -> u32 {
    let mut sum = initial;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([pair[0], pair[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

fn transport_checksum(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = proto;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());
    !fold(sum_words(segment, sum_words(&pseudo, 0)))
}

fn ipv4_pair(unit: &TrafficUnit) -> Result<(Ipv4Addr, Ipv4Addr), TransmissionError> {
    match (unit.source_address, unit.destination_address) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => Ok((src, dst)),
        (src, dst) => Err(TransmissionError::InvalidAddress(format!(
            "raw emission needs IPv4 endpoints, got {src} -> {dst}"
        ))),
    }
}

/// Encode a raw unit (TCP/UDP/ICMP) into a complete IPv4 datagram.
pub fn encode_ipv4(unit: &TrafficUnit) -> Result<Vec<u8>, TransmissionError> {
    let (src, dst) = ipv4_pair(unit)?;
    let payload = unit.payload();

    let (proto, mut segment) = match &unit.shape {
        Shape::Tcp {
            source_port,
            sequence,
            flags,
        } => {
            let mut seg = vec![0u8; TCP_HEADER_LEN + payload.len()];
            seg[0..2].copy_from_slice(&source_port.to_be_bytes());
            seg[2..4].copy_from_slice(&unit.port.unwrap_or(0).to_be_bytes());
            seg[4..8].copy_from_slice(&sequence.to_be_bytes());
            // ack number stays zero
            seg[12] = ((TCP_HEADER_LEN / 4) as u8) << 4;
            seg[13] = *flags;
            seg[14..16].copy_from_slice(&64240u16.to_be_bytes());
            seg[TCP_HEADER_LEN..].copy_from_slice(&payload);
            (IPPROTO_TCP, seg)
        }
        Shape::Udp { source_port } => {
            let mut seg = vec![0u8; UDP_HEADER_LEN + payload.len()];
            let udp_len = seg.len() as u16;
            seg[0..2].copy_from_slice(&source_port.to_be_bytes());
            seg[2..4].copy_from_slice(&unit.port.unwrap_or(0).to_be_bytes());
            seg[4..6].copy_from_slice(&udp_len.to_be_bytes());
            seg[UDP_HEADER_LEN..].copy_from_slice(&payload);
            (IPPROTO_UDP, seg)
        }
        Shape::Icmp {
            icmp_type,
            code,
            ident,
        } => {
            let mut seg = vec![0u8; ICMP_HEADER_LEN + payload.len()];
            seg[0] = *icmp_type;
            seg[1] = *code;
            seg[4..6].copy_from_slice(&ident.to_be_bytes());
            seg[6..8].copy_from_slice(&(unit.sequence_number as u16).to_be_bytes());
            seg[ICMP_HEADER_LEN..].copy_from_slice(&payload);
            (IPPROTO_ICMP, seg)
        }
        Shape::Http { .. } => {
            return Err(TransmissionError::Encode(format!(
                "{} unit has no raw encoding",
                unit.protocol
            )));
        }
    };

    let total_len = IPV4_HEADER_LEN + segment.len();
    if total_len > u16::MAX as usize {
        return Err(TransmissionError::Encode(format!(
            "datagram of {total_len} bytes exceeds IPv4 limit"
        )));
    }

    match proto {
        IPPROTO_TCP => {
            let csum = transport_checksum(src, dst, proto, &segment);
            segment[16..18].copy_from_slice(&csum.to_be_bytes());
        }
        IPPROTO_UDP => {
            let csum = match transport_checksum(src, dst, proto, &segment) {
                0 => 0xFFFF,
                c => c,
            };
            segment[6..8].copy_from_slice(&csum.to_be_bytes());
        }
        _ => {
            let csum = checksum(&segment);
            segment[2..4].copy_from_slice(&csum.to_be_bytes());
        }
    }

    let mut packet = vec![0u8; total_len];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    packet[4..6].copy_from_slice(&unit.ip.id.to_be_bytes());
    packet[6] = 0x40; // DF
    packet[8] = unit.ip.ttl;
    packet[9] = proto;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());

    let mut ip_csum = checksum(&packet[..IPV4_HEADER_LEN]);
    if unit.ip.corrupt_checksum {
        ip_csum = !ip_csum ^ 0x5A5A;
    }
    packet[10..12].copy_from_slice(&ip_csum.to_be_bytes());
    packet[IPV4_HEADER_LEN..].copy_from_slice(&segment);

    Ok(packet)
}
