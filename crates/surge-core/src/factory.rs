//! Packet Factory
//!
//! Builds one [`TrafficUnit`] per tick from a profile. All randomness comes
//! from a campaign-scoped `StdRng`, so a fixed seed reproduces the exact unit
//! sequence. Draw order per unit:
//!
//! 1. protocol (cumulative-weight inversion of a uniform draw)
//! 2. payload size (uniform over the profile range)
//! 3. anomaly flag (Bernoulli with the profile's anomaly rate)
//! 4. header fields and destination port
//! 5. mutator (uniform over the profile's mutator set), if anomalous

use crate::packet::{
    ICMP_ECHO_REQUEST, IpFields, Shape, TCP_ACK, TCP_FIN, TCP_PSH, TCP_RST, TCP_SYN, TCP_URG,
    TrafficUnit, max_datagram_payload,
};
use crate::profile::{Mutator, Profile, Protocol};
use crate::target::Endpoint;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const HTTP_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;

/// Ports commonly associated with backdoors, scanners and oddities.
pub const ABNORMAL_PORTS: [u16; 8] = [1, 19, 1337, 4444, 6667, 12345, 31337, 65535];

/// Rarely legitimate ICMP types (timestamp, info request, address mask, ...).
pub const ABNORMAL_ICMP_TYPES: [u8; 4] = [13, 15, 17, 37];

/// TCP flag combinations no normal stack emits (NULL, XMAS, SYN+FIN, all).
const MALFORMED_TCP_FLAGS: [u8; 4] = [
    0,
    TCP_FIN | TCP_PSH | TCP_URG,
    TCP_SYN | TCP_FIN,
    TCP_FIN | TCP_SYN | TCP_RST | TCP_PSH | TCP_ACK | TCP_URG,
];

/// Initial TTLs of common OS stacks, with rough prevalence.
const TTL_TABLE: [(u8, f64); 3] = [(64, 0.6), (128, 0.3), (255, 0.1)];

const HTTP_PATHS: [&str; 6] = [
    "/",
    "/index.html",
    "/api/v1/status",
    "/login",
    "/search?q=report",
    "/static/app.js",
];

const USER_AGENTS: [&str; 5] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36",
    "curl/8.5.0",
    "Go-http-client/1.1",
];

/// Campaign-scoped unit builder.
pub struct PacketFactory {
    rng: StdRng,
    source: IpAddr,
}

impl PacketFactory {
    /// `source` is the local address units claim unless spoofed.
    pub fn new(seed: u64, source: IpAddr) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            source,
        }
    }

    pub fn build(&mut self, profile: &Profile, endpoint: &Endpoint, sequence_number: u64) -> TrafficUnit {
        let protocol = profile.weights().pick(self.rng.random::<f64>());

        let (min, max) = profile.payload_size_range();
        let payload_size_bytes = self.rng.random_range(min..=max);
        let is_anomalous = self.rng.random_bool(profile.anomaly_rate());

        let ip = IpFields {
            ttl: self.ttl(),
            id: self.rng.random(),
            corrupt_checksum: false,
        };
        let port = match protocol {
            Protocol::Icmp => None,
            Protocol::Http => Some(endpoint.port.unwrap_or(HTTP_PORT)),
            Protocol::Https => Some(endpoint.port.unwrap_or(HTTPS_PORT)),
            Protocol::Tcp | Protocol::Udp => Some(
                endpoint
                    .port
                    .or_else(|| profile.ports().choose(&mut self.rng).copied())
                    .unwrap_or(HTTP_PORT),
            ),
        };
        let shape = self.shape(protocol, payload_size_bytes);

        let mut unit = TrafficUnit {
            sequence_number,
            protocol,
            source_address: self.source,
            destination_address: endpoint.address,
            port,
            payload_size_bytes,
            is_anomalous,
            anomaly: None,
            ip,
            shape,
        };

        if is_anomalous {
            if let Some(mutator) = profile.mutators().choose(&mut self.rng).copied() {
                self.apply(mutator, &mut unit, max);
            }
        }
        unit
    }

    fn ttl(&mut self) -> u8 {
        let u: f64 = self.rng.random();
        let mut acc = 0.0;
        for (ttl, p) in TTL_TABLE {
            acc += p;
            if u < acc {
                return ttl;
            }
        }
        TTL_TABLE[0].0
    }

    fn ephemeral_port(&mut self) -> u16 {
        self.rng.random_range(49152..=65535)
    }

    fn shape(&mut self, protocol: Protocol, payload: u32) -> Shape {
        match protocol {
            Protocol::Tcp => Shape::Tcp {
                source_port: self.ephemeral_port(),
                sequence: self.rng.random(),
                flags: TCP_SYN,
            },
            Protocol::Udp => Shape::Udp {
                source_port: self.ephemeral_port(),
            },
            Protocol::Icmp => Shape::Icmp {
                icmp_type: ICMP_ECHO_REQUEST,
                code: 0,
                ident: self.rng.random(),
            },
            Protocol::Http | Protocol::Https => Shape::Http {
                method: if payload > 0 { "POST" } else { "GET" },
                path: HTTP_PATHS[self.rng.random_range(0..HTTP_PATHS.len())],
                user_agent: USER_AGENTS[self.rng.random_range(0..USER_AGENTS.len())],
                forwarded_for: None,
                oversized_header: false,
            },
        }
    }

    fn spoofed_address(&mut self, like: IpAddr) -> IpAddr {
        match like {
            IpAddr::V4(_) => loop {
                let first = self.rng.random_range(1..=223u8);
                if first == 10 || first == 127 {
                    continue;
                }
                break IpAddr::V4(Ipv4Addr::new(
                    first,
                    self.rng.random(),
                    self.rng.random(),
                    self.rng.random_range(1..=254),
                ));
            },
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::new(
                0x2001,
                0x0db8,
                self.rng.random(),
                self.rng.random(),
                self.rng.random(),
                self.rng.random(),
                self.rng.random(),
                self.rng.random(),
            )),
        }
    }

    fn apply(&mut self, mutator: Mutator, unit: &mut TrafficUnit, profile_max: u32) {
        unit.anomaly = Some(mutator);
        match mutator {
            Mutator::OversizedPayload => {
                let cap = max_datagram_payload(unit.protocol);
                let lo = profile_max.saturating_add(1).min(cap);
                let hi = profile_max.saturating_mul(4).max(lo.saturating_add(1024)).min(cap);
                unit.payload_size_bytes = self.rng.random_range(lo..=hi);
                if let Shape::Http { method, .. } = &mut unit.shape {
                    *method = "POST";
                }
            }
            Mutator::MalformedHeader => match &mut unit.shape {
                Shape::Tcp { flags, .. } => {
                    *flags = *MALFORMED_TCP_FLAGS
                        .choose(&mut self.rng)
                        .unwrap_or(&MALFORMED_TCP_FLAGS[0]);
                }
                Shape::Udp { .. } => unit.ip.corrupt_checksum = true,
                Shape::Icmp { code, .. } => {
                    *code = self.rng.random_range(1..=255);
                    unit.ip.corrupt_checksum = true;
                }
                Shape::Http {
                    oversized_header, ..
                } => *oversized_header = true,
            },
            Mutator::SourceSpoof => {
                let spoofed = self.spoofed_address(unit.destination_address);
                unit.source_address = spoofed;
                if let Shape::Http { forwarded_for, .. } = &mut unit.shape {
                    *forwarded_for = Some(spoofed);
                }
            }
            Mutator::AbnormalPort => match &mut unit.shape {
                Shape::Icmp { icmp_type, .. } => {
                    *icmp_type = ABNORMAL_ICMP_TYPES[self.rng.random_range(0..ABNORMAL_ICMP_TYPES.len())];
                }
                _ => {
                    unit.port = Some(ABNORMAL_PORTS[self.rng.random_range(0..ABNORMAL_PORTS.len())]);
                }
            },
        }
    }
}
