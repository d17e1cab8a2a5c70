//! Emitter
//!
//! Puts one [`TrafficUnit`] on the wire and reports what happened. Failures
//! are returned as `Failed` events, never as errors: a campaign keeps going
//! whatever the network does.
//!
//! TCP/UDP/ICMP go out through a raw IPv4 socket with the header built by
//! [`encode_ipv4`]. The socket is opened on first use and shared. Sends run on
//! the blocking pool so a slow send in one campaign never holds up another.
//! HTTP/HTTPS use a pooled `reqwest` client.

use crate::error::TransmissionError;
use crate::packet::{Shape, TrafficUnit, encode_ipv4};
use crate::profile::Protocol;
use crate::telemetry::EmissionEvent;
use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use socket2::{Domain, SockAddr, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// `IPPROTO_RAW`: the caller supplies the IP header.
const IPPROTO_RAW: i32 = 255;

/// Size of the junk header value sent by malformed-header HTTP anomalies.
const OVERSIZED_HEADER_LEN: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmitterConfig {
    pub http_timeout_ms: u64,
    /// Accept self-signed lab certificates on HTTPS targets.
    pub accept_invalid_certs: bool,
    /// Encode units but never touch the network.
    pub dry_run: bool,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            http_timeout_ms: 5000,
            accept_invalid_certs: false,
            dry_run: false,
        }
    }
}

#[async_trait]
pub trait Emitter: Send + Sync {
    /// Transmit `unit` to its destination and describe the outcome.
    async fn send(&self, unit: &TrafficUnit) -> EmissionEvent;
}

/// Sends real traffic.
pub struct NetworkEmitter {
    raw: Arc<OnceCell<Socket>>,
    http: reqwest::Client,
}

impl NetworkEmitter {
    pub fn new(config: &EmitterConfig) -> Result<Self, TransmissionError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self {
            raw: Arc::new(OnceCell::new()),
            http,
        })
    }

    async fn send_raw(&self, unit: &TrafficUnit) -> Result<(), TransmissionError> {
        let datagram = encode_ipv4(unit)?;
        let destination = SockAddr::from(SocketAddr::new(unit.destination_address, 0));
        let raw = Arc::clone(&self.raw);

        tokio::task::spawn_blocking(move || -> Result<(), TransmissionError> {
            let socket = raw.get_or_try_init(open_raw_socket)?;
            let written = socket.send_to(&datagram, &destination)?;
            if written != datagram.len() {
                return Err(TransmissionError::Io(format!(
                    "short write: {written} of {} bytes",
                    datagram.len()
                )));
            }
            Ok(())
        })
        .await
        .map_err(|e| TransmissionError::Io(e.to_string()))?
    }

    async fn send_http(&self, unit: &TrafficUnit) -> Result<(), TransmissionError> {
        let Shape::Http {
            method,
            path,
            user_agent,
            forwarded_for,
            oversized_header,
        } = &unit.shape
        else {
            return Err(TransmissionError::Encode(format!(
                "{} unit without an HTTP shape",
                unit.protocol
            )));
        };

        let url = http_url(unit, path)?;
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|e| TransmissionError::Encode(e.to_string()))?;

        let mut request = self
            .http
            .request(method, url)
            .header(reqwest::header::USER_AGENT, *user_agent);
        if let Some(spoofed) = forwarded_for {
            request = request.header("X-Forwarded-For", spoofed.to_string());
        }
        if *oversized_header {
            request = request.header("X-Surge-Padding", "A".repeat(OVERSIZED_HEADER_LEN));
        }
        if unit.payload_size_bytes > 0 {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(unit.payload());
        }

        let response = request.send().await?;
        debug!(
            seq = unit.sequence_number,
            status = %response.status(),
            "HTTP unit answered"
        );
        Ok(())
    }
}

fn open_raw_socket() -> io::Result<Socket> {
    // IPPROTO_RAW implies IP_HDRINCL on Linux.
    let socket = Socket::new(
        Domain::IPV4,
        Type::RAW,
        Some(socket2::Protocol::from(IPPROTO_RAW)),
    )
    .inspect_err(|e| warn!(error = %e, "Raw socket unavailable"))?;
    debug!("Raw IPv4 socket opened");
    Ok(socket)
}

fn http_url(unit: &TrafficUnit, path: &str) -> Result<reqwest::Url, TransmissionError> {
    let scheme = match unit.protocol {
        Protocol::Https => "https",
        Protocol::Http => "http",
        other => {
            return Err(TransmissionError::Encode(format!("{other} is not an HTTP protocol")));
        }
    };
    let port = unit
        .port
        .ok_or_else(|| TransmissionError::InvalidAddress("HTTP unit without a port".to_string()))?;
    let authority = SocketAddr::new(unit.destination_address, port);
    reqwest::Url::parse(&format!("{scheme}://{authority}{path}"))
        .map_err(|e| TransmissionError::InvalidAddress(e.to_string()))
}

#[async_trait]
impl Emitter for NetworkEmitter {
    async fn send(&self, unit: &TrafficUnit) -> EmissionEvent {
        let timestamp = Utc::now();
        let start = Instant::now();

        let result = if unit.protocol.is_raw() {
            self.send_raw(unit).await
        } else {
            self.send_http(unit).await
        };

        match result {
            Ok(()) => EmissionEvent::sent(unit, timestamp, start.elapsed()),
            Err(e) => {
                debug!(
                    seq = unit.sequence_number,
                    protocol = %unit.protocol,
                    error = %e,
                    "Unit transmission failed"
                );
                let latency = match e {
                    TransmissionError::Encode(_) | TransmissionError::InvalidAddress(_) => None,
                    _ => Some(start.elapsed()),
                };
                EmissionEvent::failed(unit, timestamp, latency, &e)
            }
        }
    }
}

/// Builds every datagram the network emitter would, then discards it.
#[derive(Debug, Default)]
pub struct DryRunEmitter {
    units: AtomicU64,
    bytes: AtomicU64,
}

impl DryRunEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn units(&self) -> u64 {
        self.units.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Emitter for DryRunEmitter {
    async fn send(&self, unit: &TrafficUnit) -> EmissionEvent {
        let timestamp = Utc::now();
        let start = Instant::now();
        self.units.fetch_add(1, Ordering::Relaxed);

        let encoded = if unit.protocol.is_raw() {
            encode_ipv4(unit).map(|d| d.len())
        } else if let Shape::Http { path, .. } = &unit.shape {
            http_url(unit, path).map(|_| unit.wire_size())
        } else {
            Err(TransmissionError::Encode("HTTP unit without an HTTP shape".to_string()))
        };

        match encoded {
            Ok(len) => {
                self.bytes.fetch_add(len as u64, Ordering::Relaxed);
                EmissionEvent::sent(unit, timestamp, start.elapsed())
            }
            Err(e) => EmissionEvent::failed(unit, timestamp, None, &e),
        }
    }
}

/// Pick the emitter the configuration asks for.
pub fn from_config(config: &EmitterConfig) -> Result<Arc<dyn Emitter>, TransmissionError> {
    if config.dry_run {
        Ok(Arc::new(DryRunEmitter::new()))
    } else {
        Ok(Arc::new(NetworkEmitter::new(config)?))
    }
}

/// True when the process can open raw sockets.
pub fn raw_sockets_available() -> bool {
    open_raw_socket().is_ok()
}
