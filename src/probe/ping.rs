//! Ping probe with native ICMP and command fallback.
//!
//! Echo requests run on blocking sockets inside spawn_blocking for precise
//! timing. Raw ICMP use is serialized across monitors through [`IcmpLock`].

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;
use tokio::sync::{Mutex, MutexGuard};

use super::{format_micros, ProbeContext, ProbeError};
use crate::monitor::MonitorDefinition;
use crate::report::StatusReport;
use crate::status::Status;

/// Pause between consecutive echo requests of one probe.
const ECHO_INTERVAL: Duration = Duration::from_secs(1);

/// The single lock guarding ICMP socket use across all monitor tasks.
#[derive(Debug, Clone, Default)]
pub struct IcmpLock(Arc<Mutex<()>>);

impl IcmpLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.0.lock().await
    }
}

/// Round-trip statistics for one batch of echo requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingStats {
    pub sent: u32,
    pub received: u32,
    pub min: Duration,
    pub avg: Duration,
    pub max: Duration,
}

impl PingStats {
    /// Compute statistics from the round-trip times of answered echoes.
    pub fn from_samples(sent: u32, rtts: &[Duration]) -> Self {
        let received = rtts.len() as u32;
        let min = rtts.iter().min().copied().unwrap_or_default();
        let max = rtts.iter().max().copied().unwrap_or_default();
        let avg = if rtts.is_empty() {
            Duration::ZERO
        } else {
            rtts.iter().sum::<Duration>() / received
        };
        Self {
            sent,
            received,
            min,
            avg,
            max,
        }
    }

    /// Fraction of echoes left unanswered, 0.0 to 1.0.
    pub fn loss(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }
        let lost = self.sent.saturating_sub(self.received);
        lost as f64 / self.sent as f64
    }

    /// Any loss at all turns the ping column red.
    pub fn status(&self) -> Status {
        if self.loss() > 0.0 {
            Status::Red
        } else {
            Status::Green
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "Min: {}\nAvg: {}\nMax: {}\nLoss: {:.3}\n",
            format_micros(self.min),
            format_micros(self.avg),
            format_micros(self.max),
            self.loss()
        )
    }
}

/// Sends echo requests to a host.
#[async_trait]
pub trait Pinger: Send + Sync {
    /// Send `count` echo requests to `address` and summarize the replies.
    ///
    /// An error means no echo could be attempted at all; lost replies are
    /// reported through [`PingStats::loss`].
    async fn ping(&self, address: &str, count: u32) -> Result<PingStats, ProbeError>;
}

/// Run the ping stage for a monitor and report it to the ping column.
pub async fn run_ping_check(
    monitor: &MonitorDefinition,
    ctx: &ProbeContext,
) -> Result<PingStats, ProbeError> {
    tracing::debug!(count = monitor.ping.count, "Start ping monitor");

    let stats = {
        let _guard = ctx.icmp_lock.acquire().await;
        ctx.pinger.ping(&monitor.ip, monitor.ping.count).await
    };
    let stats = stats.inspect_err(|e| tracing::error!(context = "new pinger", "{}", e))?;

    let status = stats.status();
    tracing::info!(
        min = ?stats.min,
        avg = ?stats.avg,
        max = ?stats.max,
        loss = stats.loss(),
        "Ping"
    );

    ctx.publish(StatusReport::new(
        &monitor.machine,
        &monitor.ping.column,
        status,
        stats.summary(),
    ))
    .await;

    Ok(stats)
}

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

/// Ping sequence counter for unique identification
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// System pinger: native ICMP sockets, or the `ping` binary when sockets are
/// not permitted.
#[derive(Debug, Clone)]
pub struct IcmpPinger {
    /// How long to wait for each echo reply.
    timeout: Duration,
}

impl IcmpPinger {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Pinger for IcmpPinger {
    async fn ping(&self, address: &str, count: u32) -> Result<PingStats, ProbeError> {
        let count = count.max(1);
        let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

        if capability == IcmpCapability::Native {
            let ip = resolve_address(address).await?;
            let timeout = self.timeout;

            let result = tokio::task::spawn_blocking(move || run_blocking_echoes(ip, count, timeout))
                .await
                .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

            match result {
                Ok(stats) => return Ok(stats),
                Err(e) if is_permission_error(&e) => {
                    tracing::warn!(
                        "Native ping failed with permission error for {}, falling back to command: {}",
                        address,
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }

        run_ping_command(address, count, self.timeout).await
    }
}

fn is_permission_error(e: &ProbeError) -> bool {
    let text = e.to_string();
    text.contains("Permission") || text.contains("Operation not permitted") || text.contains("denied")
}

/// Resolve hostname to IP address.
async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let addrs: Vec<_> = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .collect();

    addrs
        .into_iter()
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("No addresses found for {}", address)))
}

/// How the kernel hands ICMP traffic to the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketKind {
    /// Every ICMP packet reaching the host, IPv4 header included. The echo
    /// identifier tells our replies apart.
    Raw,
    /// Only replies addressed to this socket. The kernel replaces the echo
    /// identifier with the socket's local port.
    Dgram,
}

/// Open an ICMP socket connected to `ip`, RAW first, then DGRAM.
fn open_icmp_socket(ip: IpAddr, timeout: Duration) -> Result<(Socket, SocketKind), ProbeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };

    let (socket, kind) = Socket::new(domain, Type::RAW, Some(protocol))
        .map(|s| (s, SocketKind::Raw))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)).map(|s| (s, SocketKind::Dgram)))
        .map_err(|e| ProbeError::Network(format!("Failed to create ICMP socket: {}", e)))?;

    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;
    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("Failed to connect: {}", e)))?;

    Ok((socket, kind))
}

/// Send `count` echoes on one socket. Runs in a dedicated thread.
fn run_blocking_echoes(ip: IpAddr, count: u32, timeout: Duration) -> Result<PingStats, ProbeError> {
    let (socket, kind) = open_icmp_socket(ip, timeout)?;
    let identifier: u16 = rand::random();

    let rtts = collect_echoes(count, ECHO_INTERVAL, |_| {
        let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        echo_once(&socket, kind, ip, identifier, sequence, timeout)
    })?;

    Ok(PingStats::from_samples(count, &rtts))
}

/// Run `count` echoes `interval` apart and keep the round-trip times of the
/// answered ones. A failed echo is lost; only a permission error aborts,
/// since no echo can get through then.
fn collect_echoes<F>(count: u32, interval: Duration, mut echo: F) -> Result<Vec<Duration>, ProbeError>
where
    F: FnMut(u32) -> Result<Duration, ProbeError>,
{
    let mut rtts = Vec::with_capacity(count as usize);

    for i in 0..count {
        if i > 0 {
            std::thread::sleep(interval);
        }

        match echo(i) {
            Ok(rtt) => rtts.push(rtt),
            Err(ProbeError::Timeout(_)) => tracing::debug!("Echo {} timed out", i),
            Err(e) if is_permission_error(&e) => return Err(e),
            Err(e) => tracing::warn!("Echo {} lost: {}", i, e),
        }
    }

    Ok(rtts)
}

/// Send one echo request and wait for its matching reply.
fn echo_once(
    socket: &Socket,
    kind: SocketKind,
    ip: IpAddr,
    identifier: u16,
    sequence: u16,
    timeout: Duration,
) -> Result<Duration, ProbeError> {
    let packet = match ip {
        IpAddr::V4(_) => build_icmp_echo_request(identifier, sequence),
        IpAddr::V6(_) => build_icmpv6_echo_request(identifier, sequence),
    };

    let start = Instant::now();

    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("Failed to send: {}", e))
        }
    })?;

    // Loop until we get OUR reply or time out
    loop {
        let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(format!("Failed to receive: {}", e))
            }
        })?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        if is_echo_reply(kind, ip, buf, identifier, sequence) {
            return Ok(elapsed);
        }
    }
}

/// Check whether `buf` is the echo reply for (identifier, sequence).
///
/// On DGRAM sockets the identifier on the wire is the kernel's, and the
/// kernel already routes only our replies here, so just the sequence counts.
fn is_echo_reply(kind: SocketKind, ip: IpAddr, buf: &[u8], identifier: u16, sequence: u16) -> bool {
    let (offset, reply_type) = match (ip, buf.first()) {
        // RAW sockets (and DGRAM ones on BSDs) deliver the IPv4 header as well
        (IpAddr::V4(_), Some(b)) if b >> 4 == 4 => (usize::from(b & 0x0f) * 4, 0u8),
        (IpAddr::V4(_), _) => (0, 0u8),
        (IpAddr::V6(_), _) => (0, 129u8),
    };

    if buf.len() < offset + 8 {
        return false;
    }

    let icmp = &buf[offset..];
    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    let ours = kind == SocketKind::Dgram || reply_id == identifier;
    icmp[0] == reply_type && ours && reply_seq == sequence
}

fn payload_timestamp() -> [u8; 8] {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    nanos.to_be_bytes()
}

/// Build an ICMP Echo Request packet (type 8, code 0).
fn build_icmp_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = 8;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet[8..16].copy_from_slice(&payload_timestamp());

    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());

    packet
}

/// Build an ICMPv6 Echo Request packet (type 128, code 0).
///
/// The kernel fills in the ICMPv6 checksum.
fn build_icmpv6_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = 128;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet[8..16].copy_from_slice(&payload_timestamp());

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);

    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

/// Run ping via the system binary (fallback).
async fn run_ping_command(address: &str, count: u32, timeout: Duration) -> Result<PingStats, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args([
            "-c",
            &count.to_string(),
            "-W",
            &timeout_secs.to_string(),
            address,
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    // A non-zero exit with a statistics block just means lost replies.
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_ping_output(&stdout).map_err(|e| {
        if output.status.success() {
            e
        } else {
            ProbeError::Command(format!(
                "ping failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    })
}

/// Parse the statistics block of `ping` output (Linux and macOS formats).
fn parse_ping_output(output: &str) -> Result<PingStats, ProbeError> {
    static COUNTS: OnceLock<Regex> = OnceLock::new();
    let counts = COUNTS.get_or_init(|| {
        Regex::new(r"(?P<sent>\d+) packets transmitted, (?P<recv>\d+) (?:packets )?received")
            .expect("valid regex")
    });

    static RTT: OnceLock<Regex> = OnceLock::new();
    let rtt = RTT.get_or_init(|| {
        Regex::new(r"(?:rtt|round-trip) min/avg/max/(?:mdev|stddev) = (?P<min>[0-9.]+)/(?P<avg>[0-9.]+)/(?P<max>[0-9.]+)")
            .expect("valid regex")
    });

    let caps = counts
        .captures(output)
        .ok_or_else(|| ProbeError::Command(format!("failed to parse ping output: {}", output)))?;
    let sent: u32 = caps["sent"].parse().unwrap_or(0);
    let received: u32 = caps["recv"].parse().unwrap_or(0);

    let millis = |v: &str| -> Duration {
        v.parse::<f64>()
            .map(|ms| Duration::from_nanos((ms * 1_000_000.0).round() as u64))
            .unwrap_or_default()
    };

    let (min, avg, max) = match rtt.captures(output) {
        Some(c) => (millis(&c["min"]), millis(&c["avg"]), millis(&c["max"])),
        None => (Duration::ZERO, Duration::ZERO, Duration::ZERO),
    };

    Ok(PingStats {
        sent,
        received,
        min,
        avg,
        max,
    })
}
