//! UDP tracker protocol: a connect exchange yielding a connection id,
//! followed by a 98-byte announce. One attempt per exchange, bounded by an
//! overall 15-second deadline.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use rand::Rng;

use crate::tracker_http::TrackerEvent;

const PROTOCOL_MAGIC: u64 = 0x0000_0417_2710_1980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RESPONSE_LEN: usize = 2048;
const NUM_WANT: i32 = 50;

#[derive(Debug, Clone)]
pub struct UdpAnnounceRequest<'a> {
    pub info_hash: &'a [u8; 20],
    pub peer_id: &'a [u8; 20],
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: TrackerEvent,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct UdpAnnounceResponse {
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
    pub peers: Vec<SocketAddrV4>,
}

fn event_code(event: TrackerEvent) -> u32 {
    match event {
        TrackerEvent::None => 0,
        TrackerEvent::Completed => 1,
        TrackerEvent::Started => 2,
        TrackerEvent::Stopped => 3,
    }
}

/// Resolves `udp://host:port[/path]` and runs the two-step exchange.
pub fn announce(url: &str, request: &UdpAnnounceRequest) -> Result<UdpAnnounceResponse> {
    let addr = parse_udp_tracker_url(url)?;
    let deadline = Instant::now() + EXCHANGE_TIMEOUT;

    let socket = UdpSocket::bind("0.0.0.0:0").context("bind udp socket")?;
    socket.connect(addr).context("connect udp socket")?;

    let connection_id = connect_exchange(&socket, deadline)?;
    announce_exchange(&socket, connection_id, request, deadline)
}

fn connect_exchange(socket: &UdpSocket, deadline: Instant) -> Result<u64> {
    let transaction_id = rand::thread_rng().gen();
    set_remaining_timeout(socket, deadline)?;
    socket.send(&build_connect_request(transaction_id))?;

    let mut buf = [0u8; 16];
    let n = socket.recv(&mut buf).context("connect response")?;
    parse_connect_response(&buf[..n], transaction_id)
}

fn announce_exchange(
    socket: &UdpSocket,
    connection_id: u64,
    request: &UdpAnnounceRequest,
    deadline: Instant,
) -> Result<UdpAnnounceResponse> {
    let transaction_id = rand::thread_rng().gen();
    set_remaining_timeout(socket, deadline)?;
    socket.send(&build_announce_request(connection_id, transaction_id, request))?;

    let mut buf = [0u8; MAX_RESPONSE_LEN];
    let n = socket.recv(&mut buf).context("announce response")?;
    parse_announce_response(&buf[..n], transaction_id)
}

fn set_remaining_timeout(socket: &UdpSocket, deadline: Instant) -> Result<()> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        anyhow::bail!("udp exchange deadline exceeded");
    }
    socket.set_read_timeout(Some(remaining))?;
    socket.set_write_timeout(Some(remaining))?;
    Ok(())
}

fn build_connect_request(transaction_id: u32) -> [u8; 16] {
    let mut buf = [0u8; 16];
    buf[0..8].copy_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
    buf[8..12].copy_from_slice(&ACTION_CONNECT.to_be_bytes());
    buf[12..16].copy_from_slice(&transaction_id.to_be_bytes());
    buf
}

fn parse_connect_response(data: &[u8], transaction_id: u32) -> Result<u64> {
    if data.len() < 16 {
        return Err(anyhow!("connect response too short: {} bytes", data.len()));
    }

    let action = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let txn = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if txn != transaction_id {
        return Err(anyhow!("connect transaction id mismatch"));
    }
    if action != ACTION_CONNECT {
        return Err(anyhow!("unexpected connect action {}", action));
    }

    Ok(u64::from_be_bytes([
        data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
    ]))
}

fn build_announce_request(
    connection_id: u64,
    transaction_id: u32,
    req: &UdpAnnounceRequest,
) -> [u8; 98] {
    let key: u32 = rand::thread_rng().gen();

    let mut buf = [0u8; 98];
    buf[0..8].copy_from_slice(&connection_id.to_be_bytes());
    buf[8..12].copy_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    buf[12..16].copy_from_slice(&transaction_id.to_be_bytes());
    buf[16..36].copy_from_slice(req.info_hash);
    buf[36..56].copy_from_slice(req.peer_id);
    buf[56..64].copy_from_slice(&req.downloaded.to_be_bytes());
    buf[64..72].copy_from_slice(&req.left.to_be_bytes());
    buf[72..80].copy_from_slice(&req.uploaded.to_be_bytes());
    buf[80..84].copy_from_slice(&event_code(req.event).to_be_bytes());
    // bytes 84..88 stay zero: let the tracker use the packet source address
    buf[88..92].copy_from_slice(&key.to_be_bytes());
    buf[92..96].copy_from_slice(&NUM_WANT.to_be_bytes());
    buf[96..98].copy_from_slice(&req.port.to_be_bytes());
    buf
}

fn parse_announce_response(data: &[u8], transaction_id: u32) -> Result<UdpAnnounceResponse> {
    if data.len() < 8 {
        return Err(anyhow!("announce response too short: {} bytes", data.len()));
    }

    let action = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let txn = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if txn != transaction_id {
        return Err(anyhow!("announce transaction id mismatch"));
    }

    if action == ACTION_ERROR {
        let message = String::from_utf8_lossy(&data[8..]).into_owned();
        return Err(anyhow!("tracker error: {}", message));
    }
    if action != ACTION_ANNOUNCE {
        return Err(anyhow!("unexpected announce action {}", action));
    }
    if data.len() < 20 {
        return Err(anyhow!("announce response too short: {} bytes", data.len()));
    }

    let interval = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    let leechers = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);
    let seeders = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);

    let compact = &data[20..];
    if compact.len() % 6 != 0 {
        return Err(anyhow!("peer list length is not a multiple of 6"));
    }

    let mut peers = Vec::with_capacity(compact.len() / 6);
    for entry in compact.chunks_exact(6) {
        let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
        let port = u16::from_be_bytes([entry[4], entry[5]]);
        if port != 0 {
            peers.push(SocketAddrV4::new(ip, port));
        }
    }

    Ok(UdpAnnounceResponse {
        interval,
        leechers,
        seeders,
        peers,
    })
}

pub fn parse_udp_tracker_url(url: &str) -> Result<SocketAddrV4> {
    let rest = url
        .strip_prefix("udp://")
        .ok_or_else(|| anyhow!("not a udp tracker url: {}", url))?;

    let host_port = match rest.find('/') {
        Some(slash) => &rest[..slash],
        None => rest,
    };

    let (host, port) = host_port
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("udp tracker url has no port: {}", url))?;
    let port: u16 = port.parse().context("udp tracker port")?;

    let ip = host
        .parse::<Ipv4Addr>()
        .or_else(|_| resolve_ipv4(host))
        .with_context(|| format!("resolve tracker host {}", host))?;

    Ok(SocketAddrV4::new(ip, port))
}

fn resolve_ipv4(host: &str) -> Result<Ipv4Addr> {
    use std::net::ToSocketAddrs;

    for addr in (host, 0u16).to_socket_addrs()? {
        if let std::net::SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }
    Err(anyhow!("no IPv4 address for {}", host))
}
