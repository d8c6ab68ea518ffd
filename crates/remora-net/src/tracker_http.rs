use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use remora_util::hash::percent_encode;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
const NUM_WANT: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    Started,
    Stopped,
    Completed,
    None,
}

impl TrackerEvent {
    fn as_str(&self) -> Option<&'static str> {
        match self {
            TrackerEvent::Started => Some("started"),
            TrackerEvent::Stopped => Some("stopped"),
            TrackerEvent::Completed => Some("completed"),
            TrackerEvent::None => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnnounceRequest<'a> {
    pub info_hash: &'a [u8; 20],
    pub peer_id: &'a [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: TrackerEvent,
}

#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: Option<u32>,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
    pub peers: Vec<SocketAddrV4>,
    /// A rejection from the tracker; the request itself succeeded.
    pub failure_reason: Option<String>,
}

/// One HTTP(S) announce round-trip with a 10-second deadline.
pub fn announce(base_url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse> {
    let url = announce_url(base_url, request);

    let client = reqwest::blocking::Client::builder()
        .timeout(RESPONSE_TIMEOUT)
        .build()
        .context("build http client")?;

    let response = client.get(&url).send().context("announce request")?;
    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("tracker returned HTTP {}", status));
    }

    let body = response.bytes().context("read announce response")?;
    parse_announce_response(&body)
}

fn announce_url(base_url: &str, req: &AnnounceRequest) -> String {
    let query = build_query(req);
    if base_url.contains('?') {
        format!("{}&{}", base_url, query)
    } else {
        format!("{}?{}", base_url, query)
    }
}

fn build_query(req: &AnnounceRequest) -> String {
    let mut parts = vec![
        format!("info_hash={}", percent_encode(req.info_hash)),
        format!("peer_id={}", percent_encode(req.peer_id)),
        format!("port={}", req.port),
        format!("uploaded={}", req.uploaded),
        format!("downloaded={}", req.downloaded),
        format!("left={}", req.left),
        "compact=1".to_string(),
        format!("numwant={}", NUM_WANT),
    ];
    if let Some(event) = req.event.as_str() {
        parts.push(format!("event={}", event));
    }
    parts.join("&")
}

fn parse_announce_response(data: &[u8]) -> Result<AnnounceResponse> {
    use remora_bencode::decode::Value;

    let root = remora_bencode::decode(data)?;
    let dict = root
        .as_dict()
        .ok_or_else(|| anyhow!("tracker response is not a dictionary"))?;

    if let Some(reason) = dict.get(b"failure reason".as_ref()) {
        let reason = reason
            .as_str()
            .unwrap_or("failure reason is not text")
            .to_string();
        return Ok(AnnounceResponse {
            interval: None,
            complete: None,
            incomplete: None,
            peers: Vec::new(),
            failure_reason: Some(reason),
        });
    }

    let interval = read_u32_field(dict.get(b"interval".as_ref()));
    let complete = read_u32_field(dict.get(b"complete".as_ref()));
    let incomplete = read_u32_field(dict.get(b"incomplete".as_ref()));

    let peers = match dict.get(b"peers".as_ref()) {
        Some(Value::Bytes(raw)) => parse_compact_peers(raw)?,
        Some(Value::List(entries)) => parse_peer_dicts(entries),
        Some(_) => return Err(anyhow!("peers field has unexpected type")),
        None => Vec::new(),
    };

    Ok(AnnounceResponse {
        interval,
        complete,
        incomplete,
        peers,
        failure_reason: None,
    })
}

fn read_u32_field(value: Option<&remora_bencode::Value>) -> Option<u32> {
    value
        .and_then(|v| v.as_integer())
        .and_then(|n| u32::try_from(n).ok())
}

/// Compact form: 6 bytes per peer, IPv4 followed by a big-endian port.
pub fn parse_compact_peers(data: &[u8]) -> Result<Vec<SocketAddrV4>> {
    if data.len() % 6 != 0 {
        return Err(anyhow!(
            "compact peer list length {} is not a multiple of 6",
            data.len()
        ));
    }

    let mut peers = Vec::with_capacity(data.len() / 6);
    for entry in data.chunks_exact(6) {
        let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);
        let port = u16::from_be_bytes([entry[4], entry[5]]);
        peers.push(SocketAddrV4::new(ip, port));
    }
    Ok(peers)
}

/// Non-compact form: a list of dictionaries with `ip` and `port`. Entries
/// that do not parse as IPv4 endpoints are skipped.
fn parse_peer_dicts(entries: &[remora_bencode::Value]) -> Vec<SocketAddrV4> {
    let mut peers = Vec::new();
    for entry in entries {
        let ip = entry
            .get(b"ip")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Ipv4Addr>().ok());
        let port = entry
            .get(b"port")
            .and_then(|v| v.as_integer())
            .and_then(|n| u16::try_from(n).ok());
        if let (Some(ip), Some(port)) = (ip, port) {
            peers.push(SocketAddrV4::new(ip, port));
        }
    }
    peers
}
