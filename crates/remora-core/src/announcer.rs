//! Multi-tracker announce: every known URL is queried on its own worker
//! thread, failures stay isolated to their tracker, and the successful
//! responses are merged into one deduplicated peer list.

use std::collections::HashSet;
use std::net::SocketAddrV4;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use log::{debug, info, warn};

use remora_bencode::TorrentMeta;
use remora_net::tracker_http::{self, AnnounceRequest, TrackerEvent};
use remora_net::tracker_udp::{self, UdpAnnounceRequest};

/// Upper bound on waiting for stragglers; each transport enforces its own
/// tighter deadline underneath.
const COLLECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Upload/download totals reported to trackers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransferTotals {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

pub struct Announcer {
    meta: Arc<TorrentMeta>,
    peer_id: [u8; 20],
    port: u16,
}

impl Announcer {
    pub fn new(meta: Arc<TorrentMeta>, peer_id: [u8; 20], port: u16) -> Self {
        Announcer {
            meta,
            peer_id,
            port,
        }
    }

    /// Announces to every tracker in parallel and returns the union of the
    /// peers they handed back. Errors only when no tracker responded.
    pub fn announce(&self, event: TrackerEvent, totals: TransferTotals) -> Result<Vec<SocketAddrV4>> {
        let urls = &self.meta.announce_list;
        let (tx, rx) = mpsc::channel::<(String, Result<Vec<SocketAddrV4>>)>();
        let mut pending = 0usize;

        for url in urls {
            let tx = tx.clone();
            let task_url = url.clone();
            let meta = Arc::clone(&self.meta);
            let peer_id = self.peer_id;
            let port = self.port;

            let spawned = std::thread::Builder::new()
                .name("announce".to_string())
                .spawn(move || {
                    let outcome = announce_one(&task_url, &meta, &peer_id, port, event, totals);
                    let _ = tx.send((task_url, outcome));
                });
            match spawned {
                Ok(_) => pending += 1,
                Err(err) => warn!("could not spawn announce thread for {}: {}", url, err),
            }
        }
        drop(tx);

        let mut seen = HashSet::new();
        let mut peers = Vec::new();
        let mut successes = 0usize;
        let deadline = Instant::now() + COLLECT_TIMEOUT;

        for _ in 0..pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (url, outcome) = match rx.recv_timeout(remaining) {
                Ok(result) => result,
                Err(_) => break,
            };
            match outcome {
                Ok(batch) => {
                    successes += 1;
                    debug!("tracker {} returned {} peers", url, batch.len());
                    for addr in batch {
                        if seen.insert(addr) {
                            peers.push(addr);
                        }
                    }
                }
                Err(err) => warn!("tracker {} failed: {:#}", url, err),
            }
        }

        if successes == 0 {
            return Err(anyhow!("no tracker reachable"));
        }
        info!(
            "announce gathered {} unique peers from {} tracker(s)",
            peers.len(),
            successes
        );
        Ok(peers)
    }
}

fn announce_one(
    url: &str,
    meta: &TorrentMeta,
    peer_id: &[u8; 20],
    port: u16,
    event: TrackerEvent,
    totals: TransferTotals,
) -> Result<Vec<SocketAddrV4>> {
    if url.starts_with("udp://") {
        let request = UdpAnnounceRequest {
            info_hash: &meta.info_hash,
            peer_id,
            downloaded: totals.downloaded,
            left: totals.left,
            uploaded: totals.uploaded,
            event,
            port,
        };
        let response = tracker_udp::announce(url, &request)?;
        debug!(
            "{}: interval {}s, {} seeders / {} leechers",
            url, response.interval, response.seeders, response.leechers
        );
        Ok(response.peers)
    } else if url.starts_with("http://") || url.starts_with("https://") {
        let request = AnnounceRequest {
            info_hash: &meta.info_hash,
            peer_id,
            port,
            uploaded: totals.uploaded,
            downloaded: totals.downloaded,
            left: totals.left,
            event,
        };
        let response = tracker_http::announce(url, &request)?;
        if let Some(reason) = response.failure_reason {
            return Err(anyhow!("tracker rejected announce: {}", reason));
        }
        if let Some(interval) = response.interval {
            debug!("{}: interval {}s", url, interval);
        }
        Ok(response.peers)
    } else {
        Err(anyhow!("unsupported tracker scheme: {}", url))
    }
}
