//! The download loop: supervises peer sessions, assigns pieces rarest-first
//! with a sequential fallback, enforces per-piece deadlines, and refills the
//! peer pool from the trackers when it drains.

use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, SocketAddrV4};
use std::num::NonZeroUsize;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use lru::LruCache;

use crate::announcer::{Announcer, TransferTotals};
use crate::settings::Settings;
use crate::types::DownloadSummary;
use remora_bencode::TorrentMeta;
use remora_net::session::{self, PeerCommand, PeerEvent, SessionParams};
use remora_net::TrackerEvent;
use remora_store::{PieceCompletion, PieceStore, StoreError};
use remora_util::bitfield::Bitfield;
use remora_util::{hash, ids};

const EXPANSION_CACHE_ENTRIES: usize = 64;

struct PeerHandle {
    commands: Sender<PeerCommand>,
    ready: bool,
    choked: bool,
    peer_id: Option<[u8; 20]>,
    assigned: HashSet<u32>,
    downloaded: u64,
    /// Bytes at the start of the current rate window.
    window_mark: u64,
    /// Bytes received during the previous tick window.
    rate: u64,
    /// Bumped on every bitfield/have update; keys the expansion cache.
    bitfield_version: u64,
}

impl PeerHandle {
    fn new(commands: Sender<PeerCommand>) -> Self {
        PeerHandle {
            commands,
            ready: false,
            choked: true,
            peer_id: None,
            assigned: HashSet::new(),
            downloaded: 0,
            window_mark: 0,
            rate: 0,
            bitfield_version: 0,
        }
    }
}

struct InFlight {
    addr: SocketAddr,
    deadline: Instant,
}

pub struct Coordinator {
    meta: Arc<TorrentMeta>,
    settings: Settings,
    peer_id: [u8; 20],
    store: PieceStore,
    announcer: Announcer,
    events_tx: Sender<PeerEvent>,
    events_rx: Receiver<PeerEvent>,
    peers: HashMap<SocketAddr, PeerHandle>,
    failed_peers: HashSet<SocketAddr>,
    /// At most one entry per piece index.
    in_progress: HashMap<u32, InFlight>,
    bitfields: HashMap<SocketAddr, Bitfield>,
    expanded: LruCache<SocketAddr, (u64, Vec<bool>)>,
    empty_refreshes: u32,
    last_refresh: Option<Instant>,
    started_at: Instant,
}

impl Coordinator {
    pub fn new(meta: TorrentMeta, settings: Settings) -> Result<Self> {
        let meta = Arc::new(meta);
        let store = PieceStore::new(&meta, &settings.output_dir).context("open output file")?;
        let peer_id = ids::peer_id();
        let announcer = Announcer::new(Arc::clone(&meta), peer_id, settings.listen_port);
        let (events_tx, events_rx) = mpsc::channel();

        Ok(Coordinator {
            meta,
            settings,
            peer_id,
            store,
            announcer,
            events_tx,
            events_rx,
            peers: HashMap::new(),
            failed_peers: HashSet::new(),
            in_progress: HashMap::new(),
            bitfields: HashMap::new(),
            expanded: LruCache::new(
                NonZeroUsize::new(EXPANSION_CACHE_ENTRIES).expect("nonzero cache size"),
            ),
            empty_refreshes: 0,
            last_refresh: None,
            started_at: Instant::now(),
        })
    }

    /// Runs the download to completion or to a fatal error. Either way the
    /// peers are disconnected and the trackers get a final event.
    pub fn run(mut self) -> Result<DownloadSummary> {
        info!(
            "downloading \"{}\": {} pieces, {} bytes, info hash {}",
            self.meta.file_name,
            self.meta.piece_count(),
            self.meta.total_length,
            hash::hex(&self.meta.info_hash),
        );

        match self.announcer.announce(TrackerEvent::Started, self.totals()) {
            Ok(batch) => {
                let dialled = self.dial(&batch, self.settings.initial_dial_count);
                info!("dialling {} of {} discovered peers", dialled, batch.len());
            }
            Err(err) => warn!("start-up announce failed: {:#}", err),
        }

        let outcome = self.drive();
        self.disconnect_all();

        match outcome {
            Ok(summary) => {
                if let Err(err) = self.announcer.announce(TrackerEvent::Completed, self.totals()) {
                    debug!("completed announce failed: {:#}", err);
                }
                info!(
                    "finished \"{}\" in {:.1}s ({} bytes, {} KiB/s)",
                    self.meta.file_name,
                    summary.elapsed.as_secs_f64(),
                    summary.total_bytes,
                    summary.mean_rate_bytes_per_sec() / 1024,
                );
                Ok(summary)
            }
            Err(err) => {
                if let Err(stop_err) = self.announcer.announce(TrackerEvent::Stopped, self.totals())
                {
                    debug!("stopped announce failed: {:#}", stop_err);
                }
                Err(err)
            }
        }
    }

    fn drive(&mut self) -> Result<DownloadSummary> {
        let mut last_tick = Instant::now();

        loop {
            if self.store.is_complete() {
                return self.finish();
            }

            let wait = self
                .settings
                .tick_interval
                .saturating_sub(last_tick.elapsed());
            match self.events_rx.recv_timeout(wait) {
                Ok(event) => {
                    self.handle_event(event)?;
                    while let Ok(event) = self.events_rx.try_recv() {
                        self.handle_event(event)?;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("event channel closed"));
                }
            }

            if last_tick.elapsed() >= self.settings.tick_interval {
                self.tick()?;
                last_tick = Instant::now();
            }
        }
    }

    fn finish(&mut self) -> Result<DownloadSummary> {
        self.store.finalize().context("sync output file")?;
        if !self.store.verify_file().context("re-verify output file")? {
            return Err(anyhow!("final file verification failed"));
        }

        let stats = self.store.stats();
        Ok(DownloadSummary {
            file_path: self.store.output_path().to_path_buf(),
            total_bytes: stats.total_length,
            pieces: stats.pieces_total,
            elapsed: self.started_at.elapsed(),
        })
    }

    fn tick(&mut self) -> Result<()> {
        self.release_expired();
        self.update_rates();
        let assignments = self.assign_all();

        let window_bytes: u64 = self.peers.values().map(|p| p.rate).sum();
        debug!(
            "{} peers, {} pieces in flight, {:.1}% complete, {} KiB/s",
            self.peers.len(),
            self.in_progress.len(),
            self.store.progress() * 100.0,
            window_bytes / self.settings.tick_interval.as_secs().max(1) / 1024,
        );

        if self.peers.len() < self.settings.min_active_peers || assignments == 0 {
            self.replenish()?;
        }
        Ok(())
    }

    fn handle_event(&mut self, event: PeerEvent) -> Result<()> {
        match event {
            PeerEvent::Ready { addr, peer_id } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.ready = true;
                    peer.peer_id = Some(peer_id);
                    debug!("{} ready, peer id {}", addr, hash::hex(&peer_id));
                }
            }
            PeerEvent::Bitfield { addr, raw } => {
                self.bitfields
                    .insert(addr, Bitfield::from_bytes(&raw, self.meta.piece_count()));
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.bitfield_version += 1;
                }
            }
            PeerEvent::Have { addr, index } => {
                let piece_count = self.meta.piece_count();
                self.bitfields
                    .entry(addr)
                    .or_insert_with(|| Bitfield::new(piece_count))
                    .set(index as usize, true);
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.bitfield_version += 1;
                }
            }
            PeerEvent::Choked { addr } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.choked = true;
                }
            }
            PeerEvent::Unchoked { addr } => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    peer.choked = false;
                }
                self.assign_to_peer(addr);
            }
            PeerEvent::Block {
                addr,
                index,
                begin,
                block,
            } => {
                self.handle_block(addr, index, begin, &block)?;
            }
            PeerEvent::Failed { addr, reason } => {
                warn!("peer {} failed: {}", addr, reason);
                self.failed_peers.insert(addr);
                self.remove_peer(addr);
            }
            PeerEvent::Disconnected { addr } => {
                self.remove_peer(addr);
            }
        }
        Ok(())
    }

    fn handle_block(
        &mut self,
        addr: SocketAddr,
        index: u32,
        begin: u32,
        block: &[u8],
    ) -> Result<()> {
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.downloaded += block.len() as u64;
        }

        match self.store.add_block(index, begin, block) {
            Ok(PieceCompletion::InProgress) => {}
            Ok(PieceCompletion::AlreadyCompleted) => {
                debug!("{} delivered a block for finished piece {}", addr, index);
            }
            Ok(PieceCompletion::Completed(bytes)) => {
                self.store.persist(index, &bytes).context("write piece")?;
                self.clear_assignment(addr, index);
                let stats = self.store.stats();
                info!(
                    "piece {} done ({}/{} pieces, {:.1}%)",
                    index,
                    stats.pieces_completed,
                    stats.pieces_total,
                    self.store.progress() * 100.0,
                );
                // The delivering peer is healthy; keep it busy.
                self.assign_to_peer(addr);
            }
            Ok(PieceCompletion::Failed) => {
                warn!("piece {} failed verification, will retry", index);
                self.clear_assignment(addr, index);
            }
            Err(StoreError::BlockOutOfRange { .. }) => {
                warn!("{} sent an out-of-range block for piece {}", addr, index);
                self.store.reset(index);
                self.clear_assignment(addr, index);
            }
            Err(StoreError::UnknownPiece(_)) => {
                warn!("{} sent a block for nonexistent piece {}", addr, index);
            }
            Err(err) => return Err(err).context("store block"),
        }
        Ok(())
    }

    fn clear_assignment(&mut self, addr: SocketAddr, index: u32) {
        self.in_progress.remove(&index);
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.assigned.remove(&index);
        }
    }

    fn remove_peer(&mut self, addr: SocketAddr) {
        if let Some(handle) = self.peers.remove(&addr) {
            if let Some(peer_id) = handle.peer_id {
                debug!("dropping {} (peer id {})", addr, hash::hex(&peer_id));
            }
            for index in handle.assigned {
                self.store.reset(index);
                self.in_progress.remove(&index);
                debug!("released piece {} after losing {}", index, addr);
            }
        }
        self.bitfields.remove(&addr);
        self.expanded.pop(&addr);
    }

    fn release_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<u32> = self
            .in_progress
            .iter()
            .filter(|(_, flight)| now >= flight.deadline)
            .map(|(&index, _)| index)
            .collect();

        for index in expired {
            if let Some(flight) = self.in_progress.remove(&index) {
                warn!("piece {} timed out on {}", index, flight.addr);
                self.store.reset(index);
                if let Some(peer) = self.peers.get_mut(&flight.addr) {
                    peer.assigned.remove(&index);
                }
            }
        }
    }

    fn update_rates(&mut self) {
        for peer in self.peers.values_mut() {
            peer.rate = peer.downloaded - peer.window_mark;
            peer.window_mark = peer.downloaded;
        }
    }

    /// Visits ready, unchoked peers fastest-first and tops each one up to
    /// the per-peer assignment cap.
    fn assign_all(&mut self) -> usize {
        let mut order: Vec<(SocketAddr, u64)> = self
            .peers
            .iter()
            .filter(|(_, p)| p.ready && !p.choked)
            .map(|(&addr, p)| (addr, p.rate))
            .collect();
        order.sort_by(|a, b| b.1.cmp(&a.1));

        order
            .into_iter()
            .map(|(addr, _)| self.assign_to_peer(addr))
            .sum()
    }

    fn assign_to_peer(&mut self, addr: SocketAddr) -> usize {
        let mut made = 0;

        loop {
            let has_capacity = match self.peers.get(&addr) {
                Some(p) if p.ready && !p.choked => {
                    p.assigned.len() < self.settings.max_assignments_per_peer
                }
                _ => false,
            };
            if !has_capacity {
                break;
            }

            let index = match self.pick_piece_for(addr) {
                Some(index) => index,
                None => break,
            };

            let size = self.meta.piece_size(index);
            let sent = self
                .peers
                .get(&addr)
                .map(|p| p.commands.send(PeerCommand::RequestPiece { index, size }).is_ok())
                .unwrap_or(false);
            if !sent {
                // Session thread already gone; its disconnect event will
                // finish the cleanup.
                self.store.reset(index);
                break;
            }

            self.in_progress.insert(
                index,
                InFlight {
                    addr,
                    deadline: Instant::now() + self.settings.piece_deadline,
                },
            );
            if let Some(peer) = self.peers.get_mut(&addr) {
                peer.assigned.insert(index);
            }
            debug!("assigned piece {} to {}", index, addr);
            made += 1;
        }

        made
    }

    /// Rarest-first against the whole swarm, accepted only when this peer
    /// advertises the piece; otherwise a sequential fallback, skipped when
    /// the peer's known bitfield rules it out.
    fn pick_piece_for(&mut self, addr: SocketAddr) -> Option<u32> {
        let arrays = self.expanded_bitfields();
        if let Some(index) = self.store.rarest(&arrays) {
            if self.advertises(addr, index) {
                return Some(index);
            }
            self.store.reset(index);
        }

        let index = self.store.next_sequential()?;
        match self.bitfields.get(&addr) {
            Some(bf) if !bf.get(index as usize) => {
                self.store.reset(index);
                None
            }
            _ => Some(index),
        }
    }

    fn advertises(&self, addr: SocketAddr, index: u32) -> bool {
        self.bitfields
            .get(&addr)
            .map(|bf| bf.get(index as usize))
            .unwrap_or(false)
    }

    /// Expands packed bitfields to bool arrays for the rarity count, served
    /// from a version-keyed cache so unchanged peers are not re-unpacked.
    fn expanded_bitfields(&mut self) -> Vec<Vec<bool>> {
        let mut arrays = Vec::with_capacity(self.bitfields.len());
        for (addr, bf) in &self.bitfields {
            let version = self
                .peers
                .get(addr)
                .map(|p| p.bitfield_version)
                .unwrap_or(0);

            let cached = self
                .expanded
                .get(addr)
                .filter(|(v, _)| *v == version)
                .map(|(_, a)| a.clone());
            let array = match cached {
                Some(array) => array,
                None => {
                    let array = bf.expand();
                    self.expanded.put(*addr, (version, array.clone()));
                    array
                }
            };
            arrays.push(array);
        }
        arrays
    }

    fn replenish(&mut self) -> Result<()> {
        if let Some(last) = self.last_refresh {
            if last.elapsed() < self.settings.refresh_floor {
                return Ok(());
            }
        }
        self.last_refresh = Some(Instant::now());

        let batch = match self.announcer.announce(TrackerEvent::None, self.totals()) {
            Ok(batch) => batch,
            Err(err) => {
                warn!("peer refresh failed: {:#}", err);
                Vec::new()
            }
        };

        if batch.is_empty() {
            self.empty_refreshes += 1;
            if self.empty_refreshes >= self.settings.max_empty_refreshes {
                return Err(anyhow!(
                    "no tracker returned peers for {} consecutive refresh cycles",
                    self.empty_refreshes
                ));
            }
        } else {
            self.empty_refreshes = 0;
            let dialled = self.dial(&batch, self.settings.refill_dial_count);
            if dialled > 0 {
                info!("dialling {} fresh peers", dialled);
            }
        }
        Ok(())
    }

    fn dial(&mut self, batch: &[SocketAddrV4], limit: usize) -> usize {
        let mut dialled = 0;
        for &addr in batch {
            if dialled >= limit || self.peers.len() >= self.settings.max_active_peers {
                break;
            }
            let addr = SocketAddr::V4(addr);
            if self.peers.contains_key(&addr) || self.failed_peers.contains(&addr) {
                continue;
            }

            let params = SessionParams {
                addr,
                info_hash: self.meta.info_hash,
                local_peer_id: self.peer_id,
                piece_count: self.meta.piece_count(),
                connect_timeout: self.settings.dial_timeout,
            };
            let commands = session::spawn(params, self.events_tx.clone());
            self.peers.insert(addr, PeerHandle::new(commands));
            dialled += 1;
        }
        dialled
    }

    fn disconnect_all(&mut self) {
        for (addr, peer) in self.peers.drain() {
            debug!("disconnecting {}", addr);
            let _ = peer.commands.send(PeerCommand::Disconnect);
        }
        self.bitfields.clear();
        self.in_progress.clear();
    }

    fn totals(&self) -> TransferTotals {
        let stats = self.store.stats();
        TransferTotals {
            uploaded: 0,
            downloaded: stats.bytes_completed,
            left: stats.total_length - stats.bytes_completed,
        }
    }
}
