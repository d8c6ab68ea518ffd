//! Owner of every piece's download state and of the output file. All
//! mutation funnels through the coordinator thread, so the store needs no
//! internal locking.

use std::path::Path;

use log::warn;
use thiserror::Error;

use crate::disk::OutputFile;
use crate::piece::{PieceCompletion, PieceState};
use remora_bencode::TorrentMeta;
use remora_util::hash;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("block at {offset}+{length} exceeds piece {piece} of {size} bytes")]
    BlockOutOfRange {
        piece: u32,
        offset: u32,
        length: u32,
        size: u32,
    },
    #[error("no piece with index {0}")]
    UnknownPiece(u32),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub pieces_completed: usize,
    pub pieces_total: usize,
    pub bytes_completed: u64,
    pub total_length: u64,
}

pub struct PieceStore {
    pieces: Vec<PieceState>,
    piece_length: u64,
    completed: usize,
    bytes_completed: u64,
    total_length: u64,
    output: OutputFile,
}

impl PieceStore {
    /// Builds all piece states and creates the pre-sized output file.
    pub fn new(meta: &TorrentMeta, output_dir: &Path) -> Result<Self> {
        let pieces = meta
            .piece_hashes
            .iter()
            .enumerate()
            .map(|(i, &digest)| PieceState::new(i as u32, meta.piece_size(i as u32), digest))
            .collect();

        let output = OutputFile::create(output_dir, &meta.file_name, meta.total_length)?;

        Ok(PieceStore {
            pieces,
            piece_length: meta.piece_length,
            completed: 0,
            bytes_completed: 0,
            total_length: meta.total_length,
            output,
        })
    }

    /// Lowest-indexed idle piece, marked requested. The fallback strategy
    /// when rarity gives no signal.
    pub fn next_sequential(&mut self) -> Option<u32> {
        let piece = self.pieces.iter_mut().find(|p| p.is_idle())?;
        piece.requested = true;
        Some(piece.index)
    }

    /// Idle piece advertised by the fewest peers (smallest non-zero count,
    /// lowest index on ties), marked requested. Falls back to
    /// [`Self::next_sequential`] when no idle piece is advertised at all.
    pub fn rarest(&mut self, bitfields: &[Vec<bool>]) -> Option<u32> {
        let mut best: Option<(usize, u32)> = None;

        for piece in self.pieces.iter().filter(|p| p.is_idle()) {
            let idx = piece.index as usize;
            let owners = bitfields
                .iter()
                .filter(|bf| bf.get(idx).copied().unwrap_or(false))
                .count();
            if owners == 0 {
                continue;
            }
            // Strict less-than keeps the lowest index among equally rare.
            if best.map_or(true, |(count, _)| owners < count) {
                best = Some((owners, piece.index));
            }
        }

        match best {
            Some((_, index)) => {
                self.pieces[index as usize].requested = true;
                Some(index)
            }
            None => self.next_sequential(),
        }
    }

    /// Routes a received block into its piece. Offsets past the piece end
    /// are rejected; everything else follows the piece's own lifecycle.
    pub fn add_block(&mut self, index: u32, offset: u32, data: &[u8]) -> Result<PieceCompletion> {
        let piece = self
            .pieces
            .get_mut(index as usize)
            .ok_or(StoreError::UnknownPiece(index))?;

        if offset as u64 + data.len() as u64 > piece.size as u64 {
            return Err(StoreError::BlockOutOfRange {
                piece: index,
                offset,
                length: data.len() as u32,
                size: piece.size,
            });
        }

        let outcome = piece.add_block(offset, data);
        if let PieceCompletion::Completed(bytes) = &outcome {
            self.completed += 1;
            self.bytes_completed += bytes.len() as u64;
        }
        Ok(outcome)
    }

    /// Returns a piece to the idle state after a timeout or peer loss.
    /// Completed pieces are terminal; resetting them is a no-op.
    pub fn reset(&mut self, index: u32) {
        if let Some(piece) = self.pieces.get_mut(index as usize) {
            piece.reset();
        }
    }

    /// Writes a verified piece at its absolute file offset.
    pub fn persist(&mut self, index: u32, bytes: &[u8]) -> Result<()> {
        if index as usize >= self.pieces.len() {
            return Err(StoreError::UnknownPiece(index));
        }
        self.output
            .write_at(index as u64 * self.piece_length, bytes)?;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.completed == self.pieces.len()
    }

    pub fn progress(&self) -> f64 {
        if self.pieces.is_empty() {
            return 1.0;
        }
        self.completed as f64 / self.pieces.len() as f64
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            pieces_completed: self.completed,
            pieces_total: self.pieces.len(),
            bytes_completed: self.bytes_completed,
            total_length: self.total_length,
        }
    }

    pub fn output_path(&self) -> &Path {
        self.output.path()
    }

    /// Flushes the finished file to stable storage.
    pub fn finalize(&mut self) -> Result<()> {
        self.output.sync()?;
        Ok(())
    }

    /// Re-reads the whole file and re-digests every piece. True only when
    /// each piece on disk matches its expected hash.
    pub fn verify_file(&mut self) -> Result<bool> {
        for i in 0..self.pieces.len() {
            let (size, expected, index) = {
                let p = &self.pieces[i];
                (p.size as usize, p.expected_hash, p.index)
            };
            let mut buf = vec![0u8; size];
            self.output
                .read_at(index as u64 * self.piece_length, &mut buf)?;
            if hash::sha1(&buf) != expected {
                warn!("piece {} on disk does not match its digest", index);
                return Ok(false);
            }
        }
        Ok(true)
    }
}
