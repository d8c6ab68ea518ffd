use std::collections::BTreeMap;

use remora_util::hash;

pub const BLOCK_SIZE: u32 = 16384;

/// Outcome of feeding one block into a piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PieceCompletion {
    /// Accepted (or silently ignored as a duplicate); more blocks missing.
    InProgress,
    /// All blocks arrived and the digest matched. Carries the piece bytes,
    /// ready to persist; the block map has been released.
    Completed(Vec<u8>),
    /// Assembly or digest verification failed; the piece was reset and is
    /// available for reassignment.
    Failed,
    /// The piece had already been completed and verified earlier.
    AlreadyCompleted,
}

/// Download state of a single piece. Lives in the store from start-up until
/// process exit; once `completed` the block map is gone for good.
#[derive(Debug)]
pub struct PieceState {
    pub index: u32,
    pub size: u32,
    pub expected_hash: [u8; 20],
    blocks: BTreeMap<u32, Vec<u8>>,
    blocks_received: u32,
    total_blocks: u32,
    pub requested: bool,
    pub completed: bool,
}

impl PieceState {
    pub fn new(index: u32, size: u32, expected_hash: [u8; 20]) -> Self {
        PieceState {
            index,
            size,
            expected_hash,
            blocks: BTreeMap::new(),
            blocks_received: 0,
            total_blocks: (size + BLOCK_SIZE - 1) / BLOCK_SIZE,
            requested: false,
            completed: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        !self.completed && !self.requested
    }

    /// Inserts one received block. Duplicate offsets are ignored. When the
    /// final block lands, the piece is assembled in offset order, checked
    /// for contiguity and verified against the expected digest.
    pub fn add_block(&mut self, offset: u32, data: &[u8]) -> PieceCompletion {
        if self.completed {
            return PieceCompletion::AlreadyCompleted;
        }

        if !self.blocks.contains_key(&offset) {
            self.blocks.insert(offset, data.to_vec());
            self.blocks_received += 1;
        }

        if self.blocks_received < self.total_blocks {
            return PieceCompletion::InProgress;
        }

        match self.assemble() {
            Some(bytes) => {
                self.completed = true;
                self.requested = false;
                self.blocks = BTreeMap::new();
                self.blocks_received = 0;
                PieceCompletion::Completed(bytes)
            }
            None => {
                self.reset();
                PieceCompletion::Failed
            }
        }
    }

    /// Joins the block map in offset order. None when the blocks are not
    /// contiguous, the total length is off, or the digest does not match.
    fn assemble(&self) -> Option<Vec<u8>> {
        let mut bytes = Vec::with_capacity(self.size as usize);
        let mut expected_offset = 0u32;

        for (&offset, block) in &self.blocks {
            if offset != expected_offset {
                return None;
            }
            bytes.extend_from_slice(block);
            expected_offset = offset + block.len() as u32;
        }

        if bytes.len() != self.size as usize {
            return None;
        }
        if hash::sha1(&bytes) != self.expected_hash {
            return None;
        }
        Some(bytes)
    }

    /// Back to the initial idle state. Completed pieces are terminal and
    /// unaffected.
    pub fn reset(&mut self) {
        if self.completed {
            return;
        }
        self.blocks.clear();
        self.blocks_received = 0;
        self.requested = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_block_piece() -> (PieceState, Vec<u8>) {
        let data: Vec<u8> = (0..49152u32).map(|i| (i % 251) as u8).collect();
        let piece = PieceState::new(0, data.len() as u32, hash::sha1(&data));
        (piece, data)
    }

    #[test]
    fn blocks_assemble_out_of_order() {
        let (mut piece, data) = three_block_piece();

        assert_eq!(
            piece.add_block(32768, &data[32768..]),
            PieceCompletion::InProgress
        );
        assert_eq!(
            piece.add_block(0, &data[..16384]),
            PieceCompletion::InProgress
        );
        match piece.add_block(16384, &data[16384..32768]) {
            PieceCompletion::Completed(bytes) => assert_eq!(bytes, data),
            other => panic!("expected completion, got {:?}", other),
        }
        assert!(piece.completed);
        assert!(!piece.requested);
    }

    #[test]
    fn corrupt_block_fails_then_redownload_succeeds() {
        let (mut piece, data) = three_block_piece();

        piece.add_block(0, &data[..16384]);
        piece.add_block(16384, &data[16384..32768]);
        let corrupted = vec![0u8; 16384];
        assert_eq!(piece.add_block(32768, &corrupted), PieceCompletion::Failed);
        assert!(piece.is_idle());

        piece.add_block(0, &data[..16384]);
        piece.add_block(16384, &data[16384..32768]);
        match piece.add_block(32768, &data[32768..]) {
            PieceCompletion::Completed(bytes) => assert_eq!(bytes, data),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn duplicate_blocks_are_ignored() {
        let (mut piece, data) = three_block_piece();
        piece.add_block(0, &data[..16384]);
        // Same offset again with garbage; the original bytes must win.
        piece.add_block(0, &vec![0xff; 16384]);
        piece.add_block(16384, &data[16384..32768]);
        match piece.add_block(32768, &data[32768..]) {
            PieceCompletion::Completed(bytes) => assert_eq!(bytes, data),
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[test]
    fn blocks_after_completion_are_accepted_silently() {
        let data = vec![7u8; 100];
        let mut piece = PieceState::new(3, 100, hash::sha1(&data));
        assert!(matches!(
            piece.add_block(0, &data),
            PieceCompletion::Completed(_)
        ));
        assert_eq!(piece.add_block(0, &data), PieceCompletion::AlreadyCompleted);
    }

    #[test]
    fn misaligned_blocks_fail_contiguity() {
        let data = vec![1u8; 20000];
        let mut piece = PieceState::new(0, 20000, hash::sha1(&data));
        // Two blocks arrive but they overlap instead of tiling the piece.
        piece.add_block(0, &data[..16384]);
        assert_eq!(
            piece.add_block(100, &data[100..16484]),
            PieceCompletion::Failed
        );
        assert!(piece.is_idle());
    }

    #[test]
    fn short_final_block() {
        let data = vec![9u8; 16384 + 10];
        let mut piece = PieceState::new(0, data.len() as u32, hash::sha1(&data));
        piece.add_block(0, &data[..16384]);
        assert!(matches!(
            piece.add_block(16384, &data[16384..]),
            PieceCompletion::Completed(_)
        ));
    }

    #[test]
    fn reset_leaves_completed_pieces_alone() {
        let data = vec![7u8; 10];
        let mut piece = PieceState::new(0, 10, hash::sha1(&data));
        assert!(matches!(
            piece.add_block(0, &data),
            PieceCompletion::Completed(_)
        ));
        piece.reset();
        assert!(piece.completed);
    }
}
