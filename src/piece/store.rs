use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use crate::constants::BLOCK_SIZE;

/// Lifecycle of one block within a piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Missing,
    Requested,
    Downloaded,
}

/// A 16 KiB request/transfer unit (shorter for the tail of a piece).
///
/// Invariant: a `Requested` block always carries a request timestamp.
#[derive(Debug, Clone)]
pub struct Block {
    pub offset: u32,
    pub length: u32,
    pub state: BlockState,
    pub requested_at: Option<Instant>,
}

/// Coordinates of a block to request from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

struct PieceState {
    blocks: Vec<Block>,
    buffer: Vec<u8>,
    downloaded: usize,
    verified: bool,
    finished: bool,
}

/// One hash-verified unit of the torrent's content.
///
/// Created once at session start from external metadata and never destroyed.
/// All mutation happens under a single per-piece mutex, the engine's only
/// critical section on the download path.
pub struct Piece {
    index: u32,
    length: u32,
    expected_hash: [u8; 20],
    state: Mutex<PieceState>,
}

impl Piece {
    /// Splits `length` bytes into fixed 16 KiB blocks, final block shorter
    /// if the piece length is not a multiple of the block size.
    pub fn new(index: u32, length: u32, expected_hash: [u8; 20]) -> Self {
        let mut blocks = Vec::with_capacity(length.div_ceil(BLOCK_SIZE) as usize);
        let mut offset = 0u32;
        while offset < length {
            let block_length = (length - offset).min(BLOCK_SIZE);
            blocks.push(Block {
                offset,
                length: block_length,
                state: BlockState::Missing,
                requested_at: None,
            });
            offset += block_length;
        }

        Self {
            index,
            length,
            expected_hash,
            state: Mutex::new(PieceState {
                blocks,
                buffer: vec![0; length as usize],
                downloaded: 0,
                verified: false,
                finished: false,
            }),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn block_count(&self) -> usize {
        (self.length.div_ceil(BLOCK_SIZE)) as usize
    }

    pub fn expected_hash(&self) -> &[u8; 20] {
        &self.expected_hash
    }

    /// Stores one delivered block.
    ///
    /// Returns false for an unknown offset, a length mismatch, or a block
    /// that is already downloaded: duplicate or misaligned delivery is an
    /// idempotent no-op and never corrupts assembled state. When the last
    /// block lands the piece is verified in place; a hash mismatch resets
    /// every block to `Missing` so the piece re-enters selection.
    pub fn update_block(&self, offset: u32, data: &[u8]) -> bool {
        let mut state = self.state.lock();

        let Some(position) = state.blocks.iter().position(|b| b.offset == offset) else {
            return false;
        };

        {
            let block = &state.blocks[position];
            if block.state == BlockState::Downloaded || block.length as usize != data.len() {
                return false;
            }
        }

        let start = offset as usize;
        state.buffer[start..start + data.len()].copy_from_slice(data);
        state.blocks[position].state = BlockState::Downloaded;
        state.blocks[position].requested_at = None;
        state.downloaded += 1;

        if state.downloaded == state.blocks.len() {
            self.verify_locked(&mut state);
        }

        true
    }

    fn verify_locked(&self, state: &mut PieceState) {
        let hash = Sha1::digest(&state.buffer);
        if hash.as_slice() == self.expected_hash {
            state.verified = true;
            state.finished = true;
            debug!("piece {} verified", self.index);
        } else {
            warn!("piece {} failed hash verification, re-downloading", self.index);
            for block in &mut state.blocks {
                block.state = BlockState::Missing;
                block.requested_at = None;
            }
            state.downloaded = 0;
        }
    }

    /// Reserves the first `Missing` block for a request, stamping it with
    /// the current time. Returns `None` once no block is missing.
    pub fn next_block(&self) -> Option<BlockRequest> {
        let mut state = self.state.lock();

        let block = state
            .blocks
            .iter_mut()
            .find(|b| b.state == BlockState::Missing)?;
        block.state = BlockState::Requested;
        block.requested_at = Some(Instant::now());

        Some(BlockRequest {
            piece: self.index,
            offset: block.offset,
            length: block.length,
        })
    }

    /// Returns a reserved block to `Missing` without waiting for the stale
    /// window, for requests that were never actually sent.
    pub fn release_block(&self, offset: u32) {
        let mut state = self.state.lock();
        if let Some(block) = state
            .blocks
            .iter_mut()
            .find(|b| b.offset == offset && b.state == BlockState::Requested)
        {
            block.state = BlockState::Missing;
            block.requested_at = None;
        }
    }

    /// Releases any block requested longer than `window` ago back to
    /// `Missing`, unblocking re-request. Runs periodically for every
    /// unfinished piece; this is the engine's sole retry mechanism.
    ///
    /// Only a saturated piece is swept: while blocks are still `Missing`
    /// the piece can make progress without touching in-flight requests.
    pub fn clear_stale(&self, window: Duration) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        if state.blocks.iter().any(|b| b.state == BlockState::Missing) {
            return;
        }

        let now = Instant::now();
        for block in &mut state.blocks {
            if block.state == BlockState::Requested {
                if let Some(requested_at) = block.requested_at {
                    if now.duration_since(requested_at) > window {
                        block.state = BlockState::Missing;
                        block.requested_at = None;
                    }
                }
            }
        }
    }

    /// True once no block is `Missing`: the piece is saturated and cannot
    /// accept fresh requests until a completion or a stale reset.
    pub fn all_blocks_requested(&self) -> bool {
        self.state
            .lock()
            .blocks
            .iter()
            .all(|b| b.state != BlockState::Missing)
    }

    pub fn is_verified(&self) -> bool {
        self.state.lock().verified
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub fn downloaded_blocks(&self) -> usize {
        self.state.lock().downloaded
    }

    /// Hands the assembled, verified buffer to the caller, leaving the
    /// piece verified but empty. Returns `None` before verification or on a
    /// second call.
    pub fn take_data(&self) -> Option<Bytes> {
        let mut state = self.state.lock();
        if !state.verified || state.buffer.is_empty() {
            return None;
        }
        Some(Bytes::from(std::mem::take(&mut state.buffer)))
    }
}

impl std::fmt::Debug for Piece {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Piece")
            .field("index", &self.index)
            .field("length", &self.length)
            .field("downloaded", &state.downloaded)
            .field("verified", &state.verified)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::BLOCK_SIZE;

    fn hash_of(data: &[u8]) -> [u8; 20] {
        Sha1::digest(data).into()
    }

    fn two_block_piece() -> (Piece, Vec<u8>, Vec<u8>) {
        let first = vec![0xAAu8; BLOCK_SIZE as usize];
        let second = vec![0xBBu8; BLOCK_SIZE as usize];
        let mut full = first.clone();
        full.extend_from_slice(&second);
        let piece = Piece::new(0, 2 * BLOCK_SIZE, hash_of(&full));
        (piece, first, second)
    }

    #[test]
    fn block_layout_with_short_tail() {
        let piece = Piece::new(3, BLOCK_SIZE + 100, [0u8; 20]);
        assert_eq!(piece.block_count(), 2);

        let first = piece.next_block().unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(first.length, BLOCK_SIZE);

        let tail = piece.next_block().unwrap();
        assert_eq!(tail.offset, BLOCK_SIZE);
        assert_eq!(tail.length, 100);

        assert!(piece.next_block().is_none());
        assert!(piece.all_blocks_requested());
    }

    #[test]
    fn full_download_verifies() {
        let (piece, first, second) = two_block_piece();

        assert!(piece.update_block(0, &first));
        assert!(!piece.is_verified());

        assert!(piece.update_block(BLOCK_SIZE, &second));
        assert!(piece.is_verified());
        assert!(piece.is_finished());

        let data = piece.take_data().unwrap();
        assert_eq!(data.len(), 2 * BLOCK_SIZE as usize);
        assert!(piece.take_data().is_none());
    }

    #[test]
    fn duplicate_block_is_rejected() {
        let (piece, first, _) = two_block_piece();

        assert!(piece.update_block(0, &first));
        assert_eq!(piece.downloaded_blocks(), 1);

        // Second delivery with different bytes must not touch the buffer.
        let other = vec![0xCCu8; BLOCK_SIZE as usize];
        assert!(!piece.update_block(0, &other));
        assert_eq!(piece.downloaded_blocks(), 1);

        let second = vec![0xBBu8; BLOCK_SIZE as usize];
        assert!(piece.update_block(BLOCK_SIZE, &second));
        assert!(piece.is_verified());
    }

    #[test]
    fn misaligned_offset_is_rejected() {
        let (piece, first, _) = two_block_piece();
        assert!(!piece.update_block(7, &first));
        assert_eq!(piece.downloaded_blocks(), 0);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let (piece, _, _) = two_block_piece();
        assert!(!piece.update_block(0, &[1, 2, 3]));
        assert_eq!(piece.downloaded_blocks(), 0);
    }

    #[test]
    fn hash_failure_resets_blocks() {
        let piece = Piece::new(0, 2 * BLOCK_SIZE, [0u8; 20]);

        assert!(piece.update_block(0, &vec![1u8; BLOCK_SIZE as usize]));
        assert!(piece.update_block(BLOCK_SIZE, &vec![2u8; BLOCK_SIZE as usize]));

        // Expected hash is bogus: verification fails and the piece resets.
        assert!(!piece.is_verified());
        assert_eq!(piece.downloaded_blocks(), 0);
        assert!(!piece.all_blocks_requested());
        assert!(piece.next_block().is_some());
    }

    #[test]
    fn next_block_never_reissues_without_reset() {
        let piece = Piece::new(0, 2 * BLOCK_SIZE, [0u8; 20]);

        let a = piece.next_block().unwrap();
        let b = piece.next_block().unwrap();
        assert_ne!(a.offset, b.offset);
        assert!(piece.next_block().is_none());
    }

    #[test]
    fn stale_requests_are_released() {
        let piece = Piece::new(0, 2 * BLOCK_SIZE, [0u8; 20]);

        let reserved = piece.next_block().unwrap();
        assert!(piece.next_block().is_some());
        assert!(piece.all_blocks_requested());

        // Zero-length window: everything requested is already stale.
        piece.clear_stale(Duration::from_secs(0));

        let again = piece.next_block().unwrap();
        assert_eq!(again.offset, reserved.offset);
    }

    #[test]
    fn unsaturated_piece_is_not_swept() {
        let piece = Piece::new(0, 2 * BLOCK_SIZE, [0u8; 20]);
        let reserved = piece.next_block().unwrap();

        piece.clear_stale(Duration::from_secs(0));

        // The in-flight request is untouched while a block is still missing.
        let next = piece.next_block().unwrap();
        assert_ne!(next.offset, reserved.offset);
        assert!(piece.next_block().is_none());
    }

    #[test]
    fn release_block_frees_reservation() {
        let piece = Piece::new(0, BLOCK_SIZE, [0u8; 20]);

        let reserved = piece.next_block().unwrap();
        assert!(piece.next_block().is_none());

        piece.release_block(reserved.offset);
        assert_eq!(piece.next_block().unwrap().offset, reserved.offset);
    }

    #[test]
    fn finished_piece_ignores_stale_clearing() {
        let (piece, first, second) = two_block_piece();
        piece.update_block(0, &first);
        piece.update_block(BLOCK_SIZE, &second);
        assert!(piece.is_finished());

        piece.clear_stale(Duration::from_secs(0));
        assert!(piece.next_block().is_none());
    }
}
