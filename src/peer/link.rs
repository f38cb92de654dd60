use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use super::bitfield::Bitfield;
use super::peer_id::PeerId;
use crate::piece::Piece;

/// Protocol state for one established peer connection.
///
/// A link is created after a successful handshake and destroyed on I/O
/// error, EOF, or idle timeout. Its flags are written by dispatcher workers
/// and read concurrently by the scheduler task, so they are atomics; the
/// bitfield and activity timestamp sit behind short locks.
///
/// Two links represent the same peer for a torrent iff their remote
/// addresses match; the session registry keys on `addr` to avoid duplicate
/// handshakes.
pub struct PeerLink {
    /// The peer's socket address.
    pub addr: SocketAddr,
    /// The peer's ID from its handshake.
    pub remote_id: PeerId,
    am_choking: AtomicBool,
    am_interested: AtomicBool,
    peer_choking: AtomicBool,
    peer_interested: AtomicBool,
    bitfield: RwLock<Bitfield>,
    last_piece_received: Mutex<Instant>,
    outbound: mpsc::Sender<Bytes>,
}

impl PeerLink {
    /// Creates a link in the protocol's initial state: both sides choking,
    /// neither interested, bitfield empty.
    pub fn new(
        addr: SocketAddr,
        remote_id: PeerId,
        piece_count: usize,
        outbound: mpsc::Sender<Bytes>,
    ) -> Self {
        Self {
            addr,
            remote_id,
            am_choking: AtomicBool::new(true),
            am_interested: AtomicBool::new(false),
            peer_choking: AtomicBool::new(true),
            peer_interested: AtomicBool::new(false),
            bitfield: RwLock::new(Bitfield::new(piece_count)),
            last_piece_received: Mutex::new(Instant::now()),
            outbound,
        }
    }

    pub fn am_choking(&self) -> bool {
        self.am_choking.load(Ordering::Acquire)
    }

    pub fn set_am_choking(&self, value: bool) {
        self.am_choking.store(value, Ordering::Release);
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested.load(Ordering::Acquire)
    }

    pub fn set_am_interested(&self, value: bool) {
        self.am_interested.store(value, Ordering::Release);
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking.load(Ordering::Acquire)
    }

    pub fn set_peer_choking(&self, value: bool) {
        self.peer_choking.store(value, Ordering::Release);
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested.load(Ordering::Acquire)
    }

    pub fn set_peer_interested(&self, value: bool) {
        self.peer_interested.store(value, Ordering::Release);
    }

    /// Returns true if the peer has announced the given piece.
    pub fn has_piece(&self, index: usize) -> bool {
        self.bitfield.read().has_piece(index)
    }

    /// Sets one bit after a `have` message.
    pub fn announce_piece(&self, index: usize) {
        self.bitfield.write().set_piece(index);
    }

    /// Replaces the whole bitfield after a `bitfield` message.
    pub fn replace_bitfield(&self, bitfield: Bitfield) {
        *self.bitfield.write() = bitfield;
    }

    /// Snapshot of the peer's current bitfield.
    pub fn bitfield(&self) -> Bitfield {
        self.bitfield.read().clone()
    }

    /// Returns true if the peer has any piece we have not verified yet.
    /// Used to decide the 0 -> 1 transition of `am_interested`.
    pub fn is_interesting(&self, pieces: &[Arc<Piece>]) -> bool {
        let bitfield = self.bitfield.read();
        pieces
            .iter()
            .enumerate()
            .any(|(i, piece)| bitfield.has_piece(i) && !piece.is_verified())
    }

    /// Records receipt of piece data, deferring the idle reaper.
    pub fn touch_piece_received(&self) {
        *self.last_piece_received.lock() = Instant::now();
    }

    pub fn last_piece_received(&self) -> Instant {
        *self.last_piece_received.lock()
    }

    #[cfg(test)]
    pub(crate) fn set_last_piece_received(&self, at: Instant) {
        *self.last_piece_received.lock() = at;
    }

    /// Remaining space in the outbound queue before the high-watermark.
    pub fn outbound_capacity(&self) -> usize {
        self.outbound.capacity()
    }

    /// Queues one encoded frame for the write loop.
    ///
    /// Returns false when the queue is at the high-watermark or the write
    /// loop is gone; the caller decides whether to back off or release the
    /// resources tied to the frame.
    pub fn try_enqueue(&self, frame: Bytes) -> bool {
        self.outbound.try_send(frame).is_ok()
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("addr", &self.addr)
            .field("remote_id", &self.remote_id)
            .field("am_interested", &self.am_interested())
            .field("peer_choking", &self.peer_choking())
            .field("pieces", &self.bitfield.read().count())
            .finish()
    }
}
