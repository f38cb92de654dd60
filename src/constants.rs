//! Protocol constants and tuning parameters.
//!
//! Timeouts and watermarks used by the download engine. The values follow
//! common client defaults; embedders that need different timings can override
//! them through [`SessionConfig`](crate::session::SessionConfig).

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &[u8] = b"-LE0001-";

// ============================================================================
// Block and piece sizes
// ============================================================================

/// Standard block size (16KB)
pub const BLOCK_SIZE: u32 = 16384;

/// Largest message the engine will accept. Piece messages top out at one
/// block plus 9 header bytes, but a bitfield is `1 + ceil(pieceCount / 8)`
/// bytes, so the cap must leave room for the opening bitfield of a torrent
/// with hundreds of thousands of pieces. Anything bigger is a protocol
/// violation.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Initial receive buffer per peer: room for two block-size framed messages.
/// The buffer grows on demand for the rare larger frame.
pub const RECEIVE_BUFFER_SIZE: usize = 2 * (4 + 9 + BLOCK_SIZE as usize);

// ============================================================================
// Request pipelining
// ============================================================================

/// Maximum queued outbound messages per peer. The scheduler stops generating
/// requests for a link once its queue reaches this depth.
pub const OUTBOUND_QUEUE_LIMIT: usize = 30;

/// Workers decoding and applying inbound messages concurrently.
pub const DISPATCH_WORKERS: usize = 8;

// ============================================================================
// Timeouts
// ============================================================================

/// Budget for TCP connect plus handshake exchange per candidate peer.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A requested block not delivered within this window is released for
/// re-request. This is the engine's only retry mechanism.
pub const STALE_BLOCK_WINDOW: Duration = Duration::from_secs(3);

/// Links that deliver no piece data for this long are closed by the reaper.
pub const IDLE_LINK_TIMEOUT: Duration = Duration::from_secs(60);

/// Cadence of the maintenance task (stale clearing + idle reaping).
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);

// ============================================================================
// Peer thresholds
// ============================================================================

/// Below this many active links the session signals that it wants a fresh
/// batch of candidates from the tracker collaborator.
pub const LOW_WATER_PEERS: usize = 3;
