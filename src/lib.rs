//! A download-only BitTorrent peer wire engine.
//!
//! The crate speaks the base peer protocol (BEP-3) on the downloading side:
//! it handshakes candidate peers, trades `interested`/`unchoke` state,
//! requests 16 KiB blocks rarest-piece-first, reassembles and SHA-1 verifies
//! pieces, and hands each verified piece to the caller. Peer discovery,
//! metainfo parsing, and persistence belong to the embedding application.
//!
//! # Example
//!
//! ```no_run
//! use leech::{SessionConfig, TorrentInfo, TorrentSession};
//!
//! # async fn run(info: TorrentInfo, peers: Vec<std::net::SocketAddr>) {
//! let (session, mut verified) = TorrentSession::new(info, SessionConfig::default()).unwrap();
//! session.add_peers(peers).await;
//!
//! while let Some(piece) = verified.recv().await {
//!     // write piece.data at piece.offset
//!     if session.is_complete() {
//!         break;
//!     }
//! }
//! # }
//! ```

pub mod constants;
pub mod peer;
pub mod picker;
pub mod piece;
pub mod session;

pub use peer::{Bitfield, Handshake, Message, PeerError, PeerId, PeerLink};
pub use picker::RarestFirstPicker;
pub use piece::{BlockRequest, Piece};
pub use session::{SessionConfig, SessionError, TorrentInfo, TorrentSession, VerifiedPiece};
