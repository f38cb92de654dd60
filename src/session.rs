//! Torrent session orchestration.
//!
//! Wires the codec, piece store, and picker into a running download: socket
//! tasks frame the wire, a dispatcher pool applies inbound messages, and an
//! event-driven scheduler keeps every unchoked link's request queue full.

mod dispatch;
mod error;
mod event;
mod maintenance;
mod registry;
mod scheduler;
mod socket;
mod torrent;

pub use dispatch::{InboundFrame, MessageDispatcher};
pub use error::SessionError;
pub use event::{EventKind, WriteEvent};
pub use registry::{LinkRegistry, PeerEntry};
pub use scheduler::DownloadScheduler;
pub use torrent::{SessionConfig, TorrentInfo, TorrentSession, VerifiedPiece};
