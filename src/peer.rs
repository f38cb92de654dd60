//! Peer wire protocol (BEP-3, download side).
//!
//! Handshake and message codec, peer bitfields, per-link protocol state,
//! and batch connection establishment.

mod bitfield;
mod error;
mod establish;
mod link;
mod message;
mod peer_id;

pub use bitfield::Bitfield;
pub use error::PeerError;
pub use establish::{establish, Established};
pub use link::PeerLink;
pub use message::{Handshake, Message, MessageId, HANDSHAKE_LEN, PROTOCOL};
pub use peer_id::PeerId;
