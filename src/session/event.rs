use std::sync::Arc;

use crate::peer::PeerLink;

/// What happened on a link that may let the scheduler make progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The peer announced pieces (`have` or `bitfield`).
    HaveBitfield,
    /// The link's outbound queue drained below the high-watermark.
    FreeSpace,
    /// The peer unchoked us.
    Unchoke,
    /// The peer requested a block. Reserved; the engine does not serve.
    Request,
    /// The peer lost interest in us. Reserved.
    NotInteresting,
}

/// A scheduling signal tied to one peer link.
#[derive(Debug, Clone)]
pub struct WriteEvent {
    pub link: Arc<PeerLink>,
    pub kind: EventKind,
}
