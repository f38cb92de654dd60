use thiserror::Error;

/// Errors surfaced by the session layer.
///
/// Peer-level failures never reach this type; they resolve to dropping the
/// offending link. Only problems with the torrent description itself are
/// reported to the caller.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The torrent description is internally inconsistent.
    #[error("invalid torrent metadata: {0}")]
    InvalidMetadata(String),
}
