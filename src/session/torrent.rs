use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use super::dispatch::{InboundFrame, MessageDispatcher};
use super::error::SessionError;
use super::event::WriteEvent;
use super::registry::{LinkRegistry, PeerEntry};
use super::scheduler::DownloadScheduler;
use super::{maintenance, socket};
use crate::constants::{
    CONNECT_TIMEOUT, DISPATCH_WORKERS, IDLE_LINK_TIMEOUT, LOW_WATER_PEERS, MAINTENANCE_INTERVAL,
    OUTBOUND_QUEUE_LIMIT, STALE_BLOCK_WINDOW,
};
use crate::peer::{establish, PeerId, PeerLink};
use crate::picker::RarestFirstPicker;
use crate::piece::Piece;

/// The torrent description the engine downloads against.
///
/// Produced by an external metadata collaborator; the engine never parses
/// metainfo files itself.
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    pub info_hash: [u8; 20],
    pub piece_length: u32,
    pub total_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
}

impl TorrentInfo {
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Length of one piece; the final piece covers the remainder.
    fn piece_size(&self, index: usize) -> u32 {
        let start = index as u64 * self.piece_length as u64;
        (self.total_length - start).min(self.piece_length as u64) as u32
    }

    fn validate(&self) -> Result<(), SessionError> {
        if self.piece_length == 0 || self.total_length == 0 {
            return Err(SessionError::InvalidMetadata(
                "zero piece or total length".into(),
            ));
        }

        let expected = self.total_length.div_ceil(self.piece_length as u64) as usize;
        if self.piece_hashes.len() != expected {
            return Err(SessionError::InvalidMetadata(format!(
                "{} piece hashes for {} pieces",
                self.piece_hashes.len(),
                expected
            )));
        }

        Ok(())
    }
}

/// A hash-verified piece handed to the external file writer.
#[derive(Debug, Clone)]
pub struct VerifiedPiece {
    pub index: u32,
    /// Byte offset of the piece within the torrent's content.
    pub offset: u64,
    pub data: Bytes,
}

/// Tuning knobs for one session. Defaults match common client behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub stale_block_window: Duration,
    pub idle_link_timeout: Duration,
    pub maintenance_interval: Duration,
    pub outbound_queue_limit: usize,
    pub dispatch_workers: usize,
    pub low_water_peers: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            stale_block_window: STALE_BLOCK_WINDOW,
            idle_link_timeout: IDLE_LINK_TIMEOUT,
            maintenance_interval: MAINTENANCE_INTERVAL,
            outbound_queue_limit: OUTBOUND_QUEUE_LIMIT,
            dispatch_workers: DISPATCH_WORKERS,
            low_water_peers: LOW_WATER_PEERS,
        }
    }
}

/// The download engine for one torrent.
///
/// Owns the piece set, the peer registry, and the three long-lived tasks
/// (scheduler, dispatcher, maintenance). Peers are fed in by the caller via
/// [`add_peers`](Self::add_peers); verified pieces come back on the channel
/// returned from [`new`](Self::new). Dropping the session aborts every
/// task and closes every connection.
pub struct TorrentSession {
    info_hash: [u8; 20],
    local_id: PeerId,
    config: SessionConfig,
    pieces: Arc<Vec<Arc<Piece>>>,
    links: LinkRegistry,
    frames: mpsc::UnboundedSender<InboundFrame>,
    events: mpsc::UnboundedSender<WriteEvent>,
    scheduler: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
    maintenance: JoinHandle<()>,
}

impl TorrentSession {
    /// Builds the piece set and starts the session's tasks. Must be called
    /// from within a tokio runtime.
    ///
    /// The returned receiver yields each piece exactly once, as soon as it
    /// verifies; the caller is expected to persist them.
    pub fn new(
        info: TorrentInfo,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<VerifiedPiece>), SessionError> {
        info.validate()?;

        let pieces: Arc<Vec<Arc<Piece>>> = Arc::new(
            info.piece_hashes
                .iter()
                .enumerate()
                .map(|(i, &hash)| Arc::new(Piece::new(i as u32, info.piece_size(i), hash)))
                .collect(),
        );

        let picker = Arc::new(RarestFirstPicker::new());
        let links: LinkRegistry = Arc::new(DashMap::new());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (verified_tx, verified_rx) = mpsc::unbounded_channel();

        let scheduler = Arc::new(DownloadScheduler::new(
            pieces.clone(),
            picker,
            links.clone(),
            events_tx.clone(),
        ));
        let dispatcher = Arc::new(MessageDispatcher::new(
            pieces.clone(),
            info.piece_length as u64,
            scheduler.clone(),
            links.clone(),
            verified_tx,
            config.dispatch_workers,
        ));

        let session = Self {
            info_hash: info.info_hash,
            local_id: PeerId::generate(),
            pieces: pieces.clone(),
            links: links.clone(),
            frames: frames_tx,
            events: events_tx,
            scheduler: tokio::spawn(scheduler.run(events_rx)),
            dispatcher: tokio::spawn(dispatcher.run(frames_rx)),
            maintenance: tokio::spawn(maintenance::run(
                pieces,
                links,
                config.maintenance_interval,
                config.stale_block_window,
                config.idle_link_timeout,
            )),
            config,
        };

        info!(
            "session for {} pieces, peer id {}",
            session.pieces.len(),
            session.local_id
        );
        Ok((session, verified_rx))
    }

    /// Connects and handshakes a batch of candidate addresses, registering
    /// every success. Candidates already connected are skipped; failures
    /// are dropped silently. Returns how many links were added.
    pub async fn add_peers(&self, addrs: Vec<SocketAddr>) -> usize {
        let candidates: Vec<SocketAddr> = addrs
            .into_iter()
            .filter(|addr| !self.links.contains_key(addr))
            .collect();

        let connections = establish(
            candidates,
            self.info_hash,
            self.local_id,
            self.config.connect_timeout,
        )
        .await;

        let mut added = 0;
        for conn in connections {
            if self.links.contains_key(&conn.addr) {
                continue;
            }

            let (read_half, write_half) = conn.stream.into_split();
            let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue_limit);
            let link = Arc::new(PeerLink::new(
                conn.addr,
                PeerId(conn.handshake.peer_id),
                self.pieces.len(),
                outbound_tx,
            ));

            let reader = tokio::spawn(socket::read_loop(
                link.clone(),
                read_half,
                self.frames.clone(),
                self.links.clone(),
            ));
            let writer = tokio::spawn(socket::write_loop(
                link.clone(),
                write_half,
                outbound_rx,
                self.events.clone(),
                self.links.clone(),
            ));

            self.links
                .insert(conn.addr, PeerEntry::new(link, reader, writer));
            added += 1;
        }

        added
    }

    pub fn info_hash(&self) -> &[u8; 20] {
        &self.info_hash
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn active_peers(&self) -> usize {
        self.links.len()
    }

    /// True when the session is running low on peers and the caller should
    /// fetch a fresh candidate batch from its tracker collaborator.
    pub fn needs_peers(&self) -> bool {
        !self.is_complete() && self.links.len() < self.config.low_water_peers
    }

    pub fn verified_count(&self) -> usize {
        self.pieces.iter().filter(|p| p.is_verified()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(|p| p.is_verified())
    }
}

impl Drop for TorrentSession {
    fn drop(&mut self) {
        self.scheduler.abort();
        self.dispatcher.abort();
        self.maintenance.abort();
        self.links.clear();
    }
}

impl std::fmt::Debug for TorrentSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorrentSession")
            .field("info_hash", &self.info_hash)
            .field("pieces", &self.pieces.len())
            .field("verified", &self.verified_count())
            .field("peers", &self.links.len())
            .finish()
    }
}
