use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, trace, warn};

use super::registry::LinkRegistry;
use super::scheduler::DownloadScheduler;
use super::torrent::VerifiedPiece;
use crate::peer::{Bitfield, Message, PeerLink};
use crate::piece::Piece;

/// One complete length-prefixed frame as pulled off a socket, prefix
/// included, paired with the link it arrived on.
pub struct InboundFrame {
    pub link: Arc<PeerLink>,
    pub bytes: Bytes,
}

/// Decodes inbound frames and applies their state changes.
///
/// Frames from all read loops funnel into one queue; a bounded pool of
/// workers decodes and applies them so SHA-1 verification of a completed
/// piece never stalls socket reads. Workers may interleave frames from the
/// same link, which is safe because every applied effect is idempotent
/// (`update_block`) or monotonic (flags, bitfield bits).
pub struct MessageDispatcher {
    pieces: Arc<Vec<Arc<Piece>>>,
    piece_length: u64,
    scheduler: Arc<DownloadScheduler>,
    links: LinkRegistry,
    verified: mpsc::UnboundedSender<VerifiedPiece>,
    workers: Arc<Semaphore>,
}

impl MessageDispatcher {
    pub fn new(
        pieces: Arc<Vec<Arc<Piece>>>,
        piece_length: u64,
        scheduler: Arc<DownloadScheduler>,
        links: LinkRegistry,
        verified: mpsc::UnboundedSender<VerifiedPiece>,
        workers: usize,
    ) -> Self {
        Self {
            pieces,
            piece_length,
            scheduler,
            links,
            verified,
            workers: Arc::new(Semaphore::new(workers)),
        }
    }

    /// Consumes the frame queue until the session shuts down.
    pub async fn run(self: Arc<Self>, mut frames: mpsc::UnboundedReceiver<InboundFrame>) {
        while let Some(frame) = frames.recv().await {
            let Ok(permit) = self.workers.clone().acquire_owned().await else {
                return;
            };

            let dispatcher = self.clone();
            tokio::spawn(async move {
                dispatcher.process(frame);
                drop(permit);
            });
        }
        debug!("dispatcher stopped");
    }

    fn process(&self, frame: InboundFrame) {
        let link = frame.link;

        let message = match Message::decode(frame.bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("dropping {}: {}", link.addr, e);
                self.links.remove(&link.addr);
                return;
            }
        };

        self.apply(&link, &message);
        self.scheduler.listen(&link, &message);
    }

    /// Applies one decoded message to the link and piece state.
    fn apply(&self, link: &Arc<PeerLink>, message: &Message) {
        match message {
            Message::KeepAlive => {}
            Message::Choke => link.set_peer_choking(true),
            Message::Unchoke => link.set_peer_choking(false),
            Message::Interested => link.set_peer_interested(true),
            Message::NotInterested => link.set_peer_interested(false),
            Message::Have { piece } => link.announce_piece(*piece as usize),
            Message::Bitfield(bits) => {
                link.replace_bitfield(Bitfield::from_bytes(bits.clone(), self.pieces.len()));
            }
            Message::Piece { index, begin, data } => {
                self.apply_block(link, *index, *begin, data);
            }
            Message::Request { index, begin, .. } => {
                // Download-only engine: parsed for protocol conformance,
                // never served.
                trace!("{} requested {}:{}, not serving", link.addr, index, begin);
            }
            Message::Cancel { .. } => {}
        }
    }

    fn apply_block(&self, link: &Arc<PeerLink>, index: u32, begin: u32, data: &Bytes) {
        link.touch_piece_received();

        let Some(piece) = self.pieces.get(index as usize) else {
            debug!("{} sent block for unknown piece {}", link.addr, index);
            return;
        };

        if !piece.update_block(begin, data) {
            trace!("{} sent unusable block {}:{}", link.addr, index, begin);
            return;
        }

        if piece.is_verified() {
            // take_data returns Some exactly once per piece, so duplicate
            // final blocks cannot double-deliver.
            if let Some(data) = piece.take_data() {
                info!("piece {} complete ({} bytes)", index, data.len());
                let _ = self.verified.send(VerifiedPiece {
                    index,
                    offset: index as u64 * self.piece_length,
                    data,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{BLOCK_SIZE, DISPATCH_WORKERS, OUTBOUND_QUEUE_LIMIT};
    use crate::peer::PeerId;
    use crate::picker::RarestFirstPicker;
    use crate::session::registry::PeerEntry;
    use dashmap::DashMap;
    use sha1::{Digest, Sha1};
    use std::net::SocketAddr;

    struct Fixture {
        dispatcher: MessageDispatcher,
        link: Arc<PeerLink>,
        verified: mpsc::UnboundedReceiver<VerifiedPiece>,
        _outbound: mpsc::Receiver<Bytes>,
    }

    fn fixture(pieces: Vec<Arc<Piece>>) -> Fixture {
        let pieces = Arc::new(pieces);
        let links: LinkRegistry = Arc::new(DashMap::new());
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(DownloadScheduler::new(
            pieces.clone(),
            Arc::new(RarestFirstPicker::new()),
            links.clone(),
            events_tx,
        ));

        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let (tx, outbound) = mpsc::channel(OUTBOUND_QUEUE_LIMIT);
        let link = Arc::new(PeerLink::new(addr, PeerId::generate(), pieces.len(), tx));
        links.insert(
            addr,
            PeerEntry::new(
                link.clone(),
                tokio::spawn(async {}),
                tokio::spawn(async {}),
            ),
        );

        let (verified_tx, verified) = mpsc::unbounded_channel();
        let dispatcher = MessageDispatcher::new(
            pieces,
            BLOCK_SIZE as u64,
            scheduler,
            links,
            verified_tx,
            DISPATCH_WORKERS,
        );

        Fixture {
            dispatcher,
            link,
            verified,
            _outbound: outbound,
        }
    }

    #[tokio::test]
    async fn flags_follow_choke_and_interest() {
        let f = fixture(vec![Arc::new(Piece::new(0, BLOCK_SIZE, [0u8; 20]))]);

        f.dispatcher.apply(&f.link, &Message::Unchoke);
        assert!(!f.link.peer_choking());
        f.dispatcher.apply(&f.link, &Message::Choke);
        assert!(f.link.peer_choking());
        f.dispatcher.apply(&f.link, &Message::Interested);
        assert!(f.link.peer_interested());
        f.dispatcher.apply(&f.link, &Message::NotInterested);
        assert!(!f.link.peer_interested());
    }

    #[tokio::test]
    async fn have_and_bitfield_update_announcements() {
        let pieces = (0..9)
            .map(|i| Arc::new(Piece::new(i, BLOCK_SIZE, [0u8; 20])))
            .collect();
        let f = fixture(pieces);

        f.dispatcher.apply(&f.link, &Message::Have { piece: 8 });
        assert!(f.link.has_piece(8));

        f.dispatcher.apply(
            &f.link,
            &Message::Bitfield(Bytes::from_static(&[0b1010_0000, 0])),
        );
        assert!(f.link.has_piece(0));
        assert!(!f.link.has_piece(1));
        assert!(f.link.has_piece(2));
        // The replacement drops the earlier have.
        assert!(!f.link.has_piece(8));
    }

    #[tokio::test]
    async fn verified_piece_is_handed_off_once() {
        let data = vec![0x5Au8; BLOCK_SIZE as usize];
        let hash: [u8; 20] = Sha1::digest(&data).into();
        let mut f = fixture(vec![
            Arc::new(Piece::new(0, BLOCK_SIZE, [0u8; 20])),
            Arc::new(Piece::new(1, BLOCK_SIZE, hash)),
        ]);

        f.dispatcher.apply(
            &f.link,
            &Message::Piece {
                index: 1,
                begin: 0,
                data: Bytes::from(data.clone()),
            },
        );

        let verified = f.verified.try_recv().unwrap();
        assert_eq!(verified.index, 1);
        assert_eq!(verified.offset, BLOCK_SIZE as u64);
        assert_eq!(verified.data.len(), data.len());

        // Duplicate delivery of the final block is inert.
        f.dispatcher.apply(
            &f.link,
            &Message::Piece {
                index: 1,
                begin: 0,
                data: Bytes::from(data),
            },
        );
        assert!(f.verified.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_frame_drops_the_link() {
        let f = fixture(vec![Arc::new(Piece::new(0, BLOCK_SIZE, [0u8; 20]))]);
        assert_eq!(f.dispatcher.links.len(), 1);

        // Declared length 2 with an unknown id byte.
        let frame = Bytes::from_static(&[0, 0, 0, 2, 250, 0]);
        f.dispatcher.process(InboundFrame {
            link: f.link.clone(),
            bytes: frame,
        });

        assert!(f.dispatcher.links.is_empty());
    }

    #[tokio::test]
    async fn block_for_unknown_piece_is_ignored() {
        let f = fixture(vec![Arc::new(Piece::new(0, BLOCK_SIZE, [0u8; 20]))]);

        f.dispatcher.apply(
            &f.link,
            &Message::Piece {
                index: 7,
                begin: 0,
                data: Bytes::from_static(&[1, 2, 3]),
            },
        );

        assert_eq!(f.dispatcher.pieces[0].downloaded_blocks(), 0);
    }
}
