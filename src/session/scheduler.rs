use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::event::{EventKind, WriteEvent};
use super::registry::LinkRegistry;
use crate::peer::{Message, PeerLink};
use crate::picker::RarestFirstPicker;
use crate::piece::Piece;

/// Turns link events into outbound `interested` and `request` traffic.
///
/// The scheduler is the only producer of requests. It reacts to events
/// instead of polling: a link announces pieces, unchokes us, or drains its
/// outbound queue, and the scheduler tops the queue back up to the
/// high-watermark. When no piece anywhere can accept a request it simply
/// stops generating; the next completion, stale reset, or bitfield change
/// produces a fresh event and wakes it again.
pub struct DownloadScheduler {
    pieces: Arc<Vec<Arc<Piece>>>,
    picker: Arc<RarestFirstPicker>,
    links: LinkRegistry,
    events: mpsc::UnboundedSender<WriteEvent>,
}

impl DownloadScheduler {
    pub fn new(
        pieces: Arc<Vec<Arc<Piece>>>,
        picker: Arc<RarestFirstPicker>,
        links: LinkRegistry,
        events: mpsc::UnboundedSender<WriteEvent>,
    ) -> Self {
        Self {
            pieces,
            picker,
            links,
            events,
        }
    }

    /// Consumes the event queue until the session shuts down.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<WriteEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        debug!("scheduler stopped");
    }

    /// Classifies a just-applied inbound message into its scheduling event.
    ///
    /// Called by dispatcher workers after the message's state changes have
    /// landed on the link, so the scheduler always observes the updated
    /// flags and bitfield. A `piece` message counts as free space: its
    /// request slot just opened, and the pipeline should stay full.
    pub fn listen(&self, link: &Arc<PeerLink>, message: &Message) {
        let kind = match message {
            Message::Unchoke => Some(EventKind::Unchoke),
            Message::Bitfield(_) => Some(EventKind::HaveBitfield),
            Message::Have { piece } => {
                let wanted = self
                    .pieces
                    .get(*piece as usize)
                    .is_some_and(|p| !p.is_verified());
                wanted.then_some(EventKind::HaveBitfield)
            }
            Message::Piece { .. } => Some(EventKind::FreeSpace),
            Message::Request { .. } => Some(EventKind::Request),
            Message::NotInterested => Some(EventKind::NotInteresting),
            _ => None,
        };

        if let Some(kind) = kind {
            self.push(link.clone(), kind);
        }
    }

    fn push(&self, link: Arc<PeerLink>, kind: EventKind) {
        // Send only fails once the session has dropped the receiver.
        let _ = self.events.send(WriteEvent { link, kind });
    }

    fn handle_event(&self, event: WriteEvent) {
        match event.kind {
            EventKind::HaveBitfield => self.update_interest(&event.link),
            EventKind::FreeSpace | EventKind::Unchoke => self.fill_requests(&event.link),
            // Reserved: the engine neither serves blocks nor tracks the
            // peer's interest in us.
            EventKind::Request | EventKind::NotInteresting => {}
        }
    }

    /// Declares interest the first time a peer announces a piece we still
    /// need. The synthetic free-space event covers peers that unchoked us
    /// before we became interested.
    fn update_interest(&self, link: &Arc<PeerLink>) {
        if link.am_interested() || !link.is_interesting(&self.pieces) {
            return;
        }

        if link.try_enqueue(Message::Interested.encode()) {
            link.set_am_interested(true);
            debug!("interested in {}", link.addr);
            self.push(link.clone(), EventKind::FreeSpace);
        }
    }

    /// Queues requests on the link until its outbound queue hits the
    /// high-watermark or no block is available.
    ///
    /// When the picker's current piece is saturated mid-loop the picker is
    /// queried once more for a fresh piece; a second miss ends the round.
    /// Running out of blocks entirely is the terminal near-completion
    /// state, not an error.
    fn fill_requests(&self, link: &Arc<PeerLink>) {
        if link.peer_choking() || !link.am_interested() {
            return;
        }

        let links: Vec<Arc<PeerLink>> = self.links.iter().map(|e| e.link.clone()).collect();
        let mut requeried = false;

        while link.outbound_capacity() > 0 {
            let Some(piece) = self.picker.find(&links, &self.pieces) else {
                trace!("no requestable piece for {}", link.addr);
                return;
            };

            match piece.next_block() {
                Some(block) => {
                    let frame = Message::Request {
                        index: block.piece,
                        begin: block.offset,
                        length: block.length,
                    }
                    .encode();

                    if !link.try_enqueue(frame) {
                        // Raced with another producer for the last slot;
                        // free the reservation so the block is not stuck
                        // until the stale window.
                        piece.release_block(block.offset);
                        return;
                    }
                }
                None => {
                    if requeried {
                        return;
                    }
                    requeried = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{BLOCK_SIZE, OUTBOUND_QUEUE_LIMIT};
    use crate::peer::PeerId;
    use crate::session::registry::PeerEntry;
    use bytes::Bytes;
    use dashmap::DashMap;
    use std::net::SocketAddr;

    struct Fixture {
        scheduler: DownloadScheduler,
        events: mpsc::UnboundedReceiver<WriteEvent>,
        link: Arc<PeerLink>,
        outbound: mpsc::Receiver<Bytes>,
    }

    fn fixture(piece_blocks: u32) -> Fixture {
        let pieces: Arc<Vec<Arc<Piece>>> = Arc::new(vec![Arc::new(Piece::new(
            0,
            piece_blocks * BLOCK_SIZE,
            [0u8; 20],
        ))]);
        let picker = Arc::new(RarestFirstPicker::new());
        let links: LinkRegistry = Arc::new(DashMap::new());

        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let (tx, outbound) = mpsc::channel(OUTBOUND_QUEUE_LIMIT);
        let link = Arc::new(PeerLink::new(addr, PeerId::generate(), pieces.len(), tx));
        link.announce_piece(0);
        links.insert(
            addr,
            PeerEntry::new(
                link.clone(),
                tokio::spawn(async {}),
                tokio::spawn(async {}),
            ),
        );

        let (events_tx, events) = mpsc::unbounded_channel();
        let scheduler = DownloadScheduler::new(pieces, picker, links, events_tx);

        Fixture {
            scheduler,
            events,
            link,
            outbound,
        }
    }

    #[tokio::test]
    async fn listen_classifies_messages() {
        let mut f = fixture(1);

        f.scheduler.listen(&f.link, &Message::Unchoke);
        assert_eq!(f.events.try_recv().unwrap().kind, EventKind::Unchoke);

        f.scheduler.listen(&f.link, &Message::Have { piece: 0 });
        assert_eq!(f.events.try_recv().unwrap().kind, EventKind::HaveBitfield);

        f.scheduler.listen(
            &f.link,
            &Message::Piece {
                index: 0,
                begin: 0,
                data: Bytes::new(),
            },
        );
        assert_eq!(f.events.try_recv().unwrap().kind, EventKind::FreeSpace);

        // Choke changes a flag but schedules nothing.
        f.scheduler.listen(&f.link, &Message::Choke);
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn have_for_unknown_piece_schedules_nothing() {
        let mut f = fixture(1);
        f.scheduler.listen(&f.link, &Message::Have { piece: 99 });
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn announcement_triggers_interest_once() {
        let mut f = fixture(1);

        f.scheduler.handle_event(WriteEvent {
            link: f.link.clone(),
            kind: EventKind::HaveBitfield,
        });

        assert!(f.link.am_interested());
        let frame = f.outbound.try_recv().unwrap();
        assert_eq!(frame, Message::Interested.encode());
        assert_eq!(f.events.try_recv().unwrap().kind, EventKind::FreeSpace);

        // Already interested: a second announcement is a no-op.
        f.scheduler.handle_event(WriteEvent {
            link: f.link.clone(),
            kind: EventKind::HaveBitfield,
        });
        assert!(f.outbound.try_recv().is_err());
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn fill_stops_at_watermark() {
        // More blocks than the queue can hold.
        let f = fixture(OUTBOUND_QUEUE_LIMIT as u32 + 10);
        f.link.set_am_interested(true);
        f.link.set_peer_choking(false);

        f.scheduler.handle_event(WriteEvent {
            link: f.link.clone(),
            kind: EventKind::FreeSpace,
        });

        assert_eq!(f.link.outbound_capacity(), 0);
        assert_eq!(f.scheduler.pieces[0].downloaded_blocks(), 0);

        let mut outbound = f.outbound;
        let mut queued = 0;
        while outbound.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, OUTBOUND_QUEUE_LIMIT);
    }

    #[tokio::test]
    async fn fill_stops_when_blocks_run_out() {
        let f = fixture(2);
        f.link.set_am_interested(true);
        f.link.set_peer_choking(false);

        f.scheduler.handle_event(WriteEvent {
            link: f.link.clone(),
            kind: EventKind::FreeSpace,
        });

        let mut outbound = f.outbound;
        let mut queued = 0;
        while outbound.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 2);
        assert!(f.scheduler.pieces[0].all_blocks_requested());
    }

    #[tokio::test]
    async fn choked_link_gets_no_requests() {
        let f = fixture(2);
        f.link.set_am_interested(true);

        f.scheduler.handle_event(WriteEvent {
            link: f.link.clone(),
            kind: EventKind::FreeSpace,
        });

        let mut outbound = f.outbound;
        assert!(outbound.try_recv().is_err());
    }
}
