use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use super::registry::LinkRegistry;
use crate::piece::Piece;

/// Periodic housekeeping: releases stale block requests and reaps links
/// that have stopped delivering piece data.
///
/// Stale clearing is the engine's only retry path, so this task must keep
/// running for the lifetime of the session even when no peer is connected.
pub(super) async fn run(
    pieces: Arc<Vec<Arc<Piece>>>,
    links: LinkRegistry,
    interval: Duration,
    stale_window: Duration,
    idle_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;

        for piece in pieces.iter() {
            if !piece.is_finished() {
                piece.clear_stale(stale_window);
            }
        }

        reap_idle(&links, idle_timeout);
    }
}

/// Removes every link whose last piece data is older than `timeout`,
/// returning how many were dropped. Removal aborts the link's socket tasks.
pub(super) fn reap_idle(links: &LinkRegistry, timeout: Duration) -> usize {
    let now = Instant::now();
    let idle: Vec<_> = links
        .iter()
        .filter(|entry| now.duration_since(entry.link.last_piece_received()) > timeout)
        .map(|entry| *entry.key())
        .collect();

    for addr in &idle {
        info!("reaping idle peer {}", addr);
        links.remove(addr);
    }

    idle.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{IDLE_LINK_TIMEOUT, OUTBOUND_QUEUE_LIMIT};
    use crate::peer::{PeerId, PeerLink};
    use crate::session::registry::PeerEntry;
    use dashmap::DashMap;
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    fn register(links: &LinkRegistry, port: u16) -> Arc<PeerLink> {
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_LIMIT);
        let link = Arc::new(PeerLink::new(addr, PeerId::generate(), 1, tx));
        links.insert(
            addr,
            PeerEntry::new(
                link.clone(),
                tokio::spawn(async {}),
                tokio::spawn(async move { drop(rx) }),
            ),
        );
        link
    }

    #[tokio::test]
    async fn idle_links_are_reaped() {
        let links: LinkRegistry = Arc::new(DashMap::new());
        let idle = register(&links, 6881);
        let active = register(&links, 6882);

        // 65 seconds without piece data against a 60 second timeout.
        idle.set_last_piece_received(Instant::now() - Duration::from_secs(65));
        active.touch_piece_received();

        assert_eq!(reap_idle(&links, IDLE_LINK_TIMEOUT), 1);
        assert_eq!(links.len(), 1);
        assert!(links.contains_key(&active.addr));
    }

    #[tokio::test]
    async fn fresh_links_survive_the_reaper() {
        let links: LinkRegistry = Arc::new(DashMap::new());
        register(&links, 6881);

        assert_eq!(reap_idle(&links, IDLE_LINK_TIMEOUT), 0);
        assert_eq!(links.len(), 1);
    }
}
