use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::peer::PeerLink;

/// One registered peer: its protocol state plus the two socket tasks that
/// own the connection halves.
///
/// Removing the entry from the registry aborts both tasks, which drops the
/// stream halves and closes the socket. That makes `registry.remove(addr)`
/// the single way a link dies, whoever triggers it.
pub struct PeerEntry {
    pub link: Arc<PeerLink>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl PeerEntry {
    pub fn new(link: Arc<PeerLink>, reader: JoinHandle<()>, writer: JoinHandle<()>) -> Self {
        Self {
            link,
            reader,
            writer,
        }
    }
}

impl Drop for PeerEntry {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl std::fmt::Debug for PeerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerEntry").field("link", &self.link).finish()
    }
}

/// Connected peers for one torrent, keyed by remote address.
pub type LinkRegistry = Arc<DashMap<SocketAddr, PeerEntry>>;
