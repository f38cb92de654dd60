use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::debug;

use super::error::PeerError;
use super::message::{Handshake, HANDSHAKE_LEN};
use super::peer_id::PeerId;

/// Outcome of a successful connect + handshake with one candidate.
pub struct Established {
    pub addr: SocketAddr,
    pub stream: TcpStream,
    pub handshake: Handshake,
}

impl std::fmt::Debug for Established {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established")
            .field("addr", &self.addr)
            .finish()
    }
}

/// Connects and handshakes a batch of candidate addresses concurrently.
///
/// Each candidate gets one attempt bounded by `deadline`: connect, send our
/// 68-byte handshake, read exactly 68 bytes back, require a matching info
/// hash. Failed candidates are dropped silently; there is no retry at this
/// layer. Returns whatever succeeded, in completion order.
pub async fn establish(
    addrs: Vec<SocketAddr>,
    info_hash: [u8; 20],
    local_id: PeerId,
    deadline: Duration,
) -> Vec<Established> {
    let mut attempts = JoinSet::new();

    for addr in addrs {
        attempts.spawn(async move {
            let result = match timeout(deadline, handshake_one(addr, info_hash, local_id)).await {
                Ok(result) => result,
                Err(_) => Err(PeerError::Timeout),
            };

            match result {
                Ok(established) => Some(established),
                Err(e) => {
                    debug!("handshake with {} failed: {}", addr, e);
                    None
                }
            }
        });
    }

    let mut connections = Vec::new();
    while let Some(result) = attempts.join_next().await {
        if let Ok(Some(established)) = result {
            connections.push(established);
        }
    }

    debug!("established {} peer links", connections.len());
    connections
}

async fn handshake_one(
    addr: SocketAddr,
    info_hash: [u8; 20],
    local_id: PeerId,
) -> Result<Established, PeerError> {
    let mut stream = TcpStream::connect(addr).await?;

    let ours = Handshake::new(info_hash, *local_id.as_bytes());
    stream.write_all(&ours.encode()).await?;

    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await?;

    let theirs = Handshake::decode(&buf)?;
    if theirs.info_hash != info_hash {
        return Err(PeerError::InfoHashMismatch);
    }

    Ok(Established {
        addr,
        stream,
        handshake: theirs,
    })
}
