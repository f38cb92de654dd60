use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::dispatch::InboundFrame;
use super::event::{EventKind, WriteEvent};
use super::registry::LinkRegistry;
use crate::constants::{MAX_MESSAGE_SIZE, RECEIVE_BUFFER_SIZE};
use crate::peer::{PeerError, PeerLink};

/// Splits one complete length-prefixed frame off the front of the buffer,
/// prefix included. `Ok(None)` means more bytes are needed; a declared
/// length beyond the protocol maximum is a violation.
pub(super) fn extract_frame(buffer: &mut BytesMut) -> Result<Option<Bytes>, PeerError> {
    if buffer.len() < 4 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(PeerError::InvalidMessage(format!(
            "declared length {} exceeds maximum",
            length
        )));
    }

    if buffer.len() < 4 + length {
        return Ok(None);
    }

    Ok(Some(buffer.split_to(4 + length).freeze()))
}

/// Reads frames off one connection and forwards them to the dispatcher.
///
/// Owns the read half; the task ends, and removes its link from the
/// registry, on EOF, I/O error, or an oversized frame. Partial frames stay
/// buffered across reads.
pub(super) async fn read_loop(
    link: Arc<PeerLink>,
    mut reader: OwnedReadHalf,
    frames: mpsc::UnboundedSender<InboundFrame>,
    links: LinkRegistry,
) {
    if let Err(e) = pump_frames(&link, &mut reader, &frames).await {
        match e {
            PeerError::ConnectionClosed => debug!("{} closed the connection", link.addr),
            e => warn!("read from {} failed: {}", link.addr, e),
        }
    }
    links.remove(&link.addr);
}

async fn pump_frames(
    link: &Arc<PeerLink>,
    reader: &mut OwnedReadHalf,
    frames: &mpsc::UnboundedSender<InboundFrame>,
) -> Result<(), PeerError> {
    let mut buffer = BytesMut::with_capacity(RECEIVE_BUFFER_SIZE);

    loop {
        if reader.read_buf(&mut buffer).await? == 0 {
            return Err(PeerError::ConnectionClosed);
        }

        while let Some(bytes) = extract_frame(&mut buffer)? {
            let frame = InboundFrame {
                link: link.clone(),
                bytes,
            };
            if frames.send(frame).is_err() {
                // Dispatcher gone: the session is shutting down.
                return Ok(());
            }
        }
    }
}

/// Drains one connection's outbound queue onto the socket.
///
/// Each completed write signals free space so the scheduler can top the
/// queue back up. Owns the write half; a failed write removes the link.
pub(super) async fn write_loop(
    link: Arc<PeerLink>,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Bytes>,
    events: mpsc::UnboundedSender<WriteEvent>,
    links: LinkRegistry,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            warn!("write to {} failed: {}", link.addr, e);
            break;
        }

        let event = WriteEvent {
            link: link.clone(),
            kind: EventKind::FreeSpace,
        };
        if events.send(event).is_err() {
            break;
        }
    }
    links.remove(&link.addr);
}
