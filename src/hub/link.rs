//! Per-stream link handles and the byte pump between a local socket
//! and its hub

use super::codec::Frame;
use crate::utils::types::LinkId;
use bytes::Bytes;
use std::io;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    select,
    sync::mpsc,
};

/// Events the hub driver dispatches into a link
pub enum LinkEvent {
    /// Payload bytes from the remote peer
    Data(Bytes),
    /// The remote peer tore the link down
    Close,
}

/// Sender half of a link, stored in the hub's link table
#[derive(Clone)]
pub struct LinkHandle {
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkHandle {
    pub(super) fn send(&self, event: LinkEvent) {
        // The pump may already have stopped listening
        _ = self.tx.send(event);
    }
}

/// One logical stream multiplexed through a hub, held by the
/// per-connection handler
pub struct Link {
    /// Identifier of this link within its hub
    id: LinkId,
    /// Incoming events dispatched by the hub driver
    rx: mpsc::UnboundedReceiver<LinkEvent>,
    /// Outgoing frames towards the hub socket
    hub_tx: mpsc::UnboundedSender<Frame>,
}

impl Link {
    pub(super) fn new(id: LinkId, hub_tx: mpsc::UnboundedSender<Frame>) -> (Link, LinkHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Link { id, rx, hub_tx }, LinkHandle { tx })
    }

    /// Announces the link to the remote peer. Must happen before any
    /// payload frames for this link are sent.
    pub fn send_create(&self) {
        _ = self.hub_tx.send(Frame::create(self.id));
    }

    /// Shuttles bytes between the local socket and the hub until either
    /// side closes. Returns once the stream is drained; teardown
    /// signalling towards the peer is the hub's job on release.
    pub async fn pump(mut self, conn: TcpStream) -> io::Result<()> {
        let (mut reader, mut writer) = conn.into_split();
        // Reads can exceed the u16 frame length limit, so they are
        // split into frame sized chunks below
        let mut buffer = vec![0u8; 64 * 1024];

        loop {
            select! {
                // Bytes from the local socket travel up the hub
                result = reader.read(&mut buffer) => {
                    let count = result?;
                    if count == 0 {
                        // Local side is done
                        break;
                    }
                    for chunk in buffer[..count].chunks(u16::MAX as usize) {
                        let frame = Frame::data(self.id, Bytes::copy_from_slice(chunk));
                        if self.hub_tx.send(frame).is_err() {
                            // The hub socket is gone
                            return Err(io::Error::new(
                                io::ErrorKind::BrokenPipe,
                                "hub closed while link was active",
                            ));
                        }
                    }
                }
                // Bytes from the peer travel down to the local socket
                event = self.rx.recv() => {
                    match event {
                        Some(LinkEvent::Data(bytes)) => {
                            writer.write_all(&bytes).await?;
                        }
                        // Remote teardown, or the hub died and drained
                        // its link table
                        Some(LinkEvent::Close) | None => break,
                    }
                }
            }
        }

        Ok(())
    }
}
