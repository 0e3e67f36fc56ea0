//! One persistent, authenticated, encrypted tunnel to the remote peer,
//! multiplexing many links over a single TCP connection
//!
//! A [Hub] is created from a socket that already completed the
//! handshake. It owns the link id allocator and the link table; the
//! matching [HubDriver] future owns the socket and must be awaited to
//! move frames, completing only when the tunnel dies.

use self::{
    codec::{Frame, FrameCodec, FrameKind},
    link::{Link, LinkEvent, LinkHandle},
    links::{LinkIdAllocator, LinkTable},
};
use crate::{auth::CipherKey, utils::types::LinkId};
use futures_util::{SinkExt, StreamExt};
use std::{
    future::Future,
    io,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_util::codec::Framed;

pub mod codec;
pub mod link;
pub mod links;
pub mod pool;

pub struct Hub {
    /// Outgoing frames towards the socket driver
    tx: mpsc::UnboundedSender<Frame>,
    /// Link id allocation for this hub
    ids: LinkIdAllocator,
    /// Live links by id
    table: LinkTable<LinkHandle>,
}

/// Point-in-time snapshot of a hub's link occupancy
pub struct HubStatus {
    pub active_links: usize,
    pub free_ids: usize,
}

impl Hub {
    /// Wraps an authenticated socket into a hub and the driver future
    /// that runs it
    pub fn new(socket: TcpStream, key: &CipherKey) -> (Arc<Hub>, HubDriver) {
        let io = Framed::new(socket, FrameCodec::client(key));
        let (tx, rx) = mpsc::unbounded_channel();

        let hub = Arc::new(Hub {
            tx,
            ids: LinkIdAllocator::default(),
            table: LinkTable::default(),
        });

        let driver = HubDriver {
            hub: hub.clone(),
            io,
            rx,
            buffered: None,
        };

        (hub, driver)
    }

    /// Reserves a link id, or [None] when the hub is saturated
    pub fn acquire_id(&self) -> Option<LinkId> {
        self.ids.acquire()
    }

    /// Returns a link id to the allocator. Must only happen after the
    /// link itself was released, otherwise a fresh link could collide
    /// with the stale table slot.
    pub fn release_id(&self, id: LinkId) {
        self.ids.release(id);
    }

    /// Creates the link for a previously acquired id
    pub fn new_link(self: &Arc<Self>, id: LinkId) -> Link {
        let (link, handle) = Link::new(id, self.tx.clone());
        let inserted = self.table.set(id, handle);
        debug_assert!(inserted, "link id {id} was handed out twice");
        link
    }

    /// Clears the link's table slot and announces the teardown to the
    /// peer. Does nothing when the link was already released, which
    /// happens when the hub died first and drained its table.
    pub fn release_link(&self, id: LinkId) {
        if self.table.reset(id) {
            _ = self.tx.send(Frame::close(id));
        }
    }

    pub fn status(&self) -> HubStatus {
        HubStatus {
            active_links: self.table.active(),
            free_ids: self.ids.available(),
        }
    }

    /// Routes one inbound frame to the link it belongs to
    fn dispatch(&self, frame: Frame) {
        // Frames for links the client has already torn down are
        // expected and ignored
        let handle = match self.table.get(frame.link) {
            Some(value) => value,
            None => return,
        };

        match frame.kind {
            FrameKind::Data => handle.send(LinkEvent::Data(frame.message)),
            FrameKind::Close => handle.send(LinkEvent::Close),
            // Links are only ever opened from this end
            FrameKind::Create => {}
        }
    }
}

/// Future driving a hub socket, completing when the tunnel dies
pub struct HubDriver {
    hub: Arc<Hub>,
    /// The framed tunnel socket
    io: Framed<TcpStream, FrameCodec>,
    /// Outgoing frames from the hub's links
    rx: mpsc::UnboundedReceiver<Frame>,
    /// Currently accepted outgoing frame, ready to be written
    buffered: Option<Frame>,
}

impl Drop for HubDriver {
    fn drop(&mut self) {
        // The tunnel is gone, tell every live link to stop pumping
        for handle in self.hub.table.take_all() {
            handle.send(LinkEvent::Close);
        }
    }
}

impl Future for HubDriver {
    type Output = io::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        // Read frames from the socket and dispatch them to links
        loop {
            match this.io.poll_next_unpin(cx) {
                Poll::Ready(Some(result)) => this.hub.dispatch(result?),

                // Remote peer closed the tunnel
                Poll::Ready(None) => return Poll::Ready(Ok(())),

                // Nothing yet, move onto the write polling
                Poll::Pending => break,
            }
        }

        // Write outgoing frames to the socket
        loop {
            if this.buffered.is_some() {
                // Wait until the socket is ready
                ready!(this.io.poll_ready_unpin(cx))?;

                let frame = this
                    .buffered
                    .take()
                    .expect("unexpected write state without a frame");

                this.io.start_send_unpin(frame)?;
            }

            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(frame)) => this.buffered = Some(frame),

                // The hub itself holds a sender, so this only happens
                // once the hub and all its links are gone
                Poll::Ready(None) => return Poll::Ready(Ok(())),

                Poll::Pending => break,
            }
        }

        // Push written frames out to the wire
        _ = this.io.poll_flush_unpin(cx)?;

        Poll::Pending
    }
}

#[cfg(test)]
mod test {
    use super::{
        codec::{Frame, FrameCodec, FrameKind},
        Hub,
    };
    use crate::auth::{AuthKey, CipherKey, NONCE_SIZE};
    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use tokio::{
        io::AsyncWriteExt,
        net::{TcpListener, TcpStream},
    };
    use tokio_util::codec::Framed;

    fn test_key() -> CipherKey {
        let auth = AuthKey::new("hub secret");
        let challenge = auth.issue([2; NONCE_SIZE]);
        let (_, key) = auth.answer(&challenge).unwrap();
        key
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    /// Tests that create, payload and teardown frames reach the peer in
    /// order and payloads from the peer reach the right link
    #[tokio::test]
    async fn test_frame_routing() {
        let (client_socket, server_socket) = socket_pair().await;

        let (hub, driver) = Hub::new(client_socket, &test_key());
        let driver = tokio::spawn(driver);
        let mut peer = Framed::new(server_socket, FrameCodec::server(&test_key()));

        // Open a link and push a payload through it
        let id = hub.acquire_id().unwrap();
        let link = hub.new_link(id);
        link.send_create();

        let frame = peer.next().await.unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Create);
        assert_eq!(frame.link, id);

        // Payload from the peer arrives through the link's pump; drive
        // it with a local socket pair
        let (mut local_client, local_server) = socket_pair().await;
        let pump = tokio::spawn(link.pump(local_server));

        local_client.write_all(b"upstream bytes").await.unwrap();

        let frame = peer.next().await.unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Data);
        assert_eq!(frame.link, id);
        assert_eq!(frame.message.as_ref(), b"upstream bytes");

        // Peer teardown stops the pump
        peer.send(Frame::close(id)).await.unwrap();
        pump.await.unwrap().unwrap();

        // Releasing the link announces the close and frees the slot
        hub.release_link(id);
        hub.release_id(id);
        let frame = peer.next().await.unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Close);

        let status = hub.status();
        assert_eq!(status.active_links, 0);

        drop(peer);
        driver.await.unwrap().unwrap();
    }

    /// Tests that frames for unknown links are ignored and do not kill
    /// the tunnel
    #[tokio::test]
    async fn test_unknown_link_ignored() {
        let (client_socket, server_socket) = socket_pair().await;

        let (hub, driver) = Hub::new(client_socket, &test_key());
        let driver = tokio::spawn(driver);
        let mut peer = Framed::new(server_socket, FrameCodec::server(&test_key()));

        peer.send(Frame::data(42, Bytes::from_static(b"stray")))
            .await
            .unwrap();

        // The tunnel must still be alive afterwards
        let id = hub.acquire_id().unwrap();
        let link = hub.new_link(id);
        link.send_create();

        let frame = peer.next().await.unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Create);

        drop(peer);
        driver.await.unwrap().unwrap();
    }
}
