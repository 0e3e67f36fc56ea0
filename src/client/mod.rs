//! Client runtime: hub supervision, the local acceptor and the
//! per-connection lifecycle
//!
//! A fixed set of supervisor workers each owns one hub slot, dialing
//! and authenticating its tunnel and re-establishing it whenever it
//! dies. The acceptor admits every local connection to the least
//! loaded live hub and hands it to a per-connection handler task.

use crate::{
    auth::{AuthKey, HandshakeError, CHALLENGE_SIZE},
    config::Config,
    hub::{
        pool::{HubPool, PoolEntry},
        Hub, HubDriver,
    },
    utils::types::LinkId,
};
use log::{debug, error, info, warn};
use socket2::{SockRef, TcpKeepalive};
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::sleep,
};

/// Delay between reconnect attempts for a hub slot
const RECONNECT_DELAY: Duration = Duration::from_secs(3);
/// Keepalive period applied to accepted local sockets
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(60);

/// Entry for one live hub inside the pool
type HubEntry = Arc<PoolEntry<Arc<Hub>>>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Failed to bind the local listener
    #[error("failed to bind local listener: {0}")]
    Listen(io::Error),
    /// Failed to dial the remote peer
    #[error("failed to dial remote peer: {0}")]
    Dial(io::Error),
    /// The remote peer failed the handshake
    #[error("handshake with remote peer failed: {0}")]
    Handshake(#[from] HandshakeError),
}

pub struct Client {
    /// Live hubs ordered by current load
    pool: HubPool<Arc<Hub>>,
    /// Keyed transform for the hub handshake
    auth: AuthKey,
    /// Remote peer the hubs are dialed to
    remote: SocketAddr,
}

/// Establishes the initial hub set and serves the local listener until
/// it fails. Startup fails fast when the bind or any first hub attempt
/// fails.
pub async fn start(config: Config) -> Result<(), ClientError> {
    let client = Client::connect(&config).await?;

    let listener = TcpListener::bind(config.listen)
        .await
        .map_err(ClientError::Listen)?;
    info!("listening on {}", config.listen);

    client.serve(listener).await;
    Ok(())
}

impl Client {
    /// Dials the initial hub set. Each slot reports its first attempt
    /// so a misconfigured peer fails startup instead of retrying
    /// forever; after that the workers are resilient on their own.
    pub async fn connect(config: &Config) -> Result<Arc<Client>, ClientError> {
        let client = Arc::new(Client {
            pool: HubPool::default(),
            auth: AuthKey::new(&config.secret),
            remote: config.remote,
        });

        let (ready_tx, mut ready_rx) = mpsc::channel(config.tunnels.max(1));
        for slot in 0..config.tunnels {
            tokio::spawn(hub_worker(client.clone(), slot, ready_tx.clone()));
        }
        drop(ready_tx);

        for _ in 0..config.tunnels {
            match ready_rx.recv().await {
                Some(Ok(())) => {}
                Some(Err(err)) => return Err(err),
                // Every worker reports exactly once
                None => break,
            }
        }

        info!(
            "established {} hubs to {}",
            client.pool.len(),
            config.remote
        );
        Ok(client)
    }

    /// Serves the local listener, admitting each accepted connection to
    /// the least loaded hub
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (socket, addr) = match listener.accept().await {
                Ok(value) => value,
                Err(err) if is_temporary_accept_error(&err) => {
                    warn!("failed to accept connection: {err}");
                    continue;
                }
                Err(err) => {
                    error!("listener failed, no longer accepting connections: {err}");
                    break;
                }
            };

            // Keep half-dead local sockets from holding links forever
            if let Err(err) = set_keepalive(&socket) {
                debug!("failed to enable keepalive for {addr}: {err}");
            }

            let entry = match self.pool.fetch_least_loaded() {
                Some(value) => value,
                // Every hub is down, refuse the connection
                None => {
                    warn!("no active hub, dropping connection from {addr}");
                    continue;
                }
            };

            debug!("admitting {addr} (hub load {})", entry.load());
            tokio::spawn(handle_connection(self.clone(), entry, socket));
        }
    }

    /// Dials the remote peer and upgrades the socket into a keyed hub
    async fn connect_hub(&self) -> Result<(Arc<Hub>, HubDriver), ClientError> {
        let mut socket = TcpStream::connect(self.remote)
            .await
            .map_err(ClientError::Dial)?;

        // The peer leads with its challenge; answer it with the token
        // and keep the derived cipher key
        let mut challenge = [0u8; CHALLENGE_SIZE];
        socket
            .read_exact(&mut challenge)
            .await
            .map_err(HandshakeError::from)?;

        let (token, key) = self.auth.answer(&challenge)?;

        socket
            .write_all(&token)
            .await
            .map_err(HandshakeError::from)?;

        Ok(Hub::new(socket, &key))
    }
}

/// Owns one hub slot for the lifetime of the client. Dials,
/// authenticates and registers a hub, runs it until the tunnel dies,
/// then reconnects after a fixed delay. A worker whose first attempt
/// failed exits; startup is reporting that error upward.
async fn hub_worker(
    client: Arc<Client>,
    slot: usize,
    ready: mpsc::Sender<Result<(), ClientError>>,
) {
    let mut first_attempt = Some(ready);

    loop {
        let (hub, driver) = match client.connect_hub().await {
            Ok(value) => value,
            Err(err) => {
                if let Some(ready) = first_attempt.take() {
                    _ = ready.send(Err(err)).await;
                    return;
                }

                warn!("hub {slot}: reconnect failed: {err}");
                sleep(RECONNECT_DELAY).await;
                continue;
            }
        };

        let status = hub.status();
        debug!(
            "hub {slot}: established ({} link ids available)",
            status.free_ids
        );

        // Register the hub before reporting the first attempt so the
        // acceptor never starts against a partially filled pool
        let entry = client.pool.push(hub);
        if let Some(ready) = first_attempt.take() {
            _ = ready.send(Ok(())).await;
        }

        // The driver drains the link table when it completes, so the
        // in-flight links on this hub stop with the tunnel
        let result = driver.await;
        client.pool.remove(&entry);

        match result {
            Ok(()) => info!("hub {slot}: closed by remote peer"),
            Err(err) => warn!("hub {slot}: tunnel died: {err}"),
        }

        sleep(RECONNECT_DELAY).await;
    }
}

/// Runs one accepted connection over a link on the chosen hub
async fn handle_connection(client: Arc<Client>, entry: HubEntry, socket: TcpStream) {
    // The guard pairs the admission that brought us here and releases
    // the link state no matter how the pump exits
    let mut guard = ConnGuard {
        client,
        entry,
        link_id: None,
        link_created: false,
    };

    let link_id = match guard.entry.hub.acquire_id() {
        Some(value) => value,
        // Hub is saturated, refuse the connection
        None => {
            debug!("hub saturated, dropping local connection");
            return;
        }
    };
    guard.link_id = Some(link_id);

    let link = guard.entry.hub.new_link(link_id);
    guard.link_created = true;

    // The peer must learn about the link before any payload for it
    link.send_create();

    if let Err(err) = link.pump(socket).await {
        debug!("link {link_id} ended: {err}");
    }
}

/// Releases everything a connection holds, on every exit path
/// including a panicking pump. The link teardown must come before the
/// id goes back to the allocator so a fresh link cannot collide with
/// the stale table slot.
struct ConnGuard {
    client: Arc<Client>,
    entry: HubEntry,
    link_id: Option<LinkId>,
    link_created: bool,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        if let Some(id) = self.link_id {
            if self.link_created {
                self.entry.hub.release_link(id);
            }
            self.entry.hub.release_id(id);
        }
        self.client.pool.drop_load(&self.entry);
    }
}

/// Accept errors that indicate a problem with the connection being
/// accepted rather than with the listener itself
fn is_temporary_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

fn set_keepalive(socket: &TcpStream) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    SockRef::from(socket).set_tcp_keepalive(&keepalive)
}
