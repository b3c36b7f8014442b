//! Frame server core: accept loop, worker assignment and shutdown.
//!
//! ```text
//!              main reactor                        IO workers
//!  listener ──► accept ──► least_loaded() ───────► ClientSession
//!                                                      │ DirectorEvent
//!  FrameDirector ◄─────────────────────────────────────┘
//!       │ open/close                    Renderer thread
//!       └──────────► FrameStore ◄──────── push
//! ```
//!
//! Shutdown order: stop accepting, cancel the store, cancel every
//! session, join the workers. The render thread is joined by the caller.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ledwall_core::{FrameStore, SliceTable, WallError, WallGeometry};

use crate::config::ServerConfig;
use crate::director::FrameDirector;
use crate::session::{ClientSession, SessionKey};
use crate::worker::WorkerPool;

// ── WallServer ───────────────────────────────────────────────────

/// The top-level frame server.
#[derive(Debug)]
pub struct WallServer {
    config: ServerConfig,
    geometry: WallGeometry,
    slices: SliceTable,
    store: Arc<FrameStore>,
    shutdown: CancellationToken,
    /// Parent of every session token and the director's stop token.
    /// Cancelled only after the store.
    sessions: CancellationToken,
}

impl WallServer {
    /// Validate `config` and create the shared frame store.
    pub fn new(config: ServerConfig) -> Result<Self, WallError> {
        let geometry = config.geometry()?;
        let slices = config.slice_table()?;
        let store = Arc::new(FrameStore::new(config.max_frames()));
        Ok(Self {
            config,
            geometry,
            slices,
            store,
            shutdown: CancellationToken::new(),
            sessions: CancellationToken::new(),
        })
    }

    pub fn geometry(&self) -> WallGeometry {
        self.geometry
    }

    /// The store the renderer pushes into.
    pub fn store(&self) -> Arc<FrameStore> {
        Arc::clone(&self.store)
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the device listener. Accepted sockets inherit the configured
    /// send buffer size.
    pub async fn bind(&self) -> Result<TcpListener, WallError> {
        let addr: SocketAddr = self
            .config
            .network
            .listen_addr
            .parse()
            .map_err(|e| WallError::Config(format!("listen_addr: {e}")))?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        if let Err(e) = socket.set_send_buffer_size(self.config.network.send_buffer_bytes) {
            warn!("cannot set send buffer size: {e}");
        }
        socket.bind(addr)?;
        Ok(socket.listen(128)?)
    }

    /// Serve devices on `listener` until the shutdown token fires.
    pub async fn run(self, listener: TcpListener) -> Result<(), WallError> {
        let local_addr = listener.local_addr()?;
        let workers = WorkerPool::start(self.config.worker_count())?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let director = FrameDirector::new(self.slices.clone(), Arc::clone(&self.store));
        let director_task = tokio::spawn(director.run(events_rx, self.sessions.clone()));

        info!(
            addr = %local_addr,
            slices = self.slices.len(),
            workers = workers.len(),
            "frame server listening"
        );

        let mut next_key: SessionKey = 0;
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept error: {e}");
                        continue;
                    }
                },
            };

            let stream = match stream.into_std() {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(%peer, "cannot hand off socket: {e}");
                    continue;
                }
            };
            next_key += 1;
            let (session, _) = ClientSession::new(
                next_key,
                peer,
                self.sessions.child_token(),
                Arc::clone(&self.store),
                events_tx.clone(),
                self.config.handshake_timeout(),
            );
            debug!(%peer, key = next_key, "connection accepted");
            session.spawn(workers.least_loaded(), stream);
        }

        info!("shutting down frame server");
        drop(listener);
        self.store.cancel();
        self.sessions.cancel();
        if let Err(e) = director_task.await {
            error!("director task failed: {e}");
        }
        tokio::task::spawn_blocking(move || workers.shutdown())
            .await
            .map_err(|e| WallError::Connection(std::io::Error::other(e)))?;
        info!("frame server stopped");
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_creates_with_defaults() {
        let server = WallServer::new(ServerConfig::default()).unwrap();
        assert_eq!(server.geometry().slice_count(), 3);
        assert_eq!(server.store().max_frames(), 16);
        assert!(!server.shutdown_handle().is_cancelled());
    }

    #[test]
    fn invalid_geometry_is_rejected() {
        let mut cfg = ServerConfig::default();
        cfg.wall.slice_height = 50;
        assert!(matches!(WallServer::new(cfg), Err(WallError::Config(_))));
    }

    #[tokio::test]
    async fn bad_listen_addr_is_a_config_error() {
        let mut cfg = ServerConfig::default();
        cfg.network.listen_addr = "not an address".into();
        let server = WallServer::new(cfg).unwrap();
        assert!(matches!(server.bind().await, Err(WallError::Config(_))));
    }

    #[tokio::test]
    async fn shutdown_cancels_store_before_sessions() {
        let mut cfg = ServerConfig::default();
        cfg.network.listen_addr = "127.0.0.1:0".into();
        cfg.workers.count = 1;
        let server = WallServer::new(cfg).unwrap();
        let listener = server.bind().await.unwrap();

        let store = server.store();
        let sessions = server.sessions.clone();
        let observed = tokio::spawn(async move {
            sessions.cancelled().await;
            store.is_cancelled()
        });
        tokio::task::yield_now().await;

        let stop = server.shutdown_handle();
        let run = tokio::spawn(server.run(listener));
        tokio::task::yield_now().await;
        stop.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), run)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
        assert!(
            observed.await.unwrap(),
            "sessions were cancelled while the store was still live"
        );
    }
}
