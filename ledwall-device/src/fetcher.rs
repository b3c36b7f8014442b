//! Network side of the slice controller.
//!
//! A fetcher owns one server connection and the writer half of that
//! connection's jitter buffer. After the identity header is on the wire it
//! reads exactly one frame per fetch request, straight into the next free
//! slot, and reports back through the controller's event queue.
//!
//! ```text
//!  controller ── request() ──► fetch permit ──► read_exact(next()) ──► push()
//!       ▲                                                              │
//!       └──────────────────────── READ_COMPLETE ◄──────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ledwall_core::{BufferError, DeviceId, FrameWriter};

use crate::error::DeviceError;
use crate::event::{ConnId, DeviceEvent};

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub server: SocketAddr,
    /// Bind the local side to this address before connecting.
    pub local: Option<SocketAddr>,
    pub connect_timeout: Duration,
}

/// One server connection filling one jitter buffer.
#[derive(Debug)]
pub struct FrameFetcher {
    conn: ConnId,
    id: DeviceId,
    endpoint: Endpoint,
    writer: FrameWriter,
    events: mpsc::UnboundedSender<DeviceEvent>,
    fetch: Arc<Notify>,
    cancel: CancellationToken,
}

impl FrameFetcher {
    pub fn new(
        conn: ConnId,
        id: DeviceId,
        endpoint: Endpoint,
        writer: FrameWriter,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Self {
        Self {
            conn,
            id,
            endpoint,
            writer,
            events,
            fetch: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Start the connection task on the current runtime.
    pub fn spawn(self) -> FetcherHandle {
        let conn = self.conn;
        let fetch = Arc::clone(&self.fetch);
        let cancel = self.cancel.clone();
        let task = tokio::spawn(self.run());
        FetcherHandle {
            conn,
            fetch,
            cancel,
            task,
        }
    }

    async fn run(mut self) {
        let conn = self.conn;
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(conn, "fetcher cancelled");
                return;
            }
            r = self.serve() => r,
        };
        let Err(e) = result else { return };
        if cancel.is_cancelled() {
            return;
        }
        warn!(conn, "connection error: {e}");
        let _ = self.events.send(DeviceEvent::ConnErr {
            conn,
            reason: e.to_string(),
        });
    }

    async fn serve(&mut self) -> Result<(), DeviceError> {
        let mut stream = self.connect().await?;
        stream.write_all(&self.id.to_bytes()).await?;
        info!(conn = self.conn, id = %self.id, server = %self.endpoint.server, "identity sent");
        self.post(DeviceEvent::ConnActive { conn: self.conn })?;

        loop {
            self.fetch.notified().await;
            let slot = match self.writer.next() {
                Ok(slot) => slot,
                Err(BufferError::Overrun) => {
                    debug!(conn = self.conn, "buffer full; fetch deferred");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            stream.read_exact(slot).await?;
            self.writer.push()?;
            self.post(DeviceEvent::ReadComplete { conn: self.conn })?;
        }
    }

    async fn connect(&self) -> Result<TcpStream, DeviceError> {
        let server = self.endpoint.server;
        let socket = if server.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(local) = self.endpoint.local {
            socket.bind(local)?;
        }
        let timeout = self.endpoint.connect_timeout;
        let stream = tokio::time::timeout(timeout, socket.connect(server))
            .await
            .map_err(|_| DeviceError::ConnectTimeout(timeout))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn post(&self, event: DeviceEvent) -> Result<(), DeviceError> {
        self.events
            .send(event)
            .map_err(|_| DeviceError::EventsClosed)
    }
}

// ── FetcherHandle ────────────────────────────────────────────────

/// Controller-side handle on a running fetcher.
#[derive(Debug)]
pub struct FetcherHandle {
    conn: ConnId,
    fetch: Arc<Notify>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl FetcherHandle {
    pub fn conn(&self) -> ConnId {
        self.conn
    }

    /// Ask for one more frame. Requests made while a read is running
    /// collapse into a single follow-up read.
    pub fn request(&self) {
        self.fetch.notify_one();
    }

    /// Abort the connection. No CONN_ERR is raised for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait for the task to release the socket and the buffer.
    pub async fn join(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(conn = self.conn, "fetcher task failed: {e}");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
