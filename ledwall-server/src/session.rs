//! One device connection, running on an IO worker.
//!
//! ```text
//!  accept ─► handshake (6-byte id) ─► Registered ─► idle ◄──► streaming
//!                │                                   │            │
//!                └──────────── error / cancel ───────┴────────────┴─► Closed
//! ```
//!
//! The session owns the socket. The director drives it through a
//! [`SessionHandle`]: a command channel for streaming/pausing and a
//! cancellation token for teardown. Both are observed on the worker's
//! own reactor.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use ledwall_core::{DeviceId, FrameStore, IDENTITY_LEN, SessionPhase, StoreError, WallError};

use crate::director::DirectorEvent;
use crate::worker::IoWorker;

/// Unique key of a session for the lifetime of the server.
pub type SessionKey = u64;

/// Instructions from the director.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// Deliver `slice` of every frame from `start_seq` onwards.
    Stream { slice: usize, start_seq: u64 },
    /// Stop delivering; keep the connection.
    Pause,
}

// ── SessionHandle ────────────────────────────────────────────────

/// Director-side handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    key: SessionKey,
    peer: SocketAddr,
    cancel: CancellationToken,
    control: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Start (or restart) delivery. Returns `false` if the session is gone.
    pub fn start_streaming(&self, slice: usize, start_seq: u64) -> bool {
        self.control
            .send(SessionCommand::Stream { slice, start_seq })
            .is_ok()
    }

    /// Stop delivery at the next frame boundary.
    pub fn pause(&self) -> bool {
        self.control.send(SessionCommand::Pause).is_ok()
    }

    /// Tear the session down and close its socket.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ── ClientSession ────────────────────────────────────────────────

/// Why a session ended.
#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    PeerClosed,
    Failed(WallError),
}

enum StreamEnd {
    Paused,
    Stopped(SessionEnd),
}

/// Worker-side state of one device connection.
#[derive(Debug)]
pub struct ClientSession {
    handle: SessionHandle,
    store: Arc<FrameStore>,
    events: mpsc::UnboundedSender<DirectorEvent>,
    control: mpsc::UnboundedReceiver<SessionCommand>,
    handshake_timeout: Duration,
    phase: SessionPhase,
    id: Option<DeviceId>,
    delivered: u64,
}

impl ClientSession {
    /// Create a session and the handle the director will drive it with.
    ///
    /// `cancel` is usually a child of the server's shutdown token.
    pub fn new(
        key: SessionKey,
        peer: SocketAddr,
        cancel: CancellationToken,
        store: Arc<FrameStore>,
        events: mpsc::UnboundedSender<DirectorEvent>,
        handshake_timeout: Duration,
    ) -> (Self, SessionHandle) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            key,
            peer,
            cancel,
            control: control_tx,
        };
        let session = Self {
            handle: handle.clone(),
            store,
            events,
            control: control_rx,
            handshake_timeout,
            phase: SessionPhase::default(),
            id: None,
            delivered: 0,
        };
        (session, handle)
    }

    /// Drop the session, keeping only its command queue.
    #[cfg(test)]
    pub(crate) fn into_commands(self) -> mpsc::UnboundedReceiver<SessionCommand> {
        self.control
    }

    /// Move `stream` onto `worker`'s reactor and run the session there.
    pub fn spawn(self, worker: &IoWorker, stream: std::net::TcpStream) {
        debug!(
            peer = %self.handle.peer,
            worker = worker.id(),
            "session assigned"
        );
        worker.spawn(async move {
            match TcpStream::from_std(stream) {
                Ok(stream) => self.run(stream).await,
                Err(e) => {
                    warn!(peer = %self.handle.peer, "cannot register socket: {e}");
                    let _ = self.events.send(DirectorEvent::Closed {
                        key: self.handle.key,
                    });
                }
            }
        });
    }

    /// Run the session to completion.
    pub async fn run(mut self, stream: TcpStream) {
        let peer = self.handle.peer;
        let (mut rd, mut wr) = stream.into_split();

        let end = match self.handshake(&mut rd).await {
            Ok(id) => self.register(id, &mut rd, &mut wr).await,
            Err(end) => end,
        };

        self.phase.close();
        let _ = wr.shutdown().await;
        let _ = self.events.send(DirectorEvent::Closed {
            key: self.handle.key,
        });

        let device = self.id.map(|id| id.to_string()).unwrap_or_else(|| "-".into());
        match end {
            SessionEnd::Cancelled => {
                debug!(%peer, %device, frames = self.delivered, "session cancelled")
            }
            SessionEnd::PeerClosed => {
                info!(%peer, %device, frames = self.delivered, "device disconnected")
            }
            SessionEnd::Failed(e) => {
                warn!(%peer, %device, frames = self.delivered, "session failed: {e}")
            }
        }
    }

    // ── Internal ─────────────────────────────────────────────────

    async fn handshake(&mut self, rd: &mut OwnedReadHalf) -> Result<DeviceId, SessionEnd> {
        let mut header = [0u8; IDENTITY_LEN];
        let read = tokio::select! {
            biased;
            _ = self.handle.cancel.cancelled() => return Err(SessionEnd::Cancelled),
            read = tokio::time::timeout(self.handshake_timeout, rd.read_exact(&mut header)) => read,
        };
        match read {
            Err(_) => Err(SessionEnd::Failed(WallError::Timeout(self.handshake_timeout))),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(SessionEnd::PeerClosed)
            }
            Ok(Err(e)) => Err(SessionEnd::Failed(e.into())),
            Ok(Ok(_)) => Ok(DeviceId::new(header)),
        }
    }

    async fn register(
        &mut self,
        id: DeviceId,
        rd: &mut OwnedReadHalf,
        wr: &mut OwnedWriteHalf,
    ) -> SessionEnd {
        if let Err(e) = self.phase.identify() {
            return SessionEnd::Failed(e);
        }
        self.id = Some(id);
        debug!(peer = %self.handle.peer, device = %id, "identity received");

        let registered = DirectorEvent::Registered {
            handle: self.handle.clone(),
            id,
        };
        if self.events.send(registered).is_err() {
            return SessionEnd::Cancelled;
        }
        self.serve(rd, wr).await
    }

    /// Idle loop: wait for director commands while watching the socket.
    async fn serve(&mut self, rd: &mut OwnedReadHalf, wr: &mut OwnedWriteHalf) -> SessionEnd {
        let mut eof_buf = [0u8; 64];
        loop {
            let command = tokio::select! {
                biased;
                _ = self.handle.cancel.cancelled() => return SessionEnd::Cancelled,
                command = self.control.recv() => command,
                read = rd.read(&mut eof_buf) => match check_peer(read) {
                    Some(end) => return end,
                    None => continue,
                },
            };

            match command {
                None => return SessionEnd::Cancelled,
                Some(SessionCommand::Pause) => {}
                Some(SessionCommand::Stream { slice, start_seq }) => {
                    if let Err(e) = self.phase.start_streaming(slice, start_seq) {
                        warn!(peer = %self.handle.peer, "ignoring stream command: {e}");
                        continue;
                    }
                    match self.stream(slice, start_seq, rd, wr, &mut eof_buf).await {
                        StreamEnd::Paused => {
                            let _ = self.phase.pause();
                        }
                        StreamEnd::Stopped(end) => return end,
                    }
                }
            }
        }
    }

    /// Deliver consecutive frames until paused or stopped.
    ///
    /// Pause and restart commands are honoured only between frames, so the
    /// device never sees a partial payload unless the socket is closed.
    async fn stream(
        &mut self,
        mut slice: usize,
        mut seq: u64,
        rd: &mut OwnedReadHalf,
        wr: &mut OwnedWriteHalf,
        eof_buf: &mut [u8],
    ) -> StreamEnd {
        debug!(peer = %self.handle.peer, slice, start_seq = seq, "streaming");
        loop {
            let popped = tokio::select! {
                biased;
                _ = self.handle.cancel.cancelled() => {
                    return StreamEnd::Stopped(SessionEnd::Cancelled);
                }
                command = self.control.recv() => match command {
                    None => return StreamEnd::Stopped(SessionEnd::Cancelled),
                    Some(SessionCommand::Pause) => return StreamEnd::Paused,
                    Some(SessionCommand::Stream { slice: s, start_seq }) => {
                        slice = s;
                        seq = start_seq;
                        continue;
                    }
                },
                read = rd.read(eof_buf) => match check_peer(read) {
                    Some(end) => return StreamEnd::Stopped(end),
                    None => continue,
                },
                popped = self.store.pop(seq) => popped,
            };

            let frame = match popped {
                Ok(frame) => frame,
                // The gate closed under us; the director's pause follows.
                Err(StoreError::Closed(_)) => return StreamEnd::Paused,
                Err(StoreError::Cancelled) => return StreamEnd::Stopped(SessionEnd::Cancelled),
            };
            let Some(payload) = frame.slice(slice) else {
                return StreamEnd::Stopped(SessionEnd::Failed(WallError::ProtocolViolation(
                    "slice index outside the frame",
                )));
            };

            tokio::select! {
                biased;
                _ = self.handle.cancel.cancelled() => {
                    return StreamEnd::Stopped(SessionEnd::Cancelled);
                }
                written = wr.write_all(&payload) => {
                    if let Err(e) = written {
                        return StreamEnd::Stopped(SessionEnd::Failed(e.into()));
                    }
                }
            }
            trace!(peer = %self.handle.peer, seq, bytes = payload.len(), "slice sent");
            self.delivered += 1;
            seq += 1;
        }
    }
}

/// Devices never send after the handshake: EOF closes the session,
/// stray bytes are dropped.
fn check_peer(read: std::io::Result<usize>) -> Option<SessionEnd> {
    match read {
        Ok(0) => Some(SessionEnd::PeerClosed),
        Ok(n) => {
            debug!(bytes = n, "discarding unexpected bytes from device");
            None
        }
        Err(e) => Some(SessionEnd::Failed(e.into())),
    }
}

// ── Tests ────────────────────────────────────────────────────────
