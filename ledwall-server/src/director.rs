//! Readiness gating and fan-out control.
//!
//! The director owns the registry of identified sessions and runs as a
//! single task on the main reactor. Sessions report to it through
//! [`DirectorEvent`]s; it answers by starting, pausing or cancelling them.
//!
//! The gate is open only while every configured slice has a ready
//! session. Opening the gate calls [`FrameStore::open`] and starts every
//! slice session from the returned sequence; losing any slice closes it
//! again, pauses every session and discards the backlog. Nobody races
//! ahead of a missing panel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ledwall_core::{DeviceId, FrameStore, SessionPhase, SliceTable};

use crate::session::{SessionHandle, SessionKey};

/// Messages from sessions to the director.
#[derive(Debug)]
pub enum DirectorEvent {
    /// A session received its identity header.
    Registered { handle: SessionHandle, id: DeviceId },
    /// A session's socket closed, identified or not.
    Closed { key: SessionKey },
}

#[derive(Debug)]
struct Registration {
    handle: SessionHandle,
    id: DeviceId,
    slice: usize,
    phase: SessionPhase,
}

// ── FrameDirector ────────────────────────────────────────────────

/// Registry of identified sessions plus the fan-out gate.
#[derive(Debug)]
pub struct FrameDirector {
    slices: SliceTable,
    store: Arc<FrameStore>,
    sessions: HashMap<SessionKey, Registration>,
    open: bool,
    cycles: u64,
}

impl FrameDirector {
    pub fn new(slices: SliceTable, store: Arc<FrameStore>) -> Self {
        Self {
            slices,
            store,
            sessions: HashMap::new(),
            open: false,
            cycles: 0,
        }
    }

    /// Whether fan-out is running.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Identified sessions currently registered.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Configured slices that have a ready session.
    pub fn ready_slices(&self) -> usize {
        self.sessions.values().filter(|s| s.phase.is_ready()).count()
    }

    /// Gate openings so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// The session currently serving `id`, if any.
    pub fn session_for(&self, id: &DeviceId) -> Option<SessionKey> {
        self.sessions
            .iter()
            .find(|(_, s)| s.id == *id)
            .map(|(key, _)| *key)
    }

    /// Consume events until `shutdown` fires or every sender is gone,
    /// then cancel every registered session.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<DirectorEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }
        self.shutdown();
        self
    }

    /// Apply one session event.
    pub fn handle_event(&mut self, event: DirectorEvent) {
        match event {
            DirectorEvent::Registered { handle, id } => self.on_registered(handle, id),
            DirectorEvent::Closed { key } => self.on_closed(key),
        }
    }

    /// Cancel every registered session and close the gate.
    pub fn shutdown(&mut self) {
        for (_, reg) in self.sessions.drain() {
            reg.handle.cancel();
        }
        if self.open {
            self.open = false;
            self.store.close();
        }
        debug!("director stopped");
    }

    // ── Internal ─────────────────────────────────────────────────

    fn on_registered(&mut self, handle: SessionHandle, id: DeviceId) {
        let key = handle.key();
        let Some(slice) = self.slices.slice_index(&id) else {
            warn!(device = %id, peer = %handle.peer(), "unknown device; closing");
            handle.cancel();
            return;
        };

        if let Some(previous) = self.session_for(&id) {
            warn!(device = %id, "duplicate identity; cancelling previous session");
            if let Some(reg) = self.sessions.remove(&previous) {
                reg.handle.cancel();
            }
            self.update_gate();
        }

        let mut phase = SessionPhase::Handshaking;
        if let Err(e) = phase.identify() {
            warn!(device = %id, "cannot register session: {e}");
            handle.cancel();
            return;
        }
        info!(device = %id, slice, peer = %handle.peer(), "device ready");
        self.sessions.insert(
            key,
            Registration {
                handle,
                id,
                slice,
                phase,
            },
        );
        self.update_gate();
    }

    fn on_closed(&mut self, key: SessionKey) {
        if let Some(reg) = self.sessions.remove(&key) {
            info!(device = %reg.id, slice = reg.slice, "device gone");
            self.update_gate();
        }
    }

    /// Open or close the gate to match the current registry.
    fn update_gate(&mut self) {
        let all_ready = self.ready_slices() == self.slices.len();
        if all_ready && !self.open {
            self.open_gate();
        } else if !all_ready && self.open {
            self.close_gate();
        }
    }

    fn open_gate(&mut self) {
        let start_seq = self.store.open(self.slices.len());
        for reg in self.sessions.values_mut() {
            if let Err(e) = reg.phase.start_streaming(reg.slice, start_seq) {
                warn!(device = %reg.id, "cannot stream: {e}");
                continue;
            }
            if !reg.handle.start_streaming(reg.slice, start_seq) {
                debug!(device = %reg.id, "session already gone");
            }
        }
        self.open = true;
        self.cycles += 1;
        info!(start_seq, cycle = self.cycles, "all slices ready; fan-out started");
    }

    fn close_gate(&mut self) {
        // Pause first so no session pops into the next cycle.
        for reg in self.sessions.values_mut() {
            if reg.phase.is_streaming() {
                let _ = reg.phase.pause();
                reg.handle.pause();
            }
        }
        self.store.close();
        self.open = false;
        warn!(
            ready = self.ready_slices(),
            slices = self.slices.len(),
            "slice lost; fan-out paused"
        );
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ClientSession, SessionCommand};
    use std::net::SocketAddr;
    use std::time::Duration;

    fn id(last: u8) -> DeviceId {
        DeviceId::new([0x24, 0x0a, 0xc4, 0xc0, 0x00, last])
    }

    fn director(n: u8) -> FrameDirector {
        let table = SliceTable::new((0..n).map(id).collect()).unwrap();
        FrameDirector::new(table, Arc::new(FrameStore::new(4)))
    }

    /// A handle whose commands land in a receiver the test can inspect.
    fn handle(key: SessionKey) -> (SessionHandle, mpsc::UnboundedReceiver<SessionCommand>) {
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let (events, _) = mpsc::unbounded_channel();
        let (session, handle) = ClientSession::new(
            key,
            peer,
            CancellationToken::new(),
            Arc::new(FrameStore::new(1)),
            events,
            Duration::from_secs(1),
        );
        (handle, session.into_commands())
    }

    fn register(
        d: &mut FrameDirector,
        key: SessionKey,
        dev: DeviceId,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionCommand>) {
        let (h, rx) = handle(key);
        d.handle_event(DirectorEvent::Registered {
            handle: h.clone(),
            id: dev,
        });
        (h, rx)
    }

    #[test]
    fn gate_waits_for_every_slice() {
        let mut d = director(3);
        let (_, mut rx0) = register(&mut d, 1, id(0));
        let (_, _rx1) = register(&mut d, 2, id(1));
        assert!(!d.is_open());
        assert_eq!(d.ready_slices(), 2);
        assert!(rx0.try_recv().is_err());

        let (_, mut rx2) = register(&mut d, 3, id(2));
        assert!(d.is_open());
        assert_eq!(d.cycles(), 1);
        assert_eq!(
            rx0.try_recv().unwrap(),
            SessionCommand::Stream {
                slice: 0,
                start_seq: 0
            }
        );
        assert_eq!(
            rx2.try_recv().unwrap(),
            SessionCommand::Stream {
                slice: 2,
                start_seq: 0
            }
        );
    }

    #[test]
    fn unknown_identity_is_cancelled_without_registering() {
        let mut d = director(1);
        let stranger = DeviceId::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        let (h, _) = register(&mut d, 7, stranger);
        assert!(h.is_cancelled());
        assert_eq!(d.session_count(), 0);
        assert!(!d.is_open());
    }

    #[test]
    fn duplicate_identity_cancels_first_session() {
        let mut d = director(1);
        let (first, _rx_first) = register(&mut d, 1, id(0));
        assert!(d.is_open());

        let (second, mut rx_second) = register(&mut d, 2, id(0));
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(d.session_for(&id(0)), Some(2));
        assert_eq!(d.cycles(), 2);
        assert!(matches!(
            rx_second.try_recv().unwrap(),
            SessionCommand::Stream { slice: 0, .. }
        ));
    }

    #[test]
    fn losing_a_slice_pauses_everyone_and_resumes_together() {
        let mut d = director(2);
        let store = Arc::clone(&d.store);
        let (_, mut rx0) = register(&mut d, 1, id(0));
        let (_, _rx1) = register(&mut d, 2, id(1));
        assert!(matches!(rx0.try_recv().unwrap(), SessionCommand::Stream { .. }));
        assert_eq!(store.consumers(), 2);

        d.handle_event(DirectorEvent::Closed { key: 2 });
        assert!(!d.is_open());
        assert_eq!(rx0.try_recv().unwrap(), SessionCommand::Pause);
        assert_eq!(store.consumers(), 0);

        let (_, mut rx1) = register(&mut d, 3, id(1));
        assert!(d.is_open());
        let start = store.next_seq();
        assert_eq!(
            rx0.try_recv().unwrap(),
            SessionCommand::Stream {
                slice: 0,
                start_seq: start
            }
        );
        assert_eq!(
            rx1.try_recv().unwrap(),
            SessionCommand::Stream {
                slice: 1,
                start_seq: start
            }
        );
    }

    #[test]
    fn close_of_unregistered_session_is_ignored() {
        let mut d = director(1);
        d.handle_event(DirectorEvent::Closed { key: 42 });
        assert_eq!(d.session_count(), 0);
    }

    #[tokio::test]
    async fn run_cancels_sessions_on_shutdown() {
        let d = director(2);
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(d.run(rx, shutdown.clone()));

        let (h, _cmds) = handle(1);
        tx.send(DirectorEvent::Registered {
            handle: h.clone(),
            id: id(0),
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        shutdown.cancel();
        let d = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(h.is_cancelled());
        assert_eq!(d.session_count(), 0);
    }
}
