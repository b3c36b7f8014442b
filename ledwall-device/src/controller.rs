//! Slice controller.
//!
//! A single task owns the device state machine and handles one event at a
//! time, each to completion:
//!
//! ```text
//!   address source ──┐
//!   fetcher ─────────┼──► events ──┐
//!   timers ──────────┘             ├──► dispatch() ──► DeviceState
//!   clock driver ── NEED_FRAME ────┘        │
//!                                           ├──► FrameFetcher (connect / fetch / cancel)
//!                                           └──► PixelClockDriver (stage / arm / disarm)
//! ```
//!
//! Handler errors are logged and leave the state as it was. Fatal errors
//! (sustained underrun, buffer overrun) reset the controller: the link is
//! torn down and a reconnect is scheduled.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use ledwall_core::{DeviceState, jitter};

use crate::address::{self, AddressSource};
use crate::clock::{ColumnFrame, EdgeHandler, EdgeSource, OutputBus, PixelClockDriver};
use crate::config::DeviceSettings;
use crate::error::DeviceError;
use crate::event::{ConnId, DeviceEvent};
use crate::fetcher::{FetcherHandle, FrameFetcher};
use crate::playout::{Advance, Playout};

/// Snapshot of the controller, published after every event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    /// State name, e.g. `"ACTIVE"`.
    pub state: &'static str,
    /// Connections opened so far.
    pub connects: u64,
    /// Frames waiting in the jitter buffer.
    pub level: usize,
    /// NEED_FRAME ticks handled while active.
    pub ticks: u64,
    /// Ticks that showed a new frame.
    pub shown: u64,
    /// Ticks that repeated the previous frame.
    pub dropped: u64,
    /// Frames skipped to catch up after drops.
    pub skipped: u64,
    /// Resets after fatal errors.
    pub resets: u64,
}

/// One live server connection and the buffer it fills.
struct Link {
    fetcher: FetcherHandle,
    playout: Playout,
    read_pending: bool,
}

/// Counters carried across connections.
#[derive(Debug, Default)]
struct Counters {
    ticks: u64,
    shown: u64,
    dropped: u64,
    skipped: u64,
    resets: u64,
}

pub struct DeviceController<B: OutputBus + 'static, C: EdgeSource> {
    settings: DeviceSettings,
    state: DeviceState,
    driver: Arc<PixelClockDriver<B>>,
    clock: C,
    events_tx: mpsc::UnboundedSender<DeviceEvent>,
    events_rx: mpsc::UnboundedReceiver<DeviceEvent>,
    address: Option<Box<dyn AddressSource>>,
    link: Option<Link>,
    conn_seq: ConnId,
    prefetch_at: Option<Instant>,
    reconnect_at: Option<Instant>,
    scratch: ColumnFrame,
    counters: Counters,
    status: watch::Sender<DeviceStatus>,
}

impl<B: OutputBus + 'static, C: EdgeSource> DeviceController<B, C> {
    pub fn new(settings: DeviceSettings, bus: B, clock: C, address: Box<dyn AddressSource>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(DeviceStatus {
            state: DeviceState::Stopped.name(),
            ..DeviceStatus::default()
        });
        Self {
            driver: Arc::new(PixelClockDriver::new(settings.width, settings.leds, bus)),
            scratch: ColumnFrame::new(settings.width, settings.leds),
            settings,
            state: DeviceState::Stopped,
            clock,
            events_tx,
            events_rx,
            address: Some(address),
            link: None,
            conn_seq: 0,
            prefetch_at: None,
            reconnect_at: None,
            counters: Counters::default(),
            status,
        }
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// Watch the controller's status.
    pub fn subscribe(&self) -> watch::Receiver<DeviceStatus> {
        self.status.subscribe()
    }

    /// Sender into the event queue.
    pub fn events(&self) -> mpsc::UnboundedSender<DeviceEvent> {
        self.events_tx.clone()
    }

    pub fn driver(&self) -> &Arc<PixelClockDriver<B>> {
        &self.driver
    }

    /// Run the event loop until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let forwarder = self
            .address
            .take()
            .map(|source| address::forward(source, self.events_tx.clone()));
        info!(id = %self.settings.id, server = %self.settings.endpoint.server, "slice controller started");

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                wraps = self.driver.need_frame() => {
                    // one advance per scan, even when this task ran late
                    for _ in 1..wraps {
                        self.dispatch(DeviceEvent::NeedFrame).await;
                    }
                    DeviceEvent::NeedFrame
                }
                Some(event) = self.events_rx.recv() => event,
                _ = sleep_until(self.prefetch_at) => {
                    self.prefetch_at = None;
                    DeviceEvent::PrefetchTimer
                }
                _ = sleep_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    DeviceEvent::ConnectTimer
                }
            };
            self.dispatch(event).await;
        }

        self.teardown().await;
        if let Some(task) = forwarder {
            task.abort();
        }
        info!("slice controller stopped");
    }

    /// Handle one event to completion.
    pub async fn dispatch(&mut self, event: DeviceEvent) {
        if let Some(conn) = event.conn() {
            let live = self.link.as_ref().map(|link| link.fetcher.conn());
            if live != Some(conn) {
                debug!(event = event.name(), conn, "event from a closed connection");
                return;
            }
        }

        let from = self.state.name();
        match self.handle(&event).await {
            Ok(()) => {
                let to = self.state.name();
                if to != from {
                    info!(event = event.name(), "{from} -> {to}");
                }
            }
            Err(e) if e.is_fatal() => {
                error!(event = event.name(), state = from, "{e}; resetting");
                self.reset().await;
            }
            Err(e) => warn!(event = event.name(), state = from, "{e}"),
        }
        self.publish();
    }

    async fn handle(&mut self, event: &DeviceEvent) -> Result<(), DeviceError> {
        match event {
            DeviceEvent::AddressAcquired(ip) => {
                info!(%ip, "address acquired");
                self.teardown().await;
                self.reconnect_at = None;
                self.state.acquire_address();
                self.connect();
                Ok(())
            }
            DeviceEvent::AddressLost => {
                self.teardown().await;
                self.reconnect_at = None;
                self.state.lose_address();
                Ok(())
            }
            DeviceEvent::ConnActive { .. } => {
                self.state.begin_prefetch()?;
                self.prefetch_at = Some(Instant::now() + self.settings.prefetch_poll);
                self.fetch();
                Ok(())
            }
            DeviceEvent::ReadComplete { .. } => {
                if let Some(link) = self.link.as_mut() {
                    link.read_pending = false;
                }
                if self.state.is_connected() {
                    self.fetch();
                }
                Ok(())
            }
            DeviceEvent::ConnErr { reason, .. } => {
                warn!(state = self.state.name(), "connection lost: {reason}");
                self.teardown().await;
                self.state.lose_connection()?;
                self.schedule_reconnect();
                Ok(())
            }
            DeviceEvent::NeedFrame => {
                if !self.state.is_active() {
                    trace!(state = self.state.name(), "NEED_FRAME ignored");
                    return Ok(());
                }
                self.advance()
            }
            DeviceEvent::PrefetchTimer => self.poll_prefetch(),
            DeviceEvent::ConnectTimer => {
                if self.state == DeviceState::Ready && self.link.is_none() {
                    self.connect();
                }
                Ok(())
            }
        }
    }

    // ── Handlers ─────────────────────────────────────────────────

    fn poll_prefetch(&mut self) -> Result<(), DeviceError> {
        if self.state != DeviceState::Prefetch {
            warn!(state = self.state.name(), "PREFETCH_TIMER ignored");
            return Ok(());
        }
        let Some(link) = self.link.as_mut() else {
            return Ok(());
        };
        if !link.playout.is_full() {
            debug!(level = link.playout.level(), depth = link.playout.depth(), "prefetching");
            self.prefetch_at = Some(Instant::now() + self.settings.prefetch_poll);
            self.fetch();
            return Ok(());
        }

        self.state.activate()?;
        link.playout.advance(&mut self.scratch)?;
        self.counters.shown += 1;
        self.driver.stage(&mut self.scratch);
        self.driver.arm();
        let handler: Arc<dyn EdgeHandler> = self.driver.clone();
        self.clock.attach(handler);
        info!(depth = self.settings.depth, "buffer full; clock armed");
        self.fetch();
        Ok(())
    }

    fn advance(&mut self) -> Result<(), DeviceError> {
        let Some(link) = self.link.as_mut() else {
            return Ok(());
        };
        self.counters.ticks += 1;
        match link.playout.advance(&mut self.scratch)? {
            Advance::Shown { skipped } => {
                self.counters.shown += 1;
                self.driver.stage(&mut self.scratch);
                if skipped > 0 {
                    self.counters.skipped += skipped as u64;
                    debug!(skipped, level = link.playout.level(), "caught up");
                }
                self.fetch();
            }
            Advance::Repeated { drops } => {
                self.counters.dropped += 1;
                if drops == 1 || drops % 32 == 0 {
                    debug!(drops, "underrun; repeating frame");
                }
            }
        }
        Ok(())
    }

    // ── Link management ──────────────────────────────────────────

    /// Open a new connection with a fresh jitter buffer.
    fn connect(&mut self) {
        self.conn_seq += 1;
        let conn = self.conn_seq;
        let (writer, reader) = jitter::channel(self.settings.depth, self.settings.frame_len());
        let fetcher = FrameFetcher::new(
            conn,
            self.settings.id,
            self.settings.endpoint.clone(),
            writer,
            self.events_tx.clone(),
        )
        .spawn();
        info!(conn, server = %self.settings.endpoint.server, "connecting");
        self.link = Some(Link {
            fetcher,
            playout: Playout::new(reader, self.settings.max_drops),
            read_pending: false,
        });
    }

    /// Request one frame unless a read is already pending or there is no
    /// free slot.
    fn fetch(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if link.read_pending || link.playout.is_full() {
            return;
        }
        link.read_pending = true;
        link.fetcher.request();
    }

    /// Cancel the read, stop the clock, join the fetcher, drop the buffer.
    async fn teardown(&mut self) {
        self.prefetch_at = None;
        let Some(link) = self.link.take() else {
            return;
        };
        link.fetcher.cancel();
        self.clock.detach();
        self.driver.disarm();
        link.fetcher.join().await;
        debug!(level = link.playout.level(), "link torn down");
    }

    async fn reset(&mut self) {
        self.counters.resets += 1;
        self.teardown().await;
        if self.state.lose_connection().is_ok() {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        info!(after_ms = self.settings.reconnect.as_millis() as u64, "reconnect scheduled");
        self.reconnect_at = Some(Instant::now() + self.settings.reconnect);
    }

    fn publish(&self) {
        let c = &self.counters;
        self.status.send_replace(DeviceStatus {
            state: self.state.name(),
            connects: self.conn_seq,
            level: self.link.as_ref().map_or(0, |link| link.playout.level()),
            ticks: c.ticks,
            shown: c.shown,
            dropped: c.dropped,
            skipped: c.skipped,
            resets: c.resets,
        });
    }
}

impl<B: OutputBus + 'static, C: EdgeSource> std::fmt::Debug for DeviceController<B, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceController")
            .field("id", &self.settings.id)
            .field("state", &self.state)
            .field("conn", &self.conn_seq)
            .field("driver", &self.driver)
            .finish()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use ledwall_core::DeviceId;

    use crate::address::{AddressChange, ChannelAddress};
    use crate::clock::CountingBus;
    use crate::fetcher::Endpoint;

    const WIDTH: usize = 4;
    const LEDS: usize = 2;
    const DEPTH: usize = 4;
    const FRAME_LEN: usize = WIDTH * LEDS * 3;
    const ID: DeviceId = DeviceId::new([0x24, 0x0a, 0xc4, 0xc0, 0x6b, 0xf0]);

    /// Edge source the test fires by hand.
    #[derive(Clone, Default)]
    struct ManualEdges(Arc<Mutex<Option<Arc<dyn EdgeHandler>>>>);

    impl ManualEdges {
        fn attached(&self) -> bool {
            self.0.lock().unwrap().is_some()
        }

        fn fire(&self, edges: usize) {
            let handler = self.0.lock().unwrap().clone();
            if let Some(handler) = handler {
                for _ in 0..edges {
                    handler.on_edge();
                }
            }
        }
    }

    impl EdgeSource for ManualEdges {
        fn attach(&mut self, handler: Arc<dyn EdgeHandler>) {
            *self.0.lock().unwrap() = Some(handler);
        }

        fn detach(&mut self) {
            *self.0.lock().unwrap() = None;
        }
    }

    fn settings(server: SocketAddr) -> DeviceSettings {
        DeviceSettings {
            id: ID,
            width: WIDTH,
            leds: LEDS,
            depth: DEPTH,
            max_drops: 2,
            prefetch_poll: Duration::from_millis(10),
            reconnect: Duration::from_millis(50),
            fps: 16,
            endpoint: Endpoint {
                server,
                local: None,
                connect_timeout: Duration::from_secs(2),
            },
        }
    }

    struct Rig {
        edges: ManualEdges,
        bus: CountingBus,
        status: watch::Receiver<DeviceStatus>,
        address: mpsc::UnboundedSender<AddressChange>,
        events: mpsc::UnboundedSender<DeviceEvent>,
        stop: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    impl Rig {
        fn start(settings: DeviceSettings) -> Self {
            let edges = ManualEdges::default();
            let bus = CountingBus::new();
            let (address, source) = ChannelAddress::new();
            let controller =
                DeviceController::new(settings, bus.clone(), edges.clone(), Box::new(source));
            let status = controller.subscribe();
            let events = controller.events();
            let stop = CancellationToken::new();
            let task = tokio::spawn(controller.run(stop.clone()));
            Self {
                edges,
                bus,
                status,
                address,
                events,
                stop,
                task,
            }
        }

        fn acquire(&self) {
            let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
            self.address.send(AddressChange::Acquired(ip)).unwrap();
        }

        async fn wait_for(&mut self, what: &str, f: impl FnMut(&DeviceStatus) -> bool) -> DeviceStatus {
            match tokio::time::timeout(Duration::from_secs(5), self.status.wait_for(f)).await {
                Ok(Ok(status)) => status.clone(),
                Ok(Err(_)) => panic!("controller gone while waiting for {what}"),
                Err(_) => panic!("timed out waiting for {what}"),
            }
        }

        /// Fire one full scan and wait for the controller to handle the tick.
        async fn scan(&mut self) -> DeviceStatus {
            let ticks = self.status.borrow().ticks;
            let resets = self.status.borrow().resets;
            self.edges.fire(WIDTH);
            self.wait_for("tick", |s| s.ticks > ticks || s.resets > resets)
                .await
        }

        async fn stop(self) {
            self.stop.cancel();
            tokio::time::timeout(Duration::from_secs(5), self.task)
                .await
                .unwrap()
                .unwrap();
        }
    }

    async fn accept(listener: &TcpListener) -> TcpStream {
        let (mut stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("device did not connect")
            .unwrap();
        let mut header = [0u8; 6];
        stream.read_exact(&mut header).await.unwrap();
        assert_eq!(header, ID.to_bytes());
        stream
    }

    async fn send_frames(stream: &mut TcpStream, tags: std::ops::Range<u8>) {
        for tag in tags {
            stream.write_all(&[tag; FRAME_LEN]).await.unwrap();
        }
    }

    #[tokio::test]
    async fn prefetch_fills_buffer_then_plays() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut rig = Rig::start(settings(listener.local_addr().unwrap()));
        rig.acquire();

        let mut server = accept(&listener).await;
        rig.wait_for("PREFETCH", |s| s.state == "PREFETCH").await;
        assert!(!rig.edges.attached());

        send_frames(&mut server, 1..20).await;
        let status = rig.wait_for("ACTIVE", |s| s.state == "ACTIVE").await;
        assert_eq!(status.shown, 1);
        assert!(rig.edges.attached());

        // first scan shows frame 1
        rig.scan().await;
        assert_eq!(rig.bus.first_led(), [1, 1, 1]);
        assert_eq!(rig.bus.columns(), WIDTH as u64);

        // frames staged on NEED_FRAME appear one scan later
        let mut last = 1;
        for _ in 0..4 {
            rig.scan().await;
            let [tag, ..] = rig.bus.first_led();
            assert!(tag >= last, "frames went backwards");
            last = tag;
        }
        assert!(last > 1, "display never advanced");
        rig.stop().await;
    }

    #[tokio::test]
    async fn late_wakeup_advances_once_per_scan() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut rig = Rig::start(settings(listener.local_addr().unwrap()));
        rig.acquire();
        let mut server = accept(&listener).await;
        send_frames(&mut server, 1..20).await;
        rig.wait_for("ACTIVE", |s| s.state == "ACTIVE").await;

        // two full scans before the controller gets to run
        rig.edges.fire(2 * WIDTH);
        rig.wait_for("two ticks", |s| s.ticks >= 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = rig.status.borrow().clone();
        assert_eq!(status.ticks, 2);
        assert_eq!(status.shown, 3);
        assert_eq!(status.dropped, 0);
        rig.stop().await;
    }

    #[tokio::test]
    async fn need_frame_outside_active_is_ignored() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut rig = Rig::start(settings(listener.local_addr().unwrap()));
        rig.acquire();
        let _server = accept(&listener).await;
        rig.wait_for("PREFETCH", |s| s.state == "PREFETCH").await;

        rig.events.send(DeviceEvent::NeedFrame).unwrap();
        rig.events.send(DeviceEvent::ConnectTimer).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = rig.status.borrow().clone();
        assert_eq!(status.state, "PREFETCH");
        assert_eq!(status.ticks, 0);
        assert_eq!(status.connects, 1);
        rig.stop().await;
    }

    #[tokio::test]
    async fn stale_connection_events_are_ignored() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut rig = Rig::start(settings(listener.local_addr().unwrap()));
        rig.acquire();
        let mut server = accept(&listener).await;
        send_frames(&mut server, 1..20).await;
        rig.wait_for("ACTIVE", |s| s.state == "ACTIVE").await;

        rig.events
            .send(DeviceEvent::ConnErr {
                conn: 99,
                reason: "old socket".into(),
            })
            .unwrap();
        rig.scan().await;
        assert_eq!(rig.status.borrow().state, "ACTIVE");
        rig.stop().await;
    }

    #[tokio::test]
    async fn connection_loss_reconnects_after_backoff() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut rig = Rig::start(settings(listener.local_addr().unwrap()));
        rig.acquire();

        // one buffer's worth, then the server goes away; the fetcher hits
        // EOF on the read issued right after activation
        let mut server = accept(&listener).await;
        send_frames(&mut server, 1..DEPTH as u8 + 1).await;
        drop(server);
        rig.wait_for("READY", |s| s.shown >= 1 && s.state == "READY")
            .await;
        assert!(!rig.edges.attached(), "clock still attached");

        let _again = accept(&listener).await;
        let status = rig
            .wait_for("second connection", |s| s.connects == 2 && s.state == "PREFETCH")
            .await;
        assert_eq!(status.level, 0);
        rig.stop().await;
    }

    #[tokio::test]
    async fn sustained_underrun_resets() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut s = settings(listener.local_addr().unwrap());
        s.reconnect = Duration::from_secs(60);
        let mut rig = Rig::start(s);
        rig.acquire();

        // exactly one buffer's worth, then silence
        let mut server = accept(&listener).await;
        send_frames(&mut server, 1..DEPTH as u8 + 1).await;
        rig.wait_for("ACTIVE", |s| s.state == "ACTIVE").await;

        let mut status = rig.status.borrow().clone();
        for _ in 0..DEPTH + 4 {
            status = rig.scan().await;
            if status.resets > 0 {
                break;
            }
        }
        assert_eq!(status.resets, 1);
        assert_eq!(status.state, "READY");
        assert_eq!(status.shown, DEPTH as u64);
        assert_eq!(status.dropped, 2);
        assert!(!rig.edges.attached());
        rig.stop().await;
    }

    #[tokio::test]
    async fn address_loss_stops_without_reconnecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut rig = Rig::start(settings(listener.local_addr().unwrap()));
        rig.acquire();
        let _server = accept(&listener).await;
        rig.wait_for("PREFETCH", |s| s.state == "PREFETCH").await;

        rig.address.send(AddressChange::Lost).unwrap();
        rig.wait_for("STOPPED", |s| s.state == "STOPPED").await;

        let reconnect = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(reconnect.is_err(), "reconnected without an address");

        rig.acquire();
        let _server = accept(&listener).await;
        rig.wait_for("PREFETCH", |s| s.state == "PREFETCH" && s.connects == 2)
            .await;
        rig.stop().await;
    }
}
