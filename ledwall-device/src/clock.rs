//! Pixel-clock driven output.
//!
//! Every rising edge of the external pixel clock shifts one pre-encoded
//! column of the current frame onto the LED bus. After the last column the
//! driver wraps to column 0, swaps in the staged frame if there is one and
//! raises NEED_FRAME.
//!
//! ```text
//!  edge ─► on_edge() ─► bus.transmit(column[x]) ─► x += 1
//!                                                   │ x == width
//!                              swap(front, back) ◄──┘
//!                              NEED_FRAME ──► controller ─► stage(next frame)
//! ```
//!
//! The edge handler runs in interrupt context on hardware and on the
//! [`SimulatedClock`] thread on a host. It never allocates, blocks or logs;
//! its state sits behind a `critical_section` mutex. Every wraparound bumps a
//! pending count and raises an interrupt-safe `embassy_sync` signal, so a
//! controller that wakes late still sees each scan it missed.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use critical_section::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

use ledwall_core::WallGeometry;

use crate::error::DeviceError;

// ── ColumnFrame ──────────────────────────────────────────────────

/// A slice pre-encoded as APA102 bus transfers, one per column.
///
/// Each column is a 4-byte zero start frame, one `[0xFF, b, g, r]` frame per
/// LED from the top row down, and an end frame of `((n + 1) / 2 + 7) / 8`
/// zero bytes for `n` LEDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFrame {
    width: usize,
    leds: usize,
    data: Box<[u8]>,
}

impl ColumnFrame {
    const START_LEN: usize = 4;
    const LED_LEN: usize = 4;

    /// An all-black frame for a slice `width` columns wide and `leds` rows high.
    pub fn new(width: usize, leds: usize) -> Self {
        let column_len = Self::column_len(leds);
        let mut data = vec![0u8; width * column_len].into_boxed_slice();
        for column in data.chunks_exact_mut(column_len) {
            for led in 0..leds {
                column[Self::START_LEN + led * Self::LED_LEN] = 0xFF;
            }
        }
        Self { width, leds, data }
    }

    /// Bytes in one encoded column of `leds` LEDs.
    pub fn column_len(leds: usize) -> usize {
        Self::START_LEN + leds * Self::LED_LEN + Self::end_len(leds)
    }

    fn end_len(leds: usize) -> usize {
        (leds.div_ceil(2)).div_ceil(8)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn leds(&self) -> usize {
        self.leds
    }

    /// Encode a raster slice (`width * leds * 3` bytes, row-major `r, g, b`).
    pub fn load(&mut self, raster: &[u8]) -> Result<(), DeviceError> {
        let bpp = WallGeometry::BYTES_PER_PIXEL;
        let expected = self.width * self.leds * bpp;
        if raster.len() != expected {
            return Err(DeviceError::FrameSize {
                expected,
                actual: raster.len(),
            });
        }
        let column_len = Self::column_len(self.leds);
        for (x, column) in self.data.chunks_exact_mut(column_len).enumerate() {
            for y in 0..self.leds {
                let p = (y * self.width + x) * bpp;
                let led = Self::START_LEN + y * Self::LED_LEN;
                column[led] = 0xFF;
                column[led + 1] = raster[p + 2];
                column[led + 2] = raster[p + 1];
                column[led + 3] = raster[p];
            }
        }
        Ok(())
    }

    /// The encoded transfer for column `x`.
    pub fn column(&self, x: usize) -> &[u8] {
        let len = Self::column_len(self.leds);
        &self.data[x * len..(x + 1) * len]
    }
}

// ── Output bus ───────────────────────────────────────────────────

/// The peripheral bus the LEDs hang off. Called from the edge context.
pub trait OutputBus: Send {
    fn transmit(&mut self, bytes: &[u8]);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullBus;

impl OutputBus for NullBus {
    fn transmit(&mut self, _bytes: &[u8]) {}
}

/// Counts transfers and remembers the first LED of the last column sent.
#[derive(Debug, Clone, Default)]
pub struct CountingBus {
    columns: Arc<AtomicU64>,
    bytes: Arc<AtomicU64>,
    first_led: Arc<AtomicU32>,
}

impl CountingBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Columns transmitted so far.
    pub fn columns(&self) -> u64 {
        self.columns.load(Ordering::Relaxed)
    }

    /// Bytes transmitted so far.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// `[r, g, b]` of the top LED in the most recent column.
    pub fn first_led(&self) -> [u8; 3] {
        let [_, r, g, b] = self.first_led.load(Ordering::Relaxed).to_be_bytes();
        [r, g, b]
    }
}

impl OutputBus for CountingBus {
    fn transmit(&mut self, bytes: &[u8]) {
        self.columns.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        if let Some(led) = bytes.get(4..8) {
            let packed = u32::from_be_bytes([0, led[3], led[2], led[1]]);
            self.first_led.store(packed, Ordering::Relaxed);
        }
    }
}

// ── PixelClockDriver ─────────────────────────────────────────────

/// Something the edge source can call on every clock edge.
pub trait EdgeHandler: Send + Sync {
    fn on_edge(&self);
}

struct ScanState<B> {
    x: usize,
    front: ColumnFrame,
    back: ColumnFrame,
    staged: bool,
    bus: B,
}

/// Column scanner driven by clock edges. Shared between the edge context
/// and the controller through an `Arc`.
pub struct PixelClockDriver<B: OutputBus> {
    scan: Mutex<RefCell<ScanState<B>>>,
    armed: AtomicBool,
    need_frame: Signal<CriticalSectionRawMutex, ()>,
    pending: AtomicU32,
    scans: AtomicU64,
}

impl<B: OutputBus> std::fmt::Debug for PixelClockDriver<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelClockDriver")
            .field("armed", &self.is_armed())
            .field("scans", &self.scans())
            .finish()
    }
}

impl<B: OutputBus> PixelClockDriver<B> {
    /// A disarmed driver showing black.
    pub fn new(width: usize, leds: usize, bus: B) -> Self {
        Self {
            scan: Mutex::new(RefCell::new(ScanState {
                x: 0,
                front: ColumnFrame::new(width, leds),
                back: ColumnFrame::new(width, leds),
                staged: false,
                bus,
            })),
            armed: AtomicBool::new(false),
            need_frame: Signal::new(),
            pending: AtomicU32::new(0),
            scans: AtomicU64::new(0),
        }
    }

    /// Queue `frame` for display from the next wraparound.
    ///
    /// The buffers are swapped, so `frame` comes back holding stale data.
    pub fn stage(&self, frame: &mut ColumnFrame) {
        critical_section::with(|cs| {
            let mut scan = self.scan.borrow_ref_mut(cs);
            std::mem::swap(&mut scan.back, frame);
            scan.staged = true;
        });
    }

    /// Start scanning from column 0, showing the staged frame at once.
    pub fn arm(&self) {
        critical_section::with(|cs| {
            let mut scan = self.scan.borrow_ref_mut(cs);
            let scan = &mut *scan;
            scan.x = 0;
            if scan.staged {
                std::mem::swap(&mut scan.front, &mut scan.back);
                scan.staged = false;
            }
        });
        self.pending.store(0, Ordering::Relaxed);
        self.need_frame.reset();
        self.armed.store(true, Ordering::Release);
    }

    /// Ignore edges from now on.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
        critical_section::with(|cs| {
            let mut scan = self.scan.borrow_ref_mut(cs);
            scan.x = 0;
            scan.staged = false;
        });
        self.pending.store(0, Ordering::Relaxed);
        self.need_frame.reset();
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Completed scans since creation.
    pub fn scans(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    /// Column the next edge will transmit.
    pub fn column(&self) -> usize {
        critical_section::with(|cs| self.scan.borrow_ref(cs).x)
    }

    /// Resolves once at least one NEED_FRAME is pending, with the number of
    /// wraparounds since the last call.
    pub async fn need_frame(&self) -> u32 {
        loop {
            let wraps = self.pending.swap(0, Ordering::AcqRel);
            if wraps > 0 {
                return wraps;
            }
            self.need_frame.wait().await;
        }
    }

    /// Consume pending NEED_FRAMEs without waiting. Returns how many.
    pub fn take_need_frame(&self) -> u32 {
        self.need_frame.reset();
        self.pending.swap(0, Ordering::AcqRel)
    }
}

impl<B: OutputBus> EdgeHandler for PixelClockDriver<B> {
    fn on_edge(&self) {
        if !self.armed.load(Ordering::Acquire) {
            return;
        }
        let wrapped = critical_section::with(|cs| {
            let mut scan = self.scan.borrow_ref_mut(cs);
            let scan = &mut *scan;
            scan.bus.transmit(scan.front.column(scan.x));
            scan.x += 1;
            if scan.x < scan.front.width() {
                return false;
            }
            scan.x = 0;
            if scan.staged {
                std::mem::swap(&mut scan.front, &mut scan.back);
                scan.staged = false;
            }
            true
        });
        if wrapped {
            self.scans.fetch_add(1, Ordering::Relaxed);
            self.pending.fetch_add(1, Ordering::AcqRel);
            self.need_frame.signal(());
        }
    }
}

// ── Edge sources ─────────────────────────────────────────────────

/// The external clock plus its edge interrupt.
pub trait EdgeSource: Send {
    /// Start delivering edges to `handler`.
    fn attach(&mut self, handler: Arc<dyn EdgeHandler>);
    /// Stop delivering edges. Returns once no edge is in flight.
    fn detach(&mut self);
}

/// Host stand-in for the clock generator: a thread firing edges at a
/// fixed rate, catching up on late wakeups.
#[derive(Debug)]
pub struct SimulatedClock {
    period: Duration,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatedClock {
    /// A clock firing `hz` edges per second.
    pub fn new(hz: u32) -> Self {
        Self {
            period: Duration::from_secs(1) / hz.max(1),
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// A clock scanning a `width`-column slice `fps` times per second.
    pub fn for_scan(width: usize, fps: u32) -> Self {
        Self::new((width as u32).saturating_mul(fps))
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }
}

impl EdgeSource for SimulatedClock {
    fn attach(&mut self, handler: Arc<dyn EdgeHandler>) {
        self.detach();
        let stop = Arc::new(AtomicBool::new(false));
        self.stop = Arc::clone(&stop);
        let period = self.period;
        let spawned = std::thread::Builder::new()
            .name("ledwall-clock".into())
            .spawn(move || {
                let mut due = Instant::now();
                while !stop.load(Ordering::Acquire) {
                    due += period;
                    let now = Instant::now();
                    if due > now {
                        std::thread::sleep(due - now);
                    }
                    handler.on_edge();
                }
            });
        match spawned {
            Ok(thread) => self.thread = Some(thread),
            Err(e) => tracing::error!("cannot start simulated clock: {e}"),
        }
    }

    fn detach(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SimulatedClock {
    fn drop(&mut self) {
        self.detach();
    }
}

// ── Tests ────────────────────────────────────────────────────────
