//! Render loop.
//!
//! Runs on its own OS thread: draws each frame into a fresh canvas and
//! pushes it into the [`FrameStore`] with consecutive sequence numbers.
//! The store's backpressure sets the pace; a cancelled store ends the loop.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tracing::{debug, info};

use ledwall_core::{Canvas, FrameStore, StoreError, WallGeometry};

use crate::config::EffectConfig;
use crate::effect::{Effect, TestGrid};

/// One playlist entry.
pub struct Act {
    pub effect: Box<dyn Effect>,
    pub duration: Duration,
}

impl std::fmt::Debug for Act {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Act")
            .field("effect", &self.effect.name())
            .field("duration", &self.duration)
            .finish()
    }
}

/// Looping effect playlist.
#[derive(Debug)]
pub struct Show {
    acts: Vec<Act>,
}

impl Show {
    pub fn new(acts: Vec<Act>) -> Self {
        Self { acts }
    }

    /// Build the playlist from configuration. An empty list shows the
    /// test grid forever.
    pub fn from_config(effects: &[EffectConfig]) -> Self {
        if effects.is_empty() {
            return Self::new(vec![Act {
                effect: Box::new(TestGrid),
                duration: Duration::MAX,
            }]);
        }
        let acts = effects
            .iter()
            .map(|e| Act {
                effect: e.name.build(e.color),
                duration: Duration::from_secs(e.seconds.max(1)),
            })
            .collect();
        Self::new(acts)
    }

    pub fn len(&self) -> usize {
        self.acts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acts.is_empty()
    }
}

// ── Renderer ─────────────────────────────────────────────────────

/// Producer side of the frame store.
#[derive(Debug)]
pub struct Renderer {
    store: Arc<FrameStore>,
    geometry: WallGeometry,
    show: Show,
    seq: u64,
}

impl Renderer {
    pub fn new(store: Arc<FrameStore>, geometry: WallGeometry, show: Show) -> Self {
        Self {
            store,
            geometry,
            show,
            seq: 0,
        }
    }

    /// Next sequence number to be pushed.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Play the show until the store is cancelled. Returns the number of
    /// frames pushed.
    pub async fn run(mut self) -> u64 {
        if self.show.is_empty() {
            return 0;
        }
        let mut acts = std::mem::take(&mut self.show.acts);
        loop {
            for act in &mut acts {
                info!(effect = act.effect.name(), seconds = act.duration.as_secs(), "playing");
                if self.play(act).await.is_err() {
                    debug!(frames = self.seq, "render loop cancelled");
                    return self.seq;
                }
            }
        }
    }

    /// Render `act` for its duration.
    async fn play(&mut self, act: &mut Act) -> Result<(), StoreError> {
        let started = Instant::now();
        let mut frame_no = 0u64;
        while started.elapsed() < act.duration {
            let mut canvas = Canvas::new(self.geometry);
            act.effect.draw(frame_no, &mut canvas);
            self.store.push(self.seq, canvas.freeze()).await?;
            self.seq += 1;
            frame_no += 1;
        }
        Ok(())
    }

    /// Run on a dedicated thread, driving store waits through `runtime`.
    pub fn spawn(self, runtime: Handle) -> std::io::Result<JoinHandle<u64>> {
        std::thread::Builder::new()
            .name("ledwall-render".into())
            .spawn(move || runtime.block_on(self.run()))
    }
}

// ── Tests ────────────────────────────────────────────────────────
