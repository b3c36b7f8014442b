//! Frame advance on the reader side of the jitter buffer.
//!
//! Each NEED_FRAME either shows the next buffered frame or, when the
//! buffer ran dry, repeats the previous one and counts a drop. When frames
//! are back, the backlog built up during the drops is skipped so the slice
//! catches up with the rest of the wall instead of lagging forever.

use ledwall_core::FrameReader;

use crate::clock::ColumnFrame;
use crate::error::DeviceError;

/// Outcome of one advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// A new frame was loaded; `skipped` stale frames were dropped to catch up.
    Shown { skipped: usize },
    /// Nothing buffered; the previous frame stays up. `drops` in a row so far.
    Repeated { drops: u32 },
}

/// Reader half of a jitter buffer plus underrun bookkeeping.
#[derive(Debug)]
pub struct Playout {
    reader: FrameReader,
    drop_count: u32,
    max_drops: u32,
}

impl Playout {
    /// `max_drops` consecutive empty ticks are tolerated; one more is fatal.
    pub fn new(reader: FrameReader, max_drops: u32) -> Self {
        Self {
            reader,
            drop_count: 0,
            max_drops,
        }
    }

    pub fn level(&self) -> usize {
        self.reader.level()
    }

    pub fn depth(&self) -> usize {
        self.reader.depth()
    }

    pub fn is_full(&self) -> bool {
        self.reader.is_full()
    }

    /// Consecutive ticks without a frame.
    pub fn drop_count(&self) -> u32 {
        self.drop_count
    }

    /// Advance one tick, encoding the next frame into `out` if there is one.
    ///
    /// Fails with [`DeviceError::FatalUnderrun`] once more than `max_drops`
    /// ticks in a row found the buffer empty.
    pub fn advance(&mut self, out: &mut ColumnFrame) -> Result<Advance, DeviceError> {
        let Some(front) = self.reader.front() else {
            self.drop_count += 1;
            if self.drop_count > self.max_drops {
                return Err(DeviceError::FatalUnderrun {
                    drops: self.drop_count,
                });
            }
            return Ok(Advance::Repeated {
                drops: self.drop_count,
            });
        };

        out.load(front)?;
        self.reader.pop()?;

        let skipped = match self.drop_count {
            0 => 0,
            n => self.reader.ffwd(n as usize),
        };
        self.drop_count = 0;
        Ok(Advance::Shown { skipped })
    }
}

// ── Tests ────────────────────────────────────────────────────────
