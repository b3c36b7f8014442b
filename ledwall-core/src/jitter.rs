//! Fixed-depth ring of whole frames between network delivery and
//! clock-paced playout.
//!
//! ```text
//!            FrameWriter                      FrameReader
//!   socket ──► next() ─ fill ─► push() ──► front() ─ load ─► pop()/ffwd()
//!                    slot (w+1) % D            slot r
//! ```
//!
//! The buffer is created as a split pair so exactly one writer (the
//! fetcher) and one reader (the playout side) exist. Slot memory is never
//! shared: the writer only touches the slot after the last committed one,
//! the reader only touches committed slots, and the cursors that separate
//! them live behind a `critical_section` guard. That guard is non-blocking
//! and O(1), so the reader side may run in interrupt context.

use std::cell::{Cell, UnsafeCell};
use std::sync::Arc;

use critical_section::Mutex;

use crate::error::BufferError;

#[derive(Debug, Clone, Copy)]
struct Cursors {
    /// Oldest committed slot.
    r: usize,
    /// Last committed slot.
    w: usize,
    /// Committed slots.
    level: usize,
}

/// Shared core of a jitter buffer. Obtain one through [`channel`].
pub struct JitterBuffer {
    slots: Box<[UnsafeCell<Box<[u8]>>]>,
    frame_len: usize,
    cursors: Mutex<Cell<Cursors>>,
}

// SAFETY: slot access is partitioned by the cursors. The single writer only
// dereferences slot `(w + 1) % depth` while `level < depth`, which is never in
// the committed range `[r, r + level)` the single reader may dereference.
// Cursor updates happen inside a critical section.
unsafe impl Sync for JitterBuffer {}

impl std::fmt::Debug for JitterBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let c = self.cursors();
        f.debug_struct("JitterBuffer")
            .field("depth", &self.depth())
            .field("frame_len", &self.frame_len)
            .field("r", &c.r)
            .field("w", &c.w)
            .field("level", &c.level)
            .finish()
    }
}

impl JitterBuffer {
    /// Number of frame slots.
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Bytes per frame slot.
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Committed frames waiting for playout.
    pub fn level(&self) -> usize {
        self.cursors().level
    }

    fn cursors(&self) -> Cursors {
        critical_section::with(|cs| self.cursors.borrow(cs).get())
    }

    /// Run `f` on the cursors inside the critical section, storing the
    /// result back only if `f` succeeds.
    fn update<T>(
        &self,
        f: impl FnOnce(&mut Cursors, usize) -> Result<T, BufferError>,
    ) -> Result<T, BufferError> {
        let depth = self.depth();
        critical_section::with(|cs| {
            let cell = self.cursors.borrow(cs);
            let mut c = cell.get();
            let out = f(&mut c, depth)?;
            cell.set(c);
            Ok(out)
        })
    }
}

/// Create a jitter buffer of `depth` slots, each `frame_len` bytes.
///
/// # Panics
///
/// Panics if `depth` or `frame_len` is zero.
pub fn channel(depth: usize, frame_len: usize) -> (FrameWriter, FrameReader) {
    assert!(depth > 0, "jitter buffer depth must be non-zero");
    assert!(frame_len > 0, "jitter buffer frame length must be non-zero");

    let slots = (0..depth)
        .map(|_| UnsafeCell::new(vec![0u8; frame_len].into_boxed_slice()))
        .collect();
    let shared = Arc::new(JitterBuffer {
        slots,
        frame_len,
        // w = last committed, so the first slot handed out by next() is r.
        cursors: Mutex::new(Cell::new(Cursors {
            r: 1 % depth,
            w: 0,
            level: 0,
        })),
    });
    (
        FrameWriter {
            shared: Arc::clone(&shared),
        },
        FrameReader { shared },
    )
}

// ── FrameWriter ──────────────────────────────────────────────────

/// Producer half: fills slots in place and commits them.
#[derive(Debug)]
pub struct FrameWriter {
    shared: Arc<JitterBuffer>,
}

impl FrameWriter {
    /// The slot the next committed frame will occupy, for an in-place read.
    ///
    /// Fails with [`BufferError::Overrun`] when the buffer is full; a
    /// writer that respects `level() < depth()` never sees that.
    pub fn next(&mut self) -> Result<&mut [u8], BufferError> {
        let c = self.shared.cursors();
        if c.level == self.shared.depth() {
            return Err(BufferError::Overrun);
        }
        let slot = (c.w + 1) % self.shared.depth();
        // SAFETY: `slot` is outside the committed range (level < depth) and
        // the reader can only shrink that range, so no reader reference to
        // it exists or can be created until push() commits it. `&mut self`
        // keeps this the only writer reference.
        Ok(unsafe { &mut **self.shared.slots[slot].get() })
    }

    /// Commit the slot returned by [`next`](Self::next).
    pub fn push(&mut self) -> Result<(), BufferError> {
        self.shared.update(|c, depth| {
            if c.level == depth {
                return Err(BufferError::Overrun);
            }
            c.w = (c.w + 1) % depth;
            c.level += 1;
            Ok(())
        })
    }

    pub fn level(&self) -> usize {
        self.shared.level()
    }

    pub fn depth(&self) -> usize {
        self.shared.depth()
    }

    pub fn is_full(&self) -> bool {
        self.level() == self.depth()
    }

    pub fn frame_len(&self) -> usize {
        self.shared.frame_len()
    }
}

// ── FrameReader ──────────────────────────────────────────────────

/// Consumer half: reads the oldest committed frame and retires it.
#[derive(Debug)]
pub struct FrameReader {
    shared: Arc<JitterBuffer>,
}

impl FrameReader {
    /// The next frame to display, or `None` when the buffer is empty.
    pub fn front(&self) -> Option<&[u8]> {
        let c = self.shared.cursors();
        if c.level == 0 {
            return None;
        }
        // SAFETY: slot r is committed; the writer does not touch it until
        // it is retired by pop()/ffwd(), which need `&mut self` and so
        // cannot run while this borrow is alive.
        Some(unsafe { &**self.shared.slots[c.r].get() })
    }

    /// Retire the front frame.
    pub fn pop(&mut self) -> Result<(), BufferError> {
        self.shared.update(|c, depth| {
            if c.level == 0 {
                return Err(BufferError::Underrun);
            }
            c.r = (c.r + 1) % depth;
            c.level -= 1;
            Ok(())
        })
    }

    /// Skip up to `n` frames of backlog without returning them, always
    /// leaving at least one frame available. Returns the number skipped.
    pub fn ffwd(&mut self, n: usize) -> usize {
        self.shared
            .update(|c, depth| {
                if c.level == 0 {
                    return Ok(0);
                }
                let skip = n.min(c.level - 1);
                c.r = (c.r + skip) % depth;
                c.level -= skip;
                Ok(skip)
            })
            .unwrap_or(0)
    }

    pub fn level(&self) -> usize {
        self.shared.level()
    }

    pub fn depth(&self) -> usize {
        self.shared.depth()
    }

    pub fn is_full(&self) -> bool {
        self.level() == self.depth()
    }

    pub fn frame_len(&self) -> usize {
        self.shared.frame_len()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(writer: &mut FrameWriter, tag: u8) {
        writer.next().unwrap().fill(tag);
        writer.push().unwrap();
    }

    #[test]
    fn fresh_buffer_is_empty() {
        let (w, mut r) = channel(4, 8);
        assert_eq!(w.level(), 0);
        assert_eq!(r.depth(), 4);
        assert!(r.front().is_none());
        assert_eq!(r.pop(), Err(BufferError::Underrun));
    }

    #[test]
    fn written_frame_reads_back_identical() {
        let (mut w, mut r) = channel(3, 16);
        for round in 0..10u8 {
            let slot = w.next().unwrap();
            for (i, b) in slot.iter_mut().enumerate() {
                *b = round.wrapping_mul(31).wrapping_add(i as u8);
            }
            w.push().unwrap();

            let front = r.front().unwrap();
            let expected: Vec<u8> = (0..16)
                .map(|i| round.wrapping_mul(31).wrapping_add(i as u8))
                .collect();
            assert_eq!(front, &expected[..]);
            r.pop().unwrap();
        }
    }

    #[test]
    fn fifo_order_across_wraparound() {
        let (mut w, mut r) = channel(4, 1);
        let mut next_tag = 0u8;
        let mut expect = 0u8;
        for _ in 0..5 {
            while !w.is_full() {
                fill(&mut w, next_tag);
                next_tag += 1;
            }
            for _ in 0..3 {
                assert_eq!(r.front().unwrap()[0], expect);
                r.pop().unwrap();
                expect += 1;
            }
        }
    }

    #[test]
    fn overrun_is_reported() {
        let (mut w, _r) = channel(2, 1);
        fill(&mut w, 1);
        fill(&mut w, 2);
        assert_eq!(w.next().unwrap_err(), BufferError::Overrun);
        assert_eq!(w.push(), Err(BufferError::Overrun));
        assert_eq!(w.level(), 2);
    }

    #[test]
    fn level_stays_in_bounds_for_mixed_sequences() {
        let depth = 5;
        let (mut w, mut r) = channel(depth, 2);
        let mut seed = 0x2545_f491_u32;
        let mut model = 0usize;
        for _ in 0..2000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if seed % 2 == 0 {
                let res = w.push();
                if model == depth {
                    assert_eq!(res, Err(BufferError::Overrun));
                } else {
                    res.unwrap();
                    model += 1;
                }
            } else {
                let res = r.pop();
                if model == 0 {
                    assert_eq!(res, Err(BufferError::Underrun));
                } else {
                    res.unwrap();
                    model -= 1;
                }
            }
            assert_eq!(r.level(), model);
            assert!(r.level() <= depth);
        }
    }

    #[test]
    fn ffwd_skips_min_of_n_and_level_minus_one() {
        for level in 1..=6usize {
            for n in 0..9usize {
                let (mut w, mut r) = channel(6, 1);
                for tag in 0..level {
                    fill(&mut w, tag as u8);
                }
                let skipped = r.ffwd(n);
                assert_eq!(skipped, n.min(level - 1));
                assert_eq!(r.level(), level - skipped);
                assert!(r.level() >= 1);
                assert_eq!(r.front().unwrap()[0], skipped as u8);
            }
        }
    }

    #[test]
    fn ffwd_on_empty_is_noop() {
        let (_w, mut r) = channel(4, 1);
        assert_eq!(r.ffwd(3), 0);
        assert_eq!(r.level(), 0);
    }

    #[test]
    fn depth_one_buffer() {
        let (mut w, mut r) = channel(1, 4);
        fill(&mut w, 7);
        assert!(w.is_full());
        assert_eq!(r.front().unwrap(), &[7, 7, 7, 7]);
        r.pop().unwrap();
        fill(&mut w, 9);
        assert_eq!(r.front().unwrap(), &[9, 9, 9, 9]);
    }

    #[test]
    fn concurrent_writer_and_reader_see_identical_frames() {
        const FRAMES: u32 = 5000;
        let (mut w, mut r) = channel(8, 64);

        let producer = std::thread::spawn(move || {
            let mut n = 0u32;
            while n < FRAMES {
                if w.is_full() {
                    std::thread::yield_now();
                    continue;
                }
                let slot = w.next().unwrap();
                for chunk in slot.chunks_exact_mut(4) {
                    chunk.copy_from_slice(&n.to_le_bytes());
                }
                w.push().unwrap();
                n += 1;
            }
        });

        let mut expect = 0u32;
        while expect < FRAMES {
            let Some(front) = r.front() else {
                std::thread::yield_now();
                continue;
            };
            for chunk in front.chunks_exact(4) {
                assert_eq!(u32::from_le_bytes(chunk.try_into().unwrap()), expect);
            }
            r.pop().unwrap();
            expect += 1;
        }
        producer.join().unwrap();
    }
}
