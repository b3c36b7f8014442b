//! Bounded, reference-counted frame backlog shared by every session.
//!
//! The producer pushes frames with consecutive sequence numbers; every
//! subscribed consumer pops each sequence exactly once. An entry starts
//! with one reference per consumer and is erased by the last pop. The
//! backlog never holds more than `max_frames` entries, so a stalled
//! consumer stalls the producer instead of letting memory grow.
//!
//! One mutex guards the backlog and one [`Notify`] acts as its condition
//! variable; waiters re-check their predicate after every wakeup.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::error::StoreError;
use crate::frame::Frame;

/// Default backlog bound.
pub const DEFAULT_MAX_FRAMES: usize = 16;

#[derive(Debug)]
struct Entry {
    frame: Frame,
    refs: usize,
}

#[derive(Debug, Default)]
struct Inner {
    frames: BTreeMap<u64, Entry>,
    /// References given to each newly pushed entry.
    consumers: usize,
    /// Sequence number the next push is expected to carry.
    next_seq: u64,
    cancelled: bool,
}

/// Multi-consumer frame backlog. See the module docs.
#[derive(Debug)]
pub struct FrameStore {
    inner: Mutex<Inner>,
    cond: Notify,
    max_frames: usize,
}

impl FrameStore {
    /// A store holding at most `max_frames` un-retired entries.
    ///
    /// # Panics
    ///
    /// Panics if `max_frames` is zero.
    pub fn new(max_frames: usize) -> Self {
        assert!(max_frames > 0, "frame store needs room for one frame");
        Self {
            inner: Mutex::new(Inner::default()),
            cond: Notify::new(),
            max_frames,
        }
    }

    pub fn max_frames(&self) -> usize {
        self.max_frames
    }

    /// Un-retired entries currently held.
    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence number the next push is expected to carry.
    pub fn next_seq(&self) -> u64 {
        self.lock().next_seq
    }

    /// References each new entry starts with.
    pub fn consumers(&self) -> usize {
        self.lock().consumers
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Add frame `seq`, waiting while the backlog is full.
    pub async fn push(&self, seq: u64, frame: Frame) -> Result<(), StoreError> {
        let max = self.max_frames;
        let mut frame = Some(frame);
        self.wait_until(|inner| {
            if inner.cancelled {
                return Some(Err(StoreError::Cancelled));
            }
            if inner.frames.len() >= max {
                return None;
            }
            if let Some(frame) = frame.take() {
                let refs = inner.consumers;
                inner.frames.insert(seq, Entry { frame, refs });
                inner.next_seq = seq + 1;
            }
            Some(Ok(()))
        })
        .await?;
        self.cond.notify_waiters();
        Ok(())
    }

    /// Take this consumer's reference to frame `seq`, waiting until it has
    /// been pushed. The entry is erased when the last reference goes.
    pub async fn pop(&self, seq: u64) -> Result<Frame, StoreError> {
        let (frame, retired) = self
            .wait_until(|inner| {
                if inner.cancelled {
                    return Some(Err(StoreError::Cancelled));
                }
                if seq >= inner.next_seq {
                    return None;
                }
                let Some(entry) = inner.frames.get_mut(&seq) else {
                    // Already discarded by a gate change.
                    return Some(Err(StoreError::Closed(seq)));
                };
                entry.refs = entry.refs.saturating_sub(1);
                let frame = entry.frame.clone();
                let retired = entry.refs == 0;
                if retired {
                    inner.frames.remove(&seq);
                }
                Some(Ok((frame, retired)))
            })
            .await?;
        if retired {
            self.cond.notify_waiters();
        }
        Ok(frame)
    }

    /// Start a fan-out cycle for `consumers` sessions.
    ///
    /// Discards the backlog and returns the sequence number every session
    /// should start popping from.
    pub fn open(&self, consumers: usize) -> u64 {
        let start = {
            let mut inner = self.lock();
            inner.frames.clear();
            inner.consumers = consumers;
            inner.next_seq
        };
        self.cond.notify_waiters();
        start
    }

    /// End the current fan-out cycle: no consumers, backlog discarded.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            inner.frames.clear();
            inner.consumers = 0;
        }
        self.cond.notify_waiters();
    }

    /// Wake every waiter with [`StoreError::Cancelled`]. Irreversible.
    pub fn cancel(&self) {
        self.lock().cancelled = true;
        self.cond.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Evaluate `ready` under the lock until it yields a value, sleeping on
    /// the condition in between. The waiter is registered before the check
    /// so a notification between check and sleep is not lost.
    async fn wait_until<T>(&self, mut ready: impl FnMut(&mut Inner) -> Option<T>) -> T {
        loop {
            let notified = self.cond.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let out = {
                let mut inner = self.lock();
                ready(&mut inner)
            };
            if let Some(out) = out {
                return out;
            }
            notified.await;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
