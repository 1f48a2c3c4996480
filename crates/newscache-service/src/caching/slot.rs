//! The per-key state of the cache directory.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::fs::StableFile;
use super::stream::GenerationStream;
use super::CacheError;

/// What a slot currently exposes to its callers.
///
/// States only ever move forward: `Empty`, then `Generating`, then `Ready`. `Failed` and
/// `Restart` are final and can be reached from every other state.
#[derive(Debug, Clone)]
pub enum SlotState {
    /// Nothing was published yet.
    Empty,
    /// A generation is writing into the stream.
    Generating(Arc<GenerationStream>),
    /// The stable file is published and open.
    Ready(Arc<StableFile>),
    /// Generating or publishing the object failed.
    Failed(CacheError),
    /// The slot is moot and callers have to start over with a fresh one.
    Restart,
}

impl SlotState {
    fn rank(&self) -> u8 {
        match self {
            Self::Empty => 0,
            Self::Generating(_) => 1,
            Self::Ready(_) => 2,
            Self::Failed(_) | Self::Restart => 3,
        }
    }

    /// Whether the slot will not produce anything beyond this state.
    pub fn is_settled(&self) -> bool {
        self.rank() >= 2
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Generating(_) => "generating",
            Self::Ready(_) => "ready",
            Self::Failed(_) => "failed",
            Self::Restart => "restart",
        }
    }
}

#[derive(Debug)]
struct SlotInner {
    /// Number of callers that are attached to this slot.
    refcount: usize,
    state: SlotState,
}

/// One logical cached object.
///
/// A slot is reachable from the directory only while its refcount is positive. Once the
/// refcount dropped to zero it never rises again, which is what lets a racing caller detect
/// a slot that is being torn down.
#[derive(Debug)]
pub struct Slot {
    inner: Mutex<SlotInner>,
    changed: Condvar,
}

impl Slot {
    /// Creates an empty slot that is held by its creator.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                refcount: 1,
                state: SlotState::Empty,
            }),
            changed: Condvar::new(),
        }
    }

    /// Attaches another caller, unless the slot is already being torn down.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.refcount == 0 {
            return false;
        }
        inner.refcount += 1;
        true
    }

    /// Detaches a caller.
    ///
    /// Returns `true` for the caller that brought the refcount to zero, which is then
    /// responsible for removing the slot from the directory.
    pub fn release(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.refcount {
            // forcibly drained or finished as an invalidation placeholder
            0 => false,
            1 => {
                inner.refcount = 0;
                self.changed.notify_all();
                true
            }
            _ => {
                inner.refcount -= 1;
                false
            }
        }
    }

    pub fn refcount(&self) -> usize {
        self.inner.lock().refcount
    }

    pub fn state(&self) -> SlotState {
        self.inner.lock().state.clone()
    }

    /// Moves the slot to `state` and wakes everybody waiting on it.
    ///
    /// Backward moves are refused and logged.
    pub fn publish(&self, state: SlotState) {
        let mut inner = self.inner.lock();
        Self::transition(&mut inner, state);
        self.changed.notify_all();
    }

    /// Publishes a freshly opened stable file, unless everybody already left.
    ///
    /// In that case nobody would ever close the file again, so the slot turns moot instead.
    pub fn publish_ready(&self, file: StableFile) {
        let mut inner = self.inner.lock();
        let state = if inner.refcount == 0 {
            SlotState::Restart
        } else {
            SlotState::Ready(Arc::new(file))
        };
        Self::transition(&mut inner, state);
        self.changed.notify_all();
    }

    fn transition(inner: &mut SlotInner, state: SlotState) {
        if state.rank() <= inner.state.rank() {
            tracing::warn!(
                from = inner.state.name(),
                to = state.name(),
                "Refusing cache slot transition"
            );
            return;
        }
        tracing::trace!(
            from = inner.state.name(),
            to = state.name(),
            "Cache slot transition"
        );
        inner.state = state;
    }

    /// Blocks until the slot published something other than [`SlotState::Empty`].
    pub fn wait_published(&self) -> SlotState {
        let mut inner = self.inner.lock();
        while matches!(inner.state, SlotState::Empty) {
            self.changed.wait(&mut inner);
        }
        inner.state.clone()
    }

    /// Blocks until the slot reached `Ready`, `Failed` or `Restart`.
    pub fn wait_settled(&self) -> SlotState {
        let mut inner = self.inner.lock();
        while !inner.state.is_settled() {
            self.changed.wait(&mut inner);
        }
        inner.state.clone()
    }

    /// Waits for all callers to detach, for at most `timeout`.
    ///
    /// Returns `false` if callers were still attached when the time ran out.
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.refcount > 0 {
            if self.changed.wait_until(&mut inner, deadline).timed_out() {
                return inner.refcount == 0;
            }
        }
        true
    }

    /// Closes the stable file under remaining readers and fails the slot.
    ///
    /// The refcount is reset, so later detaches of those readers are no-ops.
    pub fn force_fail(&self, err: CacheError) {
        let file = {
            let mut inner = self.inner.lock();
            let file = match &inner.state {
                SlotState::Ready(file) => Some(Arc::clone(file)),
                _ => None,
            };
            inner.refcount = 0;
            Self::transition(&mut inner, SlotState::Failed(err));
            self.changed.notify_all();
            file
        };
        if let Some(file) = file {
            file.close();
        }
    }

    /// Turns an invalidation placeholder into a moot slot that nobody holds.
    pub fn retire(&self) {
        let mut inner = self.inner.lock();
        inner.refcount = 0;
        Self::transition(&mut inner, SlotState::Restart);
        self.changed.notify_all();
    }

    /// Releases the stable file handle, if one is held.
    pub fn close_file(&self) {
        if let SlotState::Ready(file) = self.state() {
            file.close();
        }
    }
}
