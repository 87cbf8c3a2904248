//! Sync state: the shared `[exit, sync_request, step]` triple
//!
//! One segment per producer/consumer pair. The step counter is the only
//! "new frame" signal the consumer uses; the two flags coordinate the
//! per-step rendezvous and the cooperative shutdown. Writer discipline:
//! the producer writes `sync_request` and advances `step`; either side may
//! raise `exit`, once, to request shutdown.

use crate::error::Result;
use crate::shm::{self, ShmSegment};
use std::sync::atomic::{AtomicU64, Ordering};

#[repr(C)]
struct SyncBlock {
    exit: AtomicU64,
    sync_request: AtomicU64,
    step: AtomicU64,
}

/// Handle to the sync-state segment
pub struct SyncState {
    segment: ShmSegment,
}

// SAFETY: all access to the mapped block goes through atomics.
unsafe impl Send for SyncState {}
unsafe impl Sync for SyncState {}

impl SyncState {
    /// Create the segment (producer side); all three slots start at zero
    pub fn create() -> Result<Self> {
        let name = shm::unique_name("sync");
        let segment = ShmSegment::create(&name, std::mem::size_of::<SyncBlock>())?;
        Ok(Self { segment })
    }

    /// Open the segment advertised in the handshake (consumer side)
    pub fn open(name: &str) -> Result<Self> {
        let segment = ShmSegment::open(name)?;
        Ok(Self { segment })
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// False once either side has requested shutdown
    pub fn is_open(&self) -> bool {
        !self.exit_requested()
    }

    pub fn exit_requested(&self) -> bool {
        self.block().exit.load(Ordering::Acquire) != 0
    }

    pub fn request_exit(&self) {
        self.block().exit.store(1, Ordering::Release);
    }

    pub fn sync_requested(&self) -> bool {
        self.block().sync_request.load(Ordering::Acquire) != 0
    }

    pub fn set_sync_request(&self, on: bool) {
        self.block().sync_request.store(on as u64, Ordering::Release);
    }

    /// Live step counter
    pub fn step(&self) -> u64 {
        self.block().step.load(Ordering::Acquire)
    }

    /// Increment the step counter by exactly 1 (producer only)
    pub fn advance_step(&self) -> u64 {
        self.block().step.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Remove the segment name (producer side, idempotent)
    pub fn unlink(&mut self) {
        self.segment.unlink();
    }

    fn block(&self) -> &SyncBlock {
        // SAFETY: the segment is sized to SyncBlock at creation and the
        // mapping lives as long as self; mmap returns page-aligned memory.
        unsafe { &*(self.segment.as_ptr() as *const SyncBlock) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_and_flags() {
        let state = SyncState::create().unwrap();
        let mirror = SyncState::open(state.name()).unwrap();

        assert!(state.is_open());
        assert_eq!(mirror.step(), 0);

        assert_eq!(state.advance_step(), 1);
        assert_eq!(state.advance_step(), 2);
        assert_eq!(mirror.step(), 2);

        state.set_sync_request(true);
        assert!(mirror.sync_requested());
        state.set_sync_request(false);
        assert!(!mirror.sync_requested());

        // Either side may raise the exit flag.
        mirror.request_exit();
        assert!(!state.is_open());
    }
}
