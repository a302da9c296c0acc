use std::{
    fmt::Debug,
    sync::{Condvar, Mutex},
};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("barrier cancelled")]
pub struct CancelledBarrier;

/// Rendezvous point for all shards/processes of a group.
///
/// `wait` blocks until every participant has arrived or the barrier has been
/// cancelled. A cancelled barrier stays cancelled (every subsequent `wait`
/// returns `Err`) until `reset` is called.
pub trait Barrier: Send + Sync + Debug {
    fn wait(&self) -> Result<(), CancelledBarrier>;
    fn cancel(&self);
    fn reset(&self);
    fn is_cancelled(&self) -> bool;
}

/// Barrier for single-process, single-shard runs; `wait` always succeeds.
#[derive(Debug, Default)]
pub struct NopBarrier;

impl Barrier for NopBarrier {
    fn wait(&self) -> Result<(), CancelledBarrier> {
        Ok(())
    }

    fn cancel(&self) {}

    fn reset(&self) {}

    fn is_cancelled(&self) -> bool {
        false
    }
}

#[derive(Debug)]
struct LocalBarrierState {
    arrived: usize,
    generation: u64,
    cancelled: bool,
}

/// Reusable in-process barrier for `participants` threads.
#[derive(Debug)]
pub struct LocalBarrier {
    participants: usize,
    state: Mutex<LocalBarrierState>,
    condvar: Condvar,
}

impl LocalBarrier {
    pub fn new(participants: usize) -> Self {
        assert!(participants > 0, "barrier needs at least one participant");
        Self {
            participants,
            state: Mutex::new(LocalBarrierState {
                arrived: 0,
                generation: 0,
                cancelled: false,
            }),
            condvar: Condvar::new(),
        }
    }
}

impl Barrier for LocalBarrier {
    fn wait(&self) -> Result<(), CancelledBarrier> {
        let mut state = self.state.lock().unwrap();
        if state.cancelled {
            return Err(CancelledBarrier);
        }
        state.arrived += 1;
        if state.arrived == self.participants {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.condvar.notify_all();
            return Ok(());
        }
        let generation = state.generation;
        while state.generation == generation && !state.cancelled {
            state = self.condvar.wait(state).unwrap();
        }
        if state.cancelled {
            Err(CancelledBarrier)
        } else {
            Ok(())
        }
    }

    fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        state.cancelled = true;
        state.arrived = 0;
        self.condvar.notify_all();
    }

    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.cancelled = false;
        state.arrived = 0;
        state.generation = state.generation.wrapping_add(1);
        self.condvar.notify_all();
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn nop_barrier_always_passes() {
        let barrier = NopBarrier;
        assert!(barrier.wait().is_ok());
        barrier.cancel();
        assert!(barrier.wait().is_ok());
        assert!(!barrier.is_cancelled());
    }

    #[test]
    fn local_barrier_releases_all_participants() {
        let barrier = Arc::new(LocalBarrier::new(3));
        let mut handles = Vec::new();
        for _ in 0..2 {
            let barrier = barrier.clone();
            handles.push(std::thread::spawn(move || barrier.wait()));
        }
        assert!(barrier.wait().is_ok());
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
    }

    #[test]
    fn cancelled_barrier_fails_until_reset() {
        let barrier = LocalBarrier::new(1);
        barrier.cancel();
        assert_eq!(barrier.wait(), Err(CancelledBarrier));
        assert!(barrier.is_cancelled());
        barrier.reset();
        assert!(barrier.wait().is_ok());
    }
}
