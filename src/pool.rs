//! Outbound Call Pool
//!
//! Counting semaphore bounding concurrent generative-service calls across
//! all jobs. Waiters are admitted in FIFO order; the limit can be changed
//! at runtime and applies to future admissions. Release is guard-based so
//! every exit path gives the slot back.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

struct PoolState {
    limit: usize,
    in_flight: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// FIFO counting semaphore for outbound calls
#[derive(Clone)]
pub struct CallPool {
    state: Arc<Mutex<PoolState>>,
}

impl CallPool {
    pub fn new(limit: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState {
                limit: limit.max(1),
                in_flight: 0,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Suspend until fewer than the limit are in flight, then admit.
    ///
    /// The returned permit releases its slot on drop.
    pub async fn acquire(&self) -> PoolPermit {
        let rx = {
            let mut state = self.state.lock();
            if state.in_flight < state.limit {
                state.in_flight += 1;
                return PoolPermit {
                    state: Arc::clone(&self.state),
                };
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        // The releasing side transfers the slot before signalling, so a
        // successful recv means this caller is already admitted.
        rx.await.expect("call pool dropped while waiting");
        PoolPermit {
            state: Arc::clone(&self.state),
        }
    }

    /// Change the admission limit for future acquisitions, clamped to ≥1.
    pub fn set_limit(&self, limit: usize) {
        let mut state = self.state.lock();
        state.limit = limit.max(1);
        debug!(limit = state.limit, "call pool limit changed");
        // A raised limit admits queued waiters immediately.
        while state.in_flight < state.limit {
            match state.waiters.pop_front() {
                Some(tx) => {
                    state.in_flight += 1;
                    if tx.send(()).is_err() {
                        state.in_flight -= 1;
                    }
                }
                None => break,
            }
        }
    }

    /// Currently admitted call count.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    pub fn limit(&self) -> usize {
        self.state.lock().limit
    }
}

/// Admission slot; releases back to the pool on drop.
pub struct PoolPermit {
    state: Arc<Mutex<PoolState>>,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.in_flight <= state.limit {
            // Hand the slot to the next FIFO waiter without retiring it.
            while let Some(tx) = state.waiters.pop_front() {
                if tx.send(()).is_ok() {
                    return;
                }
            }
        }
        state.in_flight -= 1;
    }
}
