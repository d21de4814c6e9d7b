//! Per-device shared state: submission-queue grants, the outstanding-response
//! counter, and the DMA address allocators.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use kestrel_device::DramWindow;

use crate::error::EngineError;

/// Upper bound on a single blocking wait so deadline and abort flags are
/// re-checked at a reasonable cadence.
pub(crate) const WAIT_SLICE: Duration = Duration::from_millis(50);

pub(crate) struct DeviceState {
    window: DramWindow,
    /// Bit N set: the listener observed free slots on submission queue N.
    /// Dispatchers consume grants one queue at a time.
    sq_grants: Mutex<u64>,
    cv: Condvar,
    pub abort: AtomicBool,
    /// Responses still owed by the device in the current phase. Superseded
    /// commands are not counted.
    expected_rsps: AtomicI64,
    pub listener_done: AtomicBool,
    dma_write: Mutex<u64>,
    dma_read: Mutex<u64>,
}

impl DeviceState {
    pub fn new(window: DramWindow) -> DeviceState {
        DeviceState {
            window,
            sq_grants: Mutex::new(0),
            cv: Condvar::new(),
            abort: AtomicBool::new(false),
            expected_rsps: AtomicI64::new(0),
            listener_done: AtomicBool::new(false),
            dma_write: Mutex::new(window.base),
            dma_read: Mutex::new(window.base),
        }
    }

    /// Publishes availability bits from a queue-events wait and wakes any
    /// dispatcher blocked on backpressure.
    pub fn grant_sq(&self, bitmap: u64) {
        if bitmap == 0 {
            return;
        }
        let mut grants = self.sq_grants.lock().unwrap();
        *grants |= bitmap;
        self.cv.notify_all();
    }

    pub fn notify(&self) {
        let _grants = self.sq_grants.lock().unwrap();
        self.cv.notify_all();
    }

    /// Blocks until a grant for `queue` is available and consumes it. Returns
    /// `false` if the deadline passed or the abort flag was raised first.
    pub fn take_sq_grant(&self, queue: usize, deadline: Instant) -> bool {
        let mask = 1u64 << queue;
        let mut grants = self.sq_grants.lock().unwrap();
        loop {
            if *grants & mask != 0 {
                *grants &= !mask;
                return true;
            }
            if self.abort.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let wait = (deadline - now).min(WAIT_SLICE);
            let (g, _) = self.cv.wait_timeout(grants, wait).unwrap();
            grants = g;
        }
    }

    /// Parks the caller briefly; woken early by [`grant_sq`]/[`notify`].
    ///
    /// [`grant_sq`]: DeviceState::grant_sq
    /// [`notify`]: DeviceState::notify
    pub fn idle_wait(&self, dur: Duration) {
        let grants = self.sq_grants.lock().unwrap();
        let _ = self.cv.wait_timeout(grants, dur).unwrap();
    }

    pub fn add_expected(&self, n: i64) {
        self.expected_rsps.fetch_add(n, Ordering::SeqCst);
    }

    pub fn dec_expected(&self) {
        self.expected_rsps.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn set_expected(&self, n: i64) {
        self.expected_rsps.store(n, Ordering::SeqCst);
    }

    pub fn expected(&self) -> i64 {
        self.expected_rsps.load(Ordering::SeqCst)
    }

    /// Resets per-phase coordination (grants, abort flag, listener flag) while
    /// keeping the DMA allocators untouched.
    pub fn reset_phase(&self) {
        *self.sq_grants.lock().unwrap() = 0;
        self.abort.store(false, Ordering::SeqCst);
        self.listener_done.store(false, Ordering::SeqCst);
    }

    /// Bump allocator over the device DRAM window for host-to-device buffers.
    /// Exhaustion is a hard error, not a wrap.
    pub fn alloc_dma_write(&self, device: usize, len: u64) -> Result<u64, EngineError> {
        Self::bump(&self.dma_write, self.window, device, len)
    }

    /// Same window, separate cursor, for device-to-host buffers.
    pub fn alloc_dma_read(&self, device: usize, len: u64) -> Result<u64, EngineError> {
        Self::bump(&self.dma_read, self.window, device, len)
    }

    pub fn reset_dma_pool(&self) {
        *self.dma_write.lock().unwrap() = self.window.base;
        *self.dma_read.lock().unwrap() = self.window.base;
    }

    fn bump(
        cursor: &Mutex<u64>,
        window: DramWindow,
        device: usize,
        len: u64,
    ) -> Result<u64, EngineError> {
        let mut ptr = cursor.lock().unwrap();
        let end = ptr.checked_add(len).filter(|&e| e <= window.end());
        match end {
            Some(end) => {
                let addr = *ptr;
                *ptr = end;
                Ok(addr)
            }
            None => Err(EngineError::DmaRegionExhausted {
                device,
                requested: len,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> DeviceState {
        DeviceState::new(DramWindow {
            base: 0x1000,
            size: 0x100,
        })
    }

    #[test]
    fn grants_are_consumed_per_queue() {
        let st = state();
        st.grant_sq(0b101);
        let deadline = Instant::now() + Duration::from_millis(10);
        assert!(st.take_sq_grant(0, deadline));
        assert!(st.take_sq_grant(2, deadline));
        // Queue 0's grant was consumed; no new grant, so this times out.
        assert!(!st.take_sq_grant(0, Instant::now() + Duration::from_millis(5)));
    }

    #[test]
    fn abort_flag_unblocks_grant_waiters() {
        let st = state();
        st.abort.store(true, Ordering::SeqCst);
        assert!(!st.take_sq_grant(1, Instant::now() + Duration::from_secs(60)));
    }

    #[test]
    fn dma_cursors_are_independent_and_bounded() {
        let st = state();
        assert_eq!(st.alloc_dma_write(0, 0x40).unwrap(), 0x1000);
        assert_eq!(st.alloc_dma_write(0, 0x40).unwrap(), 0x1040);
        assert_eq!(st.alloc_dma_read(0, 0x10).unwrap(), 0x1000);
        assert!(matches!(
            st.alloc_dma_write(0, 0x100),
            Err(EngineError::DmaRegionExhausted { requested: 0x100, .. })
        ));
        st.reset_dma_pool();
        assert_eq!(st.alloc_dma_write(0, 8).unwrap(), 0x1000);
    }
}
