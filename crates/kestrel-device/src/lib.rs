//! Transport seam between the protocol engine and a physical (or simulated)
//! accelerator.
//!
//! The engine only ever talks to a [`DeviceLayer`]: push raw command bytes to
//! a submission queue, pop raw response bytes from the per-device completion
//! queue, and block on queue availability events. PCIe BAR mapping, interrupt
//! plumbing and bring-up live behind implementations of this trait and are
//! out of scope here.
//!
//! [`loopback::LoopbackDevice`] is the in-process implementation used by
//! tests: bounded submission queues and scripted response behaviour.
#![forbid(unsafe_code)]

pub mod loopback;

use std::time::Duration;
use thiserror::Error;

/// Fatal transport errors. Transient backpressure is *not* an error: a full
/// submission queue is reported as `Ok(false)` from [`DeviceLayer::push`] and
/// an empty completion queue as `Ok(None)` from [`DeviceLayer::pop`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("no such device {0}")]
    UnknownDevice(usize),

    #[error("no such submission queue {queue} on device {device}")]
    UnknownQueue { device: usize, queue: usize },

    #[error("device {device} link is down")]
    LinkDown { device: usize },
}

/// Queue availability snapshot returned by a backpressure wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueEvents {
    /// Bit N set: submission queue N on this device has free slots.
    pub sq_bitmap: u64,
    /// The completion queue has at least one response ready.
    pub cq_available: bool,
}

impl QueueEvents {
    /// Full availability for `queue_count` queues, as synthesized by the
    /// interval-polling fallback: callers re-probe `push`/`pop` and discover
    /// the real state.
    pub fn synthesized(queue_count: usize) -> QueueEvents {
        let sq_bitmap = if queue_count >= 64 {
            u64::MAX
        } else {
            (1u64 << queue_count) - 1
        };
        QueueEvents {
            sq_bitmap,
            cq_available: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sq_bitmap == 0 && !self.cq_available
    }
}

/// Device DRAM window available for host-managed DMA buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DramWindow {
    pub base: u64,
    pub size: u64,
}

impl DramWindow {
    pub fn end(&self) -> u64 {
        self.base + self.size
    }
}

/// Raw queue transport for one or more accelerator devices.
pub trait DeviceLayer: Send + Sync {
    fn device_count(&self) -> usize;

    fn queue_count(&self, device: usize) -> Result<usize, DeviceError>;

    /// Pushes one command to a submission queue. Returns `Ok(false)` when the
    /// queue is full (transient; wait for a [`QueueEvents`] grant and retry).
    /// `dma_heavy` hints that the command moves bulk data.
    fn push(
        &self,
        device: usize,
        queue: usize,
        bytes: &[u8],
        dma_heavy: bool,
    ) -> Result<bool, DeviceError>;

    /// Pops one response from the device's completion queue, if any is ready.
    fn pop(&self, device: usize) -> Result<Option<Vec<u8>>, DeviceError>;

    /// Blocks until a submission queue frees up or a completion arrives, or
    /// `timeout` elapses (returning whatever is available at that point,
    /// possibly nothing).
    fn wait_for_queue_events(
        &self,
        device: usize,
        timeout: Duration,
    ) -> Result<QueueEvents, DeviceError>;

    fn dram_window(&self, device: usize) -> Result<DramWindow, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_events_cover_all_queues() {
        let ev = QueueEvents::synthesized(4);
        assert_eq!(ev.sq_bitmap, 0b1111);
        assert!(ev.cq_available);
        assert!(!ev.is_empty());
        assert_eq!(QueueEvents::synthesized(64).sq_bitmap, u64::MAX);
    }
}
