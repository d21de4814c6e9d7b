//! In-process loopback device.
//!
//! Stands in for the real transport in tests and bring-up: commands pushed to
//! a bounded submission queue are serviced on the next `pop`/wait and answered
//! on the completion queue. Per-command behaviour is scriptable so tests can
//! provoke wrong result codes, dropped or duplicated responses, and kernels
//! that hang until explicitly aborted.

use crate::{DeviceError, DeviceLayer, DramWindow, QueueEvents};
use kestrel_protocol::{
    encode_response, result, CmdHeader, CommandBody, Opcode, Tag, CMD_HEADER_LEN,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackConfig {
    pub devices: usize,
    pub queues_per_device: usize,
    /// Submission queue depth; pushes beyond this return `Ok(false)`.
    pub sq_depth: usize,
    pub dram_base: u64,
    pub dram_size: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        LoopbackConfig {
            devices: 1,
            queues_per_device: 4,
            sq_depth: 8,
            dram_base: 0x8000_0000,
            dram_size: 16 * 1024 * 1024,
        }
    }
}

/// What the device does with one matched command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptAction {
    /// Respond once with this result code.
    Respond(u32),
    /// Swallow the command; no response is ever produced.
    DropResponse,
    /// Respond twice with the same tag and result code.
    RespondTwice(u32),
    /// Hold the command until a matching abort arrives (kernel launches).
    Hang,
}

/// Matches the `occurrence`-th serviced command of `opcode` (0-based, counted
/// per device). Unmatched commands get a success response.
#[derive(Debug, Clone, Copy)]
pub struct ScriptRule {
    pub opcode: Opcode,
    pub occurrence: usize,
    pub action: ScriptAction,
}

impl ScriptRule {
    pub fn nth(opcode: Opcode, occurrence: usize, action: ScriptAction) -> ScriptRule {
        ScriptRule {
            opcode,
            occurrence,
            action,
        }
    }
}

#[derive(Default)]
struct DevInner {
    sqs: Vec<VecDeque<Vec<u8>>>,
    cq: VecDeque<Vec<u8>>,
    /// Kernel-launch tags held back until aborted.
    hung: Vec<Tag>,
    /// Every serviced command tag, in arrival order across all queues.
    serviced: Vec<Tag>,
    seen: HashMap<Opcode, usize>,
    rules: Vec<ScriptRule>,
    /// SQ bits already reported to a waiter; re-armed when the queue fills.
    reported_sq: u64,
    link_down: bool,
}

struct Dev {
    inner: Mutex<DevInner>,
    cv: Condvar,
}

/// Simulated multi-device queue transport.
pub struct LoopbackDevice {
    cfg: LoopbackConfig,
    devs: Vec<Dev>,
}

impl LoopbackDevice {
    pub fn new(cfg: LoopbackConfig) -> LoopbackDevice {
        let devs = (0..cfg.devices)
            .map(|_| Dev {
                inner: Mutex::new(DevInner {
                    sqs: vec![VecDeque::new(); cfg.queues_per_device],
                    ..DevInner::default()
                }),
                cv: Condvar::new(),
            })
            .collect();
        LoopbackDevice { cfg, devs }
    }

    /// Appends a behaviour rule for `device`.
    pub fn script(&self, device: usize, rule: ScriptRule) {
        if let Some(dev) = self.devs.get(device) {
            dev.inner.lock().unwrap().rules.push(rule);
        }
    }

    /// Tags of every command `device` has serviced so far, in arrival order.
    /// Lets tests verify host-side submission ordering.
    pub fn serviced_tags(&self, device: usize) -> Vec<Tag> {
        self.devs
            .get(device)
            .map(|dev| dev.inner.lock().unwrap().serviced.clone())
            .unwrap_or_default()
    }

    /// Simulates a fatal link failure; all subsequent calls for `device` fail.
    pub fn set_link_down(&self, device: usize, down: bool) {
        if let Some(dev) = self.devs.get(device) {
            dev.inner.lock().unwrap().link_down = down;
            dev.cv.notify_all();
        }
    }

    fn dev(&self, device: usize) -> Result<&Dev, DeviceError> {
        self.devs
            .get(device)
            .ok_or(DeviceError::UnknownDevice(device))
    }

    fn action_for(inner: &mut DevInner, opcode: Opcode) -> ScriptAction {
        let n = inner.seen.entry(opcode).or_insert(0);
        let occurrence = *n;
        *n += 1;
        inner
            .rules
            .iter()
            .find(|r| r.opcode == opcode && r.occurrence == occurrence)
            .map(|r| r.action)
            .unwrap_or(ScriptAction::Respond(result::SUCCESS))
    }

    /// Drains every submission queue, producing completions.
    fn service(inner: &mut DevInner) {
        for q in 0..inner.sqs.len() {
            while let Some(msg) = inner.sqs[q].pop_front() {
                let hdr = match CmdHeader::parse(&msg) {
                    Ok(hdr) => hdr,
                    Err(err) => {
                        warn!(queue = q, %err, "loopback: dropping malformed command");
                        continue;
                    }
                };
                inner.serviced.push(hdr.tag_id);
                let action = Self::action_for(inner, hdr.opcode);

                if hdr.opcode == Opcode::KernelAbort {
                    Self::service_abort(inner, hdr.tag_id, &msg, action);
                    continue;
                }

                match action {
                    ScriptAction::Respond(code) => {
                        inner.cq.push_back(encode_response(hdr.tag_id, code, &[]));
                    }
                    ScriptAction::RespondTwice(code) => {
                        inner.cq.push_back(encode_response(hdr.tag_id, code, &[]));
                        inner.cq.push_back(encode_response(hdr.tag_id, code, &[]));
                    }
                    ScriptAction::DropResponse => {}
                    ScriptAction::Hang => inner.hung.push(hdr.tag_id),
                }
            }
        }
    }

    fn service_abort(inner: &mut DevInner, abort_tag: Tag, msg: &[u8], action: ScriptAction) {
        let target = match CommandBody::decode(Opcode::KernelAbort, &msg[CMD_HEADER_LEN..]) {
            Ok(CommandBody::KernelAbort { target_tag }) => target_tag,
            _ => {
                warn!(tag = abort_tag, "loopback: malformed abort payload");
                inner
                    .cq
                    .push_back(encode_response(abort_tag, result::ABORT_INVALID_TAG, &[]));
                return;
            }
        };

        if action == ScriptAction::DropResponse {
            // Device died mid-abort: neither the abort nor the hung kernel
            // ever answer.
            return;
        }

        if let Some(pos) = inner.hung.iter().position(|t| *t == target) {
            inner.hung.remove(pos);
            inner
                .cq
                .push_back(encode_response(target, result::KERNEL_HOST_ABORTED, &[]));
            let code = match action {
                ScriptAction::Respond(code) | ScriptAction::RespondTwice(code) => code,
                _ => result::SUCCESS,
            };
            inner.cq.push_back(encode_response(abort_tag, code, &[]));
        } else {
            inner
                .cq
                .push_back(encode_response(abort_tag, result::ABORT_INVALID_TAG, &[]));
        }
    }

    fn available_sq_bitmap(&self, inner: &DevInner) -> u64 {
        let mut bitmap = 0u64;
        for (q, sq) in inner.sqs.iter().enumerate() {
            if sq.len() < self.cfg.sq_depth {
                bitmap |= 1 << q;
            }
        }
        bitmap
    }
}

impl DeviceLayer for LoopbackDevice {
    fn device_count(&self) -> usize {
        self.cfg.devices
    }

    fn queue_count(&self, device: usize) -> Result<usize, DeviceError> {
        self.dev(device)?;
        Ok(self.cfg.queues_per_device)
    }

    fn push(
        &self,
        device: usize,
        queue: usize,
        bytes: &[u8],
        _dma_heavy: bool,
    ) -> Result<bool, DeviceError> {
        let dev = self.dev(device)?;
        let mut inner = dev.inner.lock().unwrap();
        if inner.link_down {
            return Err(DeviceError::LinkDown { device });
        }
        if queue >= inner.sqs.len() {
            return Err(DeviceError::UnknownQueue { device, queue });
        }
        if inner.sqs[queue].len() >= self.cfg.sq_depth {
            // Re-arm the availability edge so the next free slot is reported.
            inner.reported_sq &= !(1 << queue);
            return Ok(false);
        }
        inner.sqs[queue].push_back(bytes.to_vec());
        if inner.sqs[queue].len() >= self.cfg.sq_depth {
            inner.reported_sq &= !(1 << queue);
        }
        dev.cv.notify_all();
        Ok(true)
    }

    fn pop(&self, device: usize) -> Result<Option<Vec<u8>>, DeviceError> {
        let dev = self.dev(device)?;
        let mut inner = dev.inner.lock().unwrap();
        if inner.link_down {
            return Err(DeviceError::LinkDown { device });
        }
        Self::service(&mut inner);
        Ok(inner.cq.pop_front())
    }

    fn wait_for_queue_events(
        &self,
        device: usize,
        timeout: Duration,
    ) -> Result<QueueEvents, DeviceError> {
        let dev = self.dev(device)?;
        let deadline = Instant::now() + timeout;
        let mut inner = dev.inner.lock().unwrap();
        loop {
            if inner.link_down {
                return Err(DeviceError::LinkDown { device });
            }
            Self::service(&mut inner);
            let available = self.available_sq_bitmap(&inner);
            // Only newly-freed queues are reported; levels would make waiters
            // spin on queues they are not blocked on.
            let fresh = available & !inner.reported_sq;
            let cq_available = !inner.cq.is_empty();
            if fresh != 0 || cq_available {
                inner.reported_sq |= fresh;
                return Ok(QueueEvents {
                    sq_bitmap: fresh,
                    cq_available,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(QueueEvents::default());
            }
            let (guard, _timed_out) = dev.cv.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
    }

    fn dram_window(&self, device: usize) -> Result<DramWindow, DeviceError> {
        self.dev(device)?;
        Ok(DramWindow {
            base: self.cfg.dram_base,
            size: self.cfg.dram_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_protocol::{CmdFlags, Command, RspHeader};

    fn echo_cmd(tag: Tag) -> Vec<u8> {
        Command::new(
            tag,
            CmdFlags::default(),
            result::SUCCESS,
            CommandBody::Echo { payload: 0xdead },
        )
        .encode()
    }

    fn launch_cmd(tag: Tag) -> Vec<u8> {
        Command::new(
            tag,
            CmdFlags::default(),
            result::SUCCESS,
            CommandBody::KernelLaunch {
                entry_addr: 0x8000_0000,
                args_addr: 0,
                exception_buf: 0,
                cluster_mask: 1,
                trace_buf: 0,
                args: Vec::new(),
            },
        )
        .encode()
    }

    fn abort_cmd(tag: Tag, target: Tag) -> Vec<u8> {
        Command::new(
            tag,
            CmdFlags::default(),
            result::SUCCESS,
            CommandBody::KernelAbort { target_tag: target },
        )
        .encode()
    }

    #[test]
    fn push_pop_round_trip() {
        let dev = LoopbackDevice::new(LoopbackConfig::default());
        assert!(dev.push(0, 0, &echo_cmd(1), false).unwrap());
        let rsp = dev.pop(0).unwrap().unwrap();
        let hdr = RspHeader::parse(&rsp).unwrap();
        assert_eq!(hdr.tag_id, 1);
        assert_eq!(hdr.result_code, result::SUCCESS);
        assert!(dev.pop(0).unwrap().is_none());
    }

    #[test]
    fn full_queue_rejects_push_until_serviced() {
        let cfg = LoopbackConfig {
            sq_depth: 2,
            ..LoopbackConfig::default()
        };
        let dev = LoopbackDevice::new(cfg);
        assert!(dev.push(0, 0, &echo_cmd(1), false).unwrap());
        assert!(dev.push(0, 0, &echo_cmd(2), false).unwrap());
        assert!(!dev.push(0, 0, &echo_cmd(3), false).unwrap());

        // Popping services the queue and frees the slots.
        assert!(dev.pop(0).unwrap().is_some());
        assert!(dev.push(0, 0, &echo_cmd(3), false).unwrap());
    }

    #[test]
    fn freed_queue_is_reported_once() {
        let cfg = LoopbackConfig {
            sq_depth: 1,
            ..LoopbackConfig::default()
        };
        let dev = LoopbackDevice::new(cfg);
        assert!(dev.push(0, 0, &echo_cmd(1), false).unwrap());
        assert!(!dev.push(0, 0, &echo_cmd(2), false).unwrap());

        let ev = dev.wait_for_queue_events(0, Duration::from_millis(10)).unwrap();
        assert!(ev.sq_bitmap & 1 != 0);
        assert!(ev.cq_available);

        // Drain the completion; the same free slot is not reported again.
        assert!(dev.pop(0).unwrap().is_some());
        let ev = dev.wait_for_queue_events(0, Duration::from_millis(10)).unwrap();
        assert_eq!(ev.sq_bitmap, 0);
    }

    #[test]
    fn hung_kernel_answers_after_abort() {
        let dev = LoopbackDevice::new(LoopbackConfig::default());
        dev.script(0, ScriptRule::nth(Opcode::KernelLaunch, 0, ScriptAction::Hang));

        assert!(dev.push(0, 0, &launch_cmd(5), false).unwrap());
        assert!(dev.pop(0).unwrap().is_none());

        assert!(dev.push(0, 0, &abort_cmd(6, 5), false).unwrap());
        let first = RspHeader::parse(&dev.pop(0).unwrap().unwrap()).unwrap();
        let second = RspHeader::parse(&dev.pop(0).unwrap().unwrap()).unwrap();
        assert_eq!((first.tag_id, first.result_code), (5, result::KERNEL_HOST_ABORTED));
        assert_eq!((second.tag_id, second.result_code), (6, result::SUCCESS));
    }

    #[test]
    fn abort_of_unknown_tag_is_rejected() {
        let dev = LoopbackDevice::new(LoopbackConfig::default());
        assert!(dev.push(0, 0, &abort_cmd(9, 1234), false).unwrap());
        let rsp = RspHeader::parse(&dev.pop(0).unwrap().unwrap()).unwrap();
        assert_eq!(rsp.tag_id, 9);
        assert_eq!(rsp.result_code, result::ABORT_INVALID_TAG);
    }

    #[test]
    fn scripted_duplicate_produces_two_completions() {
        let dev = LoopbackDevice::new(LoopbackConfig::default());
        dev.script(
            0,
            ScriptRule::nth(Opcode::Echo, 0, ScriptAction::RespondTwice(result::SUCCESS)),
        );
        assert!(dev.push(0, 0, &echo_cmd(1), false).unwrap());
        assert!(dev.pop(0).unwrap().is_some());
        assert!(dev.pop(0).unwrap().is_some());
        assert!(dev.pop(0).unwrap().is_none());
    }

    #[test]
    fn serviced_tags_record_arrival_order() {
        let dev = LoopbackDevice::new(LoopbackConfig::default());
        assert!(dev.push(0, 0, &echo_cmd(3), false).unwrap());
        assert!(dev.push(0, 0, &echo_cmd(1), false).unwrap());
        assert!(dev.push(0, 1, &echo_cmd(2), false).unwrap());
        while dev.pop(0).unwrap().is_some() {}
        assert_eq!(dev.serviced_tags(0), vec![3, 1, 2]);
    }

    #[test]
    fn link_down_is_fatal() {
        let dev = LoopbackDevice::new(LoopbackConfig::default());
        dev.set_link_down(0, true);
        assert_eq!(
            dev.push(0, 0, &echo_cmd(1), false),
            Err(DeviceError::LinkDown { device: 0 })
        );
        assert_eq!(dev.pop(0), Err(DeviceError::LinkDown { device: 0 }));
    }
}
