//! Run orchestration: stream intake, the two execution modes, and the
//! shared state the dispatcher/listener threads operate on.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use kestrel_device::DeviceLayer;
use kestrel_protocol::{Command, Tag};
use tracing::debug;

use crate::abort;
use crate::device_state::{DeviceState, WAIT_SLICE};
use crate::dispatcher;
use crate::error::EngineError;
use crate::listener;
use crate::registry::{CmdStatus, TagRegistry};
use crate::stream::{Stream, StreamCommand};
use crate::summary::{self, ExecutionSummary};

/// How workers block when the device has nothing for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Block on the transport's queue-events wait.
    Event,
    /// Sleep for the given interval and re-probe. Fallback for transports
    /// with no usable event source.
    Poll(Duration),
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Deadline for the main execution phase.
    pub exec_timeout: Duration,
    /// Deadline for the abort phase that cleans up hung commands.
    pub abort_timeout: Duration,
    pub wait_mode: WaitMode,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            exec_timeout: Duration::from_secs(60),
            abort_timeout: Duration::from_secs(20),
            wait_mode: WaitMode::Event,
        }
    }
}

/// State shared between the engine and its worker threads for the duration
/// of a run. Owned by [`Engine`]; workers borrow it through scoped threads.
pub(crate) struct EngineShared {
    pub device: Arc<dyn DeviceLayer>,
    pub config: EngineConfig,
    pub registry: TagRegistry,
    pub devices: Vec<DeviceState>,
    pub queue_counts: Vec<usize>,
    pub streams: Mutex<Vec<Arc<Mutex<Stream>>>>,
    /// Pending stream ids per (device, queue), in submission order.
    work: Mutex<HashMap<(usize, usize), VecDeque<usize>>>,
    /// Same streams in global insertion order, for the synchronous mode.
    run_queue: Mutex<VecDeque<usize>>,
    run_error: Mutex<Option<EngineError>>,
    /// Set while the abort phase runs; suppresses retransmission.
    pub aborting: AtomicBool,
}

impl EngineShared {
    pub fn stream(&self, id: usize) -> Arc<Mutex<Stream>> {
        self.streams.lock().unwrap()[id].clone()
    }

    pub fn take_work(&self, device_idx: usize, queue_idx: usize) -> Option<Arc<Mutex<Stream>>> {
        let id = {
            let mut work = self.work.lock().unwrap();
            work.get_mut(&(device_idx, queue_idx))?.pop_front()?
        };
        Some(self.stream(id))
    }

    pub fn enqueue_work(&self, stream_id: usize, device_idx: usize, queue_idx: usize) {
        self.work
            .lock()
            .unwrap()
            .entry((device_idx, queue_idx))
            .or_default()
            .push_back(stream_id);
        self.run_queue.lock().unwrap().push_back(stream_id);
    }

    pub fn clear_work(&self) {
        self.work.lock().unwrap().clear();
        self.run_queue.lock().unwrap().clear();
    }

    pub fn pop_run_queue(&self) -> Option<usize> {
        self.run_queue.lock().unwrap().pop_front()
    }

    /// Records the first fatal error of the run and unblocks every waiter so
    /// the phase can tear down.
    pub fn record_run_error(&self, err: EngineError) {
        {
            let mut slot = self.run_error.lock().unwrap();
            if slot.is_none() {
                tracing::error!(%err, "run stopped by fatal error");
                *slot = Some(err);
            }
        }
        for state in &self.devices {
            state.abort.store(true, Ordering::SeqCst);
            state.notify();
        }
    }

    pub fn has_run_error(&self) -> bool {
        self.run_error.lock().unwrap().is_some()
    }

    pub fn take_run_error(&self) -> Option<EngineError> {
        self.run_error.lock().unwrap().take()
    }

    pub fn state(&self, device_idx: usize) -> Result<&DeviceState, EngineError> {
        self.devices
            .get(device_idx)
            .ok_or(EngineError::UnknownDevice(device_idx))
    }
}

/// Spawns one listener per involved device and one dispatcher per (device,
/// queue) pair with pending work, then joins them all.
pub(crate) fn run_phase(shared: &EngineShared, deadline: Instant) {
    let pairs: Vec<(usize, usize)> = {
        let work = shared.work.lock().unwrap();
        work.iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(&pair, _)| pair)
            .collect()
    };
    let mut involved: Vec<usize> = pairs.iter().map(|&(d, _)| d).collect();
    for (d, state) in shared.devices.iter().enumerate() {
        if state.expected() > 0 {
            involved.push(d);
        }
    }
    involved.sort_unstable();
    involved.dedup();
    if involved.is_empty() {
        return;
    }
    thread::scope(|scope| {
        for &d in &involved {
            scope.spawn(move || listener::run(shared, d, deadline));
        }
        for &(d, q) in &pairs {
            scope.spawn(move || dispatcher::run(shared, d, q, deadline));
        }
    });
}

/// The protocol engine: accepts command streams, drives them through the
/// device's submission queues, correlates responses, retransmits failed
/// stream tails, aborts hung commands, and reports an [`ExecutionSummary`]
/// per run. All run state is owned here; nothing is global, so independent
/// engines can coexist in one process.
pub struct Engine {
    shared: EngineShared,
}

impl Engine {
    pub fn new(device: Arc<dyn DeviceLayer>, config: EngineConfig) -> Result<Engine, EngineError> {
        let count = device.device_count();
        let mut devices = Vec::with_capacity(count);
        let mut queue_counts = Vec::with_capacity(count);
        for d in 0..count {
            devices.push(DeviceState::new(device.dram_window(d)?));
            queue_counts.push(device.queue_count(d)?);
        }
        Ok(Engine {
            shared: EngineShared {
                device,
                config,
                registry: TagRegistry::new(),
                devices,
                queue_counts,
                streams: Mutex::new(Vec::new()),
                work: Mutex::new(HashMap::new()),
                run_queue: Mutex::new(VecDeque::new()),
                run_error: Mutex::new(None),
                aborting: AtomicBool::new(false),
            },
        })
    }

    pub fn device_count(&self) -> usize {
        self.shared.devices.len()
    }

    pub fn registry(&self) -> &TagRegistry {
        &self.shared.registry
    }

    /// Queues an ordered stream of commands on one submission queue. Tags are
    /// assigned and registered here; submission happens on the next
    /// `execute_*` call. Returns the assigned tags, in stream order.
    pub fn insert_stream(
        &self,
        device_idx: usize,
        queue_idx: usize,
        drafts: Vec<StreamCommand>,
        retry_budget: u32,
    ) -> Result<Vec<Tag>, EngineError> {
        let queues = *self
            .shared
            .queue_counts
            .get(device_idx)
            .ok_or(EngineError::UnknownDevice(device_idx))?;
        // The route hint in the flags word carries 4 bits.
        if queue_idx >= queues || queue_idx >= 16 {
            return Err(EngineError::UnknownQueue {
                device: device_idx,
                queue: queue_idx,
            });
        }
        if drafts.is_empty() {
            return Err(EngineError::EmptyStream);
        }
        for draft in &drafts {
            draft.body.validate()?;
        }
        let commands: Vec<Command> = drafts
            .into_iter()
            .map(|d| {
                Command::new(
                    self.shared.registry.allocate_tag(),
                    d.flags.with_route(queue_idx),
                    d.expected,
                    d.body,
                )
            })
            .collect();
        let tags: Vec<Tag> = commands.iter().map(|c| c.tag()).collect();
        let stream_id = {
            let mut streams = self.shared.streams.lock().unwrap();
            let id = streams.len();
            for cmd in &commands {
                self.shared.registry.register(
                    cmd.tag(),
                    cmd.opcode(),
                    cmd.expected_result(),
                    device_idx,
                    id,
                    cmd.cancelable(),
                )?;
            }
            streams.push(Arc::new(Mutex::new(Stream::new(
                device_idx,
                queue_idx,
                commands,
                retry_budget,
            ))));
            id
        };
        self.shared.devices[device_idx].add_expected(tags.len() as i64);
        self.shared.enqueue_work(stream_id, device_idx, queue_idx);
        debug!(
            device = device_idx,
            queue = queue_idx,
            stream = stream_id,
            commands = tags.len(),
            "stream queued"
        );
        Ok(tags)
    }

    /// Allocates `len` bytes of device DRAM for a host-to-device buffer.
    pub fn dma_write_addr(&self, device_idx: usize, len: u64) -> Result<u64, EngineError> {
        self.shared.state(device_idx)?.alloc_dma_write(device_idx, len)
    }

    /// Allocates `len` bytes of device DRAM for a device-to-host buffer.
    pub fn dma_read_addr(&self, device_idx: usize, len: u64) -> Result<u64, EngineError> {
        self.shared.state(device_idx)?.alloc_dma_read(device_idx, len)
    }

    pub fn reset_dma_pool(&self, device_idx: usize) -> Result<(), EngineError> {
        self.shared.state(device_idx)?.reset_dma_pool();
        Ok(())
    }

    /// Runs every queued stream with one dispatcher thread per (device,
    /// queue) pair and one listener thread per device, then the abort phase.
    pub fn execute_async(&self) -> Result<ExecutionSummary, EngineError> {
        let started = Instant::now();
        let deadline = started + self.shared.config.exec_timeout;
        self.prepare_run();
        run_phase(&self.shared, deadline);
        self.finish_run(started)
    }

    /// Runs every queued stream on the caller's thread, draining each
    /// command's response before submitting the next. Retransmission and the
    /// abort phase behave exactly as in the async mode.
    pub fn execute_sync(&self) -> Result<ExecutionSummary, EngineError> {
        let started = Instant::now();
        let deadline = started + self.shared.config.exec_timeout;
        self.prepare_run();
        if let Err(err) = self.sync_loop(deadline) {
            self.shared.record_run_error(err);
        }
        self.finish_run(started)
    }

    fn sync_loop(&self, deadline: Instant) -> Result<(), EngineError> {
        while let Some(id) = self.shared.pop_run_queue() {
            let stream = self.shared.stream(id);
            let (device_idx, queue_idx, len) = {
                let s = stream.lock().unwrap();
                (s.device_idx, s.queue_idx, s.commands.len())
            };
            for i in 0..len {
                if Instant::now() >= deadline {
                    return Ok(());
                }
                let cmd = stream.lock().unwrap().commands[i].clone();
                if self.shared.registry.is_superseded(cmd.tag()) {
                    stream.lock().unwrap().next_unsent = i + 1;
                    continue;
                }
                let bytes = cmd.encode();
                loop {
                    if Instant::now() >= deadline {
                        return Ok(());
                    }
                    if self
                        .shared
                        .device
                        .push(device_idx, queue_idx, &bytes, cmd.is_dma())?
                    {
                        self.shared.registry.note_sent(cmd.tag(), bytes.len());
                        stream.lock().unwrap().next_unsent = i + 1;
                        break;
                    }
                    self.sync_wait(device_idx, deadline)?;
                }
                while self.shared.registry.status(cmd.tag()) == Some(CmdStatus::AwaitingResponse) {
                    if Instant::now() >= deadline {
                        return Ok(());
                    }
                    match self.shared.device.pop(device_idx)? {
                        Some(rsp) => listener::handle_response(&self.shared, device_idx, &rsp),
                        None => self.sync_wait(device_idx, deadline)?,
                    }
                }
            }
        }
        Ok(())
    }

    fn sync_wait(&self, device_idx: usize, deadline: Instant) -> Result<(), EngineError> {
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        let bound = (deadline - now).min(WAIT_SLICE);
        match self.shared.config.wait_mode {
            WaitMode::Event => {
                self.shared.device.wait_for_queue_events(device_idx, bound)?;
            }
            WaitMode::Poll(interval) => thread::sleep(interval.min(bound)),
        }
        Ok(())
    }

    fn prepare_run(&self) {
        self.shared.aborting.store(false, Ordering::SeqCst);
        let _ = self.shared.take_run_error();
        for state in &self.shared.devices {
            state.reset_phase();
        }
    }

    fn finish_run(&self, started: Instant) -> Result<ExecutionSummary, EngineError> {
        if let Some(err) = self.shared.take_run_error() {
            self.cleanup();
            return Err(err);
        }
        // Late responses (e.g. a duplicate sitting behind the response that
        // settled the expectation) are still accounted for.
        self.final_sweep();
        let abort_failed = abort::run_abort_phase(&self.shared);
        if let Some(err) = self.shared.take_run_error() {
            self.cleanup();
            return Err(err);
        }
        self.final_sweep();
        let retransmitted = {
            let streams = self.shared.streams.lock().unwrap();
            streams
                .iter()
                .filter(|s| s.lock().unwrap().retransmitted)
                .count()
        };
        let summary = summary::build(
            self.shared.registry.snapshot(),
            abort_failed,
            retransmitted,
            started.elapsed(),
        );
        summary.log();
        self.cleanup();
        Ok(summary)
    }

    fn final_sweep(&self) {
        for device_idx in 0..self.shared.devices.len() {
            while let Ok(Some(rsp)) = self.shared.device.pop(device_idx) {
                listener::handle_response(&self.shared, device_idx, &rsp);
            }
        }
    }

    fn cleanup(&self) {
        self.shared.registry.clear();
        self.shared.streams.lock().unwrap().clear();
        self.shared.clear_work();
        for state in &self.shared.devices {
            state.set_expected(0);
            state.reset_phase();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_device::loopback::{LoopbackConfig, LoopbackDevice};
    use kestrel_protocol::CommandBody;

    fn engine(cfg: LoopbackConfig) -> Engine {
        let dev = Arc::new(LoopbackDevice::new(cfg));
        let config = EngineConfig {
            exec_timeout: Duration::from_secs(5),
            abort_timeout: Duration::from_secs(1),
            ..EngineConfig::default()
        };
        Engine::new(dev, config).unwrap()
    }

    fn echo(payload: u64) -> StreamCommand {
        StreamCommand::new(CommandBody::Echo { payload })
    }

    #[test]
    fn async_run_resolves_every_stream() {
        let eng = engine(LoopbackConfig::default());
        let a = eng.insert_stream(0, 0, vec![echo(1), echo(2), echo(3)], 0).unwrap();
        let b = eng.insert_stream(0, 1, vec![echo(4), echo(5)], 0).unwrap();
        let summary = eng.execute_async().unwrap();
        assert!(!summary.run_failed());
        assert_eq!(summary.successful.len(), a.len() + b.len());
        assert!(summary.missing.is_empty());
        assert_eq!(summary.cmds_sent, 5);
    }

    #[test]
    fn sync_run_resolves_every_stream() {
        let eng = engine(LoopbackConfig::default());
        eng.insert_stream(0, 0, vec![echo(1), echo(2)], 0).unwrap();
        let summary = eng.execute_sync().unwrap();
        assert!(!summary.run_failed());
        assert_eq!(summary.successful.len(), 2);
    }

    #[test]
    fn engine_is_reusable_across_runs() {
        let eng = engine(LoopbackConfig::default());
        eng.insert_stream(0, 0, vec![echo(1)], 0).unwrap();
        let first = eng.execute_async().unwrap();
        assert_eq!(first.total(), 1);

        eng.insert_stream(0, 0, vec![echo(2), echo(3)], 0).unwrap();
        let second = eng.execute_async().unwrap();
        assert_eq!(second.total(), 2);
        assert!(!second.run_failed());
    }

    #[test]
    fn insert_stream_validates_its_target() {
        let eng = engine(LoopbackConfig::default());
        assert!(matches!(
            eng.insert_stream(7, 0, vec![echo(1)], 0),
            Err(EngineError::UnknownDevice(7))
        ));
        assert!(matches!(
            eng.insert_stream(0, 9, vec![echo(1)], 0),
            Err(EngineError::UnknownQueue { device: 0, queue: 9 })
        ));
        assert!(matches!(
            eng.insert_stream(0, 0, vec![], 0),
            Err(EngineError::EmptyStream)
        ));
    }

    #[test]
    fn dma_addresses_come_from_the_device_window() {
        let cfg = LoopbackConfig {
            dram_base: 0x1000,
            dram_size: 0x100,
            ..LoopbackConfig::default()
        };
        let eng = engine(cfg);
        assert_eq!(eng.dma_write_addr(0, 0x80).unwrap(), 0x1000);
        assert_eq!(eng.dma_write_addr(0, 0x80).unwrap(), 0x1080);
        assert!(matches!(
            eng.dma_write_addr(0, 1),
            Err(EngineError::DmaRegionExhausted { .. })
        ));
        eng.reset_dma_pool(0).unwrap();
        assert_eq!(eng.dma_read_addr(0, 8).unwrap(), 0x1000);
    }
}
