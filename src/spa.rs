use crate::allocation::Allocator;
use crate::completion::{pad_delay, CompletionQueue};
use crate::compute_unit::ComputeUnit;
use crate::config::{Config, STREAM_DELAY};
use crate::copy::CopyEngine;
use crate::device::DeviceEngine;
use crate::error::{Fatal, Result};
use crate::event::{self, Kind};
use crate::host::{HostThread, ThreadStatus};
use crate::streams::{Dispatched, StreamId, StreamManager};
use crate::{address, DeviceCycles, Ref, Tick};
use console::style;
use std::path::Path;

/// External components the stream processor array drives once started.
#[derive(Debug, Clone)]
struct Collaborators {
    thread: Ref<dyn HostThread>,
    device: Ref<dyn DeviceEngine>,
    streams: Ref<dyn StreamManager>,
    copy_engine: Ref<dyn CopyEngine>,
}

/// Timing bridge between the host and the accelerator.
///
/// Owns the host timeline and two kinds of events on it:
/// device activity (kernel completion and device cycles) and stream
/// dispatch (issuing the next queued stream operation). At most one event
/// of each kind is outstanding at any time.
#[derive(Debug)]
pub struct StreamProcessorArray {
    config: Config,
    events: event::Queue,

    /// Tick of the outstanding device activity event.
    device_tick_pending: Option<Tick>,
    stream_tick_pending: bool,
    /// Host thread must be activated once all device work drained.
    unblock_needed: bool,
    running: bool,
    kernel_start_time: Tick,

    allocator: Allocator,
    completions: CompletionQueue,
    kernel_times: stats::KernelTimes,
    cleared_at: Option<Tick>,

    compute_units: Vec<Ref<dyn ComputeUnit>>,
    collaborators: Option<Collaborators>,
}

impl StreamProcessorArray {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        log::debug!(
            "stream processor array: launch delay={} return delay={} conversion={}",
            config.launch_delay,
            config.return_delay,
            config.gpu_tick_conversion.ratio()
        );
        let allocator = Allocator::new(config.page_size)?;
        Ok(Self {
            config,
            events: event::Queue::new(),
            device_tick_pending: None,
            stream_tick_pending: false,
            unblock_needed: false,
            running: false,
            kernel_start_time: 0,
            allocator,
            completions: CompletionQueue::new(),
            kernel_times: stats::KernelTimes::default(),
            cleared_at: None,
            compute_units: Vec::new(),
            collaborators: None,
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn now(&self) -> Tick {
        self.events.now()
    }

    #[must_use]
    pub fn running(&self) -> bool {
        self.running
    }

    /// Tick of the outstanding device activity event, if any.
    #[must_use]
    pub fn pending_device_tick(&self) -> Option<Tick> {
        self.device_tick_pending
    }

    #[must_use]
    pub fn stream_tick_pending(&self) -> bool {
        self.stream_tick_pending
    }

    #[must_use]
    pub fn unblock_needed(&self) -> bool {
        self.unblock_needed
    }

    #[must_use]
    pub fn completions(&self) -> &CompletionQueue {
        &self.completions
    }

    #[must_use]
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    #[must_use]
    pub fn events(&self) -> &event::Queue {
        &self.events
    }

    /// Shared memory latency in device cycles.
    #[must_use]
    pub fn shared_mem_delay(&self) -> u64 {
        self.config.shared_mem_delay
    }

    #[must_use]
    pub fn use_gem5_mem(&self) -> bool {
        self.config.use_gem5_mem
    }

    fn collaborators(&self) -> Result<Collaborators> {
        self.collaborators.clone().ok_or(Fatal::NotStarted)
    }

    pub fn register_compute_unit(&mut self, unit: Ref<dyn ComputeUnit>) -> usize {
        let id = self.compute_units.len();
        log::debug!("registered compute unit {id}");
        self.compute_units.push(unit);
        id
    }

    pub fn compute_unit(&self, id: usize) -> Result<&Ref<dyn ComputeUnit>> {
        self.compute_units
            .get(id)
            .ok_or(Fatal::ComputeUnitOutOfRange {
                id,
                num_units: self.compute_units.len(),
            })
    }

    #[must_use]
    pub fn num_compute_units(&self) -> usize {
        self.compute_units.len()
    }

    /// Attach the external collaborators and initialize the compute units
    /// and copy engine with the host thread.
    pub fn start(
        &mut self,
        thread: Ref<dyn HostThread>,
        device: Ref<dyn DeviceEngine>,
        streams: Ref<dyn StreamManager>,
        copy_engine: Ref<dyn CopyEngine>,
    ) {
        for unit in &self.compute_units {
            unit.lock().initialize(thread.clone());
        }
        copy_engine.lock().initialize(thread.clone());
        log::debug!(
            "starting stream processor array with {} compute unit(s)",
            self.compute_units.len()
        );
        self.collaborators = Some(Collaborators {
            thread,
            device,
            streams,
            copy_engine,
        });
    }

    /// Tick `delay` ticks from now.
    fn ticks_from_now(&self, kind: Kind, delay: Tick) -> Result<Tick> {
        let now = self.now();
        now.checked_add(delay)
            .ok_or(Fatal::TickOverflow { kind, now, delay })
    }

    fn schedule_device_tick(&mut self, at: Tick) -> Result<()> {
        if let Some(pending) = self.device_tick_pending {
            return Err(Fatal::DeviceTickAlreadyScheduled {
                pending,
                requested: at,
            });
        }
        self.events.schedule(Kind::DeviceActivity, at)?;
        self.device_tick_pending = Some(at);
        Ok(())
    }

    /// Wake up the device after `cycles` device cycles.
    pub fn request_device_tick(&mut self, cycles: DeviceCycles) -> Result<()> {
        let delay = self.config.gpu_tick_conversion.to_ticks(cycles);
        let at = self.ticks_from_now(Kind::DeviceActivity, delay)?;
        log::trace!("device tick requested in {cycles} cycles (at tick {at})");
        self.schedule_device_tick(at)
    }

    /// Dispatch the next stream operation in `ticks` host ticks.
    ///
    /// Ignored if a stream dispatch is already scheduled.
    pub fn request_stream_tick(&mut self, ticks: Tick) -> Result<()> {
        if self.stream_tick_pending {
            log::trace!("stream tick already scheduled, ignoring request");
            return Ok(());
        }
        let at = self.ticks_from_now(Kind::StreamDispatch, ticks)?;
        self.events.schedule(Kind::StreamDispatch, at)?;
        self.stream_tick_pending = true;
        Ok(())
    }

    /// Start executing the kernel the host launched at `launch_time`.
    pub fn begin_running(&mut self, launch_time: Tick) -> Result<()> {
        let now = self.now();
        if self.running {
            return Err(Fatal::AlreadyRunning { now });
        }
        log::debug!("beginning kernel execution at tick {now}");
        self.running = true;
        self.kernel_start_time = now;
        let delay = pad_delay(
            now,
            launch_time,
            self.config.launch_delay,
            self.config.gpu_tick_conversion,
        );
        let at = self.ticks_from_now(Kind::DeviceActivity, delay)?;
        self.schedule_device_tick(at)
    }

    /// Ask to block the host thread until all device work completed.
    ///
    /// Returns `false` if there is no outstanding work, in which case the
    /// host must not block.
    pub fn request_block(&mut self) -> Result<bool> {
        let streams = self.collaborators()?.streams;
        let streams = streams.lock();
        if streams.is_empty() {
            log::debug!("suspend request: already done");
            return Ok(false);
        }
        log::debug!("suspend request: need to activate host thread later");
        self.unblock_needed = true;
        if log::log_enabled!(log::Level::Debug) {
            let mut dump = Vec::new();
            streams.print(&mut dump)?;
            log::debug!("{}", String::from_utf8_lossy(&dump).trim_end());
        }
        Ok(true)
    }

    /// Reactivate the suspended host thread.
    pub fn unblock(&mut self) -> Result<()> {
        let thread = self.collaborators()?.thread;
        let mut thread = thread.lock();
        let status = thread.status();
        if status != ThreadStatus::Suspended {
            return Err(Fatal::ThreadNotSuspended { status });
        }
        log::debug!("unblocking host thread");
        thread.activate();
        Ok(())
    }

    pub fn allocate(&mut self, num_bytes: u64) -> Result<address> {
        self.allocate_named(num_bytes, None)
    }

    pub fn allocate_named(&mut self, num_bytes: u64, name: Option<String>) -> Result<address> {
        let thread = self.collaborators()?.thread;
        let mut thread = thread.lock();
        self.allocator.allocate(num_bytes, name, &mut *thread)
    }

    pub fn free(&mut self, addr: address) -> Result<()> {
        self.allocator.free(addr)
    }

    pub fn write_functional(&self, addr: address, data: &[u8]) -> Result<()> {
        log::trace!("writing {} bytes to {addr:#x}", data.len());
        let thread = self.collaborators()?.thread;
        let mut thread = thread.lock();
        thread.write_blob(addr, data)?;
        Ok(())
    }

    pub fn read_functional(&self, addr: address, data: &mut [u8]) -> Result<()> {
        log::trace!("reading {} bytes from {addr:#x}", data.len());
        let thread = self.collaborators()?.thread;
        let thread = thread.lock();
        thread.read_blob(addr, data)?;
        Ok(())
    }

    pub fn memcpy(
        &self,
        src: address,
        dst: address,
        num_bytes: u64,
        stream: Option<StreamId>,
    ) -> Result<()> {
        let copy_engine = self.collaborators()?.copy_engine;
        let mut copy_engine = copy_engine.lock();
        copy_engine.memcpy(src, dst, num_bytes, stream)
    }

    /// Pop all completions whose ready time passed and unblock the host
    /// once everything drained.
    fn drain_completions(&mut self, collaborators: &Collaborators) {
        let now = self.now();
        while let Some(finished) = self.completions.pop_ready(now) {
            log::debug!(
                "{}",
                style(format!("device finished kernel {}", finished.kernel)).green()
            );
            let mut streams = collaborators.streams.lock();
            streams.register_finished_kernel(finished.kernel);
            self.kernel_times.push(stats::KernelTime {
                kernel: finished.kernel.get(),
                elapsed: now - self.kernel_start_time,
            });

            if self.unblock_needed && streams.is_empty() && self.completions.is_empty() {
                log::debug!("stream manager is empty, unblocking host thread");
                collaborators.thread.lock().activate();
                self.unblock_needed = false;
            }
        }
    }

    #[tracing::instrument(name = "spa_device_tick", skip(self))]
    fn device_tick(&mut self) -> Result<()> {
        let now = self.now();
        log::trace!("device tick at {now}");
        self.device_tick_pending = None;
        let collaborators = self.collaborators()?;

        let termination = collaborators.device.lock().finished_kernel();
        if let Some(termination) = termination {
            let delay = pad_delay(
                now,
                termination.time,
                self.config.return_delay,
                self.config.gpu_tick_conversion,
            );
            let ready_time = self.ticks_from_now(Kind::DeviceActivity, delay)?;
            let ready_time = self.completions.push(termination.kernel, ready_time);
            log::debug!(
                "kernel {} finished at tick {}, visible to host after tick {ready_time}",
                termination.kernel,
                termination.time
            );
            self.request_stream_tick(1)?;
            self.running = false;
        }

        self.drain_completions(&collaborators);

        let active = collaborators.device.lock().active();
        if active {
            let wakeup = collaborators.device.lock().cycle(now);
            if let Some(cycles) = wakeup {
                self.request_device_tick(cycles)?;
            }
        } else if let Some(front) = self.completions.front() {
            let ready_time = front.ready_time;
            let at = ready_time.checked_add(1).ok_or(Fatal::TickOverflow {
                kind: Kind::DeviceActivity,
                now: ready_time,
                delay: 1,
            })?;
            self.schedule_device_tick(at)?;
        }

        collaborators
            .device
            .lock()
            .deadlock_check()
            .map_err(|source| Fatal::Deadlock { now, source })?;

        if !self.stream_tick_pending && collaborators.streams.lock().ready() {
            self.request_stream_tick(STREAM_DELAY)?;
        }
        Ok(())
    }

    #[tracing::instrument(name = "spa_stream_tick", skip(self))]
    fn stream_tick(&mut self) -> Result<()> {
        log::trace!("stream tick at {}", self.now());
        self.stream_tick_pending = false;
        let collaborators = self.collaborators()?;

        let op = collaborators.streams.lock().front();
        if let Some(op) = op {
            let dispatched = {
                let mut device = collaborators.device.lock();
                let mut copy_engine = collaborators.copy_engine.lock();
                op.execute(&mut *device, &mut *copy_engine)?
            };
            if let Dispatched::KernelLaunch { launch_time, .. } = dispatched {
                self.begin_running(launch_time)?;
            }
        }

        if collaborators.streams.lock().ready() {
            self.request_stream_tick(STREAM_DELAY)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, event: event::Event) -> Result<()> {
        match event.kind {
            Kind::DeviceActivity => self.device_tick(),
            Kind::StreamDispatch => self.stream_tick(),
        }
    }

    /// Process the next event.
    ///
    /// Returns the processed event, or `None` if nothing is scheduled.
    pub fn step(&mut self) -> Result<Option<event::Event>> {
        match self.events.pop_until(Tick::MAX) {
            Some(event) => {
                self.dispatch(event)?;
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }

    /// Process all events due at or before `limit`, then advance to `limit`.
    pub fn run_until(&mut self, limit: Tick) -> Result<()> {
        while let Some(event) = self.events.pop_until(limit) {
            self.dispatch(event)?;
        }
        self.events.advance_to(limit);
        Ok(())
    }

    /// Process events until none are left.
    pub fn run(&mut self) -> Result<()> {
        while self.step()?.is_some() {}
        log::debug!("no more events at tick {}", self.now());
        Ok(())
    }

    /// Snapshot of the collected statistics.
    #[must_use]
    pub fn stats(&self) -> stats::Stats {
        let mut memory = stats::MemorySystem::default();
        for unit in &self.compute_units {
            let unit = unit.lock();
            memory.retries.push(unit.num_retries());
            memory.max_outstanding.push(unit.max_outstanding());
        }
        stats::Stats {
            kernels: self.kernel_times.clone(),
            memory,
            cleared_at: self.cleared_at,
        }
    }

    pub fn print_stats(&self, out: &mut dyn std::io::Write) -> Result<()> {
        let stats = self.stats();
        for (i, kernel) in stats.kernels.iter().enumerate() {
            log::info!("kernel[{i}] time = {}", kernel.elapsed);
        }
        log::info!("total kernel time = {}", stats.kernels.total());
        write!(out, "{stats}")?;
        Ok(())
    }

    /// Write the statistics report to `<dir>/<stats_filename>`.
    pub fn write_stats_file(&self, dir: impl AsRef<Path>) -> Result<()> {
        let path = dir.as_ref().join(&self.config.stats_filename);
        let mut file = utils::fs::open_writable(&path).map_err(std::io::Error::from)?;
        self.print_stats(&mut file)?;
        std::io::Write::flush(&mut file)?;
        log::debug!("wrote stats to {}", path.display());
        Ok(())
    }

    pub fn clear_stats(&mut self) {
        let now = self.now();
        log::debug!("clearing stats at tick {now}");
        for unit in &self.compute_units {
            unit.lock().clear_stats();
        }
        self.cleared_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::StreamProcessorArray;
    use crate::compute_unit::CounterUnit;
    use crate::config::{Config, TickConversion};
    use crate::copy::FunctionalCopyEngine;
    use crate::device::{DeadlockError, FixedLatency};
    use crate::error::Fatal;
    use crate::event::Kind;
    use crate::host::{HostThread, SimThread, ThreadStatus};
    use crate::streams::{StreamManager, StreamOperation, StreamQueue};
    use crate::testing::{self, device::ScriptedDevice};
    use crate::{KernelId, Ref};
    use color_eyre::eyre;
    use parking_lot::Mutex;
    use pretty_assertions_sorted as diff;
    use std::sync::Arc;

    struct Harness {
        spa: StreamProcessorArray,
        thread: Ref<SimThread>,
        device: Ref<ScriptedDevice>,
        streams: Ref<StreamQueue>,
    }

    fn config(launch_delay: f64, return_delay: f64, conversion: f64) -> eyre::Result<Config> {
        Ok(Config {
            launch_delay,
            return_delay,
            gpu_tick_conversion: TickConversion::new(conversion)?,
            ..Config::default()
        })
    }

    fn harness(config: Config) -> eyre::Result<Harness> {
        testing::init_logging();
        let mut spa = StreamProcessorArray::new(config)?;
        let thread = Arc::new(Mutex::new(SimThread::new()));
        let device = Arc::new(Mutex::new(ScriptedDevice::new()));
        let streams = Arc::new(Mutex::new(StreamQueue::new()));
        spa.start(
            thread.clone(),
            device.clone(),
            streams.clone(),
            Arc::new(Mutex::new(FunctionalCopyEngine::new())),
        );
        Ok(Harness {
            spa,
            thread,
            device,
            streams,
        })
    }

    fn kernel(id: u64) -> eyre::Result<KernelId> {
        Ok(KernelId::new(id)?)
    }

    #[test]
    fn test_begin_running_pads_launch_delay() -> eyre::Result<()> {
        let Harness { mut spa, .. } = harness(config(5.0, 0.0, 2.0)?)?;
        spa.run_until(100)?;
        spa.begin_running(100)?;
        assert!(spa.running());
        assert_eq!(spa.pending_device_tick(), Some(110));
        assert_eq!(spa.events().num_pending(Kind::DeviceActivity), 1);
        Ok(())
    }

    #[test]
    fn test_begin_running_after_launch_delay_elapsed() -> eyre::Result<()> {
        let Harness { mut spa, .. } = harness(config(5.0, 0.0, 2.0)?)?;
        spa.run_until(150)?;
        spa.begin_running(100)?;
        assert_eq!(spa.pending_device_tick(), Some(151));
        Ok(())
    }

    #[test]
    fn test_begin_running_twice_is_fatal() -> eyre::Result<()> {
        let Harness { mut spa, device, .. } = harness(config(1.0, 0.0, 1.0)?)?;
        spa.begin_running(0)?;
        spa.step()?;
        assert!(device.lock().cycled_at.is_empty());
        assert!(matches!(
            spa.begin_running(1),
            Err(Fatal::AlreadyRunning { now: 1 })
        ));
        Ok(())
    }

    #[test]
    fn test_completion_is_padded_by_return_delay() -> eyre::Result<()> {
        let Harness {
            mut spa, device, ..
        } = harness(config(0.0, 5.0, 2.0)?)?;
        spa.run_until(204)?;
        spa.request_device_tick(0.5)?;
        // 0.5 cycles are a single tick
        assert_eq!(spa.pending_device_tick(), Some(205));

        device.lock().finish(kernel(1)?, 200);
        spa.run_until(205)?;

        let ready: Vec<_> = spa
            .completions()
            .iter()
            .map(|f| (f.kernel.get(), f.ready_time))
            .collect();
        diff::assert_eq!(ready, vec![(1, 210)]);
        assert!(!spa.running());
        assert!(spa.stream_tick_pending());
        // device is idle, wake up right after the completion became ready
        assert_eq!(spa.pending_device_tick(), Some(211));
        Ok(())
    }

    #[test]
    fn test_completions_drain_in_order_once_ready() -> eyre::Result<()> {
        let Harness {
            mut spa,
            device,
            streams,
            ..
        } = harness(config(0.0, 0.0, 1.0)?)?;
        for id in 1..=2 {
            streams.lock().push(StreamOperation::KernelLaunch {
                kernel: kernel(id)?,
                stream: 0,
                launch_time: 0,
            });
        }

        spa.request_stream_tick(1)?;
        spa.run_until(1)?;
        assert_eq!(device.lock().launched, vec![kernel(1)?]);
        assert!(spa.running());
        assert_eq!(spa.pending_device_tick(), Some(2));

        device.lock().finish(kernel(1)?, 2);
        spa.run_until(2)?;
        assert_eq!(spa.completions().len(), 1);
        // not yet visible at its ready time
        spa.run_until(3)?;
        assert_eq!(spa.completions().len(), 1);
        assert!(streams.lock().finished_kernels().is_empty());

        spa.run_until(4)?;
        assert!(spa.completions().is_empty());
        assert_eq!(streams.lock().finished_kernels(), &[kernel(1)?]);

        // second kernel is dispatched once the first one was registered
        spa.run_until(5)?;
        assert_eq!(device.lock().launched, vec![kernel(1)?, kernel(2)?]);

        let stats = spa.stats();
        let times: Vec<_> = stats.kernels.iter().map(|t| (t.kernel, t.elapsed)).collect();
        diff::assert_eq!(times, vec![(1, 3)]);
        Ok(())
    }

    #[test]
    fn test_block_and_unblock_exactly_once() -> eyre::Result<()> {
        let Harness {
            mut spa,
            thread,
            device,
            streams,
        } = harness(config(0.0, 0.0, 1.0)?)?;

        assert!(!spa.request_block()?);
        assert!(!spa.unblock_needed());

        streams.lock().push(StreamOperation::KernelLaunch {
            kernel: kernel(1)?,
            stream: 0,
            launch_time: 0,
        });
        device.lock().wakeup = Some(1.0);
        spa.request_stream_tick(1)?;
        assert!(spa.request_block()?);
        thread.lock().suspend();

        spa.run_until(2)?;
        device.lock().finish(kernel(1)?, 2);
        spa.run()?;

        assert!(!spa.unblock_needed());
        let thread = thread.lock();
        assert_eq!(thread.status(), ThreadStatus::Active);
        assert_eq!(thread.num_activations, 1);
        Ok(())
    }

    #[test]
    fn test_unblock_requires_suspended_thread() -> eyre::Result<()> {
        let Harness {
            mut spa, thread, ..
        } = harness(Config::default())?;
        assert!(matches!(
            spa.unblock(),
            Err(Fatal::ThreadNotSuspended {
                status: ThreadStatus::Active
            })
        ));
        thread.lock().suspend();
        spa.unblock()?;
        assert_eq!(thread.lock().status(), ThreadStatus::Active);
        Ok(())
    }

    #[test]
    fn test_duplicate_stream_tick_is_suppressed() -> eyre::Result<()> {
        let Harness { mut spa, .. } = harness(Config::default())?;
        spa.request_stream_tick(3)?;
        spa.request_stream_tick(1)?;
        assert!(spa.stream_tick_pending());
        assert_eq!(spa.events().num_pending(Kind::StreamDispatch), 1);
        assert_eq!(spa.events().peek().map(|e| e.time), Some(3));

        // nothing queued, so no follow up tick
        spa.step()?;
        assert!(!spa.stream_tick_pending());
        assert!(spa.events().is_empty());
        Ok(())
    }

    #[test]
    fn test_host_stays_blocked_while_streams_have_work() -> eyre::Result<()> {
        let Harness {
            mut spa,
            thread,
            device,
            streams,
        } = harness(config(0.0, 0.0, 1.0)?)?;
        for id in 1..=2 {
            streams.lock().push(StreamOperation::KernelLaunch {
                kernel: kernel(id)?,
                stream: 0,
                launch_time: 0,
            });
        }
        device.lock().wakeup = Some(1.0);
        spa.request_stream_tick(1)?;
        assert!(spa.request_block()?);
        thread.lock().suspend();

        spa.run_until(2)?;
        device.lock().finish(kernel(1)?, 2);
        spa.run_until(5)?;

        // first kernel drained, second one is still queued
        assert_eq!(streams.lock().finished_kernels(), &[kernel(1)?]);
        assert!(spa.completions().is_empty());
        assert!(spa.unblock_needed());
        assert_eq!(thread.lock().status(), ThreadStatus::Suspended);
        assert_eq!(thread.lock().num_activations, 0);

        spa.run_until(7)?;
        assert_eq!(device.lock().launched, vec![kernel(1)?, kernel(2)?]);
        device.lock().finish(kernel(2)?, 7);
        spa.run()?;

        assert_eq!(
            streams.lock().finished_kernels(),
            &[kernel(1)?, kernel(2)?]
        );
        assert!(!spa.unblock_needed());
        assert_eq!(thread.lock().status(), ThreadStatus::Active);
        assert_eq!(thread.lock().num_activations, 1);
        Ok(())
    }

    #[test]
    fn test_tick_overflow_is_fatal() -> eyre::Result<()> {
        let Harness { mut spa, .. } = harness(config(0.0, 0.0, 2.0)?)?;
        spa.run_until(u64::MAX - 1)?;
        assert!(matches!(
            spa.request_stream_tick(5),
            Err(Fatal::TickOverflow {
                kind: Kind::StreamDispatch,
                delay: 5,
                ..
            })
        ));
        assert!(!spa.stream_tick_pending());
        assert!(matches!(
            spa.request_device_tick(4.0),
            Err(Fatal::TickOverflow {
                kind: Kind::DeviceActivity,
                delay: 8,
                ..
            })
        ));
        assert_eq!(spa.pending_device_tick(), None);
        spa.request_stream_tick(1)?;
        assert_eq!(spa.events().peek().map(|e| e.time), Some(u64::MAX));
        Ok(())
    }

    #[test]
    fn test_duplicate_device_tick_is_fatal() -> eyre::Result<()> {
        let Harness { mut spa, .. } = harness(Config::default())?;
        spa.request_device_tick(4.0)?;
        assert!(matches!(
            spa.request_device_tick(1.0),
            Err(Fatal::DeviceTickAlreadyScheduled {
                pending: 4,
                requested: 1
            })
        ));
        Ok(())
    }

    #[test]
    fn test_active_device_is_cycled() -> eyre::Result<()> {
        let Harness {
            mut spa, device, ..
        } = harness(config(0.0, 0.0, 3.0)?)?;
        {
            let mut device = device.lock();
            device.active = true;
            device.wakeup = Some(2.0);
        }
        spa.request_device_tick(0.0)?;
        spa.run_until(13)?;
        assert_eq!(device.lock().cycled_at, vec![0, 6, 12]);
        assert_eq!(spa.pending_device_tick(), Some(18));
        Ok(())
    }

    #[test]
    fn test_deadlock_is_fatal() -> eyre::Result<()> {
        let Harness {
            mut spa, device, ..
        } = harness(Config::default())?;
        device.lock().deadlock = Some(DeadlockError {
            cycles: 10,
            running: 1,
        });
        spa.request_device_tick(1.0)?;
        assert!(matches!(
            spa.step(),
            Err(Fatal::Deadlock { now: 1, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_not_started() -> eyre::Result<()> {
        let mut spa = StreamProcessorArray::new(Config::default())?;
        assert!(matches!(spa.allocate(16), Err(Fatal::NotStarted)));
        assert!(matches!(spa.request_block(), Err(Fatal::NotStarted)));
        spa.request_stream_tick(1)?;
        assert!(matches!(spa.step(), Err(Fatal::NotStarted)));
        Ok(())
    }

    #[test]
    fn test_allocate_and_free() -> eyre::Result<()> {
        let Harness {
            mut spa, thread, ..
        } = harness(Config::default())?;
        let first = spa.allocate(0x100)?;
        let second = spa.allocate_named(64, Some("output".to_string()))?;
        assert_eq!(first, 0x0800_0100);
        assert_eq!(second, 0x0800_0200);
        assert_eq!(thread.lock().mapped_pages(), vec![0x0800_0000]);
        assert!(matches!(
            spa.free(first),
            Err(Fatal::FreeUnsupported { addr: 0x0800_0100 })
        ));

        spa.write_functional(second, &[1, 2, 3])?;
        let mut data = [0; 3];
        spa.read_functional(second, &mut data)?;
        assert_eq!(data, [1, 2, 3]);

        spa.memcpy(second, first, 3, None)?;
        spa.read_functional(first, &mut data)?;
        assert_eq!(data, [1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_compute_unit_lookup() -> eyre::Result<()> {
        let mut spa = StreamProcessorArray::new(Config::default())?;
        let first = Arc::new(Mutex::new(CounterUnit::new()));
        assert_eq!(spa.register_compute_unit(first.clone()), 0);
        assert_eq!(
            spa.register_compute_unit(Arc::new(Mutex::new(CounterUnit::new()))),
            1
        );
        assert_eq!(spa.num_compute_units(), 2);
        assert!(spa.compute_unit(1).is_ok());
        assert!(matches!(
            spa.compute_unit(2),
            Err(Fatal::ComputeUnitOutOfRange {
                id: 2,
                num_units: 2
            })
        ));

        assert!(!first.lock().initialized());
        spa.start(
            Arc::new(Mutex::new(SimThread::new())),
            Arc::new(Mutex::new(ScriptedDevice::new())),
            Arc::new(Mutex::new(StreamQueue::new())),
            Arc::new(Mutex::new(FunctionalCopyEngine::new())),
        );
        assert!(first.lock().initialized());
        Ok(())
    }

    #[test]
    fn test_stats_report() -> eyre::Result<()> {
        let Harness { mut spa, .. } = harness(Config::default())?;
        let unit = Arc::new(Mutex::new(CounterUnit::new()));
        {
            let mut unit = unit.lock();
            unit.issue();
            unit.issue();
            unit.retry();
        }
        spa.register_compute_unit(unit.clone());
        spa.register_compute_unit(Arc::new(Mutex::new(CounterUnit::new())));

        let mut out = Vec::new();
        spa.print_stats(&mut out)?;
        diff::assert_eq!(
            String::from_utf8(out)?,
            [
                "total kernel time = 0",
                "",
                "Memory System:",
                "Retires: [1 0 ]",
                "Max outstanding: [2 0 ]",
                "",
                "",
            ]
            .join("\n")
        );

        spa.run_until(500)?;
        spa.clear_stats();
        let stats = spa.stats();
        assert_eq!(stats.cleared_at, Some(500));
        assert_eq!(stats.memory.retries, vec![0, 0]);
        assert!(stats.to_string().ends_with("Stats cleared at tick 500\n"));

        let dir = tempfile::tempdir()?;
        spa.write_stats_file(dir.path())?;
        let written = std::fs::read_to_string(dir.path().join("gpu_stats.txt"))?;
        assert_eq!(written, stats.to_string());
        Ok(())
    }

    #[test]
    fn test_end_to_end_with_reference_collaborators() -> eyre::Result<()> {
        testing::init_logging();
        let mut spa = StreamProcessorArray::new(config(4.0, 6.0, 2.0)?)?;
        let thread = Arc::new(Mutex::new(SimThread::new()));
        let device = Arc::new(Mutex::new(FixedLatency::new(10)));
        let streams = Arc::new(Mutex::new(StreamQueue::new()));
        spa.register_compute_unit(Arc::new(Mutex::new(CounterUnit::new())));
        spa.start(
            thread.clone(),
            device.clone(),
            streams.clone(),
            Arc::new(Mutex::new(FunctionalCopyEngine::new())),
        );

        let input = spa.allocate(64)?;
        let output = spa.allocate(64)?;
        spa.write_functional(input, &[7; 64])?;

        {
            let mut streams = streams.lock();
            streams.push(StreamOperation::Memcpy {
                src: input,
                dst: output,
                num_bytes: 64,
                stream: 0,
            });
            streams.push(StreamOperation::Synchronize { stream: 0 });
            for id in 1..=3 {
                streams.push(StreamOperation::KernelLaunch {
                    kernel: kernel(id)?,
                    stream: 0,
                    launch_time: 0,
                });
            }
        }
        spa.request_stream_tick(1)?;
        assert!(spa.request_block()?);
        thread.lock().suspend();

        spa.run()?;

        assert!(streams.lock().is_empty());
        assert_eq!(
            streams.lock().finished_kernels(),
            &[kernel(1)?, kernel(2)?, kernel(3)?]
        );
        assert!(!spa.running());
        assert_eq!(thread.lock().status(), ThreadStatus::Active);
        assert_eq!(thread.lock().num_activations, 1);
        assert_eq!(device.lock().cycles, 30);

        let mut data = [0; 64];
        spa.read_functional(output, &mut data)?;
        assert_eq!(data, [7; 64]);

        let stats = spa.stats();
        assert_eq!(stats.kernels.len(), 3);
        assert!(stats.kernels.iter().all(|t| t.elapsed > 10 * 2));
        Ok(())
    }
}
