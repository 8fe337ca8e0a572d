use crate::{DeviceCycles, KernelId, Tick};
use std::collections::VecDeque;

/// Reported by the device engine when a kernel finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelTermination {
    pub kernel: KernelId,
    /// Host tick at which the device finished the kernel.
    pub time: Tick,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("no progress for {cycles} cycles with {running} running kernel(s)")]
pub struct DeadlockError {
    pub cycles: u64,
    pub running: usize,
}

/// The accelerator's execution engine.
///
/// The stream processor array only drives the engine; it never looks into
/// how kernels are executed.
pub trait DeviceEngine: std::fmt::Debug + Send + 'static {
    /// Start executing `kernel`.
    fn launch(&mut self, kernel: KernelId);

    /// Take the next kernel that finished since the last call.
    fn finished_kernel(&mut self) -> Option<KernelTermination>;

    /// Simulate a single device cycle at host tick `now`.
    ///
    /// Returns the number of device cycles after which the engine wants
    /// to be stepped again, if any.
    fn cycle(&mut self, now: Tick) -> Option<DeviceCycles>;

    /// Whether the engine still has work to do.
    fn active(&self) -> bool;

    fn deadlock_check(&self) -> Result<(), DeadlockError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RunningKernel {
    kernel: KernelId,
    remaining_cycles: u64,
}

/// Device engine where every kernel takes a fixed number of cycles.
///
/// Kernels run one after the other in launch order.
/// A kernel that makes no progress for `deadlock_threshold` cycles is
/// reported as a deadlock.
#[derive(Debug, Clone)]
pub struct FixedLatency {
    kernel_cycles: u64,
    deadlock_threshold: Option<u64>,
    running: VecDeque<RunningKernel>,
    finished: VecDeque<KernelTermination>,
    stalled: bool,
    cycles_without_progress: u64,
    /// Total number of simulated cycles.
    pub cycles: u64,
}

impl FixedLatency {
    #[must_use]
    pub fn new(kernel_cycles: u64) -> Self {
        Self {
            kernel_cycles,
            deadlock_threshold: None,
            running: VecDeque::new(),
            finished: VecDeque::new(),
            stalled: false,
            cycles_without_progress: 0,
            cycles: 0,
        }
    }

    #[must_use]
    pub fn with_deadlock_threshold(mut self, cycles: u64) -> Self {
        self.deadlock_threshold = Some(cycles);
        self
    }

    /// Stop making progress, e.g. to provoke a deadlock.
    pub fn stall(&mut self, stalled: bool) {
        self.stalled = stalled;
    }

    #[must_use]
    pub fn num_running(&self) -> usize {
        self.running.len()
    }
}

impl DeviceEngine for FixedLatency {
    fn launch(&mut self, kernel: KernelId) {
        log::debug!(
            "device: launch kernel {kernel} ({} cycles)",
            self.kernel_cycles
        );
        self.running.push_back(RunningKernel {
            kernel,
            remaining_cycles: self.kernel_cycles,
        });
    }

    fn finished_kernel(&mut self) -> Option<KernelTermination> {
        self.finished.pop_front()
    }

    fn cycle(&mut self, now: Tick) -> Option<DeviceCycles> {
        self.cycles += 1;
        if self.stalled {
            self.cycles_without_progress += 1;
            return Some(1.0);
        }
        self.cycles_without_progress = 0;
        if let Some(current) = self.running.front_mut() {
            current.remaining_cycles = current.remaining_cycles.saturating_sub(1);
            if current.remaining_cycles == 0 {
                let kernel = current.kernel;
                self.running.pop_front();
                log::debug!("device: kernel {kernel} finished at tick {now}");
                self.finished.push_back(KernelTermination { kernel, time: now });
            }
        }
        // finished kernels are picked up on the next device tick
        Some(1.0)
    }

    fn active(&self) -> bool {
        !self.running.is_empty()
    }

    fn deadlock_check(&self) -> Result<(), DeadlockError> {
        match self.deadlock_threshold {
            Some(threshold) if self.cycles_without_progress >= threshold => Err(DeadlockError {
                cycles: self.cycles_without_progress,
                running: self.running.len(),
            }),
            _ => Ok(()),
        }
    }
}
