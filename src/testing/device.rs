use crate::device::{DeadlockError, DeviceEngine, KernelTermination};
use crate::{DeviceCycles, KernelId, Tick};
use std::collections::VecDeque;

/// Device engine fully controlled by the test.
///
/// Kernels only finish when the test says so.
#[derive(Debug, Default)]
pub struct ScriptedDevice {
    pub launched: Vec<KernelId>,
    /// Host ticks at which the device was cycled.
    pub cycled_at: Vec<Tick>,
    pub finished: VecDeque<KernelTermination>,
    pub active: bool,
    pub wakeup: Option<DeviceCycles>,
    pub deadlock: Option<DeadlockError>,
}

impl ScriptedDevice {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `kernel` as finished at `time` on the next device tick.
    pub fn finish(&mut self, kernel: KernelId, time: Tick) {
        self.active = false;
        self.finished.push_back(KernelTermination { kernel, time });
    }
}

impl DeviceEngine for ScriptedDevice {
    fn launch(&mut self, kernel: KernelId) {
        self.launched.push(kernel);
        self.active = true;
    }

    fn finished_kernel(&mut self) -> Option<KernelTermination> {
        self.finished.pop_front()
    }

    fn cycle(&mut self, now: Tick) -> Option<DeviceCycles> {
        self.cycled_at.push(now);
        self.wakeup
    }

    fn active(&self) -> bool {
        self.active
    }

    fn deadlock_check(&self) -> Result<(), DeadlockError> {
        match &self.deadlock {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}
