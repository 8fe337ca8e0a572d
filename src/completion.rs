use crate::config::TickConversion;
use crate::{DeviceCycles, KernelId, Tick};
use std::collections::VecDeque;

/// Delay until an event that happened on the device at `reported` becomes
/// visible on the host.
///
/// The event is padded to take at least `min_cycles` device cycles (in host
/// ticks). If that much time has already passed, the delay is a single tick.
#[must_use]
pub fn pad_delay(
    now: Tick,
    reported: Tick,
    min_cycles: DeviceCycles,
    conversion: TickConversion,
) -> Tick {
    let min_delay = conversion.to_ticks(min_cycles);
    let elapsed = now.saturating_sub(reported);
    if elapsed < min_delay {
        min_delay - elapsed
    } else {
        1
    }
}

/// A kernel that finished on the device, waiting to become visible to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FinishedKernel {
    pub kernel: KernelId,
    pub ready_time: Tick,
}

impl std::fmt::Display for FinishedKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "kernel {} (ready at {})", self.kernel, self.ready_time)
    }
}

/// FIFO of finished kernels ordered by ready time.
///
/// Entries are pushed with non-decreasing ready times and never reordered.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompletionQueue {
    inner: VecDeque<FinishedKernel>,
}

impl CompletionQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a finished kernel.
    ///
    /// A ready time earlier than the last queued entry is clamped to it,
    /// keeping the queue ordered by ready time. Returns the effective ready time.
    pub fn push(&mut self, kernel: KernelId, ready_time: Tick) -> Tick {
        let ready_time = match self.inner.back() {
            Some(last) if last.ready_time > ready_time => {
                log::debug!(
                    "completion of kernel {kernel} at {ready_time} clamped to {}",
                    last.ready_time
                );
                last.ready_time
            }
            _ => ready_time,
        };
        self.inner.push_back(FinishedKernel { kernel, ready_time });
        ready_time
    }

    #[must_use]
    pub fn front(&self) -> Option<&FinishedKernel> {
        self.inner.front()
    }

    /// Pop the front entry if its ready time has passed at `now`.
    pub fn pop_ready(&mut self, now: Tick) -> Option<FinishedKernel> {
        match self.inner.front() {
            Some(front) if front.ready_time < now => self.inner.pop_front(),
            _ => None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> std::collections::vec_deque::Iter<'_, FinishedKernel> {
        self.inner.iter()
    }
}
