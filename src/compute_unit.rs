use crate::host::HostThread;
use crate::Ref;

/// A shader core attached to the stream processor array.
///
/// Only its memory system counters are of interest here.
pub trait ComputeUnit: std::fmt::Debug + Send + 'static {
    fn initialize(&mut self, thread: Ref<dyn HostThread>);

    /// Number of memory requests that had to be retried.
    fn num_retries(&self) -> u64;

    /// Maximum number of memory requests in flight at any time.
    fn max_outstanding(&self) -> u64;

    fn clear_stats(&mut self);
}

/// Compute unit that only tracks memory request counters.
#[derive(Debug, Default)]
pub struct CounterUnit {
    thread: Option<Ref<dyn HostThread>>,
    outstanding: u64,
    num_retries: u64,
    max_outstanding: u64,
}

impl CounterUnit {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn initialized(&self) -> bool {
        self.thread.is_some()
    }

    pub fn issue(&mut self) {
        self.outstanding += 1;
        self.max_outstanding = self.max_outstanding.max(self.outstanding);
    }

    pub fn retry(&mut self) {
        self.num_retries += 1;
    }

    pub fn complete(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
    }
}

impl ComputeUnit for CounterUnit {
    fn initialize(&mut self, thread: Ref<dyn HostThread>) {
        self.thread = Some(thread);
    }

    fn num_retries(&self) -> u64 {
        self.num_retries
    }

    fn max_outstanding(&self) -> u64 {
        self.max_outstanding
    }

    fn clear_stats(&mut self) {
        self.num_retries = 0;
        self.max_outstanding = self.outstanding;
    }
}

#[cfg(test)]
mod tests {
    use super::{ComputeUnit, CounterUnit};

    #[test]
    fn test_counters() {
        let mut unit = CounterUnit::new();
        unit.issue();
        unit.issue();
        unit.retry();
        unit.complete();
        unit.issue();
        unit.complete();
        assert_eq!(unit.max_outstanding(), 2);
        assert_eq!(unit.num_retries(), 1);

        unit.clear_stats();
        assert_eq!(unit.num_retries(), 0);
        assert_eq!(unit.max_outstanding(), 1);
    }
}
