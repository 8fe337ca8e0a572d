use serde::{Deserialize, Serialize};

/// Host ticks between a kernel's launch and its completion becoming visible.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelTime {
    pub kernel: u64,
    pub elapsed: u64,
}

/// Append-only log of kernel execution times, in completion order.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelTimes(Vec<KernelTime>);

impl KernelTimes {
    pub fn push(&mut self, time: KernelTime) {
        self.0.push(time);
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.0.iter().map(|time| time.elapsed).sum()
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<KernelTime> {
        self.0
    }
}

impl std::ops::Deref for KernelTimes {
    type Target = [KernelTime];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromIterator<KernelTime> for KernelTimes {
    fn from_iter<I: IntoIterator<Item = KernelTime>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
