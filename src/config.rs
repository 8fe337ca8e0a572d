use crate::error::Fatal;
use crate::{DeviceCycles, Tick};
use color_eyre::eyre;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Start of the device break.
///
/// Chosen high enough to stay clear of the host process' own heap.
pub const BRK_START: crate::address = 0x0800_0000;

/// First address handed out by the allocator.
///
/// The offset of 0x100 matches the addresses GPGPU-Sim hands out for
/// constant memory, which traces and tooling depend on.
pub const FIRST_ALLOCATION: crate::address = 0x0800_0100;

/// Host ticks between two consecutive stream dispatches.
pub const STREAM_DELAY: Tick = 1;

/// Ratio converting device cycles into host ticks.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct TickConversion(f64);

impl TickConversion {
    pub fn new(ratio: f64) -> Result<Self, Fatal> {
        if ratio.is_finite() && ratio > 0.0 {
            Ok(Self(ratio))
        } else {
            Err(Fatal::InvalidConfig(format!(
                "gpu tick conversion must be positive and finite (got {ratio})"
            )))
        }
    }

    #[must_use]
    pub fn ratio(self) -> f64 {
        self.0
    }

    /// Convert device cycles to host ticks, truncating fractional ticks.
    #[must_use]
    pub fn to_ticks(self, cycles: DeviceCycles) -> Tick {
        (cycles * self.0) as Tick
    }
}

impl Default for TickConversion {
    fn default() -> Self {
        Self(1.0)
    }
}

impl TryFrom<f64> for TickConversion {
    type Error = Fatal;

    fn try_from(ratio: f64) -> Result<Self, Self::Error> {
        Self::new(ratio)
    }
}

impl From<TickConversion> for f64 {
    fn from(conversion: TickConversion) -> Self {
        conversion.0
    }
}

/// Configuration of the stream processor array.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Minimum device cycles between a launch on the host and the device
    /// starting to execute the kernel.
    pub launch_delay: DeviceCycles,
    /// Minimum device cycles between a kernel finishing on the device and
    /// its completion becoming visible to the host.
    pub return_delay: DeviceCycles,
    /// Host ticks per device cycle.
    pub gpu_tick_conversion: TickConversion,
    /// Shared memory access latency in device cycles (used by compute units).
    pub shared_mem_delay: u64,
    /// Route device memory accesses through the host memory system.
    pub use_gem5_mem: bool,
    /// Page size of the host address space backing device allocations.
    pub page_size: u64,
    /// File name of the exit-time statistics report.
    pub stats_filename: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            launch_delay: 0.0,
            return_delay: 0.0,
            gpu_tick_conversion: TickConversion::default(),
            shared_mem_delay: 1,
            use_gem5_mem: false,
            page_size: 4096,
            stats_filename: "gpu_stats.txt".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let reader = utils::fs::open_readable(path.as_ref())?;
        let config: Self = serde_yaml::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Fatal> {
        if !self.page_size.is_power_of_two() {
            return Err(Fatal::InvalidConfig(format!(
                "page size must be a power of two (got {})",
                self.page_size
            )));
        }
        for (name, delay) in [
            ("launch delay", self.launch_delay),
            ("return delay", self.return_delay),
        ] {
            if !delay.is_finite() || delay < 0.0 {
                return Err(Fatal::InvalidConfig(format!(
                    "{name} must be a non-negative number of cycles (got {delay})"
                )));
            }
        }
        Ok(())
    }
}
