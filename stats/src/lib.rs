pub mod kernel;
pub mod mem;

pub use kernel::{KernelTime, KernelTimes};
pub use mem::MemorySystem;

use serde::{Deserialize, Serialize};

/// Statistics of a stream processor array run.
///
/// The `Display` implementation renders the exit-time report that
/// downstream tooling greps for, so its format must remain stable.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub kernels: KernelTimes,
    pub memory: MemorySystem,
    /// Host tick at which statistics were last cleared.
    pub cleared_at: Option<u64>,
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, kernel) in self.kernels.iter().enumerate() {
            writeln!(f, "kernel[{i}] time = {}", kernel.elapsed)?;
        }
        writeln!(f, "total kernel time = {}", self.kernels.total())?;

        writeln!(f)?;
        write!(f, "{}", self.memory)?;
        writeln!(f)?;

        match self.cleared_at {
            Some(tick) if tick > 0 => writeln!(f, "Stats cleared at tick {tick}"),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{KernelTime, MemorySystem, Stats};
    use pretty_assertions_sorted as diff;

    #[test]
    fn test_report_format() {
        let mut stats = Stats::default();
        stats.kernels.push(KernelTime {
            kernel: 1,
            elapsed: 120,
        });
        stats.kernels.push(KernelTime {
            kernel: 2,
            elapsed: 30,
        });
        stats.memory = MemorySystem {
            retries: vec![3, 0],
            max_outstanding: vec![12, 7],
        };
        diff::assert_eq!(
            stats.to_string(),
            [
                "kernel[0] time = 120",
                "kernel[1] time = 30",
                "total kernel time = 150",
                "",
                "Memory System:",
                "Retires: [3 0 ]",
                "Max outstanding: [12 7 ]",
                "",
                "",
            ]
            .join("\n")
        );
    }

    #[test]
    fn test_report_mentions_clear_tick() {
        let stats = Stats {
            cleared_at: Some(4_000),
            ..Stats::default()
        };
        let report = stats.to_string();
        assert!(report.starts_with("total kernel time = 0\n"));
        assert!(report.ends_with("Stats cleared at tick 4000\n"));
    }

    #[test]
    fn test_report_omits_clear_tick_at_zero() {
        let stats = Stats {
            cleared_at: Some(0),
            ..Stats::default()
        };
        assert!(!stats.to_string().contains("Stats cleared"));
    }
}
