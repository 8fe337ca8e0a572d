use crate::{address, Tick};

/// Modeling invariant violations.
///
/// None of these are recoverable: a simulation that observes one of them
/// must be terminated by the harness. They are surfaced as errors instead
/// of aborting the process so that tests can observe them.
#[derive(thiserror::Error, Debug)]
pub enum Fatal {
    #[error("kernel launched at tick {now} while another kernel is still running")]
    AlreadyRunning { now: Tick },

    #[error("device deadlock detected at tick {now}: {source}")]
    Deadlock {
        now: Tick,
        source: crate::device::DeadlockError,
    },

    #[error("free of device address {addr:#x} is not implemented")]
    FreeUnsupported { addr: address },

    #[error("compute unit {id} does not exist ({num_units} registered)")]
    ComputeUnitOutOfRange { id: usize, num_units: usize },

    #[error("device tick requested for tick {requested} but a device tick is already scheduled for tick {pending}")]
    DeviceTickAlreadyScheduled { pending: Tick, requested: Tick },

    #[error("cannot schedule {kind} event at tick {at} in the past (now={now})")]
    ScheduleInPast {
        kind: crate::event::Kind,
        at: Tick,
        now: Tick,
    },

    #[error("cannot unblock host thread in state {status:?}")]
    ThreadNotSuspended { status: crate::host::ThreadStatus },

    #[error("stream processor array was not started")]
    NotStarted,

    #[error("allocation of {requested} bytes at {next_addr:#x} exhausts the device address space")]
    AddressSpaceExhausted { next_addr: address, requested: u64 },

    #[error("{kind} event {delay} ticks after tick {now} overflows the host timeline")]
    TickOverflow {
        kind: crate::event::Kind,
        now: Tick,
        delay: Tick,
    },

    #[error("overlapping device allocation {range:#x?}")]
    OverlappingAllocation { range: std::ops::Range<address> },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Host(#[from] crate::host::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Fatal>;
