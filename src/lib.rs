#![allow(
    non_camel_case_types,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation
)]

pub mod allocation;
pub mod completion;
pub mod compute_unit;
pub mod config;
pub mod copy;
pub mod device;
pub mod error;
pub mod event;
pub mod host;
pub mod spa;
pub mod streams;

#[cfg(test)]
pub mod testing;

pub use config::Config;
pub use error::Fatal;
pub use spa::StreamProcessorArray;

use std::num::NonZeroU64;

pub type address = u64;

/// Timestamp on the host timeline.
pub type Tick = u64;

/// Cycle count in the device's clock domain.
pub type DeviceCycles = f64;

/// Shared handle to a collaborator.
pub type Ref<T> = std::sync::Arc<parking_lot::Mutex<T>>;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("kernel id must be non-zero")]
pub struct InvalidKernelId;

/// Identifier of a kernel launched on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelId(NonZeroU64);

impl KernelId {
    pub fn new(id: u64) -> Result<Self, InvalidKernelId> {
        NonZeroU64::new(id).map(Self).ok_or(InvalidKernelId)
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl From<NonZeroU64> for KernelId {
    fn from(id: NonZeroU64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for KernelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::KernelId;

    #[test]
    fn test_kernel_id_is_non_zero() {
        assert!(KernelId::new(0).is_err());
        assert_eq!(KernelId::new(3).map(KernelId::get), Ok(3));
        assert_eq!(KernelId::new(42).map(|id| id.to_string()).as_deref(), Ok("42"));
    }
}
