use super::address;
use crate::error::{Fatal, Result};
use crate::host::HostThread;

/// A device memory allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Allocation {
    pub id: usize,
    pub name: Option<String>,
    pub start_addr: address,
    pub end_addr: address,
}

impl Allocation {
    #[must_use]
    pub fn num_bytes(&self) -> u64 {
        self.end_addr - self.start_addr
    }
}

impl std::fmt::Display for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("start_addr", &format_args!("{:#x}", self.start_addr))
            .field("end_addr", &format_args!("{:#x}", self.end_addr))
            .field(
                "size",
                &human_bytes::human_bytes(self.num_bytes() as f64),
            )
            .finish()
    }
}

/// Records of all live device allocations, keyed by address range.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Allocations {
    inner: rangemap::RangeMap<address, Allocation>,
    num_allocations: usize,
}

impl std::ops::Deref for Allocations {
    type Target = rangemap::RangeMap<address, Allocation>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Allocations {
    pub fn insert(
        &mut self,
        range: std::ops::Range<address>,
        name: Option<String>,
    ) -> Result<Allocation> {
        if range.is_empty() || self.inner.overlaps(&range) {
            return Err(Fatal::OverlappingAllocation { range });
        }
        // ids start at one
        self.num_allocations += 1;
        let id = self.num_allocations;
        let allocation = Allocation {
            id,
            name,
            start_addr: range.start,
            end_addr: range.end,
        };
        self.inner.insert(range, allocation.clone());
        Ok(allocation)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.num_allocations
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_allocations == 0
    }

    /// Size of the allocation starting at `addr`.
    #[must_use]
    pub fn num_bytes(&self, addr: address) -> Option<u64> {
        self.inner
            .get(&addr)
            .filter(|alloc| alloc.start_addr == addr)
            .map(Allocation::num_bytes)
    }
}

/// Monotonic allocator for the private device address space.
///
/// Addresses are never reused. The host pages backing the device region are
/// materialized lazily whenever an allocation crosses the current break.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocator {
    next_addr: address,
    brk_point: address,
    page_size: u64,
    allocations: Allocations,
}

impl Allocator {
    pub fn new(page_size: u64) -> Result<Self> {
        Self::with_layout(
            crate::config::FIRST_ALLOCATION,
            crate::config::BRK_START,
            page_size,
        )
    }

    pub fn with_layout(next_addr: address, brk_point: address, page_size: u64) -> Result<Self> {
        if !page_size.is_power_of_two() {
            return Err(Fatal::InvalidConfig(format!(
                "page size must be a power of two (got {page_size})"
            )));
        }
        Ok(Self {
            next_addr,
            brk_point,
            page_size,
            allocations: Allocations::default(),
        })
    }

    #[must_use]
    pub fn next_addr(&self) -> address {
        self.next_addr
    }

    #[must_use]
    pub fn brk_point(&self) -> address {
        self.brk_point
    }

    #[must_use]
    pub fn allocations(&self) -> &Allocations {
        &self.allocations
    }

    pub fn allocate(
        &mut self,
        num_bytes: u64,
        name: Option<String>,
        host: &mut dyn HostThread,
    ) -> Result<address> {
        let addr = self.next_addr;
        if num_bytes == 0 {
            log::debug!("zero byte device allocation at address {addr:#x}");
            return Ok(addr);
        }

        let exhausted = move || Fatal::AddressSpaceExhausted {
            next_addr: addr,
            requested: num_bytes,
        };
        let end_addr = addr.checked_add(num_bytes).ok_or_else(exhausted)?;
        if end_addr > self.brk_point {
            let growth = num_bytes
                .checked_add(self.page_size - 1)
                .map(|len| utils::round_down(len, self.page_size));
            let new_brk_point = growth
                .and_then(|growth| self.brk_point.checked_add(growth))
                .ok_or_else(exhausted)?;
            for page in utils::pages(self.brk_point, num_bytes, self.page_size) {
                host.allocate_mem(page, self.page_size)?;
            }
            let old_brk_point = self.brk_point;
            self.brk_point = new_brk_point;
            log::trace!(
                "device break moved from {:#x} to {:#x}",
                old_brk_point,
                self.brk_point
            );
        }

        self.next_addr = end_addr;

        let allocation = self.allocations.insert(addr..end_addr, name)?;
        log::debug!(
            "giving the device {} at address {:#x}: {}",
            human_bytes::human_bytes(num_bytes as f64),
            addr,
            allocation,
        );
        Ok(addr)
    }

    /// Freeing device memory is not supported.
    ///
    /// Allocation is monotonic, hence this always fails.
    pub fn free(&mut self, addr: address) -> Result<()> {
        log::error!("free of device address {addr:#x} requested");
        Err(Fatal::FreeUnsupported { addr })
    }
}
