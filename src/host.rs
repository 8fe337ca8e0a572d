use crate::address;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ThreadStatus {
    Active,
    Suspended,
    Halted,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("page {page:#x} is not aligned to page size {page_size}")]
    UnalignedPage { page: address, page_size: u64 },

    #[error("access of {num_bytes} bytes at {addr:#x} overflows the address space")]
    OutOfBounds { addr: address, num_bytes: usize },
}

/// The host thread context driving the accelerator.
///
/// Besides suspending and activating the thread, it provides functional
/// access to the host process' address space.
pub trait HostThread: std::fmt::Debug + Send + 'static {
    fn status(&self) -> ThreadStatus;

    fn activate(&mut self);

    fn suspend(&mut self);

    /// Back `[page_addr, page_addr + size)` with host memory.
    fn allocate_mem(&mut self, page_addr: address, size: u64) -> Result<(), Error>;

    fn write_blob(&mut self, addr: address, data: &[u8]) -> Result<(), Error>;

    fn read_blob(&self, addr: address, data: &mut [u8]) -> Result<(), Error>;
}

const PAGE_SIZE: u64 = 4096;

/// Host thread with a sparse, paged functional memory.
///
/// Pages are materialized on first write, reads of untouched memory return zeros.
/// Pages explicitly backed via [`HostThread::allocate_mem`] are tracked
/// separately so that the allocator's behaviour can be inspected.
#[derive(Debug, Clone)]
pub struct SimThread {
    status: ThreadStatus,
    mapped: BTreeSet<address>,
    pages: HashMap<address, Box<[u8]>>,
    /// Number of times the thread was activated.
    pub num_activations: usize,
}

impl Default for SimThread {
    fn default() -> Self {
        Self {
            status: ThreadStatus::Active,
            mapped: BTreeSet::new(),
            pages: HashMap::new(),
            num_activations: 0,
        }
    }
}

impl SimThread {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pages backed through `allocate_mem`, in ascending order.
    #[must_use]
    pub fn mapped_pages(&self) -> Vec<address> {
        self.mapped.iter().copied().collect()
    }

    fn check_bounds(addr: address, num_bytes: usize) -> Result<(), Error> {
        addr.checked_add(num_bytes as u64)
            .map(|_| ())
            .ok_or(Error::OutOfBounds { addr, num_bytes })
    }

    /// Split `[addr, addr + len)` into `(page, offset within page, offset within buffer, len)` chunks.
    fn chunks(addr: address, len: usize) -> impl Iterator<Item = (address, usize, usize, usize)> {
        let mut done = 0;
        std::iter::from_fn(move || {
            if done >= len {
                return None;
            }
            let cur = addr + done as u64;
            let page = utils::round_down(cur, PAGE_SIZE);
            let page_offset = (cur - page) as usize;
            let chunk_len = (PAGE_SIZE as usize - page_offset).min(len - done);
            let chunk = (page, page_offset, done, chunk_len);
            done += chunk_len;
            Some(chunk)
        })
    }
}

impl HostThread for SimThread {
    fn status(&self) -> ThreadStatus {
        self.status
    }

    fn activate(&mut self) {
        log::debug!("host thread: {} -> {}", self.status, ThreadStatus::Active);
        self.status = ThreadStatus::Active;
        self.num_activations += 1;
    }

    fn suspend(&mut self) {
        log::debug!("host thread: {} -> {}", self.status, ThreadStatus::Suspended);
        self.status = ThreadStatus::Suspended;
    }

    fn allocate_mem(&mut self, page_addr: address, size: u64) -> Result<(), Error> {
        if page_addr % PAGE_SIZE != 0 {
            return Err(Error::UnalignedPage {
                page: page_addr,
                page_size: PAGE_SIZE,
            });
        }
        for page in utils::pages(page_addr, size, PAGE_SIZE) {
            self.mapped.insert(page);
            self.pages
                .entry(page)
                .or_insert_with(|| vec![0; PAGE_SIZE as usize].into_boxed_slice());
        }
        Ok(())
    }

    fn write_blob(&mut self, addr: address, data: &[u8]) -> Result<(), Error> {
        Self::check_bounds(addr, data.len())?;
        for (page, page_offset, offset, len) in Self::chunks(addr, data.len()) {
            let page = self
                .pages
                .entry(page)
                .or_insert_with(|| vec![0; PAGE_SIZE as usize].into_boxed_slice());
            page[page_offset..page_offset + len].copy_from_slice(&data[offset..offset + len]);
        }
        Ok(())
    }

    fn read_blob(&self, addr: address, data: &mut [u8]) -> Result<(), Error> {
        Self::check_bounds(addr, data.len())?;
        for (page, page_offset, offset, len) in Self::chunks(addr, data.len()) {
            let dest = &mut data[offset..offset + len];
            match self.pages.get(&page) {
                Some(page) => dest.copy_from_slice(&page[page_offset..page_offset + len]),
                None => dest.fill(0),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{HostThread, SimThread, ThreadStatus};
    use color_eyre::eyre;

    #[test]
    fn test_read_write_across_pages() -> eyre::Result<()> {
        let mut thread = SimThread::new();
        let data: Vec<u8> = (0..=255).cycle().take(10_000).collect();
        thread.write_blob(0x0800_0f80, &data)?;

        let mut read = vec![0; data.len()];
        thread.read_blob(0x0800_0f80, &mut read)?;
        assert_eq!(read, data);

        let mut untouched = [0xff; 16];
        thread.read_blob(0x1000_0000, &mut untouched)?;
        assert_eq!(untouched, [0; 16]);
        Ok(())
    }

    #[test]
    fn test_allocate_mem_tracks_pages() -> eyre::Result<()> {
        let mut thread = SimThread::new();
        thread.allocate_mem(0x2000, 8192)?;
        assert_eq!(thread.mapped_pages(), vec![0x2000, 0x3000]);
        assert!(thread.allocate_mem(0x2001, 4096).is_err());
        Ok(())
    }

    #[test]
    fn test_suspend_and_activate() {
        let mut thread = SimThread::new();
        assert_eq!(thread.status(), ThreadStatus::Active);
        thread.suspend();
        assert_eq!(thread.status(), ThreadStatus::Suspended);
        thread.activate();
        assert_eq!(thread.status(), ThreadStatus::Active);
        assert_eq!(thread.num_activations, 1);
    }
}
