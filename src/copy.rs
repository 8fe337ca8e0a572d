use crate::error::{Fatal, Result};
use crate::host::HostThread;
use crate::streams::StreamId;
use crate::{address, Ref};

/// Engine moving data between host and device memory.
pub trait CopyEngine: std::fmt::Debug + Send + 'static {
    fn initialize(&mut self, thread: Ref<dyn HostThread>);

    fn memcpy(
        &mut self,
        src: address,
        dst: address,
        num_bytes: u64,
        stream: Option<StreamId>,
    ) -> Result<()>;
}

/// Copy engine performing copies functionally and instantly.
///
/// Host and device share the host thread's address space.
#[derive(Debug, Default)]
pub struct FunctionalCopyEngine {
    thread: Option<Ref<dyn HostThread>>,
    pub num_copies: usize,
    pub bytes_copied: u64,
}

impl FunctionalCopyEngine {
    /// Copies are split into chunks of this size.
    const CHUNK_SIZE: u64 = 4096;

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CopyEngine for FunctionalCopyEngine {
    fn initialize(&mut self, thread: Ref<dyn HostThread>) {
        self.thread = Some(thread);
    }

    fn memcpy(
        &mut self,
        src: address,
        dst: address,
        num_bytes: u64,
        stream: Option<StreamId>,
    ) -> Result<()> {
        let thread = self.thread.as_ref().ok_or(Fatal::NotStarted)?;
        log::debug!(
            "copy engine: copy {} from {src:#x} to {dst:#x} (stream {stream:?})",
            human_bytes::human_bytes(num_bytes as f64),
        );
        let mut thread = thread.lock();
        let mut buffer = vec![0; Self::CHUNK_SIZE.min(num_bytes) as usize];
        let mut offset = 0;
        while offset < num_bytes {
            let len = Self::CHUNK_SIZE.min(num_bytes - offset) as usize;
            let chunk = &mut buffer[..len];
            thread.read_blob(src + offset, chunk)?;
            thread.write_blob(dst + offset, chunk)?;
            offset += len as u64;
        }
        self.num_copies += 1;
        self.bytes_copied += num_bytes;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{CopyEngine, FunctionalCopyEngine};
    use crate::error::Fatal;
    use crate::host::{HostThread, SimThread};
    use color_eyre::eyre;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_copy_before_initialize_fails() {
        let mut engine = FunctionalCopyEngine::new();
        assert!(matches!(
            engine.memcpy(0, 0x100, 4, None),
            Err(Fatal::NotStarted)
        ));
    }

    #[test]
    fn test_large_copy() -> eyre::Result<()> {
        let thread = Arc::new(Mutex::new(SimThread::new()));
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        thread.lock().write_blob(0x1_0000, &data)?;

        let mut engine = FunctionalCopyEngine::new();
        engine.initialize(thread.clone());
        engine.memcpy(0x1_0000, 0x0800_0100, data.len() as u64, Some(0))?;

        let mut copied = vec![0; data.len()];
        thread.lock().read_blob(0x0800_0100, &mut copied)?;
        assert_eq!(copied, data);
        assert_eq!(engine.num_copies, 1);
        assert_eq!(engine.bytes_copied, 10_000);
        Ok(())
    }
}
