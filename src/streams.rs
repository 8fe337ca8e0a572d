use crate::copy::CopyEngine;
use crate::device::DeviceEngine;
use crate::error::Result;
use crate::{address, KernelId, Tick};
use std::collections::{HashMap, HashSet, VecDeque};

pub type StreamId = u64;

/// A queued unit of device work submitted by the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamOperation {
    KernelLaunch {
        kernel: KernelId,
        stream: StreamId,
        /// Host tick at which the host issued the launch.
        launch_time: Tick,
    },
    Memcpy {
        src: address,
        dst: address,
        num_bytes: u64,
        stream: StreamId,
    },
    Synchronize {
        stream: StreamId,
    },
}

/// Outcome of executing a stream operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// A kernel was handed to the device, which now has to be started.
    KernelLaunch { kernel: KernelId, launch_time: Tick },
    /// The operation completed.
    Done,
}

impl StreamOperation {
    #[must_use]
    pub fn stream(&self) -> StreamId {
        match self {
            Self::KernelLaunch { stream, .. }
            | Self::Memcpy { stream, .. }
            | Self::Synchronize { stream } => *stream,
        }
    }

    #[must_use]
    pub fn is_kernel_launch(&self) -> bool {
        matches!(self, Self::KernelLaunch { .. })
    }

    pub fn execute(
        self,
        device: &mut dyn DeviceEngine,
        copy_engine: &mut dyn CopyEngine,
    ) -> Result<Dispatched> {
        log::debug!("execute stream operation {self}");
        match self {
            Self::KernelLaunch {
                kernel,
                launch_time,
                ..
            } => {
                device.launch(kernel);
                Ok(Dispatched::KernelLaunch {
                    kernel,
                    launch_time,
                })
            }
            Self::Memcpy {
                src,
                dst,
                num_bytes,
                stream,
            } => {
                copy_engine.memcpy(src, dst, num_bytes, Some(stream))?;
                Ok(Dispatched::Done)
            }
            Self::Synchronize { .. } => Ok(Dispatched::Done),
        }
    }
}

impl std::fmt::Display for StreamOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KernelLaunch {
                kernel,
                stream,
                launch_time,
            } => f
                .debug_struct("KernelLaunch")
                .field("kernel", &kernel.get())
                .field("stream", stream)
                .field("launch_time", launch_time)
                .finish(),
            Self::Memcpy {
                src,
                dst,
                num_bytes,
                stream,
            } => f
                .debug_struct("Memcpy")
                .field("src", &format_args!("{src:#x}"))
                .field("dst", &format_args!("{dst:#x}"))
                .field("size", &human_bytes::human_bytes(*num_bytes as f64))
                .field("stream", stream)
                .finish(),
            Self::Synchronize { stream } => f
                .debug_struct("Synchronize")
                .field("stream", stream)
                .finish(),
        }
    }
}

/// Queue of pending stream operations.
pub trait StreamManager: std::fmt::Debug + Send + 'static {
    /// No operation is queued or in flight.
    fn is_empty(&self) -> bool;

    /// The front operation can be dispatched now.
    fn ready(&self) -> bool;

    /// Take the front operation if it can be dispatched now.
    fn front(&mut self) -> Option<StreamOperation>;

    fn register_finished_kernel(&mut self, kernel: KernelId);

    /// Write a human readable dump of the queue.
    fn print(&self, out: &mut dyn std::io::Write) -> std::io::Result<()>;
}

/// In-order queue of stream operations.
///
/// Operations are dispatched strictly in submission order. A kernel launch
/// keeps its stream busy until the kernel finished, and no other kernel is
/// launched while one is in flight.
#[derive(Debug, Default)]
pub struct StreamQueue {
    ops: VecDeque<StreamOperation>,
    busy_streams: HashSet<StreamId>,
    in_flight: HashMap<KernelId, StreamId>,
    finished: Vec<KernelId>,
}

impl StreamQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: StreamOperation) {
        log::trace!("stream queue: push {op}");
        self.ops.push_back(op);
    }

    pub fn reserve_stream(&mut self, id: StreamId) {
        self.busy_streams.insert(id);
    }

    pub fn release_stream(&mut self, id: StreamId) {
        self.busy_streams.remove(&id);
    }

    #[must_use]
    pub fn is_busy(&self, id: StreamId) -> bool {
        self.busy_streams.contains(&id)
    }

    #[must_use]
    pub fn num_pending(&self) -> usize {
        self.ops.len()
    }

    /// Kernels whose completion was registered, in completion order.
    #[must_use]
    pub fn finished_kernels(&self) -> &[KernelId] {
        &self.finished
    }
}

impl StreamManager for StreamQueue {
    fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.in_flight.is_empty()
    }

    fn ready(&self) -> bool {
        match self.ops.front() {
            Some(op) if self.is_busy(op.stream()) => false,
            Some(op) if op.is_kernel_launch() => self.in_flight.is_empty(),
            Some(_) => true,
            None => false,
        }
    }

    fn front(&mut self) -> Option<StreamOperation> {
        if !self.ready() {
            return None;
        }
        let op = self.ops.pop_front()?;
        if let StreamOperation::KernelLaunch { kernel, stream, .. } = op {
            self.reserve_stream(stream);
            self.in_flight.insert(kernel, stream);
        }
        Some(op)
    }

    fn register_finished_kernel(&mut self, kernel: KernelId) {
        match self.in_flight.remove(&kernel) {
            Some(stream) => self.release_stream(stream),
            None => log::warn!("stream queue: finished kernel {kernel} was never launched"),
        }
        self.finished.push(kernel);
    }

    fn print(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        writeln!(
            out,
            "stream queue: {} pending, {} in flight",
            self.ops.len(),
            self.in_flight.len()
        )?;
        for (kernel, stream) in &self.in_flight {
            writeln!(out, "  in flight: kernel {kernel} on stream {stream}")?;
        }
        for op in &self.ops {
            writeln!(out, "  pending: {op}")?;
        }
        Ok(())
    }
}
