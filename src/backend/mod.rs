//! Compute backend interface.
//!
//! The network never touches device memory directly. It allocates buffers,
//! copies host data in and out, and enqueues kernel dispatches on an ordered
//! queue. Nothing enqueued is observable until [`ComputeBackend::finish`]
//! (or a blocking transfer, which drains the queue first) returns.

use std::fmt;

use crate::{Error, Result};

pub mod host;
pub mod kernels;

pub use host::HostBackend;

/// Handle to a device-resident buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub(crate) u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Access hint given at allocation time.
///
/// Host transfers may always write a buffer; kernels may only write
/// `ReadWrite` buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccess {
    ReadOnly,
    ReadWrite,
}

/// The four arithmetic kernels a backend must provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    /// `(size, next_size, values, weights, next_values)`
    Forward,
    /// `(values, expected, delta)`
    OutputError,
    /// `(size, next_size, values, weights, next_delta, delta)`
    Backpropagate,
    /// `(previous_size, size, learning_rate, previous_values, delta, previous_weights)`
    UpdateWeights,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArgKind {
    Int,
    Float,
    Buffer,
}

impl Kernel {
    pub fn name(self) -> &'static str {
        match self {
            Kernel::Forward => "forward",
            Kernel::OutputError => "output_error",
            Kernel::Backpropagate => "backpropagate",
            Kernel::UpdateWeights => "update_weights",
        }
    }

    pub(crate) fn signature(self) -> &'static [ArgKind] {
        use ArgKind::*;
        match self {
            Kernel::Forward => &[Int, Int, Buffer, Buffer, Buffer],
            Kernel::OutputError => &[Buffer, Buffer, Buffer],
            Kernel::Backpropagate => &[Int, Int, Buffer, Buffer, Buffer, Buffer],
            Kernel::UpdateWeights => &[Int, Int, Float, Buffer, Buffer, Buffer],
        }
    }

    /// Index of the single argument the kernel writes to.
    pub(crate) fn output_arg(self) -> usize {
        match self {
            Kernel::Forward => 4,
            Kernel::OutputError => 2,
            Kernel::Backpropagate => 5,
            Kernel::UpdateWeights => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Int(usize),
    Float(f32),
    Buffer(BufferId),
}

impl KernelArg {
    pub(crate) fn kind(&self) -> ArgKind {
        match self {
            KernelArg::Int(_) => ArgKind::Int,
            KernelArg::Float(_) => ArgKind::Float,
            KernelArg::Buffer(_) => ArgKind::Buffer,
        }
    }
}

/// A kernel bound to its ordered argument list and a one-dimensional
/// work-item count.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub kernel: Kernel,
    pub args: Vec<KernelArg>,
    pub global_size: usize,
}

impl Dispatch {
    pub fn forward(
        size: usize,
        next_size: usize,
        values: BufferId,
        weights: BufferId,
        next_values: BufferId,
    ) -> Self {
        Self {
            kernel: Kernel::Forward,
            args: vec![
                KernelArg::Int(size),
                KernelArg::Int(next_size),
                KernelArg::Buffer(values),
                KernelArg::Buffer(weights),
                KernelArg::Buffer(next_values),
            ],
            global_size: next_size.saturating_sub(1),
        }
    }

    pub fn output_error(size: usize, values: BufferId, expected: BufferId, delta: BufferId) -> Self {
        Self {
            kernel: Kernel::OutputError,
            args: vec![
                KernelArg::Buffer(values),
                KernelArg::Buffer(expected),
                KernelArg::Buffer(delta),
            ],
            global_size: size.saturating_sub(1),
        }
    }

    pub fn backpropagate(
        size: usize,
        next_size: usize,
        values: BufferId,
        weights: BufferId,
        next_delta: BufferId,
        delta: BufferId,
    ) -> Self {
        Self {
            kernel: Kernel::Backpropagate,
            args: vec![
                KernelArg::Int(size),
                KernelArg::Int(next_size),
                KernelArg::Buffer(values),
                KernelArg::Buffer(weights),
                KernelArg::Buffer(next_delta),
                KernelArg::Buffer(delta),
            ],
            global_size: size.saturating_sub(1),
        }
    }

    pub fn update_weights(
        previous_size: usize,
        size: usize,
        learning_rate: f32,
        previous_values: BufferId,
        delta: BufferId,
        previous_weights: BufferId,
    ) -> Self {
        Self {
            kernel: Kernel::UpdateWeights,
            args: vec![
                KernelArg::Int(previous_size),
                KernelArg::Int(size),
                KernelArg::Float(learning_rate),
                KernelArg::Buffer(previous_values),
                KernelArg::Buffer(delta),
                KernelArg::Buffer(previous_weights),
            ],
            global_size: previous_size * size.saturating_sub(1),
        }
    }

    /// Check argument arity and kinds against the kernel's signature.
    pub fn validate(&self) -> Result<()> {
        let signature = self.kernel.signature();
        if self.args.len() != signature.len() {
            return Err(Error::device(
                "enqueue",
                format!(
                    "kernel {} takes {} arguments, got {}",
                    self.kernel.name(),
                    signature.len(),
                    self.args.len()
                ),
            ));
        }
        for (idx, (arg, &kind)) in self.args.iter().zip(signature).enumerate() {
            if arg.kind() != kind {
                return Err(Error::device(
                    "enqueue",
                    format!(
                        "kernel {} argument {idx} must be {kind:?}, got {:?}",
                        self.kernel.name(),
                        arg.kind()
                    ),
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn int(&self, idx: usize) -> usize {
        match self.args[idx] {
            KernelArg::Int(v) => v,
            _ => unreachable!("argument kinds are validated at enqueue"),
        }
    }

    pub(crate) fn float(&self, idx: usize) -> f32 {
        match self.args[idx] {
            KernelArg::Float(v) => v,
            _ => unreachable!("argument kinds are validated at enqueue"),
        }
    }

    pub(crate) fn buffer(&self, idx: usize) -> BufferId {
        match self.args[idx] {
            KernelArg::Buffer(id) => id,
            _ => unreachable!("argument kinds are validated at enqueue"),
        }
    }
}

/// A parallel compute device with an in-order command queue.
///
/// Transfers are blocking and drain previously enqueued work first, so a read
/// always observes every dispatch enqueued before it.
pub trait ComputeBackend {
    /// Allocate a buffer of `byte_len` bytes (a non-zero multiple of 4).
    fn create_buffer(&mut self, access: MemAccess, byte_len: usize) -> Result<BufferId>;

    fn release_buffer(&mut self, buffer: BufferId) -> Result<()>;

    /// Blocking host-to-buffer copy of the whole buffer.
    fn write_bytes(&mut self, buffer: BufferId, data: &[u8]) -> Result<()>;

    /// Blocking buffer-to-host copy of the whole buffer.
    fn read_bytes(&mut self, buffer: BufferId, out: &mut [u8]) -> Result<()>;

    /// Bind and queue a dispatch. Execution is deferred until `finish`.
    fn enqueue(&mut self, dispatch: Dispatch) -> Result<()>;

    /// Barrier: run every queued dispatch in order.
    fn finish(&mut self) -> Result<()>;

    fn write_f32(&mut self, buffer: BufferId, data: &[f32]) -> Result<()> {
        self.write_bytes(buffer, bytemuck::cast_slice(data))
    }

    fn read_f32(&mut self, buffer: BufferId, out: &mut [f32]) -> Result<()> {
        self.read_bytes(buffer, bytemuck::cast_slice_mut(out))
    }

    /// Allocate a buffer sized for `len` scalars.
    fn create_f32_buffer(&mut self, access: MemAccess, len: usize) -> Result<BufferId> {
        self.create_buffer(access, len * std::mem::size_of::<f32>())
    }
}

impl<B: ComputeBackend + ?Sized> ComputeBackend for &mut B {
    fn create_buffer(&mut self, access: MemAccess, byte_len: usize) -> Result<BufferId> {
        (**self).create_buffer(access, byte_len)
    }

    fn release_buffer(&mut self, buffer: BufferId) -> Result<()> {
        (**self).release_buffer(buffer)
    }

    fn write_bytes(&mut self, buffer: BufferId, data: &[u8]) -> Result<()> {
        (**self).write_bytes(buffer, data)
    }

    fn read_bytes(&mut self, buffer: BufferId, out: &mut [u8]) -> Result<()> {
        (**self).read_bytes(buffer, out)
    }

    fn enqueue(&mut self, dispatch: Dispatch) -> Result<()> {
        (**self).enqueue(dispatch)
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_match_kernel_signatures() {
        let b = BufferId(0);
        assert!(Dispatch::forward(3, 2, b, b, b).validate().is_ok());
        assert!(Dispatch::output_error(2, b, b, b).validate().is_ok());
        assert!(Dispatch::backpropagate(3, 2, b, b, b, b).validate().is_ok());
        assert!(Dispatch::update_weights(3, 2, 0.1, b, b, b).validate().is_ok());
    }

    #[test]
    fn work_item_counts_exclude_the_bias_slot() {
        let b = BufferId(0);
        assert_eq!(Dispatch::forward(3, 4, b, b, b).global_size, 3);
        assert_eq!(Dispatch::output_error(4, b, b, b).global_size, 3);
        assert_eq!(Dispatch::backpropagate(5, 4, b, b, b, b).global_size, 4);
        assert_eq!(Dispatch::update_weights(3, 4, 0.1, b, b, b).global_size, 9);
    }

    #[test]
    fn empty_sizes_build_without_panicking() {
        let b = BufferId(0);
        assert_eq!(Dispatch::forward(0, 0, b, b, b).global_size, 0);
        assert_eq!(Dispatch::output_error(0, b, b, b).global_size, 0);
        assert_eq!(Dispatch::backpropagate(0, 1, b, b, b, b).global_size, 0);
        assert_eq!(Dispatch::update_weights(2, 0, 0.1, b, b, b).global_size, 0);
    }

    #[test]
    fn validate_rejects_wrong_arity_and_kinds() {
        let b = BufferId(0);
        let mut d = Dispatch::forward(3, 2, b, b, b);
        d.args.pop();
        assert!(d.validate().unwrap_err().is_device());

        let mut d = Dispatch::output_error(2, b, b, b);
        d.args[0] = KernelArg::Float(1.0);
        assert!(d.validate().is_err());
    }
}
