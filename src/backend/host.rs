//! In-process compute device.
//!
//! `HostBackend` keeps buffers in a handle-indexed arena and runs kernels on
//! the rayon thread pool. It honors the same queue semantics as a real
//! device: dispatches are bound at `enqueue`, executed in order at `finish`,
//! and blocking transfers drain the queue before copying.

use std::collections::VecDeque;

use log::trace;

use super::kernels;
use super::{BufferId, ComputeBackend, Dispatch, Kernel, MemAccess};
use crate::{Activation, Error, Result};

#[derive(Debug, Clone)]
struct HostBuffer {
    access: MemAccess,
    data: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct HostBackend {
    activation: Activation,
    buffers: Vec<Option<HostBuffer>>,
    queue: VecDeque<Dispatch>,
    dispatched: u64,
}

impl HostBackend {
    /// A backend whose kernels use the sigmoid activation.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_activation(activation: Activation) -> Self {
        Self {
            activation,
            ..Self::default()
        }
    }

    #[inline]
    pub fn activation(&self) -> Activation {
        self.activation
    }

    /// Number of dispatches executed so far.
    #[inline]
    pub fn dispatch_count(&self) -> u64 {
        self.dispatched
    }

    /// Number of dispatches enqueued but not yet executed.
    #[inline]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Number of live (allocated, not released) buffers.
    pub fn live_buffers(&self) -> usize {
        self.buffers.iter().filter(|b| b.is_some()).count()
    }

    fn slot(&self, op: &'static str, id: BufferId) -> Result<&HostBuffer> {
        self.buffers
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::device(op, format!("unknown or released buffer {id}")))
    }

    fn slot_mut(&mut self, op: &'static str, id: BufferId) -> Result<&mut HostBuffer> {
        self.buffers
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::device(op, format!("unknown or released buffer {id}")))
    }

    fn execute(&mut self, dispatch: &Dispatch) -> Result<()> {
        let lens = kernels::required_lens(dispatch)?;
        let out_arg = dispatch.kernel.output_arg();
        let out_id = dispatch.buffer(out_arg);

        for &(arg, min_len) in &lens {
            let id = dispatch.buffer(arg);
            if arg != out_arg && id == out_id {
                return Err(Error::device(
                    "dispatch",
                    format!(
                        "kernel {} output buffer {id} aliases argument {arg}",
                        dispatch.kernel.name()
                    ),
                ));
            }
            let buf = self.slot("dispatch", id)?;
            if buf.data.len() < min_len {
                return Err(Error::device(
                    "dispatch",
                    format!(
                        "kernel {} argument {arg} ({id}) holds {} elements, needs {min_len}",
                        dispatch.kernel.name(),
                        buf.data.len()
                    ),
                ));
            }
        }
        if self.slot("dispatch", out_id)?.access == MemAccess::ReadOnly {
            return Err(Error::device(
                "dispatch",
                format!(
                    "kernel {} cannot write read-only buffer {out_id}",
                    dispatch.kernel.name()
                ),
            ));
        }

        trace!(
            "dispatch {} over {} work items",
            dispatch.kernel.name(),
            dispatch.global_size
        );

        // Take the output out of the arena so inputs can be borrowed alongside it.
        let mut out = std::mem::take(&mut self.slot_mut("dispatch", out_id)?.data);
        let act = self.activation;
        let buffers = &self.buffers;
        let input = |arg: usize| contents(buffers, dispatch.buffer(arg));

        match dispatch.kernel {
            Kernel::Forward => kernels::forward(
                act,
                dispatch.int(0),
                dispatch.int(1),
                input(2),
                input(3),
                &mut out,
            ),
            Kernel::OutputError => {
                let n = dispatch.global_size;
                kernels::output_error(act, &input(0)[..n], &input(1)[..n], &mut out[..n])
            }
            Kernel::Backpropagate => kernels::backpropagate(
                act,
                dispatch.int(0),
                dispatch.int(1),
                input(2),
                input(3),
                input(4),
                &mut out,
            ),
            Kernel::UpdateWeights => kernels::update_weights(
                dispatch.int(0),
                dispatch.int(1),
                dispatch.float(2),
                input(3),
                input(4),
                &mut out,
            ),
        }

        self.slot_mut("dispatch", out_id)?.data = out;
        self.dispatched += 1;
        Ok(())
    }
}

fn contents(buffers: &[Option<HostBuffer>], id: BufferId) -> &[f32] {
    buffers[id.0 as usize]
        .as_ref()
        .map(|b| b.data.as_slice())
        .unwrap_or(&[])
}

impl ComputeBackend for HostBackend {
    fn create_buffer(&mut self, access: MemAccess, byte_len: usize) -> Result<BufferId> {
        let elem = std::mem::size_of::<f32>();
        if byte_len == 0 || byte_len % elem != 0 {
            return Err(Error::device(
                "create_buffer",
                format!("byte size {byte_len} is not a non-zero multiple of {elem}"),
            ));
        }
        let id = BufferId(self.buffers.len() as u64);
        self.buffers.push(Some(HostBuffer {
            access,
            data: vec![0.0; byte_len / elem],
        }));
        trace!("created {access:?} buffer {id} of {byte_len} bytes");
        Ok(id)
    }

    fn release_buffer(&mut self, buffer: BufferId) -> Result<()> {
        self.finish()?;
        self.slot("release_buffer", buffer)?;
        self.buffers[buffer.0 as usize] = None;
        Ok(())
    }

    fn write_bytes(&mut self, buffer: BufferId, data: &[u8]) -> Result<()> {
        self.finish()?;
        let buf = self.slot_mut("write_buffer", buffer)?;
        let dst: &mut [u8] = bytemuck::cast_slice_mut(buf.data.as_mut_slice());
        if dst.len() != data.len() {
            return Err(Error::device(
                "write_buffer",
                format!(
                    "buffer {buffer} is {} bytes, source is {} bytes",
                    dst.len(),
                    data.len()
                ),
            ));
        }
        dst.copy_from_slice(data);
        Ok(())
    }

    fn read_bytes(&mut self, buffer: BufferId, out: &mut [u8]) -> Result<()> {
        self.finish()?;
        let buf = self.slot("read_buffer", buffer)?;
        let src: &[u8] = bytemuck::cast_slice(buf.data.as_slice());
        if src.len() != out.len() {
            return Err(Error::device(
                "read_buffer",
                format!(
                    "buffer {buffer} is {} bytes, destination is {} bytes",
                    src.len(),
                    out.len()
                ),
            ));
        }
        out.copy_from_slice(src);
        Ok(())
    }

    fn enqueue(&mut self, dispatch: Dispatch) -> Result<()> {
        dispatch.validate()?;
        self.queue.push_back(dispatch);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        while let Some(dispatch) = self.queue.pop_front() {
            if let Err(e) = self.execute(&dispatch) {
                // Later dispatches depend on this one's writes.
                self.queue.clear();
                return Err(e);
            }
        }
        Ok(())
    }
}
