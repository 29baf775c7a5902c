//! Reference implementations of the four arithmetic kernels.
//!
//! Each function computes every work item of one dispatch. Slice lengths are
//! validated by the caller (see [`required_lens`]); indexing here never goes
//! out of bounds for a validated dispatch.
//!
//! Weight layout is row-major by source neuron: the weight from neuron `i` of
//! a layer to neuron `j` of the next layer lives at `i * next_size + j`.

use rayon::prelude::*;

use super::{Dispatch, Kernel};
use crate::{Activation, Error, Result};

/// Below this many work items the rayon fan-out costs more than it saves.
pub(crate) const PARALLEL_MIN_ITEMS: usize = 4096;

fn for_each_item<F>(out: &mut [f32], f: F)
where
    F: Fn(usize, &mut f32) + Sync + Send,
{
    if out.len() >= PARALLEL_MIN_ITEMS {
        out.par_iter_mut().enumerate().for_each(|(g, o)| f(g, o));
    } else {
        for (g, o) in out.iter_mut().enumerate() {
            f(g, o);
        }
    }
}

/// `next_values[j] = act(sum_i values[i] * weights[i, j])` for `j < next_size - 1`.
///
/// The sum runs over all `size` inputs, bias included. The next layer's bias
/// slot is not written.
pub fn forward(
    act: Activation,
    size: usize,
    next_size: usize,
    values: &[f32],
    weights: &[f32],
    next_values: &mut [f32],
) {
    for_each_item(&mut next_values[..next_size - 1], |j, out| {
        let mut sum = 0.0_f32;
        for i in 0..size {
            sum = weights[i * next_size + j].mul_add(values[i], sum);
        }
        *out = act.forward(sum);
    });
}

/// Output-layer delta for squared error: `(expected - y) * act'(y)`.
pub fn output_error(act: Activation, values: &[f32], expected: &[f32], delta: &mut [f32]) {
    for_each_item(delta, |j, out| {
        let y = values[j];
        *out = (expected[j] - y) * act.derivative_from_output(y);
    });
}

/// Hidden-layer delta via the chain rule:
/// `delta[i] = act'(values[i]) * sum_j weights[i, j] * next_delta[j]`.
pub fn backpropagate(
    act: Activation,
    size: usize,
    next_size: usize,
    values: &[f32],
    weights: &[f32],
    next_delta: &[f32],
    delta: &mut [f32],
) {
    for_each_item(&mut delta[..size - 1], |i, out| {
        let row = &weights[i * next_size..i * next_size + next_size - 1];
        let mut sum = 0.0_f32;
        for (w, d) in row.iter().zip(next_delta) {
            sum = w.mul_add(*d, sum);
        }
        *out = act.derivative_from_output(values[i]) * sum;
    });
}

/// `previous_weights[i, j] += learning_rate * delta[j] * previous_values[i]`
/// for every previous neuron `i` (bias included) and `j < size - 1`.
pub fn update_weights(
    previous_size: usize,
    size: usize,
    learning_rate: f32,
    previous_values: &[f32],
    delta: &[f32],
    previous_weights: &mut [f32],
) {
    let outputs = size - 1;
    let update_row = |i: usize, row: &mut [f32]| {
        let x = previous_values[i];
        for (w, d) in row[..outputs].iter_mut().zip(delta) {
            *w = (learning_rate * d).mul_add(x, *w);
        }
    };

    let rows = &mut previous_weights[..previous_size * size];
    if previous_size * outputs >= PARALLEL_MIN_ITEMS {
        rows.par_chunks_mut(size)
            .enumerate()
            .for_each(|(i, row)| update_row(i, row));
    } else {
        for (i, row) in rows.chunks_mut(size).enumerate() {
            update_row(i, row);
        }
    }
}

/// Minimum element count each buffer argument must hold, as `(arg index, len)`.
///
/// Also checks that the dispatch's work-item count matches its size arguments.
pub(crate) fn required_lens(dispatch: &Dispatch) -> Result<Vec<(usize, usize)>> {
    let expect_global = |expected: usize| -> Result<()> {
        if dispatch.global_size != expected {
            return Err(Error::device(
                "dispatch",
                format!(
                    "kernel {} expects {expected} work items, got {}",
                    dispatch.kernel.name(),
                    dispatch.global_size
                ),
            ));
        }
        Ok(())
    };
    let nonzero = |name: &str, v: usize, min: usize| -> Result<()> {
        if v < min {
            return Err(Error::device(
                "dispatch",
                format!(
                    "kernel {} argument {name} must be >= {min}, got {v}",
                    dispatch.kernel.name()
                ),
            ));
        }
        Ok(())
    };

    match dispatch.kernel {
        Kernel::Forward => {
            let (size, next_size) = (dispatch.int(0), dispatch.int(1));
            nonzero("size", size, 1)?;
            nonzero("next_size", next_size, 2)?;
            expect_global(next_size - 1)?;
            Ok(vec![(2, size), (3, size * next_size), (4, next_size - 1)])
        }
        Kernel::OutputError => {
            let n = dispatch.global_size;
            nonzero("size", n + 1, 2)?;
            Ok(vec![(0, n), (1, n), (2, n)])
        }
        Kernel::Backpropagate => {
            let (size, next_size) = (dispatch.int(0), dispatch.int(1));
            nonzero("size", size, 2)?;
            nonzero("next_size", next_size, 2)?;
            expect_global(size - 1)?;
            Ok(vec![
                (2, size),
                (3, size * next_size),
                (4, next_size - 1),
                (5, size - 1),
            ])
        }
        Kernel::UpdateWeights => {
            let (previous_size, size) = (dispatch.int(0), dispatch.int(1));
            nonzero("previous_size", previous_size, 1)?;
            nonzero("size", size, 2)?;
            expect_global(previous_size * (size - 1))?;
            if !dispatch.float(2).is_finite() {
                return Err(Error::device(
                    "dispatch",
                    "learning rate must be finite".to_owned(),
                ));
            }
            Ok(vec![(3, previous_size), (4, size - 1), (5, previous_size * size)])
        }
    }
}
