//! SpMV strategies over [`super::CsrMat`] (spec.md §4.5.a/b/c).
//!
//! All four strategies (three here, RCMat's in [`super::rc`]) compute
//! `y <- y + A*x`; the `dot` wrapper zeroes `y` first via `set_all(0)` then
//! delegates to the chosen strategy.

use mpi::traits::Equivalence;

use crate::numeric::{Index, Scalar};
use crate::vector::DistVec;
use crate::Error;

use super::CsrMat;

/// Which SpMV implementation to run. All four (this enum's three plus
/// [`super::RcMat`]'s own) must agree on the same `(A, x)` to within
/// floating-point accumulation error (spec.md §8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrStrategy {
    /// Blocking, one remote nonzero at a time. No overlap (spec.md §4.5.a).
    Naive,
    /// Fine-grained prefetch ring, `W` slots (spec.md §4.5.b).
    Single,
    /// Contiguous double-buffered chunks of size `B` (spec.md §4.5.c).
    Block,
}

impl<'rt, I: Index, D: Scalar + Default + Equivalence> CsrMat<'rt, I, D> {
    /// `y <- y + A*x` using `strategy`. Requires `setup` to have run,
    /// except for [`CsrStrategy::Naive`], which the source never checks
    /// (spec.md §9, preserved here).
    pub fn dot(&self, x: &DistVec<'rt, I, D>, y: &mut DistVec<'rt, I, D>, strategy: CsrStrategy) -> crate::Result<()> {
        self.check_dimensions(x, y)?;
        if strategy != CsrStrategy::Naive && !self.is_set_up() {
            return Err(Error::LifecycleViolation("SpMV requires setup() to have run"));
        }
        y.set_all(D::zero());
        match strategy {
            CsrStrategy::Naive => self.dot_naive(x, y),
            CsrStrategy::Single => self.dot_single(x, y),
            CsrStrategy::Block => self.dot_block(x, y),
        }
    }

    /// Local phase: loop rows, loop `local[i]`, accumulate from `x`'s own
    /// slab. Remote phase: loop rows, loop `remote[i]`, one blocking
    /// `x[col].get()` per nonzero (spec.md §4.5.a).
    fn dot_naive(&self, x: &DistVec<'rt, I, D>, y: &mut DistVec<'rt, I, D>) -> crate::Result<()> {
        let mut acc = vec![D::zero(); self.local.len()];

        let x_local = x.local_array_read();
        for (i, row) in self.local.iter().enumerate() {
            for &(col, val) in row {
                acc[i] += val.mul(x_local[col]);
            }
        }
        for (i, row) in self.remote.iter().enumerate() {
            for &(col, val) in row {
                let got = x.cell(col).get();
                acc[i] += val.mul(got);
            }
        }

        let y_local = y.local_array_write();
        for (i, a) in acc.into_iter().enumerate() {
            y_local[i] += a;
        }
        Ok(())
    }

    /// Fine-grained prefetched CSR (spec.md §4.5.b). Flattens the remote
    /// adjacency into its row-major traversal order once (the same
    /// traversal `seek_next` would walk incrementally), primes a ring of
    /// `W` in-flight gets over its head, runs the local phase while those
    /// are in flight, then drains the ring one nonzero at a time,
    /// refilling a slot per nonzero consumed until the cursor runs out.
    fn dot_single(&self, x: &DistVec<'rt, I, D>, y: &mut DistVec<'rt, I, D>) -> crate::Result<()> {
        let mut acc = vec![D::zero(); self.local.len()];

        let x_local = x.local_array_read();
        for (i, row) in self.local.iter().enumerate() {
            for &(col, val) in row {
                acc[i] += val.mul(x_local[col]);
            }
        }

        let order: Vec<(usize, I, D)> = self
            .remote
            .iter()
            .enumerate()
            .flat_map(|(i, row)| row.iter().map(move |&(col, val)| (i, col, val)))
            .collect();

        if order.is_empty() {
            let y_local = y.local_array_write();
            for (i, a) in acc.into_iter().enumerate() {
                y_local[i] += a;
            }
            return Ok(());
        }

        let window = self.config.prefetch_window.min(order.len());
        let mut ring: Vec<_> = (0..window).map(|k| x.cell(order[k].1)).collect();
        for slot in ring.iter_mut() {
            slot.prefetch();
        }

        // A slot holding `order[pos]` is only ever reused for `order[pos +
        // window]`, which lands at the same `pos % window` index - so the
        // read and the refill below always target the same ring slot.
        for (pos, &(i, _col, val)) in order.iter().enumerate() {
            let slot = pos % ring.len();
            let got = ring[slot].get();
            acc[i] += val.mul(got);

            let next = pos + window;
            if next < order.len() {
                ring[slot] = x.cell(order[next].1);
                ring[slot].prefetch();
            }
        }

        let y_local = y.local_array_write();
        for (i, a) in acc.into_iter().enumerate() {
            y_local[i] += a;
        }
        Ok(())
    }

    /// Contiguous double-buffered CSR (spec.md §4.5.c). Partitions `x`'s
    /// global index range into chunks of size `B`, fetches two chunks at a
    /// time into alternating buffers (via
    /// [`DistVec::read_range_begin`]/`read_range_complete`, which already
    /// compose the per-owning-rank gets a chunk may span), and for each
    /// row walks `remote[i]` from a per-row cursor as long as the column
    /// lies in the currently-loaded window. `row_starts` is sized to
    /// `local_rows`, not `M` as the source has it (spec.md §9). Each row's
    /// cursor only moves forward since `remote[i]` is sorted ascending, so
    /// every `(row, entry)` pair is visited exactly once.
    fn dot_block(&self, x: &DistVec<'rt, I, D>, y: &mut DistVec<'rt, I, D>) -> crate::Result<()> {
        let block = self.config.block_size;
        let mut acc = vec![D::zero(); self.local.len()];

        let x_local = x.local_array_read();
        for (i, row) in self.local.iter().enumerate() {
            for &(col, val) in row {
                acc[i] += val.mul(x_local[col]);
            }
        }

        let n = x.size().as_usize();
        if n == 0 || block == 0 {
            let y_local = y.local_array_write();
            for (i, a) in acc.into_iter().enumerate() {
                y_local[i] += a;
            }
            return Ok(());
        }

        let mut row_starts = vec![0usize; self.local.len()];
        let cap = block.min(n);
        let mut buf0: Box<[D]> = vec![D::zero(); cap].into_boxed_slice();
        let mut buf1: Box<[D]> = vec![D::zero(); cap].into_boxed_slice();

        let mut buf_start = 0usize;
        let len0 = block.min(n - buf_start);
        let mut pending = Some(x.read_range_begin(
            I::from_usize(buf_start),
            I::from_usize(buf_start + len0),
            &mut buf0[..len0],
        )?);
        let mut current_is_buf0 = true;

        while buf_start < n {
            let this_len = block.min(n - buf_start);
            x.read_range_complete(pending.take().expect("a fetch is always in flight here"))?;

            let next_start = buf_start + this_len;
            if next_start < n {
                let next_len = block.min(n - next_start);
                pending = Some(if current_is_buf0 {
                    x.read_range_begin(I::from_usize(next_start), I::from_usize(next_start + next_len), &mut buf1[..next_len])?
                } else {
                    x.read_range_begin(I::from_usize(next_start), I::from_usize(next_start + next_len), &mut buf0[..next_len])?
                });
            }

            let arrived: &[D] = if current_is_buf0 { &buf0[..this_len] } else { &buf1[..this_len] };
            let window_end = buf_start + this_len;
            for (i, row) in self.remote.iter().enumerate() {
                while row_starts[i] < row.len() {
                    let (col, val) = row[row_starts[i]];
                    let col = col.as_usize();
                    if col < buf_start || col >= window_end {
                        break;
                    }
                    acc[i] += val.mul(arrived[col - buf_start]);
                    row_starts[i] += 1;
                }
            }

            buf_start = next_start;
            current_is_buf0 = !current_is_buf0;
        }

        let y_local = y.local_array_write();
        for (i, a) in acc.into_iter().enumerate() {
            y_local[i] += a;
        }
        Ok(())
    }
}
