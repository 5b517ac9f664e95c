//! Row-partitioned sparse matrix: COO accumulation, CSR assembly, SpMV
//! (spec.md §3 "Mat", §4.4, §4.5).
//!
//! Grounded on `examples/original_source/include/matrix.hpp`'s draft `Mat`
//! for the COO-accumulate-then-assemble shape; the CSR/RC strategy bodies
//! in [`spmv`] and [`rc`] are built directly from spec.md §4.5's prose,
//! since the retrieved original source only carries an early, un-setup-ed
//! draft of this type.

mod rc;
mod spmv;

pub use rc::RcMat;
pub use spmv::CsrStrategy;

use mpi::traits::Equivalence;

use crate::config::SpmvConfig;
use crate::numeric::{Index, Scalar};
use crate::partition::Partitioner;
use crate::runtime::Runtime;
use crate::Error;

/// `Mat` lifecycle (spec.md §4.4 "State machine"): `set_dimensions` takes
/// `Empty -> Sized`; `set_value` moves `Sized/Accumulating -> Accumulating`;
/// `setup` takes `Accumulating/Sized -> SetUp` and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatState {
    Empty,
    Sized,
    Accumulating,
    SetUp,
}

/// A row-partitioned sparse matrix stored as CSR once assembled, COO
/// triples before that.
///
/// `local[i]` holds `(local_column_offset, value)` pairs for row `i`'s
/// entries in this rank's own column band (the "diagonal block", readable
/// from a [`crate::vector::DistVec`]'s local slab with no communication).
/// `remote[i]` holds `(global_column, value)` pairs for everything else,
/// read through [`crate::proxy::RData`].
pub struct CsrMat<'rt, I: Index, D> {
    runtime: &'rt Runtime,
    rows: I,
    cols: I,
    row_part: Option<Partitioner<I>>,
    col_part: Option<Partitioner<I>>,
    state: MatState,
    coo: Vec<(I, I, D)>,
    local: Vec<Vec<(usize, D)>>,
    remote: Vec<Vec<(I, D)>>,
    config: SpmvConfig,
}

impl<'rt, I: Index, D: Scalar + Default + Equivalence> CsrMat<'rt, I, D> {
    /// Uses [`SpmvConfig::default`] for the `Single`/`Block` strategies'
    /// prefetch window and block size; see [`CsrMat::with_config`] to load
    /// tuned values instead.
    pub fn new(runtime: &'rt Runtime) -> Self {
        Self::with_config(runtime, SpmvConfig::default())
    }

    /// Like [`CsrMat::new`], but with caller-supplied SpMV tuning knobs
    /// (spec.md §0.4's prefetch-window/block-size settings) instead of the
    /// hardcoded defaults.
    pub fn with_config(runtime: &'rt Runtime, config: SpmvConfig) -> Self {
        Self {
            runtime,
            rows: I::zero(),
            cols: I::zero(),
            row_part: None,
            col_part: None,
            state: MatState::Empty,
            coo: Vec::new(),
            local: Vec::new(),
            remote: Vec::new(),
            config,
        }
    }

    /// Positive, single-shot-or-clearing: always (re)computes the row and
    /// column partitions and drops any previously accumulated entries
    /// (spec.md §4.4). Collective - reads `P` via the partitioner.
    pub fn set_dimensions(&mut self, rows: I, cols: I) -> crate::Result<()> {
        if rows <= I::zero() {
            return Err(Error::InvalidSize(rows.as_i64()));
        }
        if cols <= I::zero() {
            return Err(Error::InvalidSize(cols.as_i64()));
        }

        self.row_part = Some(Partitioner::new(rows, self.runtime.size())?);
        self.col_part = Some(Partitioner::new(cols, self.runtime.size())?);
        self.rows = rows;
        self.cols = cols;
        self.coo.clear();
        self.local.clear();
        self.remote.clear();
        self.state = MatState::Sized;
        Ok(())
    }

    fn row_part(&self) -> &Partitioner<I> {
        self.row_part.as_ref().expect("set_dimensions must be called first")
    }

    fn col_part(&self) -> &Partitioner<I> {
        self.col_part.as_ref().expect("set_dimensions must be called first")
    }

    /// Half-open global row range `[start, end)` this rank owns.
    pub fn local_rows(&self) -> (I, I) {
        self.row_part().range(self.runtime.rank())
    }

    /// Half-open global column range this rank owns - the "diagonal block"
    /// (spec.md GLOSSARY).
    pub fn diag_cols(&self) -> (I, I) {
        self.col_part().range(self.runtime.rank())
    }

    pub fn local_rows_size(&self) -> I {
        self.row_part().local_size(self.runtime.rank())
    }

    pub fn rows(&self) -> I {
        self.rows
    }

    pub fn cols(&self) -> I {
        self.cols
    }

    fn is_set_up(&self) -> bool {
        self.state == MatState::SetUp
    }

    /// `x.size() == N`, `y.size() == M`, else dimension-mismatch.
    pub fn check_dimensions<'a>(
        &self,
        x: &crate::vector::DistVec<'a, I, D>,
        y: &crate::vector::DistVec<'a, I, D>,
    ) -> crate::Result<()> {
        if x.size().as_i64() != self.cols.as_i64() {
            return Err(Error::DimensionMismatch(format!(
                "SpMV: |x| = {} but N = {}",
                x.size().as_i64(),
                self.cols.as_i64()
            )));
        }
        if y.size().as_i64() != self.rows.as_i64() {
            return Err(Error::DimensionMismatch(format!(
                "SpMV: |y| = {} but M = {}",
                y.size().as_i64(),
                self.rows.as_i64()
            )));
        }
        Ok(())
    }

    /// Append `(row, col, v)` to the COO accumulation buffer. Not
    /// coalesced - inserting the same `(row, col)` twice produces two
    /// adjacency entries that `setup` sorts adjacent and SpMV sums, so
    /// `set_value` is additive rather than idempotent (spec.md §9).
    pub fn set_value(&mut self, row: I, col: I, v: D) -> crate::Result<()> {
        if self.state == MatState::Empty || self.state == MatState::SetUp {
            return Err(Error::LifecycleViolation(
                "set_value requires dimensions set and assembly not yet started",
            ));
        }
        let (row_start, row_end) = self.local_rows();
        debug_assert!(
            row >= row_start && row < row_end,
            "row {:?} outside this rank's local band [{:?}, {:?})",
            row,
            row_start,
            row_end
        );
        debug_assert!(
            col >= I::zero() && col < self.cols,
            "col {:?} outside [0, {:?})",
            col,
            self.cols
        );
        self.coo.push((row, col, v));
        self.state = MatState::Accumulating;
        Ok(())
    }

    /// Assemble the COO buffer into sorted per-row CSR adjacency,
    /// partitioned into the local (diagonal-block) and remote lists
    /// (spec.md §4.4 "Assembly"). `dnz`/`onz` are per-row capacity hints
    /// for the local/remote lists respectively, mirroring PETSc's
    /// `MatMPIAIJSetPreallocation` naming. Terminal: a second call is a
    /// lifecycle violation.
    pub fn setup(&mut self, dnz: usize, onz: usize) -> crate::Result<()> {
        match self.state {
            MatState::Sized | MatState::Accumulating => {}
            MatState::SetUp => return Err(Error::LifecycleViolation("setup called twice")),
            MatState::Empty => return Err(Error::LifecycleViolation("setup before set_dimensions")),
        }

        let local_rows = self.local_rows_size().as_usize();
        let (row_start, _) = self.local_rows();
        let (cstart, cend) = self.diag_cols();

        let mut local: Vec<Vec<(usize, D)>> = (0..local_rows).map(|_| Vec::with_capacity(dnz)).collect();
        let mut remote: Vec<Vec<(I, D)>> = (0..local_rows).map(|_| Vec::with_capacity(onz)).collect();

        for (r, c, v) in self.coo.drain(..) {
            let local_row = (r - row_start).as_usize();
            if c >= cstart && c < cend {
                local[local_row].push(((c - cstart).as_usize(), v));
            } else {
                remote[local_row].push((c, v));
            }
        }

        for row in local.iter_mut() {
            row.shrink_to_fit();
            row.sort_by_key(|&(c, _)| c);
        }
        for row in remote.iter_mut() {
            row.shrink_to_fit();
            row.sort_by_key(|&(c, _)| c.as_i64());
        }

        tracing::debug!(
            rank = self.runtime.rank(),
            local_rows,
            local_nnz = local.iter().map(Vec::len).sum::<usize>(),
            remote_nnz = remote.iter().map(Vec::len).sum::<usize>(),
            "assembled CsrMat"
        );

        self.local = local;
        self.remote = remote;
        self.coo = Vec::new();
        self.state = MatState::SetUp;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::runtime;
    use crate::vector::DistVec;

    fn identity_diagonal(n: i64, rt: &Runtime) -> CsrMat<'_, i64, f64> {
        let mut m = CsrMat::new(rt);
        m.set_dimensions(n, n).unwrap();
        let (start, end) = m.local_rows();
        let mut i = start;
        while i < end {
            m.set_value(i, i, 1.0).unwrap();
            i += 1;
        }
        m.setup(1, 0).unwrap();
        m
    }

    #[test]
    fn identity_times_x_equals_x_on_owned_rows() {
        let rt = runtime();
        let m = identity_diagonal(15, rt);
        let mut x: DistVec<i64, f64> = DistVec::allocated(rt, 15).unwrap();
        for i in 0..15i64 {
            x.cell(i).assign(i as f64).unwrap();
        }
        x.set_wait();
        let mut y: DistVec<i64, f64> = DistVec::allocated(rt, 15).unwrap();

        m.dot(&x, &mut y, CsrStrategy::Naive).unwrap();

        let (start, end) = m.local_rows();
        for (k, i) in (start..end).enumerate() {
            assert_eq!(y.local_array_read()[k], i as f64);
        }
    }

    #[test]
    fn diagonal_a_ii_eq_i_gives_y_i_eq_i_squared() {
        let rt = runtime();
        let mut m = CsrMat::new(rt);
        m.set_dimensions(15, 15).unwrap();
        let (start, end) = m.local_rows();
        let mut i = start;
        while i < end {
            m.set_value(i, i, i as f64).unwrap();
            i += 1;
        }
        m.setup(1, 0).unwrap();

        let mut x: DistVec<i64, f64> = DistVec::allocated(rt, 15).unwrap();
        for i in 0..15i64 {
            x.cell(i).assign(i as f64).unwrap();
        }
        x.set_wait();
        let mut y: DistVec<i64, f64> = DistVec::allocated(rt, 15).unwrap();

        m.dot(&x, &mut y, CsrStrategy::Naive).unwrap();

        let (start, end) = m.local_rows();
        for (k, i) in (start..end).enumerate() {
            assert_eq!(y.local_array_read()[k], (i * i) as f64);
        }
    }

    /// The PETSc reference driver's synthesis rule (spec.md §6, §8):
    /// row `i` gets a `1` at every `j = (91*i) mod sparsity + k*sparsity <
    /// dim`. With `x = 1` everywhere, `(A*x)[i]` is just the count of such
    /// `j`, which this test computes independently and checks against.
    #[test]
    fn benchmark_synthesis_matches_closed_form_count() {
        let rt = runtime();
        let dim: i64 = 10;
        let sparsity: i64 = 5;

        let mut m = CsrMat::new(rt);
        m.set_dimensions(dim, dim).unwrap();
        let (start, end) = m.local_rows();
        let mut i = start;
        while i < end {
            let mut j = (91 * i).rem_euclid(sparsity);
            while j < dim {
                m.set_value(i, j, 1.0).unwrap();
                j += sparsity;
            }
            i += 1;
        }
        m.setup((dim / sparsity + 1) as usize, (dim / sparsity + 1) as usize)
            .unwrap();

        let mut x: DistVec<i64, f64> = DistVec::allocated(rt, dim).unwrap();
        x.set_all(1.0);
        let mut y: DistVec<i64, f64> = DistVec::allocated(rt, dim).unwrap();

        m.dot(&x, &mut y, CsrStrategy::Naive).unwrap();

        let (start, end) = m.local_rows();
        for (k, i) in (start..end).enumerate() {
            let mut expected = 0.0;
            let mut j = (91 * i).rem_euclid(sparsity);
            while j < dim {
                expected += 1.0;
                j += sparsity;
            }
            assert_eq!(y.local_array_read()[k], expected);
        }
    }

    #[test]
    fn banded_matrix_matches_closed_form() {
        let rt = runtime();
        let band: i64 = 4;
        let n = 15i64;
        let mut m = CsrMat::new(rt);
        m.set_dimensions(n, n).unwrap();
        let (start, end) = m.local_rows();
        let mut i = start;
        while i < end {
            m.set_value(i, i, 1.0).unwrap();
            m.set_value(i, (i + band) % n, 1.0).unwrap();
            i += 1;
        }
        m.setup(2, 2).unwrap();

        let mut x: DistVec<i64, f64> = DistVec::allocated(rt, n).unwrap();
        for i in 0..n {
            x.cell(i).assign(i as f64).unwrap();
        }
        x.set_wait();
        let mut y: DistVec<i64, f64> = DistVec::allocated(rt, n).unwrap();

        m.dot(&x, &mut y, CsrStrategy::Naive).unwrap();

        let (start, end) = m.local_rows();
        for (k, i) in (start..end).enumerate() {
            let expected = (i + (i + band) % n) as f64;
            assert_eq!(y.local_array_read()[k], expected);
        }
    }

    #[test]
    fn strategies_agree_with_each_other() {
        let rt = runtime();
        let band: i64 = 3;
        let n = 40i64;
        let mut m = CsrMat::new(rt);
        m.set_dimensions(n, n).unwrap();
        let (start, end) = m.local_rows();
        let mut i = start;
        while i < end {
            m.set_value(i, i, 2.0).unwrap();
            m.set_value(i, (i + band) % n, 0.5).unwrap();
            i += 1;
        }
        m.setup(2, 2).unwrap();

        let mut x: DistVec<i64, f64> = DistVec::allocated(rt, n).unwrap();
        for i in 0..n {
            x.cell(i).assign((i as f64) * 0.25).unwrap();
        }
        x.set_wait();

        let mut y_naive: DistVec<i64, f64> = DistVec::allocated(rt, n).unwrap();
        let mut y_single: DistVec<i64, f64> = DistVec::allocated(rt, n).unwrap();
        let mut y_block: DistVec<i64, f64> = DistVec::allocated(rt, n).unwrap();

        m.dot(&x, &mut y_naive, CsrStrategy::Naive).unwrap();
        m.dot(&x, &mut y_single, CsrStrategy::Single).unwrap();
        m.dot(&x, &mut y_block, CsrStrategy::Block).unwrap();

        for k in 0..y_naive.local_array_read().len() {
            let a = y_naive.local_array_read()[k];
            let b = y_single.local_array_read()[k];
            let c = y_block.local_array_read()[k];
            assert!((a - b).abs() < 1e-12, "single disagrees at {k}: {a} vs {b}");
            assert!((a - c).abs() < 1e-12, "block disagrees at {k}: {a} vs {c}");
        }
    }

    #[test]
    fn custom_prefetch_window_still_agrees_with_naive() {
        let rt = runtime();
        let band: i64 = 3;
        let n = 20i64;
        let mut m = CsrMat::with_config(rt, crate::config::SpmvConfig { prefetch_window: 1, block_size: 3 });
        m.set_dimensions(n, n).unwrap();
        let (start, end) = m.local_rows();
        let mut i = start;
        while i < end {
            m.set_value(i, i, 2.0).unwrap();
            m.set_value(i, (i + band) % n, 0.5).unwrap();
            i += 1;
        }
        m.setup(2, 2).unwrap();

        let mut x: DistVec<i64, f64> = DistVec::allocated(rt, n).unwrap();
        for i in 0..n {
            x.cell(i).assign((i as f64) * 0.25).unwrap();
        }
        x.set_wait();

        let mut y_naive: DistVec<i64, f64> = DistVec::allocated(rt, n).unwrap();
        let mut y_single: DistVec<i64, f64> = DistVec::allocated(rt, n).unwrap();
        let mut y_block: DistVec<i64, f64> = DistVec::allocated(rt, n).unwrap();

        m.dot(&x, &mut y_naive, CsrStrategy::Naive).unwrap();
        m.dot(&x, &mut y_single, CsrStrategy::Single).unwrap();
        m.dot(&x, &mut y_block, CsrStrategy::Block).unwrap();

        for k in 0..y_naive.local_array_read().len() {
            let a = y_naive.local_array_read()[k];
            let b = y_single.local_array_read()[k];
            let c = y_block.local_array_read()[k];
            assert!((a - b).abs() < 1e-12, "single disagrees at {k}: {a} vs {b}");
            assert!((a - c).abs() < 1e-12, "block disagrees at {k}: {a} vs {c}");
        }
    }

    #[test]
    fn set_value_rejects_before_set_dimensions() {
        let rt = runtime();
        let mut m: CsrMat<i64, f64> = CsrMat::new(rt);
        assert!(matches!(m.set_value(0, 0, 1.0), Err(Error::LifecycleViolation(_))));
    }

    #[test]
    fn setup_twice_is_a_lifecycle_violation() {
        let rt = runtime();
        let mut m = identity_diagonal(10, rt);
        assert!(matches!(m.setup(1, 0), Err(Error::LifecycleViolation(_))));
    }

    #[test]
    fn dot_is_idempotent_on_a_reused_output() {
        let rt = runtime();
        let m = identity_diagonal(12, rt);
        let mut x: DistVec<i64, f64> = DistVec::allocated(rt, 12).unwrap();
        for i in 0..12i64 {
            x.cell(i).assign(i as f64).unwrap();
        }
        x.set_wait();
        let mut y: DistVec<i64, f64> = DistVec::allocated(rt, 12).unwrap();

        m.dot(&x, &mut y, CsrStrategy::Naive).unwrap();
        let first: Vec<f64> = y.local_array_read().to_vec();
        m.dot(&x, &mut y, CsrStrategy::Naive).unwrap();
        let second: Vec<f64> = y.local_array_read().to_vec();

        assert_eq!(first, second, "dot() must zero y before accumulating, not add onto stale contents");
    }

    #[test]
    fn dot_rejects_mismatched_operands() {
        let rt = runtime();
        let m = identity_diagonal(10, rt);
        let x: DistVec<i64, f64> = DistVec::allocated(rt, 9).unwrap();
        let mut y: DistVec<i64, f64> = DistVec::allocated(rt, 10).unwrap();
        assert!(matches!(
            m.dot(&x, &mut y, CsrStrategy::Naive),
            Err(Error::DimensionMismatch(_))
        ));
    }
}
