//! Collectively allocated distributed dense vector (spec.md §3, §4.3).
//!
//! Grounded on `examples/original_source/include/vector.hpp`'s `Vec`: a
//! global size, a partition, a local slab registered for one-sided RMA, and
//! a "chained put future" that lets a single `set_wait()` drain every
//! outstanding write issued through any [`crate::proxy::RData`] ever handed
//! out by this vector. The put-future here is a plain queue rather than a
//! literal composed future (see [`PutFuture`]'s doc comment) - the two are
//! observably identical in this single-threaded cooperative model, since
//! nothing drives MPI progress on a put between `assign()` and `set_wait()`
//! anyway.
//!
//! Mirrors the source's two-phase `Vec()` + `allocate(N)` shape: a `Vec` is
//! constructed empty (no partition, no window, no slab) and becomes usable
//! only after `allocate` runs, which may happen at most once per instance
//! (spec.md §3, "A Vec may be 'allocated' at most once; re-allocation
//! fails").

use mpi::traits::Equivalence;
use parking_lot::Mutex;

use crate::numeric::{Index, RealScalar, Scalar};
use crate::partition::Partitioner;
use crate::proxy::RData;
use crate::runtime::{RmaWindow, Runtime};
use crate::Error;

/// Queue of not-yet-issued puts against one [`DistVec`]'s local slabs.
///
/// spec.md §4.2 describes every `RData::assign` folding its put into the
/// parent vector's future by "when-all" composition, so one `wait` drains
/// them all. Composing real `mpi` futures that way would mean storing a
/// live borrow of the window inside every queued entry, which is exactly
/// the self-referential shape [`crate::runtime::RmaWindow`]'s doc comment
/// explains we only accept for the window/slab pair itself. Queuing the
/// `(rank, offset, value)` triples instead and replaying them against
/// `&RmaWindow` from [`DistVec::set_wait`] gets the same semantics - every
/// put issued since the last drain completes before `set_wait` returns -
/// without a second unsafe lifetime trick.
pub struct PutFuture<D> {
    queue: Mutex<Vec<(u32, usize, D)>>,
}

impl<D: Copy> PutFuture<D> {
    fn new() -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
        }
    }

    /// Record a put to replay later. Never touches the network.
    pub(crate) fn push(&self, rank: u32, offset: usize, value: D) {
        self.queue.lock().push((rank, offset, value));
    }

    /// Replay and clear every queued put against `window`.
    fn drain(&self, window: &RmaWindow<D>)
    where
        D: Equivalence,
    {
        let mut queue = self.queue.lock();
        for (rank, offset, value) in queue.drain(..) {
            window.put_now(rank, offset, value);
        }
    }
}

/// Whether a [`DistVec`] has been allocated yet (spec.md §3 invariant:
/// "allocated exactly once per instance").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VecState {
    Empty,
    Allocated,
}

/// A distributed dense vector of `D`, partitioned by rows across every rank
/// in `runtime` (spec.md §3 "Vec").
///
/// Field order matters: `window` is declared before `local` so that Rust
/// drops the RMA window (and with it any peer's outstanding access) before
/// the backing storage is freed, per the safety contract on
/// [`RmaWindow::new`]. Both stay `None`/empty until `allocate` runs.
pub struct DistVec<'rt, I: Index, D: 'static> {
    runtime: &'rt Runtime,
    state: VecState,
    partitioner: Option<Partitioner<I>>,
    window: Option<RmaWindow<D>>,
    local: Box<[D]>,
    put_future: PutFuture<D>,
}

impl<'rt, I: Index, D: Copy + Default + Equivalence> DistVec<'rt, I, D> {
    /// Construct an unallocated `Vec`, the Rust analogue of the source's
    /// default constructor. No collective communication happens here -
    /// only `allocate` is collective.
    pub fn new(runtime: &'rt Runtime) -> Self {
        Self {
            runtime,
            state: VecState::Empty,
            partitioner: None,
            window: None,
            local: Box::new([]),
            put_future: PutFuture::new(),
        }
    }

    fn partitioner(&self) -> &Partitioner<I> {
        self.partitioner.as_ref().expect("DistVec used before allocate()")
    }

    fn window(&self) -> &RmaWindow<D> {
        self.window.as_ref().expect("DistVec used before allocate()")
    }

    /// Collective: every rank must call this with the same `size`. Allocates
    /// this rank's band of the partition as local storage and registers it
    /// into a collective RMA window (spec.md §4.3 `allocate`). `g[me]` in
    /// the source's terms is simply `&self.local`, addressed by every peer
    /// as `(runtime.rank(), offset)`.
    ///
    /// Fails with [`Error::LifecycleViolation`] if this `Vec` was already
    /// allocated (spec.md §3: "allocated exactly once per instance"; §8:
    /// "Allocating twice raises lifecycle").
    pub fn allocate(&mut self, size: I) -> crate::Result<()> {
        if self.state == VecState::Allocated {
            return Err(Error::LifecycleViolation("Vec may be allocated at most once"));
        }

        let partitioner = Partitioner::new(size, self.runtime.size())?;
        let local_len = partitioner.local_size(self.runtime.rank()).as_usize();
        let mut local: Box<[D]> = vec![D::default(); local_len].into_boxed_slice();

        // Safety: `window` is declared ahead of `local` in this struct, so
        // its drop glue tears the RMA registration down first.
        let window = unsafe { RmaWindow::new(self.runtime.world(), &mut local) };

        tracing::debug!(
            rank = self.runtime.rank(),
            size = size.as_i64(),
            local_len,
            "allocated DistVec"
        );

        self.partitioner = Some(partitioner);
        self.window = Some(window);
        self.local = local;
        self.state = VecState::Allocated;
        Ok(())
    }

    /// Convenience combining [`DistVec::new`] and [`DistVec::allocate`] for
    /// the common case of wanting an already-allocated vector in one call.
    /// Collective, for the same reason `allocate` is.
    pub fn allocated(runtime: &'rt Runtime, size: I) -> crate::Result<Self> {
        let mut v = Self::new(runtime);
        v.allocate(size)?;
        Ok(v)
    }

    pub fn size(&self) -> I {
        self.partitioner().global_size()
    }

    pub fn local_size(&self) -> I {
        self.partitioner().local_size(self.runtime.rank())
    }

    pub fn local_range(&self) -> (I, I) {
        self.partitioner().range(self.runtime.rank())
    }

    /// Local-only fill of the owned slab. No communication (spec.md §4.3).
    pub fn set_all(&mut self, value: D) {
        self.local.fill(value);
    }

    /// Raw read access to the owned slab.
    pub fn local_array_read(&self) -> &[D] {
        &self.local
    }

    /// Raw write access to the owned slab. Writes through here bypass the
    /// put-future: they are local-only and never queued (spec.md §4.3).
    pub fn local_array_write(&mut self) -> &mut [D] {
        &mut self.local
    }

    /// Produce a proxy naming global index `i`. Resolves the owning rank
    /// via the partitioner and the local offset within that rank's slab
    /// (the Rust name for the source's `Vec::operator[]`, spec.md §9).
    pub fn cell(&self, i: I) -> RData<'_, D> {
        let owner = self.partitioner().owner(i);
        let (start, _) = self.partitioner().range(owner);
        let offset = (i - start).as_usize();
        RData::new(self.window(), Some(&self.put_future), owner, offset)
    }

    /// A read-only proxy - `assign` through it always fails with
    /// `LifecycleViolation`. Useful for callers that only ever read a
    /// cell and want that statically visible at the call site.
    pub fn cell_readonly(&self, i: I) -> RData<'_, D> {
        let owner = self.partitioner().owner(i);
        let (start, _) = self.partitioner().range(owner);
        let offset = (i - start).as_usize();
        RData::new(self.window(), None, owner, offset)
    }

    /// Block until every put issued through a proxy obtained from this
    /// vector has completed remotely, then a collective barrier, then reset
    /// the put-future (spec.md §4.3).
    pub fn set_wait(&mut self) {
        let pending = self.put_future.queue.lock().len();
        tracing::trace!(pending, "draining DistVec put-future");
        if let Some(window) = self.window.as_ref() {
            self.put_future.drain(window);
        }
        self.runtime.barrier();
    }

    /// Validate sizes match, then copy this rank's slab into `dst`'s slab.
    /// No cross-rank traffic (spec.md §4.3).
    pub fn copy(&self, dst: &mut Self) -> crate::Result<()> {
        if self.size().as_i64() != dst.size().as_i64() {
            return Err(Error::DimensionMismatch(format!(
                "copy: source size {} != destination size {}",
                self.size().as_i64(),
                dst.size().as_i64()
            )));
        }
        dst.local.copy_from_slice(&self.local);
        Ok(())
    }

    /// Fill `buf` (length `end - start`) with the values at global indices
    /// `[start, end)`, dispatching one `rget` per owning rank spanned by
    /// the interval and composing their futures (spec.md §4.3). The
    /// blocking call; see [`DistVec::read_range_begin`] /
    /// [`read_range_complete`] for the split form.
    pub fn read_range(&self, start: I, end: I, buf: &mut [D]) -> crate::Result<()> {
        let pending = self.read_range_begin(start, end, buf)?;
        self.read_range_complete(pending)
    }

    /// Non-blocking half of `read_range`: issues every per-rank `rget` the
    /// interval spans and returns a handle that [`read_range_complete`]
    /// later drains, writing results into `buf`.
    pub fn read_range_begin<'b>(
        &self,
        start: I,
        end: I,
        buf: &'b mut [D],
    ) -> crate::Result<ReadRangePending<'_, 'b, D>> {
        if end < start || end > self.size() {
            return Err(Error::OutOfRange(format!(
                "read_range: [{}, {}) out of bounds for size {}",
                start.as_i64(),
                end.as_i64(),
                self.size().as_i64()
            )));
        }
        let want = (end - start).as_usize();
        if buf.len() != want {
            return Err(Error::DimensionMismatch(format!(
                "read_range: buffer length {} != requested span {}",
                buf.len(),
                want
            )));
        }

        let mut requests = Vec::new();
        let mut i = start;
        let mut buf_off = 0usize;
        while i < end {
            let owner = self.partitioner().owner(i);
            let (rank_start, rank_end) = self.partitioner().range(owner);
            let span_end = end.min(rank_end);
            let count = (span_end - i).as_usize();
            let local_offset = (i - rank_start).as_usize();
            requests.push((buf_off, self.window().rget_range(owner, local_offset, count)));
            buf_off += count;
            i = span_end;
        }

        Ok(ReadRangePending { buf, requests })
    }

    /// Block on every request a prior `read_range_begin` issued, writing
    /// the results into the buffer that was passed to it.
    pub fn read_range_complete(&self, pending: ReadRangePending<'_, '_, D>) -> crate::Result<()> {
        pending.finish();
        Ok(())
    }

    fn local_sum_mag_sq(&self) -> D
    where
        D: Scalar,
    {
        self.local.iter().fold(D::zero(), |acc, &x| acc + x.mag_sq())
    }

    fn local_dot(&self, other: &Self) -> D
    where
        D: Scalar,
    {
        self.local
            .iter()
            .zip(other.local.iter())
            .fold(D::zero(), |acc, (&x, &y)| acc + x.mul(y))
    }
}

impl<'rt, I: Index, D: RealScalar + Default + Equivalence> DistVec<'rt, I, D> {
    /// Collective. Sum of `|x_i|^2` over the owned slab, allreduced, then
    /// square-rooted (spec.md §4.3 `norm`).
    pub fn norm(&self) -> D {
        let local = self.local_sum_mag_sq();
        self.runtime.allreduce_sum(local).sqrt()
    }
}

impl<'rt, I: Index, D: Scalar + Default + Equivalence> DistVec<'rt, I, D> {
    /// Collective. Validates matching sizes, then an elementwise product
    /// summed locally and allreduced. Does not conjugate the left operand -
    /// wrong for complex values, preserved because it's what the source
    /// does (spec.md §4.3, §9).
    pub fn dot(&self, other: &Self) -> crate::Result<D> {
        if self.size().as_i64() != other.size().as_i64() {
            return Err(Error::DimensionMismatch(format!(
                "dot: operand sizes {} and {} differ",
                self.size().as_i64(),
                other.size().as_i64()
            )));
        }
        let local = self.local_dot(other);
        Ok(self.runtime.allreduce_sum(local))
    }
}

/// Rule of five: `Clone` allocates a fresh vector (collective, since
/// allocation is collective - every rank must call `.clone()` in lockstep)
/// and copies only the local slab, with no cross-rank traffic for the copy
/// itself (spec.md §4.3 "Rule of five").
impl<'rt, I: Index, D: Copy + Default + Equivalence> Clone for DistVec<'rt, I, D> {
    fn clone(&self) -> Self {
        let mut fresh =
            Self::allocated(self.runtime, self.size()).expect("cloning an already-valid DistVec cannot fail");
        self.copy(&mut fresh).expect("freshly allocated DistVec always matches size");
        fresh
    }
}

/// Destruction drains outstanding puts, then a collective barrier, before
/// the slab and its RMA registration are released - omitting the barrier
/// could race a peer whose puts still target this slab (spec.md §4.3).
impl<'rt, I: Index, D: Copy + Equivalence> Drop for DistVec<'rt, I, D> {
    fn drop(&mut self) {
        if let Some(window) = self.window.as_ref() {
            self.put_future.drain(window);
        }
        self.runtime.barrier();
    }
}

/// In-flight composed get issued by [`DistVec::read_range_begin`], still
/// holding the destination buffer it will write into on completion.
pub struct ReadRangePending<'v, 'b, D> {
    buf: &'b mut [D],
    requests: Vec<(usize, crate::runtime::PendingGet<'v, D>)>,
}

impl<'v, 'b, D: Copy> ReadRangePending<'v, 'b, D> {
    fn finish(self) {
        let buf = self.buf;
        for (buf_off, pending) in self.requests {
            let got = pending.wait();
            buf[buf_off..buf_off + got.len()].copy_from_slice(&got);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::runtime;
    use approx::assert_abs_diff_eq;

    #[test]
    fn set_all_fills_every_owned_slot() {
        let rt = runtime();
        let mut v: DistVec<i64, f64> = DistVec::allocated(rt, 100).unwrap();
        v.set_all(7.0);
        assert!(v.local_array_read().iter().all(|&x| x == 7.0));
    }

    #[test]
    fn copy_matches_source_slot_by_slot() {
        let rt = runtime();
        let mut v: DistVec<i64, f64> = DistVec::allocated(rt, 100).unwrap();
        let mut w: DistVec<i64, f64> = DistVec::allocated(rt, 100).unwrap();
        v.set_all(3.5);
        v.copy(&mut w).unwrap();
        assert_eq!(v.local_array_read(), w.local_array_read());
    }

    #[test]
    fn clone_is_independent_of_source() {
        let rt = runtime();
        let mut v: DistVec<i64, f64> = DistVec::allocated(rt, 16).unwrap();
        v.set_all(1.0);
        let w = v.clone();
        v.set_all(2.0);
        assert!(w.local_array_read().iter().all(|&x| x == 1.0));
    }

    #[test]
    fn round_trip_put_then_get_through_a_proxy() {
        let rt = runtime();
        let mut v: DistVec<i64, f64> = DistVec::allocated(rt, 8).unwrap();
        v.set_all(0.0);
        {
            let mut cell = v.cell(3);
            cell.assign(42.0).unwrap();
        }
        v.set_wait();
        let mut cell = v.cell(3);
        assert_eq!(cell.get(), 42.0);
    }

    #[test]
    fn assign_through_a_readonly_proxy_is_a_lifecycle_violation() {
        let rt = runtime();
        let v: DistVec<i64, f64> = DistVec::allocated(rt, 8).unwrap();
        let mut cell = v.cell_readonly(0);
        assert!(matches!(cell.assign(1.0), Err(Error::LifecycleViolation(_))));
    }

    #[test]
    fn norm_matches_closed_form() {
        let rt = runtime();
        let mut v: DistVec<i64, f64> = DistVec::allocated(rt, 100).unwrap();
        for i in 0..100i64 {
            let mut cell = v.cell(i);
            cell.assign(i as f64 / 3.2).unwrap();
        }
        v.set_wait();
        assert_abs_diff_eq!(v.norm(), 179.068_226_348_227_4, epsilon = 1e-7);
    }

    #[test]
    fn dot_matches_closed_form() {
        let rt = runtime();
        let mut v: DistVec<i64, f64> = DistVec::allocated(rt, 100).unwrap();
        let mut w: DistVec<i64, f64> = DistVec::allocated(rt, 100).unwrap();
        for i in 0..100i64 {
            v.cell(i).assign(i as f64 / 3.2).unwrap();
            w.cell(i).assign(100.0 - i as f64 / 3.2).unwrap();
        }
        v.set_wait();
        w.set_wait();
        assert_abs_diff_eq!(v.dot(&w).unwrap(), 122_622.070_312_5, epsilon = 1e-3);
    }

    #[test]
    fn dot_is_idempotent() {
        let rt = runtime();
        let mut v: DistVec<i64, f64> = DistVec::allocated(rt, 32).unwrap();
        let mut w: DistVec<i64, f64> = DistVec::allocated(rt, 32).unwrap();
        v.set_all(1.5);
        w.set_all(2.5);
        let first = v.dot(&w).unwrap();
        let second = v.dot(&w).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn dot_rejects_mismatched_sizes() {
        let rt = runtime();
        let v: DistVec<i64, f64> = DistVec::allocated(rt, 10).unwrap();
        let w: DistVec<i64, f64> = DistVec::allocated(rt, 11).unwrap();
        assert!(matches!(v.dot(&w), Err(Error::DimensionMismatch(_))));
    }

    #[test]
    fn allocate_rejects_nonpositive_size() {
        assert!(matches!(
            DistVec::<i64, f64>::allocated(runtime(), 0),
            Err(Error::InvalidSize(0))
        ));
        assert!(matches!(
            DistVec::<i64, f64>::allocated(runtime(), -1),
            Err(Error::InvalidSize(-1))
        ));
    }

    #[test]
    fn allocate_twice_is_a_lifecycle_violation() {
        let rt = runtime();
        let mut v: DistVec<i64, f64> = DistVec::new(rt);
        v.allocate(10).unwrap();
        assert!(matches!(v.allocate(10), Err(Error::LifecycleViolation(_))));
    }

    #[test]
    fn read_range_matches_local_array() {
        let rt = runtime();
        let mut v: DistVec<i64, f64> = DistVec::allocated(rt, 20).unwrap();
        for i in 0..20i64 {
            v.cell(i).assign(i as f64).unwrap();
        }
        v.set_wait();

        let mut buf = vec![0.0f64; 5];
        v.read_range(3, 8, &mut buf).unwrap();
        assert_eq!(buf, vec![3.0, 4.0, 5.0, 6.0, 7.0]);
    }
}
