//! Process/rank handle and one-sided RMA primitives.
//!
//! Grounded on `mpi/mod.rs`'s `MpiUniverse` (itself wrapping
//! `mpi::initialize()` / `Universe` / `SystemCommunicator`), extended with
//! the one-sided get/put windows the distributed vector needs. The PGAS
//! runtime is process-wide: callers construct exactly one [`Runtime`] near
//! the top of `main`, pass `&Runtime` down into every [`crate::DistVec`] and
//! [`crate::CsrMat`], and let it drop at the very end (spec.md §9, "Global
//! state").
//!
//! This module intentionally does not use an async runtime. spec.md §5
//! describes a single-threaded, cooperative model where non-blocking RMA
//! requests are serviced by MPI's own progress engine and explicit `wait`
//! calls drive completion - that is exactly what a locked RMA epoch around
//! [`mpi::window::Window::get`]/`put` already gives us, so [`PendingGet`]
//! wraps it directly instead of going through `tokio`.

use mpi::collective::SystemOperation;
use mpi::environment::Universe;
use mpi::topology::SystemCommunicator;
use mpi::traits::*;
use mpi::window::WindowCreation;

/// Owns the MPI universe for the process and exposes the collectives the
/// kernel library is built on. One-sided RMA lives in [`RmaWindow`], which
/// is created per-vector rather than per-process.
pub struct Runtime {
    _universe: Universe,
    world: SystemCommunicator,
}

impl Runtime {
    /// Wrap an already-initialized MPI universe. Initializing MPI itself is
    /// the caller's job (spec.md §6: "Initialize the PGAS runtime" happens
    /// before any of this library's collectives are called).
    pub fn new(universe: Universe) -> Self {
        let world = universe.world();
        Self {
            _universe: universe,
            world,
        }
    }

    pub fn rank(&self) -> u32 {
        self.world.rank() as u32
    }

    pub fn size(&self) -> u32 {
        self.world.size() as u32
    }

    pub fn world(&self) -> &SystemCommunicator {
        &self.world
    }

    /// Collective barrier (spec.md §5: used by `set_wait`, destructors, and
    /// callers bracketing SpMV loops).
    pub fn barrier(&self) {
        self.world.barrier();
    }

    /// Broadcast a single value from `root` to every rank, used by
    /// `DistVec::allocate` to distribute per-rank slab handles.
    pub fn broadcast<T: Equivalence + Copy>(&self, value: &mut T, root: u32) {
        self.world.process_at_rank(root as i32).broadcast_into(value);
    }

    /// Sum-allreduce, used by `DistVec::norm` and `DistVec::dot`.
    pub fn allreduce_sum<T: Equivalence + Default>(&self, value: T) -> T {
        let mut result = T::default();
        self.world
            .all_reduce_into(&value, &mut result, SystemOperation::sum());
        result
    }
}

/// A local slab registered for one-sided RMA access by every rank.
///
/// One `RmaWindow` is created per [`crate::vector::DistVec`] instance, over
/// that vector's own local storage - the Rust analogue of
/// `upcxx::new_array` allocating straight out of the PGAS symmetric heap
/// (spec.md §3, "`Vec`"). Peers are addressed by `(rank, local offset)`
/// rather than a raw pointer, since that's exactly what an MPI one-sided
/// window already gives every rank for free.
pub struct RmaWindow<D: 'static> {
    window: mpi::window::Window<'static, D>,
}

impl<D: Equivalence> RmaWindow<D> {
    /// Register `local` (this rank's slab) into a collectively created
    /// window. Must be called by every rank, in the same order; `local`'s
    /// length may differ by at most one element across ranks (spec.md §3).
    ///
    /// # Safety
    /// `local` must outlive this `RmaWindow`. In practice this is only ever
    /// called from [`crate::vector::DistVec::allocate`], which declares its
    /// `window` field ahead of its `local` field so that Rust's
    /// in-declaration-order drop glue tears the window down (and with it,
    /// any peer's outstanding RMA against it) before the backing storage is
    /// freed.
    pub unsafe fn new(world: &SystemCommunicator, local: &mut [D]) -> Self {
        // Safety: erasing the borrow's lifetime to 'static is sound only
        // under the drop-order contract documented above.
        let local_static: &'static mut [D] = std::mem::transmute(local);
        let window = WindowCreation::create(world, local_static);
        Self { window }
    }

    /// Issue a non-blocking get of `count` contiguous elements starting at
    /// `(rank, offset)`. Completion is driven by [`PendingGet::wait`]
    /// (spec.md §4.2, `RData::prefetch`/`get`, and §4.3, `read_range`).
    pub fn rget_range(&self, rank: u32, offset: usize, count: usize) -> PendingGet<'_, D>
    where
        D: Copy + Default,
    {
        let mut out: Box<[D]> = vec![D::default(); count].into_boxed_slice();
        self.window.lock_shared(rank as i32);
        unsafe {
            self.window.get(&mut out[..], rank as i32, offset as mpi::Address);
        }
        PendingGet {
            out: Some(out),
            window: &self.window,
            rank,
        }
    }

    /// Single-element convenience wrapper around [`RmaWindow::rget_range`].
    pub fn rget(&self, rank: u32, offset: usize) -> PendingGet<'_, D>
    where
        D: Copy + Default,
    {
        self.rget_range(rank, offset, 1)
    }

    /// Issue a non-blocking put of `value` into `(rank, offset)` and block
    /// until it completes. Ordinary callers never call this directly - it's
    /// invoked from [`crate::vector::PutFuture::drain`], which is the only
    /// place that holds a live `&RmaWindow` alongside queued writes (see
    /// that type's doc comment for why puts are queued rather than issued
    /// eagerly from `RData::assign`).
    pub fn put_now(&self, rank: u32, offset: usize, value: D) {
        self.window.lock_exclusive(rank as i32);
        unsafe {
            self.window.put(&value, rank as i32, offset as mpi::Address);
        }
        self.window.unlock(rank as i32);
    }

    pub fn fence(&self) {
        self.window.fence();
    }
}

/// A one-sided get in flight. `wait()` blocks until the data has arrived
/// and releases the target-side lock.
///
/// `out` is `Some` until `wait()` runs; dropping a `PendingGet` without
/// calling `wait()` (e.g. `RData::prefetch`/`update` discarding a stale
/// request per spec.md §4.2's "idempotent... the last one wins") must still
/// release the lock `rget_range` took, so [`Drop`] unlocks whenever `out`
/// was never taken.
pub struct PendingGet<'a, D> {
    out: Option<Box<[D]>>,
    window: &'a mpi::window::Window<'static, D>,
    rank: u32,
}

impl<'a, D: Copy> PendingGet<'a, D> {
    pub fn wait(mut self) -> Box<[D]> {
        self.window.unlock(self.rank as i32);
        self.out.take().expect("wait() called exactly once")
    }
}

impl<'a, D> Drop for PendingGet<'a, D> {
    fn drop(&mut self) {
        if self.out.is_some() {
            self.window.unlock(self.rank as i32);
        }
    }
}
