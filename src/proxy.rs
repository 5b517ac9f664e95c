//! Single-cell remote proxy (spec.md §3 "RData", §4.2).
//!
//! `RData` is the only way callers name a remote cell without reaching
//! past the PGAS substrate directly (spec.md §4.2 rationale). It is
//! produced by [`crate::vector::DistVec::cell`] (the Rust name for the
//! source's `Vec::operator[]`, per spec.md §9 "proxy abstraction without
//! operator overloading") and is meant to be consumed within one logical
//! SpMV iteration - it borrows its parent vector and cannot outlive it.

use mpi::traits::Equivalence;

use crate::runtime::{PendingGet, RmaWindow};
use crate::vector::PutFuture;
use crate::Error;

/// A handle naming one remote (or local - the proxy doesn't special-case
/// ownership) cell of a [`crate::vector::DistVec`].
pub struct RData<'v, D: 'static> {
    window: &'v RmaWindow<D>,
    put_future: Option<&'v PutFuture<D>>,
    rank: u32,
    offset: usize,
    pending: Option<PendingGet<'v, D>>,
    fetched: bool,
}

impl<'v, D: Copy + Default + Equivalence> RData<'v, D> {
    pub(crate) fn new(
        window: &'v RmaWindow<D>,
        put_future: Option<&'v PutFuture<D>>,
        rank: u32,
        offset: usize,
    ) -> Self {
        Self {
            window,
            put_future,
            rank,
            offset,
            pending: None,
            fetched: false,
        }
    }

    /// Initiate an async remote get and record the in-flight request without
    /// blocking on it. Idempotent in the sense that calling this again
    /// before `get()` restarts the fetch - the last call wins, dropping
    /// whatever was in flight (spec.md §4.2). Dropping a stale in-flight
    /// request still releases its target-side lock - see
    /// [`crate::runtime::PendingGet`]'s `Drop` impl.
    pub fn prefetch(&mut self) {
        self.pending = Some(self.window.rget(self.rank, self.offset));
        self.fetched = true;
    }

    /// Return the value, starting a get now if `prefetch` wasn't already
    /// called. Blocks only long enough to drain whatever request is
    /// outstanding - if `prefetch` ran earlier, the wait here is for data
    /// that has plausibly already landed.
    pub fn get(&mut self) -> D {
        if !self.fetched {
            self.prefetch();
        }
        let pending = self.pending.take().expect("fetched implies pending is set");
        self.fetched = false;
        pending.wait()[0]
    }

    /// Issue an async remote put. The actual write is folded into the
    /// parent vector's [`PutFuture`] and is not guaranteed visible until
    /// [`crate::vector::DistVec::set_wait`] returns.
    pub fn assign(&mut self, value: D) -> crate::Result<()> {
        let put_future = self
            .put_future
            .ok_or(Error::LifecycleViolation("assign through a read-only proxy"))?;
        put_future.push(self.rank, self.offset, value);
        Ok(())
    }

    /// Rebind to a new address, clearing the fetched flag. Whatever request
    /// was in flight for the old address is dropped (and its lock released,
    /// see [`crate::runtime::PendingGet`]) without being waited on
    /// (spec.md §4.2 `update(new_addr)`).
    pub fn update(&mut self, rank: u32, offset: usize) {
        self.rank = rank;
        self.offset = offset;
        self.fetched = false;
        self.pending = None;
    }

    /// The `(rank, local-offset)` address this proxy names.
    pub fn address(&self) -> (u32, usize) {
        (self.rank, self.offset)
    }
}
