//! # slapgas - distributed sparse linear algebra for PGAS
//!
//! A distributed sparse-matrix/dense-vector kernel library for the
//! Partitioned Global Address Space model. Each rank in a parallel job owns
//! a contiguous band of rows of a sparse matrix and a matching band of a
//! dense vector; the central operation is `y <- A*x`, where `x` is read
//! through a mixture of local loads and one-sided remote loads.
//!
//! The library is built directly on MPI's one-sided RMA windows
//! ([`runtime::Runtime`]) rather than a task-based async runtime: the
//! concurrency model is single-threaded and cooperative per rank, and the
//! only suspension points are the explicit waits spec'd out in
//! [`proxy::RData`] and [`vector::DistVec`].
//!
//! Components, leaves first:
//! - [`partition`] - deterministic global-index -> rank partitioning
//! - [`proxy`] - single-cell one-sided remote handle (get/put/prefetch)
//! - [`vector`] - collectively allocated distributed dense vector
//! - [`matrix`] - row-partitioned sparse matrix, CSR assembly, SpMV strategies

pub mod config;
pub mod matrix;
pub mod numeric;
pub mod partition;
pub mod proxy;
pub mod runtime;
pub mod vector;

/// Install a `tracing` subscriber for library diagnostics. Not required -
/// callers may install their own subscriber instead - but convenient for a
/// benchmark driver that just wants `RUST_LOG`-controlled output. Unlike
/// the teacher's own `init()`, this has no async step: the whole crate is
/// deliberately synchronous (spec.md §5).
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();
}

pub use config::SpmvConfig;
pub use matrix::{CsrMat, CsrStrategy, RcMat};
pub use partition::Partitioner;
pub use proxy::RData;
pub use runtime::Runtime;
pub use vector::DistVec;

/// Errors raised by the kernel library (spec.md §7).
///
/// All variants are raised synchronously at the call site; there is no
/// retry path because every error class here is deterministic and
/// caller-caused. Collective-call mismatches between ranks are *not*
/// represented here - they manifest as deadlock, per spec.md §5.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A non-positive dimension was passed to a vector or matrix allocation.
    #[error("invalid size {0}: dimensions must be positive")]
    InvalidSize(i64),

    /// A lifecycle precondition was violated (double allocate, double
    /// setup, SpMV before setup, assigning through a read-only proxy, ...).
    #[error("lifecycle violation: {0}")]
    LifecycleViolation(&'static str),

    /// Operand shapes were incompatible with the matrix or with each other.
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// An index lay outside the valid range. Most bounds checks are
    /// debug-only (spec.md §7), enforced with `debug_assert!` at the call
    /// site; this variant is for the handful of paths that check in
    /// release builds too, such as `DistVec::read_range`.
    #[error("index out of range: {0}")]
    OutOfRange(String),

    /// Failure from the underlying MPI runtime.
    #[error("MPI error: {0}")]
    Mpi(String),

    /// Failure loading or parsing an [`SpmvConfig`].
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
