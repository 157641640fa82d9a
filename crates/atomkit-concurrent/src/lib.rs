//! Lock-free concurrency primitives built on a single CAS-updated reference cell
//!
//! - `atom`: `AtomicReference<T>`, the swappable reference cell everything else uses
//! - `boolean`: `AtomicBoolean` flag
//! - `latch`: `AtomicCountDownLatch` one-shot countdown barrier
//! - `persistent`: immutable list and FIFO queue, safe to swap whole
//! - `pool`: `AtomicThreadPool`, fixed workers over a combined queue+shutdown cell
//! - `spin`: spin-then-yield waiting

pub mod atom;
pub mod boolean;
pub mod latch;
pub mod persistent;
pub mod pool;
pub mod spin;

pub use atom::AtomicReference;
pub use boolean::AtomicBoolean;
pub use latch::AtomicCountDownLatch;
pub use persistent::{PersistentList, PersistentQueue};
pub use pool::{AtomicThreadPool, AtomicThreadPoolBuilder, IntoWorkResult};

pub use atomkit_core::{AtomicError, ErrorSink, Result, WorkFailure};
