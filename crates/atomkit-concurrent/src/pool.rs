//! Fixed-size worker pool whose queue and shutdown flag live together in a
//! single [`AtomicReference`].
//!
//! Keeping both in one cell is what makes `push` and `shutdown` race-free:
//! a push observes "not shut down" and enqueues in the same CAS, and a
//! worker observes "shut down and empty" and exits in the same CAS. There
//! is no lock anywhere; every wait is a spin with yielding.

use std::any::{type_name, Any};
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::fmt;
use std::ops::Shl;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread::{self, JoinHandle};

use atomkit_core::{AtomicError, ErrorSink, PoolSettings, Result, TracingErrorSink, WorkFailure};
use crossbeam_queue::SegQueue;
use crossbeam_utils::{Backoff, CachePadded};
use tracing::{debug, error, info, trace};

use crate::atom::AtomicReference;
use crate::persistent::PersistentQueue;
use crate::spin::spin_until;

const DEFAULT_THREAD_NAME_PREFIX: &str = "atomkit-worker";

struct JobError {
    kind: &'static str,
    error: anyhow::Error,
}

type Job = Arc<dyn Fn() -> std::result::Result<(), JobError> + Send + Sync>;

/// Holds a `FnOnce` work item until exactly one caller claims it, so it can
/// sit in the shared, cloneable queue state.
struct TakeOnce<F> {
    claimed: AtomicBool,
    slot: UnsafeCell<Option<F>>,
}

// Safety: only the caller that flips `claimed` from false ever touches `slot`.
unsafe impl<F: Send> Sync for TakeOnce<F> {}

impl<F> TakeOnce<F> {
    fn new(value: F) -> Self {
        Self {
            claimed: AtomicBool::new(false),
            slot: UnsafeCell::new(Some(value)),
        }
    }

    fn take(&self) -> Option<F> {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return None;
        }
        // SAFETY: we won `claimed`, so no other caller can reach the slot.
        unsafe { (*self.slot.get()).take() }
    }
}

thread_local! {
    static CAPTURE_PANIC_BACKTRACE: Cell<bool> = const { Cell::new(false) };
    static PANIC_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a panic hook that records a backtrace for panics on worker threads.
/// The previous hook still runs afterwards.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if CAPTURE_PANIC_BACKTRACE.try_with(Cell::get).unwrap_or(false) {
                let trace = Backtrace::force_capture().to_string();
                let _ = PANIC_BACKTRACE.try_with(|slot| *slot.borrow_mut() = Some(trace));
            }
            previous(info);
        }));
    });
}

/// Return types a work item may have. `()` always succeeds; an `Err` is
/// reported to the pool's [`ErrorSink`] just like a panic.
pub trait IntoWorkResult {
    #[doc(hidden)]
    fn into_work_result(self) -> std::result::Result<(), (&'static str, anyhow::Error)>;
}

impl IntoWorkResult for () {
    fn into_work_result(self) -> std::result::Result<(), (&'static str, anyhow::Error)> {
        Ok(())
    }
}

impl<E> IntoWorkResult for std::result::Result<(), E>
where
    E: Into<anyhow::Error>,
{
    fn into_work_result(self) -> std::result::Result<(), (&'static str, anyhow::Error)> {
        self.map_err(|e| (type_name::<E>(), e.into()))
    }
}

#[derive(Clone)]
struct PoolState {
    queue: PersistentQueue<Job>,
    shutdown: bool,
}

enum Next {
    Run(Job),
    Idle,
    Exit,
}

struct Shared {
    state: AtomicReference<PoolState>,
    started: CachePadded<AtomicUsize>,
    alive: CachePadded<AtomicUsize>,
    active: CachePadded<AtomicUsize>,
    sink: Arc<dyn ErrorSink>,
}

/// Decrements a counter when dropped, including on unwind.
struct CountGuard<'a>(&'a AtomicUsize);

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Shared {
    /// One state transition for a worker: take the head item, exit, or idle.
    fn next(&self) -> Next {
        // Idle workers only read, so they don't contend with producers.
        if self.state.peek(|s| s.queue.is_empty() && !s.shutdown) {
            return Next::Idle;
        }

        let mut taken = None;
        let mut exit = false;
        self.state.swap(|current| {
            taken = None;
            exit = false;
            match current.queue.pop_front() {
                Some((job, rest)) => {
                    taken = Some(job);
                    PoolState {
                        queue: rest,
                        shutdown: current.shutdown,
                    }
                }
                None => {
                    exit = current.shutdown;
                    current.clone()
                }
            }
        });

        match taken {
            Some(job) => Next::Run(job),
            None if exit => Next::Exit,
            None => Next::Idle,
        }
    }

    fn run(&self, thread_name: &str, job: &Job) {
        self.active.fetch_add(1, Ordering::SeqCst);
        let _active = CountGuard(&self.active);

        PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take());
        let failure = match panic::catch_unwind(AssertUnwindSafe(|| (**job)())) {
            Ok(Ok(())) => {
                trace!(thread = thread_name, "work item completed");
                return;
            }
            Ok(Err(JobError { kind, error })) => WorkFailure {
                thread: thread_name.to_string(),
                kind: kind.to_string(),
                message: format!("{:#}", error),
                backtrace: captured_backtrace(&error),
            },
            Err(payload) => WorkFailure {
                thread: thread_name.to_string(),
                kind: "panic".to_string(),
                message: panic_message(payload.as_ref()),
                backtrace: PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take()),
            },
        };

        if panic::catch_unwind(AssertUnwindSafe(|| self.sink.report(&failure))).is_err() {
            error!(thread = thread_name, "error sink panicked while reporting: {}", failure);
        }
    }
}

fn captured_backtrace(error: &anyhow::Error) -> Option<String> {
    let backtrace = error.backtrace();
    match backtrace.status() {
        std::backtrace::BacktraceStatus::Captured => Some(backtrace.to_string()),
        _ => None,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

fn worker_loop(shared: Arc<Shared>, thread_name: String) {
    shared.alive.fetch_add(1, Ordering::SeqCst);
    let _alive = CountGuard(&shared.alive);
    CAPTURE_PANIC_BACKTRACE.with(|capture| capture.set(true));
    shared.started.fetch_add(1, Ordering::SeqCst);
    debug!(thread = %thread_name, "worker started");

    let backoff = Backoff::new();
    loop {
        match shared.next() {
            Next::Run(job) => {
                backoff.reset();
                shared.run(&thread_name, &job);
            }
            Next::Idle => backoff.snooze(),
            Next::Exit => break,
        }
    }

    debug!(thread = %thread_name, "worker exiting");
}

/// Builder for [`AtomicThreadPool`].
pub struct AtomicThreadPoolBuilder {
    size: usize,
    name: Option<String>,
    thread_name_prefix: String,
    error_sink: Arc<dyn ErrorSink>,
}

impl AtomicThreadPoolBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Where failing work items are reported. Defaults to [`TracingErrorSink`].
    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = sink;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(AtomicError::InvalidArgument(
                "size must be a positive integer".into(),
            ));
        }
        if self.name.as_deref().map_or(false, |n| n.contains('\0')) {
            return Err(AtomicError::InvalidArgument(
                "name must not contain NUL bytes".into(),
            ));
        }
        if self.thread_name_prefix.is_empty() || self.thread_name_prefix.contains('\0') {
            return Err(AtomicError::InvalidArgument(
                "thread name prefix must be non-empty and free of NUL bytes".into(),
            ));
        }
        Ok(())
    }

    /// Spawn every worker and wait until all of them are polling.
    pub fn build(self) -> Result<AtomicThreadPool> {
        self.validate()?;
        install_panic_hook();

        let shared = Arc::new(Shared {
            state: AtomicReference::new(PoolState {
                queue: PersistentQueue::new(),
                shutdown: false,
            }),
            started: CachePadded::new(AtomicUsize::new(0)),
            alive: CachePadded::new(AtomicUsize::new(0)),
            active: CachePadded::new(AtomicUsize::new(0)),
            sink: self.error_sink,
        });

        let workers = SegQueue::new();
        for idx in 0..self.size {
            let thread_name = match &self.name {
                Some(name) => format!("{}-{}-{}", self.thread_name_prefix, idx, name),
                None => format!("{}-{}", self.thread_name_prefix, idx),
            };
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_loop(worker_shared, thread_name));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    error!(idx, "failed to spawn worker: {}", err);
                    shared.state.swap(|current| PoolState {
                        queue: current.queue.clone(),
                        shutdown: true,
                    });
                    while let Some(handle) = workers.pop() {
                        let _ = handle.join();
                    }
                    return Err(AtomicError::Spawn(err));
                }
            }
        }

        let size = self.size;
        spin_until(|| shared.started.load(Ordering::SeqCst) == size);
        info!(size, name = ?self.name, "atomic thread pool started");

        Ok(AtomicThreadPool {
            shared,
            workers,
            size,
            name: self.name,
        })
    }
}

/// Fixed-size, lock-free, fire-and-forget thread pool.
///
/// Work items are `FnOnce` closures run exactly once each, in FIFO order of
/// submission. A work item that panics or returns `Err` is reported to the
/// pool's [`ErrorSink`] and the worker carries on.
///
/// Dropping the pool shuts it down, draining the queue first.
pub struct AtomicThreadPool {
    shared: Arc<Shared>,
    workers: SegQueue<JoinHandle<()>>,
    size: usize,
    name: Option<String>,
}

impl AtomicThreadPool {
    pub fn builder(size: usize) -> AtomicThreadPoolBuilder {
        AtomicThreadPoolBuilder {
            size,
            name: None,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            error_sink: Arc::new(TracingErrorSink),
        }
    }

    pub fn new(size: usize, name: Option<&str>) -> Result<Self> {
        let builder = Self::builder(size);
        match name {
            Some(name) => builder.name(name).build(),
            None => builder.build(),
        }
    }

    pub fn from_settings(settings: &PoolSettings) -> Result<Self> {
        let mut builder =
            Self::builder(settings.size).thread_name_prefix(settings.thread_name_prefix.as_str());
        if let Some(name) = &settings.name {
            builder = builder.name(name.as_str());
        }
        builder.build()
    }

    /// Queue `work` at the tail.
    ///
    /// Fails with [`AtomicError::EnqueuedWorkAfterShutdown`] once
    /// [`shutdown`](Self::shutdown) has started; the rejected item never runs.
    pub fn push<F, R>(&self, work: F) -> Result<()>
    where
        F: FnOnce() -> R + Send + 'static,
        R: IntoWorkResult,
    {
        let work = TakeOnce::new(work);
        let job: Job = Arc::new(move || match work.take() {
            Some(work) => work()
                .into_work_result()
                .map_err(|(kind, error)| JobError { kind, error }),
            None => Ok(()),
        });

        let state = self.shared.state.swap(|current| {
            if current.shutdown {
                current.clone()
            } else {
                PoolState {
                    queue: current.queue.push_back(Arc::clone(&job)),
                    shutdown: false,
                }
            }
        });

        if state.shutdown {
            return Err(AtomicError::EnqueuedWorkAfterShutdown);
        }
        Ok(())
    }

    /// Worker threads still alive. Equals the configured size until shutdown.
    pub fn length(&self) -> usize {
        self.shared.alive.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.length()
    }

    pub fn queue_length(&self) -> usize {
        self.shared.state.peek(|s| s.queue.len())
    }

    pub fn queue_size(&self) -> usize {
        self.queue_length()
    }

    /// Workers currently running a work item.
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.state.peek(|s| s.shutdown)
    }

    /// Stop accepting work, wait for the queue to drain, then join every
    /// worker. Calling it again is an immediate no-op.
    pub fn shutdown(&self) {
        let mut already_shutdown = false;
        self.shared.state.swap(|current| {
            already_shutdown = current.shutdown;
            PoolState {
                queue: current.queue.clone(),
                shutdown: true,
            }
        });
        if already_shutdown {
            return;
        }

        info!(name = ?self.name, pending = self.queue_length(), "shutting down atomic thread pool");
        spin_until(|| self.shared.state.peek(|s| s.queue.is_empty()));

        // A worker that triggers shutdown (e.g. by dropping the last handle
        // to the pool) cannot join itself.
        let current = thread::current().id();
        while let Some(handle) = self.workers.pop() {
            if handle.thread().id() == current {
                continue;
            }
            let worker = handle.thread().name().unwrap_or("<unnamed>").to_string();
            if handle.join().is_err() {
                error!(thread = %worker, "worker thread panicked");
            }
        }
        info!(name = ?self.name, "atomic thread pool shut down");
    }
}

impl<F, R> Shl<F> for &AtomicThreadPool
where
    F: FnOnce() -> R + Send + 'static,
    R: IntoWorkResult,
{
    type Output = Result<()>;

    fn shl(self, work: F) -> Result<()> {
        self.push(work)
    }
}

impl Drop for AtomicThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for AtomicThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicThreadPool")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("length", &self.length())
            .field("queue_length", &self.queue_length())
            .field("active_count", &self.active_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn init() {
        let pool = AtomicThreadPool::new(2, None).unwrap();
        assert_eq!(pool.length(), 2);
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.queue_length(), 0);
        assert_eq!(pool.active_count(), 0);
        assert!(!pool.is_shutdown());
    }

    #[test]
    fn zero_size_is_rejected() {
        let err = AtomicThreadPool::new(0, None).unwrap_err();
        assert!(matches!(err, AtomicError::InvalidArgument(_)));
    }

    #[test]
    fn nul_in_name_is_rejected() {
        let err = AtomicThreadPool::new(1, Some("bad\0")).unwrap_err();
        assert!(matches!(err, AtomicError::InvalidArgument(_)));
    }

    #[test]
    fn runs_pushed_work() {
        let pool = AtomicThreadPool::new(2, None).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.push(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(pool.length(), 0);
        assert_eq!(pool.queue_length(), 0);
    }

    #[test]
    fn shl_operator_pushes() {
        let pool = AtomicThreadPool::new(1, None).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let job = {
            let ran = Arc::clone(&ran);
            move || ran.store(true, Ordering::SeqCst)
        };
        (&pool << job).unwrap();
        pool.shutdown();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn single_worker_preserves_fifo_order() {
        let pool = AtomicThreadPool::new(1, None).unwrap();
        let seen = Arc::new(AtomicReference::new(Vec::new()));
        for i in 0..100 {
            let seen = Arc::clone(&seen);
            pool.push(move || {
                seen.swap(|v| {
                    let mut next = v.clone();
                    next.push(i);
                    next
                });
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(*seen.value(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn active_count_tracks_running_items() {
        let pool = AtomicThreadPool::new(2, None).unwrap();
        let release = Arc::new(AtomicBool::new(false));
        for _ in 0..2 {
            let release = Arc::clone(&release);
            pool.push(move || {
                spin_until(|| release.load(Ordering::SeqCst));
            })
            .unwrap();
        }
        spin_until(|| pool.active_count() == 2);
        assert_eq!(pool.queue_length(), 0);
        release.store(true, Ordering::SeqCst);
        pool.shutdown();
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn failing_work_is_reported_and_worker_survives() {
        let failures = Arc::new(AtomicReference::new(Vec::<WorkFailure>::new()));
        let sink = {
            let failures = Arc::clone(&failures);
            move |failure: &WorkFailure| {
                let failure = failure.clone();
                failures.swap(|v| {
                    let mut next = v.clone();
                    next.push(failure.clone());
                    next
                });
            }
        };
        let pool = AtomicThreadPool::builder(1)
            .name("failing")
            .error_sink(Arc::new(sink))
            .build()
            .unwrap();

        pool.push::<_, ()>(|| panic!("oops")).unwrap();
        pool.push(|| -> anyhow::Result<()> { anyhow::bail!("bad input") })
            .unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        {
            let ran = Arc::clone(&ran);
            pool.push(move || ran.store(true, Ordering::SeqCst)).unwrap();
        }
        pool.shutdown();

        assert!(ran.load(Ordering::SeqCst));
        let failures = failures.value();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].kind, "panic");
        assert_eq!(failures[0].message, "oops");
        assert_eq!(failures[0].thread, "atomkit-worker-0-failing");
        assert!(failures[0].backtrace.is_some());
        assert_eq!(failures[1].kind, "anyhow::Error");
        assert_eq!(failures[1].message, "bad input");
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn accepts_work_that_consumes_its_captures() {
        let pool = AtomicThreadPool::new(2, None).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        for i in 0..3 {
            let payload = vec![i; 4];
            let tx = tx.clone();
            pool.push(move || tx.send(payload).unwrap()).unwrap();
        }
        drop(tx);
        pool.shutdown();

        let mut received: Vec<Vec<i32>> = rx.iter().collect();
        received.sort();
        assert_eq!(received, vec![vec![0; 4], vec![1; 4], vec![2; 4]]);
    }

    #[test]
    fn take_once_hands_out_the_value_a_single_time() {
        let slot = TakeOnce::new(String::from("job"));
        assert_eq!(slot.take().as_deref(), Some("job"));
        assert_eq!(slot.take(), None);
    }

    #[test]
    fn shutdown_waits_for_slow_work() {
        let pool = AtomicThreadPool::new(2, None).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let done = Arc::clone(&done);
            pool.push(move || {
                thread::sleep(Duration::from_millis(30));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert!(pool.queue_length() >= 3);
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(pool.queue_length(), 0);
        assert_eq!(pool.length(), 0);
    }

    #[test]
    fn drop_shuts_down() {
        let done = Arc::new(AtomicUsize::new(0));
        {
            let pool = AtomicThreadPool::new(2, Some("dropped")).unwrap();
            for _ in 0..4 {
                let done = Arc::clone(&done);
                pool.push(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn from_settings_uses_prefix_and_name() {
        let settings = PoolSettings {
            size: 1,
            name: Some("cfg".into()),
            thread_name_prefix: "custom".into(),
        };
        let pool = AtomicThreadPool::from_settings(&settings).unwrap();
        let name = Arc::new(AtomicReference::new(String::new()));
        {
            let name = Arc::clone(&name);
            pool.push(move || {
                let current = thread::current().name().unwrap_or_default().to_string();
                name.swap(|_| current.clone());
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(pool.name(), Some("cfg"));
        assert_eq!(*name.value(), "custom-0-cfg");
    }
}
