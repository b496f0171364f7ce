//! Thread-pool abstraction backing stage dispatch (SPEC_FULL §5, §4.9.4).
//!
//! The distilled spec treats the pool as an external contract ("the spec
//! assumes a work-stealing pool"); grounded on the teacher's
//! `ParallelExecutor` (rayon work-stealing, raw-pointer Send/Sync bypass for
//! cross-thread system dispatch), generalized into a small trait so
//! `executor.rs`'s atomic-countdown runner can dispatch onto either rayon's
//! global pool (`parallel` feature) or inline execution with the same code
//! path (§5 "the spec assumes a work-stealing pool whose contract is §5").

/// A job-dispatch target for the execution-graph runner. `execute` must not
/// block the caller — the runner's own synchronization (a condvar on a
/// `deps_remaining`-style counter) is what waits for completion.
pub trait JobPool: Send + Sync {
    fn execute(&self, job: Box<dyn FnOnce() + Send + 'static>);
}

/// Dispatches onto rayon's global work-stealing pool.
#[cfg(feature = "parallel")]
pub struct RayonPool;

#[cfg(feature = "parallel")]
impl JobPool for RayonPool {
    fn execute(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        rayon::spawn(job);
    }
}

/// Runs every job on the calling thread immediately. Used for `serial`
/// stages unconditionally, and as the fallback for `deterministic`/
/// `parallel` stages when the `parallel` feature is disabled (§5).
pub struct InlinePool;

impl JobPool for InlinePool {
    fn execute(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        job();
    }
}

/// The pool the world should dispatch onto for `deterministic`/`parallel`
/// stages, given the build's feature set.
#[cfg(feature = "parallel")]
pub fn default_pool() -> Box<dyn JobPool> {
    Box::new(RayonPool)
}

#[cfg(not(feature = "parallel"))]
pub fn default_pool() -> Box<dyn JobPool> {
    Box::new(InlinePool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn inline_pool_runs_synchronously() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = InlinePool;
        let c = counter.clone();
        pool.execute(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
