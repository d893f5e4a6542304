//! Operating system primitives used by the host controller core
//!
//! The core never spawns threads. Callers block on a per-pipe semaphore while
//! the interrupt handler retires their transfer, and calling-context mutation
//! of live schedules runs inside [`Osal::critical_section`].

/// Wait forever in [`Semaphore::take`]
pub const WAIT_FOREVER: u32 = u32::MAX;

/// Counting semaphore
///
/// `give` must be callable from interrupt context.
pub trait Semaphore: Sync {
    /// Create a semaphore with count zero
    fn new() -> Self;

    /// Take one count, waiting up to `timeout_ms`
    ///
    /// Returns `false` on timeout. A timeout of 0 polls without blocking.
    fn take(&self, timeout_ms: u32) -> bool;

    /// Release one count
    fn give(&self);

    /// Drop any counts left behind by a stale completion
    fn drain(&self) {
        while self.take(0) {}
    }
}

/// Blocking mutual exclusion between calling threads
///
/// Never taken from interrupt context.
pub trait Mutex: Sync {
    /// Create an unlocked mutex
    fn new() -> Self;

    /// Block until the mutex is acquired
    fn lock(&self);

    /// Release a mutex acquired with [`Mutex::lock`]
    fn unlock(&self);
}

/// OS abstraction layer
pub trait Osal: 'static {
    /// Semaphore used to wake blocking transfer callers
    type Semaphore: Semaphore;

    /// Per-pipe exclusive access lock
    type Mutex: Mutex;

    /// Sleep the calling thread
    fn sleep_ms(ms: u32);

    /// Run `f` with the USB interrupt (and anything else that may touch the
    /// schedules) held off
    ///
    /// Must be re-entrant: a completion callback running in interrupt context
    /// may submit a new transfer, which enters a critical section again.
    fn critical_section<R>(f: impl FnOnce() -> R) -> R;
}

/// RAII guard over an [`Osal`] mutex
pub(crate) struct MutexGuard<'a, M: Mutex> {
    mutex: &'a M,
}

impl<'a, M: Mutex> MutexGuard<'a, M> {
    pub(crate) fn lock(mutex: &'a M) -> Self {
        mutex.lock();
        Self { mutex }
    }
}

impl<M: Mutex> Drop for MutexGuard<'_, M> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
