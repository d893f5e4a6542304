//! `std`-backed OS layer for host tests
//!
//! The critical section is a process-wide re-entrant lock; tests run the
//! interrupt handler inside it so it excludes calling-context schedule edits
//! the way masking the USB interrupt does on target.

use ehci_usbh::osal::{Mutex, Osal, Semaphore, WAIT_FOREVER};
use ehci_usbh::DmaCache;
use std::sync::{Condvar, Mutex as StdMutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

fn relock<T>(result: Result<T, PoisonError<T>>) -> T {
    result.unwrap_or_else(PoisonError::into_inner)
}

/// Counting semaphore on a condition variable
pub struct StdSemaphore {
    count: StdMutex<u32>,
    cond: Condvar,
}

impl Semaphore for StdSemaphore {
    fn new() -> Self {
        Self {
            count: StdMutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn take(&self, timeout_ms: u32) -> bool {
        let count = relock(self.count.lock());
        let mut count = if timeout_ms == WAIT_FOREVER {
            relock(self.cond.wait_while(count, |c| *c == 0))
        } else {
            let timeout = Duration::from_millis(timeout_ms.into());
            relock(self.cond.wait_timeout_while(count, timeout, |c| *c == 0)).0
        };
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    fn give(&self) {
        *relock(self.count.lock()) += 1;
        self.cond.notify_one();
    }
}

/// Binary lock with explicit lock/unlock
pub struct StdLock {
    held: StdMutex<bool>,
    cond: Condvar,
}

impl Mutex for StdLock {
    fn new() -> Self {
        Self {
            held: StdMutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) {
        let mut held = relock(self.cond.wait_while(relock(self.held.lock()), |h| *h));
        *held = true;
    }

    fn unlock(&self) {
        *relock(self.held.lock()) = false;
        self.cond.notify_one();
    }
}

struct CriticalSection {
    owner: StdMutex<Option<(ThreadId, usize)>>,
    cond: Condvar,
}

static CRITICAL: CriticalSection = CriticalSection {
    owner: StdMutex::new(None),
    cond: Condvar::new(),
};

struct CriticalGuard;

impl CriticalGuard {
    fn enter() -> Self {
        let me = thread::current().id();
        let owner = relock(CRITICAL.owner.lock());
        let mut owner: MutexGuard<'_, _> =
            relock(CRITICAL.cond.wait_while(owner, |o| matches!(o, Some((id, _)) if *id != me)));
        *owner = match *owner {
            Some((id, depth)) => Some((id, depth + 1)),
            None => Some((me, 1)),
        };
        Self
    }
}

impl Drop for CriticalGuard {
    fn drop(&mut self) {
        let mut owner = relock(CRITICAL.owner.lock());
        *owner = match *owner {
            Some((id, depth)) if depth > 1 => Some((id, depth - 1)),
            _ => None,
        };
        if owner.is_none() {
            CRITICAL.cond.notify_all();
        }
    }
}

/// Host OS layer; memory is coherent so cache maintenance is a no-op
pub struct StdOsal;

impl Osal for StdOsal {
    type Semaphore = StdSemaphore;
    type Mutex = StdLock;

    fn sleep_ms(ms: u32) {
        thread::sleep(Duration::from_millis(ms.into()));
    }

    fn critical_section<R>(f: impl FnOnce() -> R) -> R {
        let _guard = CriticalGuard::enter();
        f()
    }
}

impl DmaCache for StdOsal {}
