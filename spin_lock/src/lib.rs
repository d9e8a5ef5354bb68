//! Busy-waiting mutual exclusion for short critical sections.
//!
//! The hypervisor mutates shared structures (most importantly the extended
//! page table tree) from handlers that run at an elevated priority where
//! blocking is not an option. This lock never sleeps: contending processors
//! spin until the holder releases. Callers must keep critical sections short
//! and must not take the lock from code that can be preempted by a holder on
//! the same processor.

#![cfg_attr(not(test), no_std)]

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Error returned by [`SpinLock::try_lock`] when the lock is already held.
#[derive(Debug)]
pub enum TryLockError {
    /// The lock could not be acquired at this time because the operation
    /// would otherwise spin.
    WouldBlock,
}

/// A test-and-set spinlock protecting a value of type `T`.
///
/// The value is reachable only through the RAII guard returned by [`lock`]
/// and [`try_lock`], so it is accessed only while the lock is held.
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
pub struct SpinLock<T: ?Sized> {
    held: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock in an unlocked state ready for use.
    #[inline]
    pub const fn new(t: T) -> SpinLock<T> {
        SpinLock {
            held: AtomicBool::new(false),
            data: UnsafeCell::new(t),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the lock, spinning until it becomes available.
    ///
    /// Re-acquiring on the holding processor deadlocks.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        loop {
            match self.try_lock() {
                Ok(guard) => break guard,
                Err(TryLockError::WouldBlock) => {
                    // Read-only wait keeps the cache line shared between
                    // spinners until the holder writes it.
                    while self.held.load(Ordering::Relaxed) {
                        spin_loop();
                    }
                }
            }
        }
    }

    /// Attempts to acquire the lock without spinning.
    pub fn try_lock(&self) -> Result<SpinLockGuard<'_, T>, TryLockError> {
        if self
            .held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Ok(SpinLockGuard {
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            Err(TryLockError::WouldBlock)
        }
    }

    /// Consumes this spinlock, returning the underlying data.
    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.data.into_inner()
    }
}

impl<T: ?Sized + Default> Default for SpinLock<T> {
    fn default() -> SpinLock<T> {
        SpinLock::new(Default::default())
    }
}

/// RAII guard produced by [`SpinLock::lock`]; releases the lock on drop.
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    lock: &'a SpinLock<T>,
    // A raw-pointer marker keeps the guard from crossing threads.
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: ?Sized + Sync> Sync for SpinLockGuard<'_, T> {}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use crate::SpinLock;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };
    use std::thread::scope;

    #[test]
    pub fn smoke() {
        const LENGTH: usize = 1024;
        let lock = SpinLock::new(vec![]);
        let start = Arc::new(AtomicBool::new(true));

        scope(|s| {
            for i in 0..LENGTH {
                let d = &lock;
                let start = start.clone();
                s.spawn(move || {
                    while start.load(Ordering::SeqCst) {}
                    let mut d = d.lock();
                    d.push(i);
                });
            }
            start.store(false, Ordering::SeqCst);
        });

        lock.lock().sort();
        assert_eq!(lock.into_inner(), (0..LENGTH).collect::<Vec<_>>());
    }

    #[test]
    pub fn try_lock_contended() {
        let lock = SpinLock::new(7);
        let guard = lock.lock();
        assert!(lock.try_lock().is_err());
        drop(guard);
        assert_eq!(*lock.try_lock().unwrap(), 7);
    }
}
