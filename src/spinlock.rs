//! Compare-and-exchange spinlock with optional interrupt masking.
//!
//! [`Spinlock::lock`] only provides exclusion between execution paths that
//! spin. [`Spinlock::lock_irq`] additionally masks interrupts for as long as
//! the guard lives, so an IRQ handler can never preempt the holder on the
//! same core and spin on a lock that cannot be released.
//!
//! The lock is not reentrant. Taking it twice on the same path spins
//! forever; callers must avoid that by convention.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::hal::InterruptMask;

pub struct Spinlock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `locked`.
unsafe impl<T: Send> Sync for Spinlock<T> {}
unsafe impl<T: Send> Send for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub const fn new(data: T) -> Self {
        Spinlock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        SpinlockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinlockGuard { lock: self })
    }

    /// Masks interrupts, then acquires. The previous interrupt state comes
    /// back when the guard is dropped.
    pub fn lock_irq<'a, M: InterruptMask>(&'a self, mask: &'a M) -> IrqSpinlockGuard<'a, T, M> {
        let were_enabled = mask.interrupts_enabled();
        mask.disable_interrupts();
        IrqSpinlockGuard {
            guard: Some(self.lock()),
            mask,
            were_enabled,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: we hold the lock
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: we hold the lock
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

pub struct IrqSpinlockGuard<'a, T, M: InterruptMask> {
    guard: Option<SpinlockGuard<'a, T>>,
    mask: &'a M,
    were_enabled: bool,
}

impl<T, M: InterruptMask> Deref for IrqSpinlockGuard<'_, T, M> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `None` during drop
        self.guard.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl<T, M: InterruptMask> DerefMut for IrqSpinlockGuard<'_, T, M> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_deref_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T, M: InterruptMask> Drop for IrqSpinlockGuard<'_, T, M> {
    fn drop(&mut self) {
        // Release before unmasking, or a pending IRQ could find it held.
        drop(self.guard.take());
        if self.were_enabled {
            self.mask.enable_interrupts();
        }
    }
}
