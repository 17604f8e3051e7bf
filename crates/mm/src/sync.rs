//! The non-blocking critical section used around bitmap and table mutation.

use core::ops::{Deref, DerefMut};

use crate::arch::InterruptGuard;

/// A spinlock that holds interrupts off for as long as it is held.
///
/// Critical sections guarded by this lock are short and bounded: they never sleep,
/// never wait on I/O, and never span a context switch. Because interrupts are off, an
/// interrupt handler on the same core can never spin on a lock its own core holds.
pub struct IrqSpinLock<T> {
    inner: spin::Mutex<T>,
}

/// Guard returned by [`IrqSpinLock::lock`].
pub struct IrqSpinLockGuard<'a, T> {
    // Fields drop in declaration order: release the lock, then restore interrupts.
    guard: spin::MutexGuard<'a, T>,
    _irq: InterruptGuard,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: spin::Mutex::new(value),
        }
    }

    /// Disables interrupts, then spins until the lock is acquired.
    #[inline]
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let irq = InterruptGuard::new();
        IrqSpinLockGuard {
            guard: self.inner.lock(),
            _irq: irq,
        }
    }

    /// Attempts to take the lock without spinning.
    #[inline]
    pub fn try_lock(&self) -> Option<IrqSpinLockGuard<'_, T>> {
        let irq = InterruptGuard::new();
        let guard = self.inner.try_lock()?;
        Some(IrqSpinLockGuard { guard, _irq: irq })
    }
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::emulation;

    #[test]
    fn holds_interrupts_off_while_locked() {
        emulation::reset();
        let lock = IrqSpinLock::new(5u32);
        {
            let mut guard = lock.lock();
            assert!(!emulation::interrupts_enabled());
            *guard += 1;
        }
        assert!(emulation::interrupts_enabled());
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn try_lock_fails_while_held_and_restores_interrupts() {
        emulation::reset();
        let lock = IrqSpinLock::new(());
        let held = lock.lock();
        assert!(lock.try_lock().is_none());
        // the failed attempt must not re-enable interrupts under the held lock
        assert!(!emulation::interrupts_enabled());
        drop(held);
        assert!(emulation::interrupts_enabled());
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn does_not_enable_interrupts_that_were_off() {
        emulation::reset();
        emulation::set_interrupts_enabled(false);
        let lock = IrqSpinLock::new(0u8);
        drop(lock.lock());
        assert!(!emulation::interrupts_enabled());
    }
}
