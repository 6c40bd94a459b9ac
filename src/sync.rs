// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lock helpers that recover from poisoning instead of panicking.
//!
//! The registry catalog, the session binding and the in-memory transcript are
//! all guarded by std `RwLock`s that are never held across an `.await`. If a
//! thread panics while holding one, the data is still the last value written
//! by a completed critical section, so we log and keep serving it.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "modelhost::sync",
                event = "LOCK_POISONED_READ",
                "RwLock was poisoned during read acquisition; recovering last written value"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "modelhost::sync",
                event = "LOCK_POISONED_WRITE",
                "RwLock was poisoned during write acquisition; recovering last written value"
            );
            poisoned.into_inner()
        }
    }
}

/// Lock a mutex, recovering from poisoning if necessary.
#[inline]
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "modelhost::sync",
                event = "LOCK_POISONED_MUTEX",
                "Mutex was poisoned; recovering last written value"
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_read_and_write_normal() {
        let lock = RwLock::new(1);
        *write_lock(&lock) += 1;
        assert_eq!(*read_lock(&lock), 2);

        let mutex = Mutex::new(0);
        *super::lock(&mutex) += 5;
        assert_eq!(*super::lock(&mutex), 5);
    }

    #[test]
    fn test_recovers_from_poisoned_lock() {
        let lock = Arc::new(RwLock::new(vec![1, 2]));
        let lock_clone = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let _guard = lock_clone.write().unwrap();
            panic!("intentional panic to poison lock");
        });
        let _ = handle.join();

        assert!(lock.is_poisoned());
        write_lock(&lock).push(3);
        assert_eq!(*read_lock(&lock), vec![1, 2, 3]);
    }
}
