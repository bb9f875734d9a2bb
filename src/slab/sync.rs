//! The two locks every slab carries: a reader/writer lock over its structural
//! bookkeeping and a mutex over its mapping state.
//!
//! Both are thin wrappers that pick their implementation at compile time:
//! `parking_lot`'s locks with the `parking_lot` cargo feature, the standard
//! library's otherwise. Either way, locking is infallible from the caller's
//! point of view.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(feature = "parking_lot")] {
        pub(crate) type ReadGuard<'a, T> = parking_lot::RwLockReadGuard<'a, T>;
        pub(crate) type WriteGuard<'a, T> = parking_lot::RwLockWriteGuard<'a, T>;
        pub(crate) type MutexGuard<'a, T> = parking_lot::MutexGuard<'a, T>;

        /// A reader/writer lock.
        #[derive(Debug, Default)]
        pub(crate) struct RwLock<T>(parking_lot::RwLock<T>);

        impl<T> RwLock<T> {
            pub(crate) fn new(value: T) -> Self {
                RwLock(parking_lot::RwLock::new(value))
            }

            #[inline]
            pub(crate) fn read(&self) -> ReadGuard<'_, T> {
                self.0.read()
            }

            #[inline]
            pub(crate) fn write(&self) -> WriteGuard<'_, T> {
                self.0.write()
            }
        }

        /// A mutual exclusion lock.
        #[derive(Debug, Default)]
        pub(crate) struct Mutex<T>(parking_lot::Mutex<T>);

        impl<T> Mutex<T> {
            pub(crate) fn new(value: T) -> Self {
                Mutex(parking_lot::Mutex::new(value))
            }

            #[inline]
            pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
                self.0.lock()
            }

            pub(crate) fn into_inner(self) -> T {
                self.0.into_inner()
            }
        }
    } else {
        use std::sync::PoisonError;

        pub(crate) type ReadGuard<'a, T> = std::sync::RwLockReadGuard<'a, T>;
        pub(crate) type WriteGuard<'a, T> = std::sync::RwLockWriteGuard<'a, T>;
        pub(crate) type MutexGuard<'a, T> = std::sync::MutexGuard<'a, T>;

        // Poisoning is ignored. A thread only panics while holding one of these
        // locks when an internal invariant check fails, and at that point the
        // allocator is already unusable.

        /// A reader/writer lock.
        #[derive(Debug, Default)]
        pub(crate) struct RwLock<T>(std::sync::RwLock<T>);

        impl<T> RwLock<T> {
            pub(crate) fn new(value: T) -> Self {
                RwLock(std::sync::RwLock::new(value))
            }

            #[inline]
            pub(crate) fn read(&self) -> ReadGuard<'_, T> {
                self.0.read().unwrap_or_else(PoisonError::into_inner)
            }

            #[inline]
            pub(crate) fn write(&self) -> WriteGuard<'_, T> {
                self.0.write().unwrap_or_else(PoisonError::into_inner)
            }
        }

        /// A mutual exclusion lock.
        #[derive(Debug, Default)]
        pub(crate) struct Mutex<T>(std::sync::Mutex<T>);

        impl<T> Mutex<T> {
            pub(crate) fn new(value: T) -> Self {
                Mutex(std::sync::Mutex::new(value))
            }

            #[inline]
            pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
                self.0.lock().unwrap_or_else(PoisonError::into_inner)
            }

            pub(crate) fn into_inner(self) -> T {
                self.0.into_inner().unwrap_or_else(PoisonError::into_inner)
            }
        }
    }
}
