use std::{
    ops::{Deref, DerefMut},
    sync::Condvar,
    time::Duration,
};

#[cfg(feature = "lock_tracking")]
mod tracking {
    use super::*;
    use std::{collections::VecDeque, fmt::Debug, time::Instant};
    use tracing::warn;

    #[derive(Debug)]
    struct Inner<T> {
        last_lock_owner: VecDeque<(&'static str, Duration)>,
        value: T,
    }

    /// A Mutex which optionally allows to track the time a lock was held and
    /// emit warnings in case of excessive lock times
    pub(crate) struct Mutex<T> {
        inner: std::sync::Mutex<Inner<T>>,
    }

    impl<T: Debug> std::fmt::Debug for Mutex<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            std::fmt::Debug::fmt(&self.inner, f)
        }
    }

    impl<T> Mutex<T> {
        pub(crate) fn new(value: T) -> Self {
            Self {
                inner: std::sync::Mutex::new(Inner {
                    last_lock_owner: VecDeque::new(),
                    value,
                }),
            }
        }

        /// Acquires the lock for a certain purpose
        ///
        /// The purpose will be recorded in the list of last lock owners
        pub(crate) fn lock(&self, purpose: &'static str) -> MutexGuard<'_, T> {
            MutexGuard {
                mutex: self,
                guard: Some(self.acquire(purpose)),
                start_time: Instant::now(),
                purpose,
            }
        }

        fn acquire(&self, purpose: &'static str) -> std::sync::MutexGuard<'_, Inner<T>> {
            // Pure performance diagnostics, so the connection's time override is not consulted
            let now = Instant::now();
            let guard = self.inner.lock().unwrap();

            let elapsed = now.elapsed();
            if elapsed > Duration::from_millis(1) {
                warn!(
                    "Locking the connection for {} took {:?}. Last owners: {:?}",
                    purpose, elapsed, guard.last_lock_owner
                );
            }
            guard
        }
    }

    pub(crate) struct MutexGuard<'a, T> {
        mutex: &'a Mutex<T>,
        guard: Option<std::sync::MutexGuard<'a, Inner<T>>>,
        start_time: Instant,
        purpose: &'static str,
    }

    impl<'a, T> MutexGuard<'a, T> {
        /// Releases the lock while `f` runs, then reacquires it
        pub(crate) fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
            self.record_owner();
            drop(self.guard.take());
            let result = f();
            self.guard = Some(self.mutex.acquire(self.purpose));
            self.start_time = Instant::now();
            result
        }

        /// Blocks on `condvar` with the lock released, for at most `timeout` if one is given
        pub(crate) fn wait_timeout(&mut self, condvar: &Condvar, timeout: Option<Duration>) {
            self.record_owner();
            let guard = self.guard.take().expect("guard is held outside of waits");
            let guard = match timeout {
                Some(timeout) => condvar.wait_timeout(guard, timeout).unwrap().0,
                None => condvar.wait(guard).unwrap(),
            };
            self.guard = Some(guard);
            self.start_time = Instant::now();
        }

        fn record_owner(&mut self) {
            let duration = self.start_time.elapsed();
            if duration > Duration::from_millis(1) {
                warn!(
                    "Utilizing the connection for {} took {:?}",
                    self.purpose, duration
                );
            }

            if let Some(guard) = self.guard.as_mut() {
                if guard.last_lock_owner.len() == MAX_LOCK_OWNERS {
                    guard.last_lock_owner.pop_back();
                }
                guard.last_lock_owner.push_front((self.purpose, duration));
            }
        }
    }

    impl<T> Drop for MutexGuard<'_, T> {
        fn drop(&mut self) {
            self.record_owner();
        }
    }

    impl<T> Deref for MutexGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &Self::Target {
            &self.guard.as_ref().expect("guard is held outside of waits").value
        }
    }

    impl<T> DerefMut for MutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            &mut self.guard.as_mut().expect("guard is held outside of waits").value
        }
    }

    const MAX_LOCK_OWNERS: usize = 20;
}

#[cfg(feature = "lock_tracking")]
pub(crate) use tracking::{Mutex, MutexGuard};

#[cfg(not(feature = "lock_tracking"))]
mod non_tracking {
    use super::*;

    /// A Mutex which optionally allows to track the time a lock was held and
    /// emit warnings in case of excessive lock times
    #[derive(Debug)]
    pub(crate) struct Mutex<T> {
        inner: std::sync::Mutex<T>,
    }

    impl<T> Mutex<T> {
        pub(crate) fn new(value: T) -> Self {
            Self {
                inner: std::sync::Mutex::new(value),
            }
        }

        /// Acquires the lock for a certain purpose
        ///
        /// The purpose will be recorded in the list of last lock owners
        pub(crate) fn lock(&self, _purpose: &'static str) -> MutexGuard<'_, T> {
            MutexGuard {
                mutex: self,
                guard: Some(self.inner.lock().unwrap()),
            }
        }
    }

    pub(crate) struct MutexGuard<'a, T> {
        mutex: &'a Mutex<T>,
        guard: Option<std::sync::MutexGuard<'a, T>>,
    }

    impl<'a, T> MutexGuard<'a, T> {
        /// Releases the lock while `f` runs, then reacquires it
        pub(crate) fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
            drop(self.guard.take());
            let result = f();
            self.guard = Some(self.mutex.inner.lock().unwrap());
            result
        }

        /// Blocks on `condvar` with the lock released, for at most `timeout` if one is given
        pub(crate) fn wait_timeout(&mut self, condvar: &Condvar, timeout: Option<Duration>) {
            let guard = self.guard.take().expect("guard is held outside of waits");
            let guard = match timeout {
                Some(timeout) => condvar.wait_timeout(guard, timeout).unwrap().0,
                None => condvar.wait(guard).unwrap(),
            };
            self.guard = Some(guard);
        }
    }

    impl<T> Deref for MutexGuard<'_, T> {
        type Target = T;

        fn deref(&self) -> &Self::Target {
            self.guard.as_ref().expect("guard is held outside of waits")
        }
    }

    impl<T> DerefMut for MutexGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut Self::Target {
            self.guard.as_mut().expect("guard is held outside of waits")
        }
    }
}

#[cfg(not(feature = "lock_tracking"))]
pub(crate) use non_tracking::{Mutex, MutexGuard};
