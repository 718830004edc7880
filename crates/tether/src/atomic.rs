use parking_lot::Mutex;

/// Mutually exclusive box around a value.
///
/// Every access runs under the same lock, so readers never observe a value in
/// the middle of a `modify`, and concurrent `modify` calls serialize.
#[derive(Debug, Default)]
pub struct Atomic<T> {
    value: Mutex<T>,
}

impl<T> Atomic<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
        }
    }

    /// Snapshot of the current value.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.value.lock().clone()
    }

    /// Runs `f` with exclusive access; the mutation is committed on return.
    pub fn modify<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.value.lock();
        f(&mut guard)
    }

    /// Read-only computation under the same exclusivity as [`Atomic::modify`].
    pub fn with_value<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.value.lock();
        f(&guard)
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn get_returns_initial_value() {
        let atomic = Atomic::new(1);
        assert_eq!(atomic.get(), 1);
    }

    #[test]
    fn modify_commits_before_returning() {
        let atomic = Atomic::new(1);
        let previous = atomic.modify(|value| std::mem::replace(value, 2));
        assert_eq!(previous, 1);
        assert_eq!(atomic.get(), 2);
    }

    #[test]
    fn with_value_does_not_mutate() {
        let atomic = Atomic::new(1);
        assert!(atomic.with_value(|value| *value == 1));
        assert_eq!(atomic.into_inner(), 1);
    }

    #[test_timeout::timeout(30)]
    fn concurrent_writers_and_readers_never_see_partial_updates() {
        const THREADS: usize = 100;
        const APPENDS: usize = 100;

        let atomic = Arc::new(Atomic::new(Vec::<usize>::new()));
        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let atomic = Arc::clone(&atomic);
                thread::spawn(move || {
                    if i % 2 == 0 {
                        atomic.modify(|items| {
                            let before = items.len();
                            for _ in 0..APPENDS {
                                items.push(i);
                            }
                            assert_eq!(items.len() - before, APPENDS);
                        });
                    } else {
                        atomic.with_value(|items| {
                            let before = items.len();
                            let mut spin = 0.0_f64;
                            for j in 1..APPENDS {
                                spin += 42.0 / j as f64;
                            }
                            assert!(spin > 0.0);
                            assert_eq!(items.len(), before);
                        });
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().expect("worker panicked");
        }
        assert_eq!(atomic.with_value(Vec::len), THREADS / 2 * APPENDS);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let counter = Arc::new(Atomic::new(0u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        counter.modify(|value| *value += 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker panicked");
        }
        assert_eq!(counter.get(), 8_000);
    }
}
