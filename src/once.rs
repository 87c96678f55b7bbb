//! One-shot, non-blocking initializer.
//!
//! Ported from nbdkit's `common/include/once.h`. This is deliberately
//! weaker than [`std::sync::Once`]: the only guarantee is that the body
//! runs at most once and that any caller which returns after another
//! caller ran the body will itself have run it or observed it already
//! ran. There is no blocking and no happens-before edge beyond the
//! counter itself — a caller that needs ordering of the body's side
//! effects must pair this with its own mutex, exactly as the C macro's
//! comment says.

use std::sync::atomic::{AtomicU32, Ordering};

/// A single process-lifetime "run this once" gate.
///
/// Construct with [`OnceFlag::new`] (usable in a `static`) and call
/// [`OnceFlag::call`] with the body to run.
pub struct OnceFlag {
    counter: AtomicU32,
}

impl OnceFlag {
    pub const fn new() -> Self {
        OnceFlag {
            counter: AtomicU32::new(0),
        }
    }

    /// Run `f` if and only if this is the first call to reach this point
    /// across any number of threads. The comparison against 0 before the
    /// increment mirrors the original macro and avoids treating a wrapped
    /// counter as "first".
    pub fn call<F: FnOnce()>(&self, f: F) {
        if self.counter.load(Ordering::SeqCst) == 0
            && self.counter.fetch_add(1, Ordering::SeqCst) == 0
        {
            f();
        }
    }

    /// True once some caller has run (or is running) the body.
    pub fn has_run(&self) -> bool {
        self.counter.load(Ordering::SeqCst) != 0
    }
}

impl Default for OnceFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn runs_exactly_once_across_threads() {
        let flag = Arc::new(OnceFlag::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let flag = Arc::clone(&flag);
                let runs = Arc::clone(&runs);
                thread::spawn(move || {
                    flag.call(|| {
                        runs.fetch_add(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(flag.has_run());
    }
}
