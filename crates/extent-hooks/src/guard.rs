//! Scoped reentrancy guard around custom hook calls
//!
//! Custom hooks may allocate, which can route back into the allocator.
//! While a guard is alive the thread context reports itself as reentrant,
//! so the bootstrap domain can detect and refuse recursive use. The guard
//! is released by `Drop`, so the count stays balanced on every exit path,
//! unwinding included.

use std::marker::PhantomData;

use crate::tsd::{Tsd, Tsdn};

/// RAII marker for "this thread is inside a custom extent hook".
#[must_use = "the guard is released as soon as it is dropped"]
#[derive(Debug)]
pub struct ReentrancyGuard<'a> {
    tsdn: Tsdn<'a>,
    // Exit must happen on the thread that entered.
    _not_send: PhantomData<*const ()>,
}

impl<'a> ReentrancyGuard<'a> {
    /// Enter the guard on `tsdn`, or on the calling thread's own context
    /// (established on the fly) when no context was supplied.
    #[inline]
    pub fn enter(tsdn: Tsdn<'a>) -> Self {
        match tsdn {
            Some(tsd) => tsd.pre_reentrancy_raw(),
            None => Tsd::with_current(Tsd::pre_reentrancy_raw),
        }
        Self {
            tsdn,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ReentrancyGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        match self.tsdn {
            Some(tsd) => tsd.post_reentrancy_raw(),
            None => Tsd::with_current(Tsd::post_reentrancy_raw),
        }
    }
}

/// Run `f` with a reentrancy guard held for its whole duration.
#[inline]
pub(crate) fn guarded<R>(tsdn: Tsdn<'_>, f: impl FnOnce() -> R) -> R {
    let _guard = ReentrancyGuard::enter(tsdn);
    tracing::trace!("Calling custom extent hook");
    f()
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn explicit_context_is_balanced() {
        let tsd = Tsd::new();
        {
            let _outer = ReentrancyGuard::enter(Some(&tsd));
            assert_eq!(tsd.reentrancy_level(), 1);
            {
                let _inner = ReentrancyGuard::enter(Some(&tsd));
                assert_eq!(tsd.reentrancy_level(), 2);
            }
            assert_eq!(tsd.reentrancy_level(), 1);
        }
        assert_eq!(tsd.reentrancy_level(), 0);
    }

    #[test]
    fn missing_context_uses_thread_context() {
        std::thread::spawn(|| {
            let level = guarded(None, || Tsd::with_current(Tsd::reentrancy_level));
            assert_eq!(level, 1);
            assert_eq!(Tsd::with_current(Tsd::reentrancy_level), 0);
            assert!(Tsd::with_current(Tsd::is_initialized));
        })
        .join()
        .unwrap();
    }

    #[test]
    fn released_when_unwinding() {
        let tsd = Tsd::new();
        let result = catch_unwind(AssertUnwindSafe(|| {
            guarded(Some(&tsd), || panic!("hook blew up"));
        }));
        assert!(result.is_err());
        assert_eq!(tsd.reentrancy_level(), 0);
        assert!(!tsd.is_reentrant());
    }

    #[test]
    fn returns_closure_value() {
        let tsd = Tsd::new();
        assert_eq!(guarded(Some(&tsd), || 42), 42);
    }
}
