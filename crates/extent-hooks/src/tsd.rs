//! Per-thread context consumed by the dispatcher
//!
//! Only the pieces the hook layer needs: whether the thread has an
//! established context and how deep it currently is inside custom hooks.

use std::cell::Cell;

thread_local! {
    static TSD: Tsd = const { Tsd::new() };
}

/// Thread-context token passed to dispatcher operations.
///
/// `None` means the caller has no context at hand (early bootstrap); the
/// layer then fetches or establishes the calling thread's own context.
pub type Tsdn<'a> = Option<&'a Tsd>;

/// Lifecycle of a thread context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsdState {
    /// Never touched by the allocator
    Uninitialized,
    /// Established, not inside a custom hook
    Nominal,
    /// Inside at least one custom hook call
    Reentrant,
}

/// Thread context
///
/// Not `Sync`: a context belongs to exactly one thread.
#[derive(Debug)]
pub struct Tsd {
    state: Cell<TsdState>,
    reentrancy_level: Cell<u32>,
}

impl Tsd {
    /// Creates an uninitialized context.
    pub const fn new() -> Self {
        Self {
            state: Cell::new(TsdState::Uninitialized),
            reentrancy_level: Cell::new(0),
        }
    }

    /// Run `f` with the calling thread's context, establishing it first if
    /// this is the thread's first contact with the allocator.
    pub fn with_current<R>(f: impl FnOnce(&Self) -> R) -> R {
        TSD.with(|tsd| {
            tsd.establish();
            f(tsd)
        })
    }

    /// Current lifecycle state
    #[inline]
    pub fn state(&self) -> TsdState {
        self.state.get()
    }

    /// True once the context has been established.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.state.get() != TsdState::Uninitialized
    }

    /// Number of custom hook calls currently on this thread's stack.
    #[inline]
    pub fn reentrancy_level(&self) -> u32 {
        self.reentrancy_level.get()
    }

    /// True while the thread is servicing a custom hook.
    ///
    /// The bootstrap allocation domain checks this to refuse re-entry.
    #[inline]
    pub fn is_reentrant(&self) -> bool {
        self.reentrancy_level.get() > 0
    }

    fn establish(&self) {
        if self.state.get() == TsdState::Uninitialized {
            self.state.set(TsdState::Nominal);
            tracing::trace!("Established thread context");
        }
    }

    pub(crate) fn pre_reentrancy_raw(&self) {
        self.establish();
        let level = self.reentrancy_level.get() + 1;
        self.reentrancy_level.set(level);
        if level == 1 {
            self.state.set(TsdState::Reentrant);
        }
    }

    pub(crate) fn post_reentrancy_raw(&self) {
        let level = self.reentrancy_level.get();
        debug_assert!(level > 0, "reentrancy guard released more often than entered");
        let level = level.saturating_sub(1);
        self.reentrancy_level.set(level);
        if level == 0 {
            self.state.set(TsdState::Nominal);
        }
    }
}

impl Default for Tsd {
    fn default() -> Self {
        Self::new()
    }
}
