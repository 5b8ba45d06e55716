//! Hook handle and dispatcher
//!
//! An [`EHooks`] owns one atomically published reference to a capability
//! table. Every operation loads that reference once (acquire) and then
//! takes one of three routes:
//!
//! 1. the reference *is* [`DEFAULT_EXTENT_HOOKS`]: call the default fast
//!    path directly, no guard, no indirect call;
//! 2. the table's slot is empty: return the operation's fixed fallback
//!    (`true`, i.e. failure; `destroy` does nothing);
//! 3. otherwise: call the slot under a [`ReentrancyGuard`].
//!
//! `install` publishes with release ordering. A dispatch racing with an
//! install runs against either the old or the new table, never a mix; the
//! old table must stay valid, which `&'static` guarantees.
//!
//! The lazy and forced purge operations are additionally gated by the
//! handle's [`PurgeCapabilities`]: a disabled capability fails the
//! operation before any table is consulted. Like the capabilities, the
//! retain policy of the default `dalloc` is fixed when the handle is built.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::config::{self, ExtentHooksConfig, PurgeCapabilities};
use crate::default::{
    DEFAULT_EXTENT_HOOKS, default_alloc_impl, default_commit_impl, default_dalloc_impl,
    default_decommit_impl, default_destroy_impl, default_merge_impl, default_purge_forced_impl,
    default_purge_lazy_impl, default_split_impl,
};
use crate::guard::guarded;
use crate::table::ExtentHooks;
use crate::tsd::Tsdn;

/// Which backend a handle currently dispatches to.
#[derive(Debug, Clone, Copy)]
pub enum Backend {
    /// The built-in OS-backed backend
    Default,
    /// A caller-supplied table
    Custom(&'static ExtentHooks),
}

impl Backend {
    #[inline]
    fn of(hooks: &'static ExtentHooks) -> Self {
        if ptr::eq(hooks, &DEFAULT_EXTENT_HOOKS) {
            Self::Default
        } else {
            Self::Custom(hooks)
        }
    }

    /// True for the built-in backend.
    #[inline]
    pub fn is_default(self) -> bool {
        matches!(self, Self::Default)
    }

    /// The table behind this backend.
    #[inline]
    pub fn table(self) -> &'static ExtentHooks {
        match self {
            Self::Default => &DEFAULT_EXTENT_HOOKS,
            Self::Custom(hooks) => hooks,
        }
    }
}

/// Per-arena handle on the active extent hooks.
///
/// # Safety contract of the dispatch methods
///
/// All dispatch methods are `unsafe`: they hand raw extent addresses to a
/// backend that maps, unmaps and reprotects memory. Callers must pass
/// extents that were obtained from [`alloc`](Self::alloc) on a handle using
/// the same backend, with matching sizes, and must not hold references into
/// ranges that the operation invalidates.
#[derive(Debug)]
pub struct EHooks {
    ptr: AtomicPtr<ExtentHooks>,
    purge: PurgeCapabilities,
    retain: bool,
}

impl EHooks {
    /// Create a handle publishing `hooks`, with the process-wide purge
    /// capabilities and retain policy.
    pub fn new(hooks: &'static ExtentHooks) -> Self {
        Self::with_config(hooks, config::global())
    }

    /// Create a handle with explicit purge capabilities and the
    /// process-wide retain policy.
    pub fn with_capabilities(hooks: &'static ExtentHooks, purge: PurgeCapabilities) -> Self {
        Self::build(hooks, purge, config::global().retain)
    }

    /// Create a handle from an explicit configuration instead of the
    /// process-wide one.
    pub fn with_config(hooks: &'static ExtentHooks, config: &ExtentHooksConfig) -> Self {
        Self::build(hooks, config.purge, config.retain)
    }

    fn build(hooks: &'static ExtentHooks, purge: PurgeCapabilities, retain: bool) -> Self {
        Self {
            ptr: AtomicPtr::new(table_ptr(hooks)),
            purge,
            retain,
        }
    }

    /// Re-initialize the handle. Exclusive access means no reader can
    /// observe the store, so no ordering is needed.
    pub fn init(&mut self, hooks: &'static ExtentHooks) {
        *self.ptr.get_mut() = table_ptr(hooks);
    }

    /// Publish a new table.
    ///
    /// The previous table may still be used by dispatches that loaded it
    /// before this call.
    #[inline]
    pub fn install(&self, hooks: &'static ExtentHooks) {
        tracing::debug!(default = ptr::eq(hooks, &DEFAULT_EXTENT_HOOKS), "Installing extent hooks");
        self.ptr.store(table_ptr(hooks), Ordering::Release);
    }

    /// Publish a new table and return the one it replaced, so the caller
    /// can decide when the old table may be retired.
    pub fn replace(&self, hooks: &'static ExtentHooks) -> &'static ExtentHooks {
        tracing::debug!(default = ptr::eq(hooks, &DEFAULT_EXTENT_HOOKS), "Replacing extent hooks");
        let old = self.ptr.swap(table_ptr(hooks), Ordering::AcqRel);
        // SAFETY: only `&'static ExtentHooks` are ever stored.
        unsafe { &*old }
    }

    /// The currently published table.
    #[inline]
    pub fn current(&self) -> &'static ExtentHooks {
        // SAFETY: only `&'static ExtentHooks` are ever stored, and tables
        // are never written through the pointer.
        unsafe { &*self.ptr.load(Ordering::Acquire) }
    }

    /// The currently published table, tagged by identity.
    #[inline]
    pub fn backend(&self) -> Backend {
        Backend::of(self.current())
    }

    /// True if the published table is the default table itself.
    #[inline]
    pub fn is_default(&self) -> bool {
        self.backend().is_default()
    }

    /// Purge capabilities fixed at construction.
    #[inline]
    pub fn purge_capabilities(&self) -> PurgeCapabilities {
        self.purge
    }

    /// True if the default `dalloc` keeps mappings instead of unmapping.
    #[inline]
    pub fn retains_mappings(&self) -> bool {
        self.retain
    }

    /// True if `split` is bound to fail, so the caller can skip preparing
    /// for it.
    #[inline]
    pub fn split_will_fail(&self) -> bool {
        self.current().split.is_none()
    }

    /// True if `merge` is bound to fail.
    #[inline]
    pub fn merge_will_fail(&self) -> bool {
        self.current().merge.is_none()
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Reserve an extent of `size` bytes aligned to `alignment`.
    ///
    /// `zero` and `commit` carry the requested state in and the achieved
    /// state out. Returns `None` when no memory is available.
    ///
    /// # Safety
    ///
    /// See the type-level contract; a `new_addr` hint must not overlap
    /// memory in use.
    #[inline]
    pub unsafe fn alloc(
        &self,
        tsdn: Tsdn<'_>,
        new_addr: Option<NonNull<u8>>,
        size: usize,
        alignment: usize,
        zero: &mut bool,
        commit: &mut bool,
        arena_ind: u32,
    ) -> Option<NonNull<u8>> {
        match self.backend() {
            Backend::Default => unsafe {
                default_alloc_impl(new_addr, size, alignment, zero, commit, arena_ind)
            },
            Backend::Custom(hooks) => guarded(tsdn, || unsafe {
                (hooks.alloc)(hooks, new_addr, size, alignment, zero, commit, arena_ind)
            }),
        }
    }

    /// Release an extent. `false` means the backend took it back; `true`
    /// means the caller must keep it.
    ///
    /// # Safety
    ///
    /// See the type-level contract.
    #[inline]
    pub unsafe fn dalloc(
        &self,
        tsdn: Tsdn<'_>,
        addr: NonNull<u8>,
        size: usize,
        committed: bool,
        arena_ind: u32,
    ) -> bool {
        match self.backend() {
            Backend::Default => unsafe { default_dalloc_impl(addr, size, self.retain) },
            Backend::Custom(hooks) => match hooks.dalloc {
                None => absent("dalloc", arena_ind),
                Some(dalloc) => {
                    guarded(tsdn, || unsafe { dalloc(hooks, addr, size, committed, arena_ind) })
                }
            },
        }
    }

    /// Tear an extent down. Best effort; an empty slot does nothing.
    ///
    /// # Safety
    ///
    /// See the type-level contract.
    #[inline]
    pub unsafe fn destroy(
        &self,
        tsdn: Tsdn<'_>,
        addr: NonNull<u8>,
        size: usize,
        committed: bool,
        arena_ind: u32,
    ) {
        match self.backend() {
            Backend::Default => unsafe { default_destroy_impl(addr, size) },
            Backend::Custom(hooks) => match hooks.destroy {
                None => {
                    absent("destroy", arena_ind);
                }
                Some(destroy) => {
                    guarded(tsdn, || unsafe { destroy(hooks, addr, size, committed, arena_ind) });
                }
            },
        }
    }

    /// Make `[addr + offset, addr + offset + length)` accessible.
    ///
    /// # Safety
    ///
    /// See the type-level contract.
    #[inline]
    pub unsafe fn commit(
        &self,
        tsdn: Tsdn<'_>,
        addr: NonNull<u8>,
        size: usize,
        offset: usize,
        length: usize,
        arena_ind: u32,
    ) -> bool {
        match self.backend() {
            Backend::Default => unsafe { default_commit_impl(addr, offset, length) },
            Backend::Custom(hooks) => match hooks.commit {
                None => absent("commit", arena_ind),
                Some(commit) => guarded(tsdn, || unsafe {
                    commit(hooks, addr, size, offset, length, arena_ind)
                }),
            },
        }
    }

    /// Release the physical backing of a range.
    ///
    /// # Safety
    ///
    /// See the type-level contract; the range's contents are lost.
    #[inline]
    pub unsafe fn decommit(
        &self,
        tsdn: Tsdn<'_>,
        addr: NonNull<u8>,
        size: usize,
        offset: usize,
        length: usize,
        arena_ind: u32,
    ) -> bool {
        match self.backend() {
            Backend::Default => unsafe { default_decommit_impl(addr, offset, length) },
            Backend::Custom(hooks) => match hooks.decommit {
                None => absent("decommit", arena_ind),
                Some(decommit) => guarded(tsdn, || unsafe {
                    decommit(hooks, addr, size, offset, length, arena_ind)
                }),
            },
        }
    }

    /// Hint that a range's contents may be discarded lazily.
    ///
    /// # Safety
    ///
    /// See the type-level contract; the range's contents may be lost.
    #[inline]
    pub unsafe fn purge_lazy(
        &self,
        tsdn: Tsdn<'_>,
        addr: NonNull<u8>,
        size: usize,
        offset: usize,
        length: usize,
        arena_ind: u32,
    ) -> bool {
        if !self.purge.lazy {
            tracing::trace!(arena_ind, "Lazy purge unavailable, skipping");
            return true;
        }
        match self.backend() {
            Backend::Default => unsafe { default_purge_lazy_impl(addr, offset, length) },
            Backend::Custom(hooks) => match hooks.purge_lazy {
                None => absent("purge_lazy", arena_ind),
                Some(purge) => guarded(tsdn, || unsafe {
                    purge(hooks, addr, size, offset, length, arena_ind)
                }),
            },
        }
    }

    /// Discard a range's contents immediately.
    ///
    /// # Safety
    ///
    /// See the type-level contract; the range's contents are lost.
    #[inline]
    pub unsafe fn purge_forced(
        &self,
        tsdn: Tsdn<'_>,
        addr: NonNull<u8>,
        size: usize,
        offset: usize,
        length: usize,
        arena_ind: u32,
    ) -> bool {
        if !self.purge.forced {
            tracing::trace!(arena_ind, "Forced purge unavailable, skipping");
            return true;
        }
        match self.backend() {
            Backend::Default => unsafe { default_purge_forced_impl(addr, offset, length) },
            Backend::Custom(hooks) => match hooks.purge_forced {
                None => absent("purge_forced", arena_ind),
                Some(purge) => guarded(tsdn, || unsafe {
                    purge(hooks, addr, size, offset, length, arena_ind)
                }),
            },
        }
    }

    /// Divide an extent into a leading `size_a` and trailing `size_b` part.
    ///
    /// # Safety
    ///
    /// See the type-level contract.
    #[inline]
    pub unsafe fn split(
        &self,
        tsdn: Tsdn<'_>,
        addr: NonNull<u8>,
        size: usize,
        size_a: usize,
        size_b: usize,
        committed: bool,
        arena_ind: u32,
    ) -> bool {
        match self.backend() {
            Backend::Default => default_split_impl(),
            Backend::Custom(hooks) => match hooks.split {
                None => absent("split", arena_ind),
                Some(split) => guarded(tsdn, || unsafe {
                    split(hooks, addr, size, size_a, size_b, committed, arena_ind)
                }),
            },
        }
    }

    /// Combine two adjacent extents.
    ///
    /// # Safety
    ///
    /// See the type-level contract.
    #[inline]
    pub unsafe fn merge(
        &self,
        tsdn: Tsdn<'_>,
        addr_a: NonNull<u8>,
        size_a: usize,
        addr_b: NonNull<u8>,
        size_b: usize,
        committed: bool,
        arena_ind: u32,
    ) -> bool {
        match self.backend() {
            Backend::Default => default_merge_impl(addr_a, addr_b),
            Backend::Custom(hooks) => match hooks.merge {
                None => absent("merge", arena_ind),
                Some(merge) => guarded(tsdn, || unsafe {
                    merge(hooks, addr_a, size_a, addr_b, size_b, committed, arena_ind)
                }),
            },
        }
    }
}

impl Default for EHooks {
    fn default() -> Self {
        Self::new(&DEFAULT_EXTENT_HOOKS)
    }
}

#[inline]
fn table_ptr(hooks: &'static ExtentHooks) -> *mut ExtentHooks {
    ptr::from_ref(hooks).cast_mut()
}

#[cold]
fn absent(operation: &'static str, arena_ind: u32) -> bool {
    tracing::trace!(operation, arena_ind, "Extent hook slot empty, reporting failure");
    true
}
