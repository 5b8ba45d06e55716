//! Capability table: one optional function slot per extent operation
//!
//! Tables are plain data. Once a table is published through an
//! [`EHooks`](crate::EHooks) handle it is only ever read; replacing hooks
//! means publishing a different table, never editing one in place. Tables
//! are `'static` because the layer never knows when the last in-flight
//! dispatch against a replaced table has finished.
//!
//! Every hook receives the table it was called through as its first
//! argument, followed by the full uniform argument list of its operation.
//! Boolean results follow the allocator convention: `false` means success,
//! `true` means failure.
//!
//! ```
//! use std::ptr::NonNull;
//! use nebula_extent_hooks::ExtentHooks;
//!
//! unsafe fn alloc(
//!     _hooks: &ExtentHooks,
//!     _new_addr: Option<NonNull<u8>>,
//!     _size: usize,
//!     _alignment: usize,
//!     _zero: &mut bool,
//!     _commit: &mut bool,
//!     _arena_ind: u32,
//! ) -> Option<NonNull<u8>> {
//!     None
//! }
//!
//! static HOOKS: ExtentHooks = ExtentHooks::new(alloc);
//! assert!(HOOKS.dalloc.is_none());
//! ```

use std::ptr::NonNull;

/// Reserve an extent. Returns `None` when no memory is available.
///
/// `zero` and `commit` carry the requested state in and the achieved state
/// out.
pub type ExtentAllocHook = unsafe fn(
    hooks: &ExtentHooks,
    new_addr: Option<NonNull<u8>>,
    size: usize,
    alignment: usize,
    zero: &mut bool,
    commit: &mut bool,
    arena_ind: u32,
) -> Option<NonNull<u8>>;

/// Release an extent back to the backend.
pub type ExtentDallocHook = unsafe fn(
    hooks: &ExtentHooks,
    addr: NonNull<u8>,
    size: usize,
    committed: bool,
    arena_ind: u32,
) -> bool;

/// Tear an extent down unconditionally.
pub type ExtentDestroyHook =
    unsafe fn(hooks: &ExtentHooks, addr: NonNull<u8>, size: usize, committed: bool, arena_ind: u32);

/// Operate on `[addr + offset, addr + offset + length)` inside an extent of
/// `size` bytes. Shared by commit, decommit and both purges.
pub type ExtentRangeHook = unsafe fn(
    hooks: &ExtentHooks,
    addr: NonNull<u8>,
    size: usize,
    offset: usize,
    length: usize,
    arena_ind: u32,
) -> bool;

/// Divide an extent of `size` bytes into `size_a` and `size_b`.
pub type ExtentSplitHook = unsafe fn(
    hooks: &ExtentHooks,
    addr: NonNull<u8>,
    size: usize,
    size_a: usize,
    size_b: usize,
    committed: bool,
    arena_ind: u32,
) -> bool;

/// Combine two adjacent extents into one.
pub type ExtentMergeHook = unsafe fn(
    hooks: &ExtentHooks,
    addr_a: NonNull<u8>,
    size_a: usize,
    addr_b: NonNull<u8>,
    size_b: usize,
    committed: bool,
    arena_ind: u32,
) -> bool;

/// Table of extent lifecycle hooks.
///
/// `alloc` is mandatory; every other slot may be left empty, in which case
/// the dispatcher reports the operation as failed without calling out.
#[derive(Debug, Clone, Copy)]
pub struct ExtentHooks {
    /// Reserve a new extent
    pub alloc: ExtentAllocHook,
    /// Give an extent back; `true` asks the caller to retain it
    pub dalloc: Option<ExtentDallocHook>,
    /// Tear an extent down for good
    pub destroy: Option<ExtentDestroyHook>,
    /// Back a range with memory
    pub commit: Option<ExtentRangeHook>,
    /// Drop a range's backing
    pub decommit: Option<ExtentRangeHook>,
    /// Allow the OS to reclaim a range lazily
    pub purge_lazy: Option<ExtentRangeHook>,
    /// Reclaim a range now
    pub purge_forced: Option<ExtentRangeHook>,
    /// Divide an extent in place
    pub split: Option<ExtentSplitHook>,
    /// Combine adjacent extents
    pub merge: Option<ExtentMergeHook>,
}

impl ExtentHooks {
    /// A table with only `alloc` populated.
    pub const fn new(alloc: ExtentAllocHook) -> Self {
        Self {
            alloc,
            dalloc: None,
            destroy: None,
            commit: None,
            decommit: None,
            purge_lazy: None,
            purge_forced: None,
            split: None,
            merge: None,
        }
    }

    /// Populate the `dalloc` slot.
    pub const fn with_dalloc(mut self, hook: ExtentDallocHook) -> Self {
        self.dalloc = Some(hook);
        self
    }

    /// Populate the `destroy` slot.
    pub const fn with_destroy(mut self, hook: ExtentDestroyHook) -> Self {
        self.destroy = Some(hook);
        self
    }

    /// Populate the `commit` slot.
    pub const fn with_commit(mut self, hook: ExtentRangeHook) -> Self {
        self.commit = Some(hook);
        self
    }

    /// Populate the `decommit` slot.
    pub const fn with_decommit(mut self, hook: ExtentRangeHook) -> Self {
        self.decommit = Some(hook);
        self
    }

    /// Populate the `purge_lazy` slot.
    pub const fn with_purge_lazy(mut self, hook: ExtentRangeHook) -> Self {
        self.purge_lazy = Some(hook);
        self
    }

    /// Populate the `purge_forced` slot.
    pub const fn with_purge_forced(mut self, hook: ExtentRangeHook) -> Self {
        self.purge_forced = Some(hook);
        self
    }

    /// Populate the `split` slot.
    pub const fn with_split(mut self, hook: ExtentSplitHook) -> Self {
        self.split = Some(hook);
        self
    }

    /// Populate the `merge` slot.
    pub const fn with_merge(mut self, hook: ExtentMergeHook) -> Self {
        self.merge = Some(hook);
        self
    }

    /// Leak a copy of this table so it can be installed at runtime.
    ///
    /// Tables installed this way are never reclaimed.
    pub fn leak(self) -> &'static Self {
        Box::leak(Box::new(self))
    }
}
