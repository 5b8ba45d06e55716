//! Default extent backend backed by OS page primitives
//!
//! Two layers live here:
//! - `*_impl` functions: the fast paths. The dispatcher calls them directly
//!   when the default table is installed, passing only what the primitive
//!   needs (no thread context, no table, no arena lookup).
//! - [`DEFAULT_EXTENT_HOOKS`]: the table form of the same backend, for
//!   callers that reach it through a table (e.g. a custom table that
//!   forwards some operations to the default backend). Its address is the
//!   identity the dispatcher compares against.
//!
//! Splitting is never supported by this backend, so the default table
//! leaves `split` empty and [`default_split_impl`] always fails.

use std::ptr::NonNull;

use crate::config;
use crate::pages;
use crate::table::ExtentHooks;

/// The process-wide default table.
///
/// Compared by address, never by contents: a copy of this table installed
/// elsewhere is dispatched as a custom table.
pub static DEFAULT_EXTENT_HOOKS: ExtentHooks = ExtentHooks {
    alloc: default_alloc,
    dalloc: Some(default_dalloc),
    destroy: Some(default_destroy),
    commit: Some(default_commit),
    decommit: Some(default_decommit),
    purge_lazy: Some(default_purge_lazy),
    purge_forced: Some(default_purge_forced),
    split: None,
    merge: Some(default_merge),
};

// ---------------------------------------------------------------------------
// Fast paths
// ---------------------------------------------------------------------------

/// Map a fresh extent.
///
/// Alignment is rounded up to the page size. When the pages come back
/// committed they are known to be zeroed, so `zero` is set.
///
/// # Safety
///
/// A `new_addr` hint must not overlap memory in use.
pub unsafe fn default_alloc_impl(
    new_addr: Option<NonNull<u8>>,
    size: usize,
    alignment: usize,
    zero: &mut bool,
    commit: &mut bool,
    arena_ind: u32,
) -> Option<NonNull<u8>> {
    // SAFETY: forwarded from this function's contract.
    match unsafe { pages::map(new_addr, size, alignment, *commit) } {
        Ok(addr) => {
            if *commit {
                *zero = true;
            }
            Some(addr)
        }
        Err(error) => {
            tracing::debug!(arena_ind, size, alignment, %error, "Default extent alloc failed");
            None
        }
    }
}

/// Unmap an extent, unless `retain` asks to keep the mapping.
///
/// A retained extent reports failure so the caller keeps it for reuse.
///
/// # Safety
///
/// `[addr, addr + size)` must be an extent returned by the default backend.
pub unsafe fn default_dalloc_impl(addr: NonNull<u8>, size: usize, retain: bool) -> bool {
    if retain {
        return true;
    }
    // SAFETY: forwarded.
    report("dalloc", size, unsafe { pages::unmap(addr, size) })
}

/// Unmap an extent regardless of the retain policy.
///
/// # Safety
///
/// `[addr, addr + size)` must be an extent returned by the default backend.
pub unsafe fn default_destroy_impl(addr: NonNull<u8>, size: usize) {
    // SAFETY: forwarded.
    let _ = report("destroy", size, unsafe { pages::unmap(addr, size) });
}

/// # Safety
///
/// `[addr + offset, addr + offset + length)` must lie inside an extent
/// returned by the default backend.
pub unsafe fn default_commit_impl(addr: NonNull<u8>, offset: usize, length: usize) -> bool {
    // SAFETY: forwarded.
    report("commit", length, unsafe { pages::commit(addr.add(offset), length) })
}

/// # Safety
///
/// Same as [`default_commit_impl`]; the range's contents are discarded.
pub unsafe fn default_decommit_impl(addr: NonNull<u8>, offset: usize, length: usize) -> bool {
    // SAFETY: forwarded.
    report("decommit", length, unsafe {
        pages::decommit(addr.add(offset), length)
    })
}

/// # Safety
///
/// Same as [`default_commit_impl`].
pub unsafe fn default_purge_lazy_impl(addr: NonNull<u8>, offset: usize, length: usize) -> bool {
    // SAFETY: forwarded.
    report("purge_lazy", length, unsafe {
        pages::purge_lazy(addr.add(offset), length)
    })
}

/// # Safety
///
/// Same as [`default_commit_impl`].
pub unsafe fn default_purge_forced_impl(addr: NonNull<u8>, offset: usize, length: usize) -> bool {
    // SAFETY: forwarded.
    report("purge_forced", length, unsafe {
        pages::purge_forced(addr.add(offset), length)
    })
}

/// Extents from the default backend cannot be split in place.
#[inline]
pub fn default_split_impl() -> bool {
    true
}

/// Merge succeeds wherever adjacent mappings coalesce.
#[inline]
pub fn default_merge_impl(addr_a: NonNull<u8>, addr_b: NonNull<u8>) -> bool {
    report("merge", 0, pages::coalesce(addr_a, addr_b))
}

#[inline]
fn report(operation: &'static str, size: usize, result: crate::Result<()>) -> bool {
    match result {
        Ok(()) => false,
        Err(error) => {
            tracing::debug!(operation, size, %error, "Default extent operation failed");
            true
        }
    }
}

// ---------------------------------------------------------------------------
// Table adapters
// ---------------------------------------------------------------------------

unsafe fn default_alloc(
    _hooks: &ExtentHooks,
    new_addr: Option<NonNull<u8>>,
    size: usize,
    alignment: usize,
    zero: &mut bool,
    commit: &mut bool,
    arena_ind: u32,
) -> Option<NonNull<u8>> {
    // SAFETY: forwarded.
    unsafe { default_alloc_impl(new_addr, size, alignment, zero, commit, arena_ind) }
}

unsafe fn default_dalloc(
    _hooks: &ExtentHooks,
    addr: NonNull<u8>,
    size: usize,
    _committed: bool,
    _arena_ind: u32,
) -> bool {
    // Reached through a table, there is no handle; use the process policy.
    // SAFETY: forwarded.
    unsafe { default_dalloc_impl(addr, size, config::global().retain) }
}

unsafe fn default_destroy(
    _hooks: &ExtentHooks,
    addr: NonNull<u8>,
    size: usize,
    _committed: bool,
    _arena_ind: u32,
) {
    // SAFETY: forwarded.
    unsafe { default_destroy_impl(addr, size) }
}

unsafe fn default_commit(
    _hooks: &ExtentHooks,
    addr: NonNull<u8>,
    _size: usize,
    offset: usize,
    length: usize,
    _arena_ind: u32,
) -> bool {
    // SAFETY: forwarded.
    unsafe { default_commit_impl(addr, offset, length) }
}

unsafe fn default_decommit(
    _hooks: &ExtentHooks,
    addr: NonNull<u8>,
    _size: usize,
    offset: usize,
    length: usize,
    _arena_ind: u32,
) -> bool {
    // SAFETY: forwarded.
    unsafe { default_decommit_impl(addr, offset, length) }
}

unsafe fn default_purge_lazy(
    _hooks: &ExtentHooks,
    addr: NonNull<u8>,
    _size: usize,
    offset: usize,
    length: usize,
    _arena_ind: u32,
) -> bool {
    // SAFETY: forwarded.
    unsafe { default_purge_lazy_impl(addr, offset, length) }
}

unsafe fn default_purge_forced(
    _hooks: &ExtentHooks,
    addr: NonNull<u8>,
    _size: usize,
    offset: usize,
    length: usize,
    _arena_ind: u32,
) -> bool {
    // SAFETY: forwarded.
    unsafe { default_purge_forced_impl(addr, offset, length) }
}

unsafe fn default_merge(
    _hooks: &ExtentHooks,
    addr_a: NonNull<u8>,
    _size_a: usize,
    addr_b: NonNull<u8>,
    _size_b: usize,
    _committed: bool,
    _arena_ind: u32,
) -> bool {
    default_merge_impl(addr_a, addr_b)
}
