//! OS page primitives used by the default extent backend
//!
//! Thin wrappers over the platform's virtual memory calls (`mmap`/`munmap`/
//! `madvise` on unix, `VirtualAlloc`/`VirtualFree` on Windows) that speak in
//! extents: page-aligned anonymous mappings which can be committed,
//! decommitted and purged in place.
//!
//! # Safety
//!
//! Every function that takes an address performs an unsafe FFI call on the
//! range `[addr, addr + size)`. Callers must ensure:
//! 1. **Alignment**: addresses and sizes are multiples of [`page_size`]
//! 2. **Ownership**: the range was returned by [`map`] and is not shared
//!    with live Rust references
//! 3. **Lifecycle**: a range is unmapped exactly once
//!
//! On Windows a mapping can only be released as a whole, so [`unmap`] must
//! be given the start of a range returned by [`map`]. Targets that are
//! neither unix nor Windows report [`ExtentHooksError::NotSupported`] from
//! every primitive.

use std::ptr::NonNull;
use std::sync::OnceLock;

use crate::error::{ExtentHooksError, Result};

/// Lazy purging (`MADV_FREE`, `MEM_RESET`) is available on this platform.
pub const PAGES_CAN_PURGE_LAZY: bool = cfg!(any(target_os = "linux", windows));

/// Forced purging (`MADV_DONTNEED`) is available on this platform.
pub const PAGES_CAN_PURGE_FORCED: bool = cfg!(unix);

/// Adjacent anonymous mappings can be treated as a single mapping.
///
/// Windows reservations stay separate regions, so merging is refused there.
pub const MAPS_COALESCE: bool = cfg!(unix);

const FALLBACK_PAGE_SIZE: usize = 4096;

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

/// Size of an OS page in bytes.
pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| {
        usize::try_from(os::page_size())
            .ok()
            .filter(|s| s.is_power_of_two())
            .unwrap_or(FALLBACK_PAGE_SIZE)
    })
}

/// True if `value` is a multiple of the power-of-two `alignment`.
#[inline]
fn is_aligned(value: usize, alignment: usize) -> bool {
    debug_assert!(alignment.is_power_of_two());
    value.is_multiple_of(alignment)
}

/// Map `size` bytes of fresh anonymous memory aligned to `alignment`.
///
/// With a placement hint the mapping is attempted at exactly that address
/// without clobbering existing mappings; if the OS picks another address
/// the mapping is released and the call fails. Without `commit` the pages
/// are reserved but inaccessible.
///
/// # Safety
///
/// A hinted address must not overlap memory the caller still uses.
pub unsafe fn map(
    new_addr: Option<NonNull<u8>>,
    size: usize,
    alignment: usize,
    commit: bool,
) -> Result<NonNull<u8>> {
    let page = page_size();
    if size == 0 || !is_aligned(size, page) {
        return Err(ExtentHooksError::invalid_layout(format!(
            "size {size} is not a non-zero multiple of the page size {page}"
        )));
    }
    if !alignment.is_power_of_two() {
        return Err(ExtentHooksError::invalid_layout(format!(
            "alignment {alignment} is not a power of two"
        )));
    }
    let alignment = alignment.max(page);

    if let Some(hint) = new_addr {
        if !is_aligned(hint.as_ptr().addr(), alignment) {
            return Err(ExtentHooksError::invalid_layout(format!(
                "placement hint {hint:p} is not aligned to {alignment}"
            )));
        }
        // SAFETY: caller guarantees the hinted range is not in use.
        return unsafe { os::map(hint.as_ptr(), size, commit) };
    }

    // SAFETY: a null hint lets the OS choose the placement.
    let ret = unsafe { os::map(std::ptr::null_mut(), size, commit)? };
    if is_aligned(ret.as_ptr().addr(), alignment) {
        return Ok(ret);
    }

    // Misaligned: release and retry with room for an aligned run.
    // SAFETY: `ret` was just mapped with `size` bytes.
    if let Err(error) = unsafe { os::unmap(ret.as_ptr(), size) } {
        tracing::debug!(%error, size, "Failed to release misaligned mapping");
    }
    let alloc_size = size
        .checked_add(alignment - page)
        .ok_or_else(|| ExtentHooksError::invalid_layout("aligned mapping size overflows"))?;
    // SAFETY: the OS chooses the placement.
    unsafe { os::map_aligned(alloc_size, size, alignment, commit) }
}

/// Cut the unaligned head and tail off the `alloc_size` bytes mapped at
/// `base`, keeping the aligned run of `size` bytes.
///
/// The run is valid even when releasing the excess fails; such failures
/// are logged and the excess stays mapped.
#[cfg(unix)]
fn trim_excess(
    base: NonNull<u8>,
    alloc_size: usize,
    size: usize,
    alignment: usize,
    mut release: impl FnMut(*mut u8, usize) -> Result<()>,
) -> NonNull<u8> {
    let addr = base.as_ptr().addr();
    let lead = addr.next_multiple_of(alignment) - addr;
    let trail = alloc_size - lead - size;
    let ret = NonNull::new(base.as_ptr().wrapping_add(lead)).unwrap_or(base);

    if lead != 0
        && let Err(error) = release(base.as_ptr(), lead)
    {
        tracing::debug!(%error, lead, "Failed to trim leading excess of aligned mapping");
    }
    if trail != 0
        && let Err(error) = release(ret.as_ptr().wrapping_add(size), trail)
    {
        tracing::debug!(%error, trail, "Failed to trim trailing excess of aligned mapping");
    }
    ret
}

/// Return a mapping to the OS.
///
/// # Safety
///
/// `[addr, addr + size)` must have been produced by [`map`] and must not be
/// accessed afterwards.
pub unsafe fn unmap(addr: NonNull<u8>, size: usize) -> Result<()> {
    // SAFETY: forwarded.
    unsafe { os::unmap(addr.as_ptr(), size) }
}

/// Make `[addr, addr + size)` readable and writable.
///
/// Pages that were decommitted come back zeroed.
///
/// # Safety
///
/// The range must lie inside a mapping produced by [`map`].
pub unsafe fn commit(addr: NonNull<u8>, size: usize) -> Result<()> {
    // SAFETY: forwarded.
    unsafe { os::commit(addr.as_ptr(), size) }
}

/// Release the physical backing of `[addr, addr + size)` and make it
/// inaccessible, keeping the address range reserved.
///
/// # Safety
///
/// The range must lie inside a mapping produced by [`map`] and its contents
/// are discarded.
pub unsafe fn decommit(addr: NonNull<u8>, size: usize) -> Result<()> {
    // SAFETY: forwarded.
    unsafe { os::decommit(addr.as_ptr(), size) }
}

/// Hint that the contents of `[addr, addr + size)` may be discarded lazily.
///
/// # Safety
///
/// The range must lie inside a committed mapping produced by [`map`].
pub unsafe fn purge_lazy(addr: NonNull<u8>, size: usize) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: forwarded.
        unsafe { os::advise(addr.as_ptr(), size, libc::MADV_FREE, "madvise(MADV_FREE)") }
    }
    #[cfg(windows)]
    {
        // SAFETY: forwarded.
        unsafe { os::reset(addr.as_ptr(), size) }
    }
    #[cfg(not(any(target_os = "linux", windows)))]
    {
        let _ = (addr, size);
        Err(ExtentHooksError::not_supported("lazy purge"))
    }
}

/// Discard the contents of `[addr, addr + size)` immediately.
///
/// # Safety
///
/// The range must lie inside a committed mapping produced by [`map`].
pub unsafe fn purge_forced(addr: NonNull<u8>, size: usize) -> Result<()> {
    #[cfg(unix)]
    {
        // SAFETY: forwarded.
        unsafe {
            os::advise(
                addr.as_ptr(),
                size,
                libc::MADV_DONTNEED,
                "madvise(MADV_DONTNEED)",
            )
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (addr, size);
        Err(ExtentHooksError::not_supported("forced purge"))
    }
}

/// Check that two mappings can be combined into one.
///
/// Anonymous mappings on unix coalesce without any system call, so this
/// only refuses on platforms where separate reservations stay separate.
pub fn coalesce(addr_a: NonNull<u8>, addr_b: NonNull<u8>) -> Result<()> {
    if !MAPS_COALESCE {
        return Err(ExtentHooksError::not_supported("mapping coalescing"));
    }
    if addr_a == addr_b {
        return Err(ExtentHooksError::invalid_layout(format!(
            "cannot merge extent {addr_a:p} with itself"
        )));
    }
    Ok(())
}

#[cfg(unix)]
mod os {
    use std::io;
    use std::ptr::NonNull;

    use crate::error::{ExtentHooksError, Result};

    const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    fn prot(commit: bool) -> libc::c_int {
        if commit {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_NONE
        }
    }

    pub(super) fn page_size() -> i64 {
        // SAFETY: sysconf has no preconditions.
        i64::from(unsafe { libc::sysconf(libc::_SC_PAGESIZE) })
    }

    pub(super) unsafe fn map(addr: *mut u8, size: usize, commit: bool) -> Result<NonNull<u8>> {
        // SAFETY: anonymous private mapping without MAP_FIXED never replaces
        // existing mappings; the OS validates the remaining arguments.
        let ret = unsafe { libc::mmap(addr.cast(), size, prot(commit), MAP_FLAGS, -1, 0) };
        if ret == libc::MAP_FAILED {
            return Err(ExtentHooksError::last_os_error("mmap"));
        }
        if !addr.is_null() && ret.cast::<u8>() != addr {
            // The hint was not honored; give the mapping back.
            // SAFETY: `ret` was just mapped with `size` bytes.
            if let Err(error) = unsafe { unmap(ret.cast(), size) } {
                tracing::debug!(%error, size, "Failed to release misplaced mapping");
            }
            return Err(ExtentHooksError::PageOperation {
                operation: "mmap",
                source: io::Error::from(io::ErrorKind::AddrInUse),
            });
        }
        NonNull::new(ret.cast()).ok_or_else(|| ExtentHooksError::PageOperation {
            operation: "mmap",
            source: io::Error::from(io::ErrorKind::AddrNotAvailable),
        })
    }

    /// Over-map `alloc_size` bytes and trim down to an aligned `size` run.
    pub(super) unsafe fn map_aligned(
        alloc_size: usize,
        size: usize,
        alignment: usize,
        commit: bool,
    ) -> Result<NonNull<u8>> {
        // SAFETY: OS chooses the placement.
        let pages = unsafe { map(std::ptr::null_mut(), alloc_size, commit)? };
        Ok(super::trim_excess(pages, alloc_size, size, alignment, |addr, len| {
            // SAFETY: the excess lies inside the mapping just created and
            // is disjoint from the run handed back.
            unsafe { unmap(addr, len) }
        }))
    }

    pub(super) unsafe fn unmap(addr: *mut u8, size: usize) -> Result<()> {
        // SAFETY: caller guarantees the range came from mmap.
        if unsafe { libc::munmap(addr.cast(), size) } == -1 {
            return Err(ExtentHooksError::last_os_error("munmap"));
        }
        Ok(())
    }

    pub(super) unsafe fn commit(addr: *mut u8, size: usize) -> Result<()> {
        // SAFETY: forwarded.
        unsafe { remap_fixed(addr, size, true) }
    }

    pub(super) unsafe fn decommit(addr: *mut u8, size: usize) -> Result<()> {
        // SAFETY: forwarded.
        unsafe { remap_fixed(addr, size, false) }
    }

    unsafe fn remap_fixed(addr: *mut u8, size: usize, commit: bool) -> Result<()> {
        // SAFETY: caller guarantees the range lies inside a mapping we own,
        // so MAP_FIXED only replaces our own pages.
        let ret = unsafe {
            libc::mmap(
                addr.cast(),
                size,
                prot(commit),
                MAP_FLAGS | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(ExtentHooksError::last_os_error(if commit {
                "mmap(commit)"
            } else {
                "mmap(decommit)"
            }));
        }
        if ret.cast::<u8>() != addr {
            return Err(ExtentHooksError::PageOperation {
                operation: "mmap(MAP_FIXED)",
                source: io::Error::from(io::ErrorKind::AddrNotAvailable),
            });
        }
        Ok(())
    }

    pub(super) unsafe fn advise(
        addr: *mut u8,
        size: usize,
        advice: libc::c_int,
        operation: &'static str,
    ) -> Result<()> {
        // SAFETY: advice only changes how the kernel backs our own range.
        if unsafe { libc::madvise(addr.cast(), size, advice) } == -1 {
            return Err(ExtentHooksError::last_os_error(operation));
        }
        Ok(())
    }
}

#[cfg(windows)]
mod os {
    use std::io;
    use std::ptr::{self, NonNull};

    use winapi::ctypes::c_void;
    use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
    use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
    use winapi::um::winnt::{
        MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, MEM_RESET, PAGE_READWRITE,
    };

    use crate::error::{ExtentHooksError, Result};

    /// Another thread can take the aligned address between the scout
    /// release and the placed reservation; retry a bounded number of times.
    const ALIGNED_ATTEMPTS: usize = 16;

    pub(super) fn page_size() -> i64 {
        // SAFETY: all-zero bytes are a valid SYSTEM_INFO, which
        // GetSystemInfo then fills in.
        let info = unsafe {
            let mut info: SYSTEM_INFO = std::mem::zeroed();
            GetSystemInfo(&mut info);
            info
        };
        i64::from(info.dwPageSize)
    }

    pub(super) unsafe fn map(addr: *mut u8, size: usize, commit: bool) -> Result<NonNull<u8>> {
        let alloc_type = if commit {
            MEM_RESERVE | MEM_COMMIT
        } else {
            MEM_RESERVE
        };
        // SAFETY: a reservation never replaces existing memory; the OS
        // validates the remaining arguments and returns null on error.
        let ret = unsafe { VirtualAlloc(addr.cast::<c_void>(), size, alloc_type, PAGE_READWRITE) };
        let Some(ret) = NonNull::new(ret.cast::<u8>()) else {
            return Err(ExtentHooksError::last_os_error("VirtualAlloc(MEM_RESERVE)"));
        };
        if !addr.is_null() && ret.as_ptr() != addr {
            // SAFETY: `ret` is the base of the reservation just created.
            if let Err(error) = unsafe { unmap(ret.as_ptr(), size) } {
                tracing::debug!(%error, size, "Failed to release misplaced reservation");
            }
            return Err(ExtentHooksError::PageOperation {
                operation: "VirtualAlloc(MEM_RESERVE)",
                source: io::Error::from(io::ErrorKind::AddrInUse),
            });
        }
        Ok(ret)
    }

    /// Reservations cannot be trimmed, so find an aligned address with an
    /// oversized scout reservation, release it and reserve again exactly there.
    pub(super) unsafe fn map_aligned(
        alloc_size: usize,
        size: usize,
        alignment: usize,
        commit: bool,
    ) -> Result<NonNull<u8>> {
        for _ in 0..ALIGNED_ATTEMPTS {
            // SAFETY: OS chooses the placement.
            let scout = unsafe { map(ptr::null_mut(), alloc_size, false)? };
            let base = scout.as_ptr().addr();
            let aligned = scout
                .as_ptr()
                .wrapping_add(base.next_multiple_of(alignment) - base);
            // SAFETY: `scout` is the base of the reservation just created.
            unsafe { unmap(scout.as_ptr(), alloc_size)? };

            // SAFETY: `aligned` lay inside our own released scout.
            match unsafe { map(aligned, size, commit) } {
                Ok(ret) => return Ok(ret),
                Err(error) => tracing::trace!(%error, "Aligned reservation raced, retrying"),
            }
        }
        Err(ExtentHooksError::PageOperation {
            operation: "VirtualAlloc(aligned)",
            source: io::Error::from(io::ErrorKind::AddrInUse),
        })
    }

    pub(super) unsafe fn unmap(addr: *mut u8, _size: usize) -> Result<()> {
        // SAFETY: caller guarantees `addr` is the base of a reservation;
        // MEM_RELEASE with size 0 releases all of it.
        if unsafe { VirtualFree(addr.cast::<c_void>(), 0, MEM_RELEASE) } == 0 {
            return Err(ExtentHooksError::last_os_error("VirtualFree(MEM_RELEASE)"));
        }
        Ok(())
    }

    pub(super) unsafe fn commit(addr: *mut u8, size: usize) -> Result<()> {
        // SAFETY: committing pages of our own reservation.
        let ret = unsafe { VirtualAlloc(addr.cast::<c_void>(), size, MEM_COMMIT, PAGE_READWRITE) };
        if ret.is_null() {
            return Err(ExtentHooksError::last_os_error("VirtualAlloc(MEM_COMMIT)"));
        }
        Ok(())
    }

    pub(super) unsafe fn decommit(addr: *mut u8, size: usize) -> Result<()> {
        // SAFETY: decommitting pages of our own reservation.
        if unsafe { VirtualFree(addr.cast::<c_void>(), size, MEM_DECOMMIT) } == 0 {
            return Err(ExtentHooksError::last_os_error("VirtualFree(MEM_DECOMMIT)"));
        }
        Ok(())
    }

    pub(super) unsafe fn reset(addr: *mut u8, size: usize) -> Result<()> {
        // SAFETY: MEM_RESET only marks our own committed pages discardable.
        let ret = unsafe { VirtualAlloc(addr.cast::<c_void>(), size, MEM_RESET, PAGE_READWRITE) };
        if ret.is_null() {
            return Err(ExtentHooksError::last_os_error("VirtualAlloc(MEM_RESET)"));
        }
        Ok(())
    }
}

#[cfg(not(any(unix, windows)))]
mod os {
    use std::ptr::NonNull;

    use crate::error::{ExtentHooksError, Result};

    pub(super) fn page_size() -> i64 {
        0
    }

    pub(super) unsafe fn map(_addr: *mut u8, _size: usize, _commit: bool) -> Result<NonNull<u8>> {
        Err(ExtentHooksError::not_supported("anonymous mappings"))
    }

    pub(super) unsafe fn map_aligned(
        _alloc_size: usize,
        _size: usize,
        _alignment: usize,
        _commit: bool,
    ) -> Result<NonNull<u8>> {
        Err(ExtentHooksError::not_supported("anonymous mappings"))
    }

    pub(super) unsafe fn unmap(_addr: *mut u8, _size: usize) -> Result<()> {
        Err(ExtentHooksError::not_supported("anonymous mappings"))
    }

    pub(super) unsafe fn commit(_addr: *mut u8, _size: usize) -> Result<()> {
        Err(ExtentHooksError::not_supported("commit"))
    }

    pub(super) unsafe fn decommit(_addr: *mut u8, _size: usize) -> Result<()> {
        Err(ExtentHooksError::not_supported("decommit"))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert!(page_size() >= 4096);
    }

    #[test]
    fn rejects_unaligned_size() {
        let err = unsafe { map(None, page_size() + 1, page_size(), true) }.unwrap_err();
        assert_eq!(err.code(), "EHOOKS:PAGES:LAYOUT");
        let err = unsafe { map(None, 0, page_size(), true) }.unwrap_err();
        assert_eq!(err.code(), "EHOOKS:PAGES:LAYOUT");
    }

    #[test]
    fn rejects_non_power_of_two_alignment() {
        let err = unsafe { map(None, page_size(), 3 * page_size(), true) }.unwrap_err();
        assert_eq!(err.code(), "EHOOKS:PAGES:LAYOUT");
    }

    #[test]
    fn map_honors_large_alignment() {
        let size = 4 * page_size();
        let alignment = 64 * page_size();
        unsafe {
            let addr = map(None, size, alignment, true).unwrap();
            assert!(is_aligned(addr.as_ptr().addr(), alignment));
            std::ptr::write_bytes(addr.as_ptr(), 0x5A, size);
            assert_eq!(*addr.as_ptr().add(size - 1), 0x5A);
            unmap(addr, size).unwrap();
        }
    }

    #[test]
    fn commit_cycle_zeroes_pages() {
        let size = 2 * page_size();
        unsafe {
            let addr = map(None, size, page_size(), true).unwrap();
            std::ptr::write_bytes(addr.as_ptr(), 0xFF, size);

            decommit(addr, size).unwrap();
            commit(addr, size).unwrap();
            assert_eq!(*addr.as_ptr(), 0);

            unmap(addr, size).unwrap();
        }
    }

    #[test]
    fn forced_purge_discards_contents() {
        let size = page_size();
        unsafe {
            let addr = map(None, size, page_size(), true).unwrap();
            *addr.as_ptr() = 7;
            purge_forced(addr, size).unwrap();
            #[cfg(target_os = "linux")]
            assert_eq!(*addr.as_ptr(), 0);
            unmap(addr, size).unwrap();
        }
    }

    #[test]
    fn hinted_map_lands_at_hint_or_fails() {
        let size = page_size();
        unsafe {
            let scout = map(None, size, page_size(), true).unwrap();
            unmap(scout, size).unwrap();

            match map(Some(scout), size, page_size(), true) {
                Ok(addr) => {
                    assert_eq!(addr, scout);
                    unmap(addr, size).unwrap();
                }
                Err(err) => assert!(err.is_os_failure()),
            }
        }
    }

    #[test]
    fn coalesce_refuses_self_merge() {
        let a = NonNull::<u8>::dangling();
        assert!(coalesce(a, a).is_err());
    }

    #[test]
    fn trim_excess_releases_lead_and_trail() {
        let page = page_size();
        let (size, alignment) = (4 * page, 16 * page);
        let alloc_size = size + alignment - page;
        let base = NonNull::new(std::ptr::without_provenance_mut::<u8>(3 * alignment + 5 * page))
            .unwrap();

        let mut released = Vec::new();
        let ret = trim_excess(base, alloc_size, size, alignment, |addr, len| {
            released.push((addr.addr(), len));
            Ok(())
        });

        assert!(is_aligned(ret.as_ptr().addr(), alignment));
        assert_eq!(ret.as_ptr().addr(), 4 * alignment);
        assert_eq!(
            released,
            [(base.as_ptr().addr(), 11 * page), (4 * alignment + size, 4 * page)]
        );
    }

    #[test]
    fn trim_excess_keeps_run_when_release_fails() {
        let page = page_size();
        let (size, alignment) = (page, 8 * page);
        let alloc_size = size + alignment - page;
        let base = NonNull::new(std::ptr::without_provenance_mut::<u8>(alignment + page)).unwrap();

        let mut attempts = 0;
        let ret = trim_excess(base, alloc_size, size, alignment, |_, _| {
            attempts += 1;
            Err(ExtentHooksError::not_supported("munmap"))
        });

        assert_eq!(ret.as_ptr().addr(), 2 * alignment);
        assert_eq!(attempts, 1);
    }

    #[test]
    fn trim_excess_skips_aligned_base() {
        let page = page_size();
        let (size, alignment) = (2 * page, 4 * page);
        let alloc_size = size + alignment - page;
        let base = NonNull::new(std::ptr::without_provenance_mut::<u8>(alignment)).unwrap();

        let mut released = Vec::new();
        let ret = trim_excess(base, alloc_size, size, alignment, |addr, len| {
            released.push((addr.addr(), len));
            Ok(())
        });

        assert_eq!(ret, base);
        assert_eq!(released, [(alignment + size, 3 * page)]);
    }
}
