//! Process-wide retain policy set through `init`.
//!
//! Lives in its own test binary: the global configuration can only be
//! fixed once per process.

use nebula_extent_hooks::pages::page_size;
use nebula_extent_hooks::prelude::*;

#[cfg(unix)]
#[test]
fn init_with_retain_keeps_default_mappings() {
    nebula_extent_hooks::init(ExtentHooksConfig::default().with_retain(true))
        .expect("first init");
    let again = nebula_extent_hooks::init(ExtentHooksConfig::default());
    assert!(matches!(
        again,
        Err(ExtentHooksError::AlreadyInitialized { .. })
    ));

    let ehooks = EHooks::default();
    assert!(ehooks.is_default());
    assert!(ehooks.retains_mappings());

    let size = 2 * page_size();
    let (mut zero, mut commit) = (false, true);
    unsafe {
        let addr = ehooks
            .alloc(None, None, size, page_size(), &mut zero, &mut commit, 0)
            .expect("default alloc");
        assert!(ehooks.dalloc(None, addr, size, true, 0));

        std::ptr::write_bytes(addr.as_ptr(), 0x77, size);
        assert_eq!(addr.as_ptr().add(size - 1).read(), 0x77);

        // Reached through the table, the adapter sees the same policy.
        let dalloc = DEFAULT_EXTENT_HOOKS.dalloc.expect("default dalloc slot");
        assert!(dalloc(&DEFAULT_EXTENT_HOOKS, addr, size, true, 0));

        ehooks.destroy(None, addr, size, true, 0);
    }
}
