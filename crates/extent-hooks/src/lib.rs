//! # nebula-extent-hooks
//!
//! Indirection layer between the Nebula extent manager and the backends
//! that actually reserve, release and reshape page-granular address
//! ranges ("extents").
//!
//! Every arena owns an [`EHooks`] handle. The handle publishes a
//! [`ExtentHooks`] capability table and dispatches each extent operation:
//! - straight to the built-in OS backend when the published table is
//!   [`DEFAULT_EXTENT_HOOKS`] itself,
//! - to a fixed failure result when a custom table leaves the slot empty,
//! - to the custom hook otherwise, inside a [`ReentrancyGuard`] so that
//!   allocation performed by the hook is detected as re-entry.
//!
//! ## Quick Start
//!
//! ```rust
//! use nebula_extent_hooks::prelude::*;
//!
//! let ehooks = EHooks::default();
//! assert!(ehooks.is_default());
//!
//! let mut zero = false;
//! let mut commit = true;
//! let size = nebula_extent_hooks::pages::page_size();
//! # #[cfg(unix)]
//! # {
//! let addr = unsafe { ehooks.alloc(None, None, size, size, &mut zero, &mut commit, 0) };
//! let addr = addr.expect("mapping a page");
//! assert!(zero);
//! unsafe { ehooks.destroy(None, addr, size, true, 0) };
//! # }
//! ```
//!
//! ## Boolean results
//!
//! Operations that can fail return `bool` with the allocator convention:
//! `false` means success, `true` means failure or "not supported".
//!
//! ## Configuration
//!
//! See [`config`] for the environment variables and [`init`] for explicit
//! startup configuration.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![allow(unsafe_code)] // Page mapping and hook dispatch work on raw extents

pub mod config;
pub mod default;
pub mod ehooks;
pub mod error;
pub mod guard;
pub mod pages;
pub mod table;
pub mod tsd;

pub use crate::config::{ExtentHooksConfig, PurgeCapabilities};
pub use crate::default::DEFAULT_EXTENT_HOOKS;
pub use crate::ehooks::{Backend, EHooks};
pub use crate::error::{ExtentHooksError, Result};
pub use crate::guard::ReentrancyGuard;
pub use crate::table::{
    ExtentAllocHook, ExtentDallocHook, ExtentDestroyHook, ExtentHooks, ExtentMergeHook,
    ExtentRangeHook, ExtentSplitHook,
};
pub use crate::tsd::{Tsd, TsdState, Tsdn};

pub mod prelude {
    //! Convenient re-exports of commonly used types.

    pub use crate::config::{ExtentHooksConfig, PurgeCapabilities};
    pub use crate::default::DEFAULT_EXTENT_HOOKS;
    pub use crate::ehooks::{Backend, EHooks};
    pub use crate::error::{ExtentHooksError, Result};
    pub use crate::guard::ReentrancyGuard;
    pub use crate::table::ExtentHooks;
    pub use crate::tsd::{Tsd, Tsdn};
}

/// Fix the process-wide configuration before the first handle is created.
///
/// Without this call the configuration is resolved from the environment on
/// first use.
///
/// ```rust
/// use nebula_extent_hooks::ExtentHooksConfig;
///
/// fn main() -> nebula_extent_hooks::Result<()> {
///     nebula_extent_hooks::init(ExtentHooksConfig::default().with_retain(true))?;
///     assert!(nebula_extent_hooks::config::global().retain);
///     Ok(())
/// }
/// ```
pub fn init(config: ExtentHooksConfig) -> Result<()> {
    tracing::debug!(?config, "Initializing extent hooks");
    config::init_global(config)?;
    Ok(())
}
