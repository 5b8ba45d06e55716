//! Configuration for the extent hook layer
//!
//! Capabilities are resolved once per process (from the environment or an
//! explicit [`init_global`] call) and copied into every
//! [`EHooks`](crate::EHooks) at construction. Dispatch never re-reads them.
//!
//! Environment variables:
//! - `NEBULA_EHOOKS_PURGE_LAZY`: enable lazy purging (`MADV_FREE`, `MEM_RESET`)
//! - `NEBULA_EHOOKS_PURGE_FORCED`: enable forced purging (`MADV_DONTNEED`)
//! - `NEBULA_EHOOKS_RETAIN`: keep mappings on deallocation instead of
//!   unmapping them
//!
//! Each accepts `1/0`, `true/false`, `yes/no` or `on/off`.

use std::sync::OnceLock;

use crate::error::{ExtentHooksError, Result};
use crate::pages::{PAGES_CAN_PURGE_FORCED, PAGES_CAN_PURGE_LAZY};

/// Environment variable toggling lazy purge.
pub const ENV_PURGE_LAZY: &str = "NEBULA_EHOOKS_PURGE_LAZY";
/// Environment variable toggling forced purge.
pub const ENV_PURGE_FORCED: &str = "NEBULA_EHOOKS_PURGE_FORCED";
/// Environment variable toggling mapping retention.
pub const ENV_RETAIN: &str = "NEBULA_EHOOKS_RETAIN";

static GLOBAL_CONFIG: OnceLock<ExtentHooksConfig> = OnceLock::new();

/// Which purge operations may be dispatched at all.
///
/// A disabled capability short-circuits the corresponding operation to
/// failure for every table, default or custom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PurgeCapabilities {
    /// Lazy purge may be dispatched
    pub lazy: bool,
    /// Forced purge may be dispatched
    pub forced: bool,
}

impl PurgeCapabilities {
    /// Neither purge operation is available.
    pub const NONE: Self = Self {
        lazy: false,
        forced: false,
    };

    /// What the current platform's page primitives support.
    pub const PLATFORM: Self = Self {
        lazy: PAGES_CAN_PURGE_LAZY,
        forced: PAGES_CAN_PURGE_FORCED,
    };
}

impl Default for PurgeCapabilities {
    fn default() -> Self {
        Self::PLATFORM
    }
}

/// Process-wide extent hook configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentHooksConfig {
    /// Purge capabilities handed to new hook handles
    pub purge: PurgeCapabilities,

    /// Keep mappings on deallocation; the default backend then reports
    /// dealloc as failed so the extent manager retains the extent.
    pub retain: bool,
}

impl Default for ExtentHooksConfig {
    fn default() -> Self {
        Self {
            purge: PurgeCapabilities::PLATFORM,
            retain: false,
        }
    }
}

impl ExtentHooksConfig {
    /// Configuration with every optional behavior switched off.
    pub fn minimal() -> Self {
        Self {
            purge: PurgeCapabilities::NONE,
            retain: false,
        }
    }

    /// Set the lazy purge capability
    pub fn with_purge_lazy(mut self, enabled: bool) -> Self {
        self.purge.lazy = enabled;
        self
    }

    /// Set the forced purge capability
    pub fn with_purge_forced(mut self, enabled: bool) -> Self {
        self.purge.forced = enabled;
        self
    }

    /// Set the retain policy
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// Build from defaults overridden by environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_PURGE_LAZY) {
            config.purge.lazy = parse_flag(ENV_PURGE_LAZY, &raw)?;
        }
        if let Some(raw) = lookup(ENV_PURGE_FORCED) {
            config.purge.forced = parse_flag(ENV_PURGE_FORCED, &raw)?;
        }
        if let Some(raw) = lookup(ENV_RETAIN) {
            config.retain = parse_flag(ENV_RETAIN, &raw)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject capabilities the platform cannot provide.
    pub fn validate(&self) -> Result<()> {
        if self.purge.lazy && !PAGES_CAN_PURGE_LAZY {
            return Err(ExtentHooksError::invalid_config(
                "lazy purge requested but the platform cannot purge lazily",
            ));
        }
        if self.purge.forced && !PAGES_CAN_PURGE_FORCED {
            return Err(ExtentHooksError::invalid_config(
                "forced purge requested but the platform cannot purge forcibly",
            ));
        }
        Ok(())
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ExtentHooksError::invalid_config(format!(
            "{key}: expected a boolean, got '{other}'"
        ))),
    }
}

/// Install the process-wide configuration.
///
/// Must run before the first [`global`] call; later calls fail with
/// [`ExtentHooksError::AlreadyInitialized`].
pub fn init_global(config: ExtentHooksConfig) -> Result<()> {
    config.validate()?;
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| ExtentHooksError::AlreadyInitialized {
            component: "extent hooks configuration",
        })?;
    tracing::info!(config = ?GLOBAL_CONFIG.get(), "Extent hooks configuration installed");
    Ok(())
}

/// The process-wide configuration, resolved from the environment on first use.
pub fn global() -> &'static ExtentHooksConfig {
    GLOBAL_CONFIG.get_or_init(|| {
        let config = ExtentHooksConfig::from_env().unwrap_or_else(|error| {
            tracing::warn!(%error, "Ignoring invalid extent hooks environment configuration");
            ExtentHooksConfig::default()
        });
        tracing::info!(?config, "Extent hooks configuration resolved");
        config
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_matches_platform() {
        let config = ExtentHooksConfig::default();
        assert_eq!(config.purge, PurgeCapabilities::PLATFORM);
        assert!(!config.retain);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_environment_yields_default() {
        let config = ExtentHooksConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, ExtentHooksConfig::default());
    }

    #[test]
    fn environment_can_disable_capabilities() {
        let config = ExtentHooksConfig::from_lookup(lookup_from(&[
            (ENV_PURGE_LAZY, "off"),
            (ENV_PURGE_FORCED, "0"),
            (ENV_RETAIN, "YES"),
        ]))
        .unwrap();
        assert_eq!(
            config,
            ExtentHooksConfig {
                purge: PurgeCapabilities::NONE,
                retain: true,
            }
        );
    }

    #[test]
    fn bogus_flag_is_rejected() {
        let err = ExtentHooksConfig::from_lookup(lookup_from(&[(ENV_RETAIN, "maybe")]))
            .unwrap_err();
        assert_eq!(err.code(), "EHOOKS:CONFIG:INVALID");
        assert!(err.to_string().contains(ENV_RETAIN));
    }

    #[test]
    fn unsupported_capability_fails_validation() {
        let config = ExtentHooksConfig::minimal().with_purge_lazy(true);
        assert_eq!(config.validate().is_ok(), PAGES_CAN_PURGE_LAZY);

        let config = ExtentHooksConfig::minimal().with_purge_forced(true);
        assert_eq!(config.validate().is_ok(), PAGES_CAN_PURGE_FORCED);
    }

    #[test]
    fn builder_methods_compose() {
        let config = ExtentHooksConfig::minimal()
            .with_retain(true)
            .with_purge_forced(PAGES_CAN_PURGE_FORCED);
        assert!(config.retain);
        assert!(!config.purge.lazy);
        assert_eq!(config.purge.forced, PAGES_CAN_PURGE_FORCED);
    }

    #[test]
    fn global_is_resolved_once() {
        let first: *const ExtentHooksConfig = global();
        let second: *const ExtentHooksConfig = global();
        assert_eq!(first, second);
        assert!(init_global(ExtentHooksConfig::default()).is_err());
    }
}
