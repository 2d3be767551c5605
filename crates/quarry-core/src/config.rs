//! Engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::types::Refetch;

/// Default retention of unsubscribed data, in seconds.
pub const DEFAULT_KEEP_UNUSED_DATA_FOR_SECS: f64 = 60.0;

// Validation constants
const MAX_KEEP_UNUSED_DATA_FOR_SECS: f64 = 365.0 * 24.0 * 3600.0;

/// Engine-wide cache and refetch behaviour.
///
/// # Examples
///
/// ```rust
/// use quarry_core::{EngineConfig, Refetch};
///
/// let config = EngineConfig::builder()
///     .keep_unused_data_for(30.0)
///     .refetch_on_mount_or_arg_change(Refetch::IfOlderThan(10.0))
///     .refetch_on_focus(true)
///     .build()
///     .unwrap();
/// assert_eq!(config.keep_unused_data_for, 30.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Seconds an entry survives after its last subscriber leaves.
    pub keep_unused_data_for: f64,

    /// Refetch policy applied when a new subscriber mounts and the caller did
    /// not pass an explicit `force_refetch`.
    pub refetch_on_mount_or_arg_change: Refetch,

    /// Refetch subscribed queries when the host regains focus.
    pub refetch_on_focus: bool,

    /// Refetch subscribed queries when the host comes back online.
    pub refetch_on_reconnect: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            keep_unused_data_for: DEFAULT_KEEP_UNUSED_DATA_FOR_SECS,
            refetch_on_mount_or_arg_change: Refetch::Never,
            refetch_on_focus: false,
            refetch_on_reconnect: false,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Validate value ranges.
    pub fn validate(&self) -> Result<(), EngineError> {
        let keep = self.keep_unused_data_for;
        if !keep.is_finite() || !(0.0..=MAX_KEEP_UNUSED_DATA_FOR_SECS).contains(&keep) {
            return Err(EngineError::Config(format!(
                "keepUnusedDataFor must be between 0 and {MAX_KEEP_UNUSED_DATA_FOR_SECS} seconds (got {keep})"
            )));
        }

        validate_refetch(
            "refetchOnMountOrArgChange",
            self.refetch_on_mount_or_arg_change,
        )
    }

    /// Retention window as a `Duration`.
    pub fn keep_unused_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.keep_unused_data_for).unwrap_or_default()
    }
}

/// Reject negative or non-finite refetch thresholds.
pub(crate) fn validate_refetch(field: &str, refetch: Refetch) -> Result<(), EngineError> {
    if let Refetch::IfOlderThan(secs) = refetch {
        if !secs.is_finite() || secs < 0.0 {
            return Err(EngineError::Config(format!(
                "{field} threshold must be a non-negative number of seconds (got {secs})"
            )));
        }
    }
    Ok(())
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keep_unused_data_for(mut self, secs: f64) -> Self {
        self.config.keep_unused_data_for = secs;
        self
    }

    pub fn refetch_on_mount_or_arg_change(mut self, refetch: impl Into<Refetch>) -> Self {
        self.config.refetch_on_mount_or_arg_change = refetch.into();
        self
    }

    pub fn refetch_on_focus(mut self, enabled: bool) -> Self {
        self.config.refetch_on_focus = enabled;
        self
    }

    pub fn refetch_on_reconnect(mut self, enabled: bool) -> Self {
        self.config.refetch_on_reconnect = enabled;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<EngineConfig, EngineError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.keep_unused_data_for, 60.0);
        assert_eq!(config.refetch_on_mount_or_arg_change, Refetch::Never);
        assert!(!config.refetch_on_focus);
        assert!(!config.refetch_on_reconnect);
        assert_eq!(config.keep_unused_duration(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(EngineConfig::builder().keep_unused_data_for(-1.0).build().is_err());
        assert!(EngineConfig::builder().keep_unused_data_for(f64::NAN).build().is_err());
        assert!(
            EngineConfig::builder()
                .refetch_on_mount_or_arg_change(Refetch::IfOlderThan(-5.0))
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"refetchOnFocus": true, "keepUnusedDataFor": 5}"#).unwrap();
        assert!(config.refetch_on_focus);
        assert_eq!(config.keep_unused_data_for, 5.0);
        assert_eq!(config.refetch_on_mount_or_arg_change, Refetch::Never);
    }
}
