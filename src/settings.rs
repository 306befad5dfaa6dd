//! Context Settings
//!
//! [`ComputeSettings`] configures how a [`ComputeContext`](crate::ComputeContext)
//! negotiates its device and how it behaves afterwards.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use myth_compute::{ComputeContext, ComputeSettings};
//!
//! // Defaults: high-performance adapter, optional features on, 1 s async timeout
//! let mut ctx = ComputeContext::new();
//!
//! // Verbose tracing and a longer readback timeout
//! let settings = ComputeSettings {
//!     debug_logging: true,
//!     async_timeout: std::time::Duration::from_secs(5),
//!     ..Default::default()
//! };
//! let mut ctx = ComputeContext::with_settings(settings);
//! ctx.init(4, 3)?;
//! ```

use std::time::Duration;

/// Environment variable that turns on debug tracing in [`ComputeSettings::from_env`].
pub const DEBUG_ENV: &str = "MYTH_COMPUTE_DEBUG";

/// Default timeout used by [`ComputeContext::wait_async`](crate::ComputeContext::wait_async).
pub const DEFAULT_ASYNC_TIMEOUT: Duration = Duration::from_secs(1);

/// Device negotiation and runtime behaviour of a compute context.
#[derive(Debug, Clone)]
pub struct ComputeSettings {
    /// Adapter power preference.
    pub power_preference: wgpu::PowerPreference,
    /// Force the software fallback adapter.
    pub force_fallback_adapter: bool,
    /// Limits requested from the device. `None` requests everything the
    /// adapter supports.
    pub required_limits: Option<wgpu::Limits>,
    /// Request timestamp queries and extended storage formats when the
    /// adapter offers them.
    pub request_optional_features: bool,
    /// Emit verbose `log::debug!` traces for every operation.
    pub debug_logging: bool,
    /// Default timeout for [`wait_async`](crate::ComputeContext::wait_async).
    pub async_timeout: Duration,
    /// Label attached to the device and its objects.
    pub label: String,
}

impl Default for ComputeSettings {
    fn default() -> Self {
        Self {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            required_limits: None,
            request_optional_features: true,
            debug_logging: false,
            async_timeout: DEFAULT_ASYNC_TIMEOUT,
            label: "myth-compute".to_string(),
        }
    }
}

impl ComputeSettings {
    /// Defaults overridden by `WGPU_POWER_PREF` and [`DEBUG_ENV`].
    #[must_use]
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(pref) = wgpu::PowerPreference::from_env() {
            settings.power_preference = pref;
        }
        if env_var_truthy(DEBUG_ENV) {
            settings.debug_logging = true;
        }
        settings
    }

    /// Limits to request from an adapter supporting `available`.
    #[must_use]
    pub fn negotiated_limits(&self, available: wgpu::Limits) -> wgpu::Limits {
        self.required_limits.clone().unwrap_or(available)
    }

    /// Optional device features to request from an adapter that offers
    /// `available`.
    #[must_use]
    pub fn negotiated_features(&self, available: wgpu::Features) -> wgpu::Features {
        let mut requested = wgpu::Features::empty();
        if !self.request_optional_features {
            return requested;
        }

        let timestamps =
            wgpu::Features::TIMESTAMP_QUERY | wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS;
        if available.contains(timestamps) {
            requested |= timestamps;
        }
        if available.contains(wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES) {
            requested |= wgpu::Features::TEXTURE_ADAPTER_SPECIFIC_FORMAT_FEATURES;
        }
        requested
    }
}

pub(crate) fn env_var_truthy(name: &str) -> bool {
    let Ok(raw) = std::env::var(name) else {
        return false;
    };
    is_truthy(&raw)
}

fn is_truthy(raw: &str) -> bool {
    let v = raw.trim();
    v == "1"
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v.eq_ignore_ascii_case("on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_values() {
        for v in ["1", "true", "TRUE", " yes ", "On"] {
            assert!(is_truthy(v), "{v:?} should be truthy");
        }
        for v in ["", "0", "false", "off", "nope"] {
            assert!(!is_truthy(v), "{v:?} should not be truthy");
        }
    }

    #[test]
    fn optional_features_require_both_timestamp_bits() {
        let settings = ComputeSettings::default();

        let only_pass_level = settings.negotiated_features(wgpu::Features::TIMESTAMP_QUERY);
        assert!(!only_pass_level.contains(wgpu::Features::TIMESTAMP_QUERY));

        let both = settings.negotiated_features(
            wgpu::Features::TIMESTAMP_QUERY | wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS,
        );
        assert!(both.contains(wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS));
    }

    #[test]
    fn optional_features_can_be_disabled() {
        let settings = ComputeSettings {
            request_optional_features: false,
            ..Default::default()
        };
        assert!(settings.negotiated_features(wgpu::Features::all()).is_empty());
    }

    #[test]
    fn limits_default_to_the_adapter() {
        let adapter = wgpu::Limits {
            max_storage_buffers_per_shader_stage: 8,
            ..wgpu::Limits::downlevel_defaults()
        };
        let requested = ComputeSettings::default().negotiated_limits(adapter.clone());
        assert_eq!(requested.max_storage_buffers_per_shader_stage, 8);

        let pinned = ComputeSettings {
            required_limits: Some(wgpu::Limits::downlevel_defaults()),
            ..Default::default()
        };
        assert_eq!(
            pinned.negotiated_limits(adapter).max_storage_buffers_per_shader_stage,
            wgpu::Limits::downlevel_defaults().max_storage_buffers_per_shader_stage
        );
    }

    #[test]
    fn default_timeout_is_one_second() {
        assert_eq!(ComputeSettings::default().async_timeout, Duration::from_secs(1));
    }
}
