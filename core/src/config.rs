//! Launcher configuration loading and validation
//!
//! This module parses a TOML configuration into `schema::LaunchOptions`,
//! applies defaults (via serde defaults on the schema type), and performs
//! strict validation with field-path error messages. It also converts
//! validated options into the supervisor's runtime pieces: a policy update
//! and the signal set to install handlers for.

use crate::policy::PolicyUpdate;
use crate::router::parse_signal_names;
use crate::{CoreError, Result};
use nix::sys::signal::Signal;
use schema::launch::{LaunchOptions, DEFAULT_SIGNALS_TO_HANDLE, SIGNALS_TO_HANDLE_ENV};
use std::fs;
use std::path::Path;

/// Load launch options from a TOML file path
pub fn load_launch_options_from_toml_path(path: impl AsRef<Path>) -> Result<LaunchOptions> {
    let data = fs::read_to_string(&path).map_err(|e| {
        CoreError::ConfigurationError(format!("Failed to read config {:?}: {}", path.as_ref(), e))
    })?;
    load_launch_options_from_toml_str(&data)
}

/// Load launch options from a TOML string
pub fn load_launch_options_from_toml_str(input: &str) -> Result<LaunchOptions> {
    let options: LaunchOptions = toml::from_str(input)
        .map_err(|e| CoreError::ConfigurationError(format!("TOML parse error: {}", e)))?;
    validate_launch_options(&options)?;
    Ok(options)
}

/// Validate launch options, returning field-path errors
pub fn validate_launch_options(options: &LaunchOptions) -> Result<()> {
    if !options.grace_period_secs.is_finite() || options.grace_period_secs < 0.0 {
        return Err(CoreError::ConfigurationError(format!(
            "gracePeriodSecs: must be a non-negative number, got {}",
            options.grace_period_secs
        )));
    }

    if let Err(e) = parse_signal_names(&options.signals_to_handle) {
        let message = match e {
            CoreError::ConfigurationError(m) => m,
            other => other.to_string(),
        };
        return Err(CoreError::ConfigurationError(format!(
            "signalsToHandle: {message}"
        )));
    }

    if let Some(dir) = &options.log_dir {
        if dir.as_os_str().is_empty() {
            return Err(CoreError::ConfigurationError(
                "logDir: cannot be empty".to_string(),
            ));
        }
    }

    Ok(())
}

/// Build the policy update expressed by validated launch options
pub fn policy_update(options: &LaunchOptions) -> Result<PolicyUpdate> {
    validate_launch_options(options)?;
    PolicyUpdate::from_raw(
        Some(options.grace_period_secs),
        Some(options.handle_secondary_signal),
        Some(options.forward_signals),
    )
}

/// The signal set the launcher should install handlers for
pub fn monitored_signals(options: &LaunchOptions) -> Result<Vec<Signal>> {
    parse_signal_names(&options.signals_to_handle)
}

/// The raw signal list from the launcher's own environment, falling back to
/// the built-in default when the variable is unset
pub fn signals_to_handle_from_env() -> String {
    std::env::var(SIGNALS_TO_HANDLE_ENV)
        .unwrap_or_else(|_| DEFAULT_SIGNALS_TO_HANDLE.to_string())
}
