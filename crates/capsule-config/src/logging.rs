//! Structured logging utilities for capsule components.
//!
//! Provides consistent logging with component prefixes and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use capsule_config::logging::*;
//!
//! log_engine_info!("export completed", artifact_id = "doc.txt");
//! log_plugin_debug!("invoking handler", plugin_id = "format-markdown");
//! ```

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const CAS: &'static str = "CAS";
    pub const CONTAINER: &'static str = "CONTAINER";
    pub const PACK: &'static str = "PACK";
    pub const ENGINE: &'static str = "ENGINE";
    pub const PLUGIN: &'static str = "PLUGIN";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

// === CAS logging macros ===

#[macro_export]
macro_rules! log_cas_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "CAS", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_cas_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "CAS", $($key = $value,)* $msg)
    };
}

// === CONTAINER logging macros ===

#[macro_export]
macro_rules! log_container_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "CONTAINER", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_container_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "CONTAINER", $($key = $value,)* $msg)
    };
}

// === PACK logging macros ===

#[macro_export]
macro_rules! log_pack_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "PACK", $($key = $value,)* $msg)
    };
}

// === ENGINE logging macros ===

#[macro_export]
macro_rules! log_engine_info {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::info!(component = "ENGINE", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_engine_warn {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::warn!(component = "ENGINE", $($key = $value,)* $msg)
    };
}

// === PLUGIN logging macros ===

#[macro_export]
macro_rules! log_plugin_debug {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::debug!(component = "PLUGIN", $($key = $value,)* $msg)
    };
}

#[macro_export]
macro_rules! log_plugin_error {
    ($msg:literal $(, $key:ident = $value:expr)* $(,)?) => {
        tracing::error!(component = "PLUGIN", $($key = $value,)* $msg)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let filter = match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
        LogLevel::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_constants() {
        assert_eq!(Component::CAS, "CAS");
        assert_eq!(Component::ENGINE, "ENGINE");
        assert_eq!(Component::PLUGIN, "PLUGIN");
    }
}
