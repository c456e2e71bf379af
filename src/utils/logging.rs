//! Logging macros gated on a per-module `ENABLE_LOGS` flag.
//!
//! A module opts in by declaring the flag and importing the macros from the
//! crate root:
//!
//! ```ignore
//! const ENABLE_LOGS: bool = true;
//!
//! use crate::{log_info, log_warn};
//!
//! log_info!("{} scan running", transport);
//! ```
//!
//! Flipping the flag to `false` silences the module without touching
//! `RUST_LOG`. Plain `log::debug!` stays available for noise that should
//! only ever follow the global filter.

/// Forwards to the given `log` macro when the caller's `ENABLE_LOGS` is set.
#[doc(hidden)]
#[macro_export]
macro_rules! log_if_enabled {
    ($level:ident, $($arg:tt)*) => {
        if ENABLE_LOGS {
            log::$level!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::log_if_enabled!(debug, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::log_if_enabled!(info, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::log_if_enabled!(warn, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::log_if_enabled!(error, $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    const ENABLE_LOGS: bool = false;

    #[test]
    fn disabled_flag_skips_formatting() {
        let mut formatted = false;
        let mut probe = || {
            formatted = true;
            "probe"
        };
        crate::log_info!("{}", probe());
        crate::log_warn!("{}", probe());
        assert!(!formatted);
    }
}
