//! Logging for collabiq.
//!
//! Pipeline events go through `tracing`, re-exported here under `log_*`
//! names. The severity ladder is INFO (success), WARNING (retry triggered),
//! ERROR (retries exhausted, parked in DLQ), CRITICAL (breaker opened,
//! authentication failure). tracing has no level above ERROR, so
//! `log_critical!` emits at ERROR with an explicit `severity` field that
//! the per-severity log files and alerting key on.

#[allow(unused_imports)]
pub use tracing::{
    debug as log_debug, error as log_error, info as log_info, trace as log_trace, warn as log_warn,
};

/// ERROR-level event flagged CRITICAL for alerting.
macro_rules! log_critical {
    ($($arg:tt)*) => {
        tracing::error!(severity = "CRITICAL", $($arg)*)
    };
}
pub(crate) use log_critical;
