//! Soft-limit warning dispatch (spec.md §4.8). Invoked synchronously after a
//! successful consume; a handler's failure is logged and swallowed — it must
//! never fail the consume that triggered it.

use crate::types::Usage;

/// Registered callback for threshold crossings. Kept as an explicit trait
/// object parameter (spec.md §9 "Context-carried warning handler in the
/// source" re-architecture note) rather than anything thread-local.
pub trait WarningHandler: Send + Sync {
    /// `threshold` is the crossed fraction; `usage` is the post-consume
    /// snapshot. Any `Err` is logged at `warn` level and otherwise ignored.
    fn handle(&self, usage: &Usage, threshold: f64) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Default handler: observes nothing. Equivalent to no thresholds configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWarningHandler;

impl WarningHandler for NoopWarningHandler {
    fn handle(&self, _usage: &Usage, _threshold: f64) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}

/// Dispatches threshold crossings for one consume. `thresholds` must already
/// be sorted ascending (guaranteed by `CoreConfig::validate`).
pub fn dispatch(
    handler: &dyn WarningHandler,
    usage: &Usage,
    thresholds: &[f64],
    before_used: u64,
    limit: u64,
) {
    if limit == 0 {
        return;
    }
    let before_ratio = before_used as f64 / limit as f64;
    let after_ratio = usage.used as f64 / limit as f64;

    for &threshold in thresholds {
        if before_ratio < threshold && threshold <= after_ratio {
            if let Err(error) = handler.handle(usage, threshold) {
                tracing::warn!(threshold, %error, "warning handler failed");
            }
        }
    }
}
