//! Symmetric over/under bounds derived from the configured ratio.

use serde::Serialize;
use tracing::info;

/// Bounds a query's actual/estimated row ratio is tested against.
///
/// Always built as a unit so the under and over bounds come from the same
/// configured ratio.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct RatioBounds {
    pub ratio: f64,
    pub under: f64,
    pub over: f64,
}

impl RatioBounds {
    /// Derives the bounds for `ratio`, which must be in `(0, 1]`.
    pub fn new(ratio: f64) -> Self {
        Self {
            ratio,
            under: ratio,
            over: 1.0 / ratio,
        }
    }

    /// Same as [`RatioBounds::new`], announcing the new bounds.
    pub(crate) fn recalculate(ratio: f64) -> Self {
        let bounds = Self::new(ratio);
        info!(
            under = bounds.under,
            over = bounds.over,
            "pg_badplan: setting ratio to {:.3} > x > {:.3}",
            bounds.over,
            bounds.under
        );
        bounds
    }

    /// True when `ratio` lies outside the open interval `(under, over)`.
    pub fn is_outside(&self, ratio: f64) -> bool {
        ratio <= self.under || ratio >= self.over
    }
}

impl Default for RatioBounds {
    fn default() -> Self {
        Self::new(crate::settings::DEFAULT_RATIO)
    }
}
