//! Estimated vs. actual row comparison for one finished query.

use serde::Serialize;

use crate::query::Instrumentation;
use crate::ratio::RatioBounds;

/// Outcome of comparing the planner estimate with the rows actually produced.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Verdict {
    /// Planner estimate for the top-level node.
    pub estimated: f64,
    /// Rows per loop actually produced.
    pub actual: f64,
    /// `actual / estimated`; `None` when the estimate is zero.
    pub ratio: Option<f64>,
    pub flagged: bool,
}

/// Judges one query.
///
/// A query is flagged when its ratio falls outside `bounds` and either side
/// of the comparison exceeds `min_row_threshold`. A zero estimate counts as
/// outside the bounds as soon as any row was produced.
///
/// Returns `None` when no loop ever completed.
pub fn evaluate(
    estimated: f64,
    ntuples: f64,
    nloops: f64,
    bounds: &RatioBounds,
    min_row_threshold: u32,
) -> Option<Verdict> {
    if nloops <= 0.0 {
        return None;
    }
    let actual = ntuples / nloops;

    let (ratio, outside) = if estimated > 0.0 {
        let ratio = actual / estimated;
        (Some(ratio), bounds.is_outside(ratio))
    } else {
        (None, actual > 0.0)
    };

    let threshold = f64::from(min_row_threshold);
    let significant = estimated > threshold || actual > threshold;

    Some(Verdict {
        estimated,
        actual,
        ratio,
        flagged: outside && significant,
    })
}

/// Judges a query from its top-node instrumentation.
pub fn evaluate_instrumentation(
    plan_rows: f64,
    instr: &Instrumentation,
    bounds: &RatioBounds,
    min_row_threshold: u32,
) -> Option<Verdict> {
    evaluate(
        plan_rows,
        instr.ntuples,
        instr.nloops,
        bounds,
        min_row_threshold,
    )
}
