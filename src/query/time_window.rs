//! Time window to clauses
//!
//! An event `[time, endTime]` overlaps `[from, to]` when it started before
//! `to` and ended at or after `from`. Running events have no end and only
//! qualify when the window reaches the present.

use super::clause::QueryClause;

/// How close to "now" an upper bound must be for running events to match
pub const RUNNING_SLACK_SECS: f64 = 5.0;

/// Whether running events are eligible for a window ending at `to`
pub fn running_eligible(to: Option<f64>, now: f64) -> bool {
    match to {
        None => true,
        Some(to) => to >= now - RUNNING_SLACK_SECS,
    }
}

/// Clauses selecting events overlapping `[from, to]` as seen at `now`
pub fn time_window_clauses(from: Option<f64>, to: Option<f64>, now: f64) -> Vec<QueryClause> {
    let mut clauses = Vec::new();
    if let Some(to) = to {
        clauses.push(QueryClause::lower_or_equal("time", to));
    }
    if let Some(from) = from {
        if running_eligible(to, now) {
            clauses.push(QueryClause::greater_or_equal_or_null("endTime", from));
        } else {
            clauses.push(QueryClause::greater_or_equal("endTime", from));
        }
    }
    clauses
}
