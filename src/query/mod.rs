//! Events query IR and its compiler
//!
//! Callers describe what they want with [`EventsQuery`]: an ordered list of
//! [`QueryClause`]s (all ANDed) plus [`QueryOptions`]. [`compile`] turns it
//! into a backend [`Filter`](crate::backend::Filter) scoped to one user.

pub mod clause;
mod compiler;
pub mod time_window;

pub use clause::{QueryClause, StreamsSelection};
pub use compiler::{compile, compile_clause, CompiledQuery};
pub use time_window::{running_eligible, time_window_clauses, RUNNING_SLACK_SECS};

use crate::utils::now_seconds;

/// Read options carried alongside the clauses
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    /// Sort by `time` ascending instead of descending
    pub ascending: bool,
    pub skip: usize,
    pub limit: Option<usize>,
    /// Only project `id`
    pub ids_only: bool,
    /// Match event `id` and its history rows, sorted by `modified` ascending
    pub history_of: Option<String>,
    /// Also match tombstones
    pub include_deleted: bool,
}

/// Backend-neutral events query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventsQuery {
    pub clauses: Vec<QueryClause>,
    pub options: QueryOptions,
}

impl EventsQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clause(mut self, clause: QueryClause) -> Self {
        self.clauses.push(clause);
        self
    }

    /// Events in any of the blocks; no block at all matches no event
    pub fn streams(self, blocks: Vec<StreamsSelection>) -> Self {
        self.clause(QueryClause::streams(blocks))
    }

    pub fn types<S: AsRef<str>>(self, types: &[S]) -> Self {
        if types.is_empty() {
            return self;
        }
        self.clause(QueryClause::types_list(types))
    }

    /// Events overlapping `[from, to]`, judged against the current time
    pub fn time_window(self, from: Option<f64>, to: Option<f64>) -> Self {
        self.time_window_at(from, to, now_seconds())
    }

    pub fn time_window_at(mut self, from: Option<f64>, to: Option<f64>, now: f64) -> Self {
        self.clauses.extend(time_window_clauses(from, to, now));
        self
    }

    /// Only trashed (`true`) or only non-trashed (`false`) events
    pub fn trashed(self, trashed: bool) -> Self {
        self.clause(QueryClause::equal("trashed", trashed))
    }

    /// Events still running
    pub fn running(self) -> Self {
        self.clause(QueryClause::equal("endTime", serde_json::Value::Null))
    }

    pub fn modified_since(self, since: f64) -> Self {
        self.clause(QueryClause::greater("modified", since))
    }

    pub fn ascending(mut self) -> Self {
        self.options.ascending = true;
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.options.skip = skip;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.options.limit = Some(limit);
        self
    }

    pub fn ids_only(mut self) -> Self {
        self.options.ids_only = true;
        self
    }

    pub fn history_of(mut self, id: &str) -> Self {
        self.options.history_of = Some(id.to_string());
        self
    }

    pub fn include_deleted(mut self) -> Self {
        self.options.include_deleted = true;
        self
    }
}
