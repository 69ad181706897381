//! Query IR to backend filter
//!
//! The output is always a top-level `And`. Every clause needing a disjunction
//! (stream blocks, types with wildcards, nullable lower bounds) contributes one
//! nested `Or`, so the result never carries two top-level disjunctions.

use serde_json::Value;

use super::clause::{QueryClause, StreamsSelection};
use super::{EventsQuery, QueryOptions};
use crate::backend::{Filter, FindOptions, SortKey};
use crate::types::USER_ID_FIELD;

const STREAM_IDS: &str = "streamIds";
const TYPE: &str = "type";
const HEAD_ID: &str = "headId";
const DELETED: &str = "deleted";

/// Backend-ready form of an events query
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub filter: Filter,
    pub options: FindOptions,
}

/// Compile a query scoped to `user_id`
pub fn compile(user_id: &str, query: &EventsQuery) -> CompiledQuery {
    let mut conditions = vec![Filter::eq(USER_ID_FIELD, user_id)];
    for filter in query.clauses.iter().filter_map(compile_clause) {
        match filter {
            Filter::And(children) => conditions.extend(children),
            other => conditions.push(other),
        }
    }
    conditions.extend(scope_conditions(&query.options));

    CompiledQuery {
        filter: Filter::And(conditions),
        options: find_options(&query.options),
    }
}

/// Compile a single clause; `None` when it places no constraint
pub fn compile_clause(clause: &QueryClause) -> Option<Filter> {
    match clause {
        QueryClause::Equal { field, value } => Some(Filter::Eq(field.clone(), value.clone())),
        QueryClause::Greater { field, value } => Some(Filter::Gt(field.clone(), value.clone())),
        QueryClause::GreaterOrEqual { field, value } => {
            Some(Filter::Gte(field.clone(), value.clone()))
        }
        QueryClause::LowerOrEqual { field, value } => {
            Some(Filter::Lte(field.clone(), value.clone()))
        }
        QueryClause::GreaterOrEqualOrNull { field, value } => Some(Filter::Or(vec![
            Filter::Gte(field.clone(), value.clone()),
            Filter::IsNull(field.clone()),
        ])),
        QueryClause::TypesList { values } => compile_types(values),
        QueryClause::StreamsQuery { blocks } => compile_streams(blocks),
    }
}

fn compile_types(values: &[String]) -> Option<Filter> {
    if values.is_empty() {
        return None;
    }
    let mut exact = Vec::new();
    let mut alternatives = Vec::new();
    for value in values {
        match value.strip_suffix("/*") {
            Some(class) => alternatives.push(Filter::Prefix(TYPE.to_string(), format!("{}/", class))),
            None => exact.push(Value::String(value.clone())),
        }
    }
    if !exact.is_empty() {
        alternatives.insert(0, Filter::In(TYPE.to_string(), exact));
    }
    single_or_any(alternatives)
}

fn compile_streams(blocks: &[StreamsSelection]) -> Option<Filter> {
    if blocks.is_empty() {
        // No permitted stream: an empty disjunction matches nothing
        return Some(Filter::Or(Vec::new()));
    }
    let mut alternatives = Vec::with_capacity(blocks.len());
    for block in blocks {
        let conditions = compile_selection(block);
        if conditions.is_empty() {
            // One wildcard block without further parts makes the whole
            // disjunction true
            return None;
        }
        alternatives.push(if conditions.len() == 1 {
            conditions.into_iter().next()?
        } else {
            Filter::And(conditions)
        });
    }
    single_or_any(alternatives)
}

fn compile_selection(block: &StreamsSelection) -> Vec<Filter> {
    let mut conditions = Vec::new();
    // An empty `any` intersects nothing
    if !block.is_wildcard() {
        conditions.push(Filter::In(STREAM_IDS.to_string(), to_values(&block.any)));
    }
    for group in &block.all {
        conditions.push(Filter::In(STREAM_IDS.to_string(), to_values(group)));
    }
    if !block.not.is_empty() {
        conditions.push(Filter::Nin(STREAM_IDS.to_string(), to_values(&block.not)));
    }
    conditions
}

fn to_values(ids: &[String]) -> Vec<Value> {
    ids.iter().map(|id| Value::String(id.clone())).collect()
}

fn single_or_any(mut alternatives: Vec<Filter>) -> Option<Filter> {
    match alternatives.len() {
        0 => None,
        1 => alternatives.pop(),
        _ => Some(Filter::Or(alternatives)),
    }
}

fn scope_conditions(options: &QueryOptions) -> Vec<Filter> {
    let mut conditions = Vec::new();
    match &options.history_of {
        Some(target) => conditions.push(Filter::Or(vec![
            Filter::eq("id", target.as_str()),
            Filter::eq(HEAD_ID, target.as_str()),
        ])),
        None => conditions.push(Filter::is_null(HEAD_ID)),
    }
    if !options.include_deleted {
        conditions.push(Filter::is_null(DELETED));
    }
    conditions
}

fn find_options(options: &QueryOptions) -> FindOptions {
    let sort = if options.history_of.is_some() {
        SortKey::ascending("modified")
    } else if options.ascending {
        SortKey::ascending("time")
    } else {
        SortKey::descending("time")
    };
    FindOptions {
        sort: vec![sort],
        skip: options.skip,
        limit: options.limit,
        projection: options.ids_only.then(|| vec!["id".to_string()]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Document;
    use crate::query::time_window::{running_eligible, time_window_clauses};
    use proptest::prelude::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn event(event_type: &str, streams: &[&str], time: f64, end_time: Option<f64>) -> Document {
        doc(json!({
            "userId": "u1",
            "id": "e",
            "type": event_type,
            "streamIds": streams,
            "time": time,
            "endTime": end_time,
        }))
    }

    fn top_level_ors(filter: &Filter) -> usize {
        match filter {
            Filter::Or(_) => 1,
            Filter::And(children) => children.iter().filter(|c| matches!(c, Filter::Or(_))).count(),
            _ => 0,
        }
    }

    #[test]
    fn test_user_id_comes_first() {
        let compiled = compile("u1", &EventsQuery::new());
        match &compiled.filter {
            Filter::And(conditions) => assert_eq!(conditions[0], Filter::eq("userId", "u1")),
            other => panic!("expected And, got {:?}", other),
        }
        let mut foreign = event("a/b", &["s"], 1.0, Some(1.0));
        foreign.insert("userId".into(), json!("u2"));
        assert!(!compiled.filter.matches(&foreign));
    }

    #[test]
    fn test_weight_wildcard_matches_class() {
        let query = EventsQuery::new().types(&["weight/*"]);
        let compiled = compile("u1", &query);
        assert!(compiled.filter.matches(&event("weight/kg", &["s"], 1.0, Some(1.0))));
        assert!(compiled.filter.matches(&event("weight/lb", &["s"], 1.0, Some(1.0))));
        assert!(!compiled.filter.matches(&event("height/cm", &["s"], 1.0, Some(1.0))));
        assert!(!compiled.filter.matches(&event("weightless/x", &["s"], 1.0, Some(1.0))));
    }

    #[test]
    fn test_mixed_types_list() {
        let query = EventsQuery::new().types(&["note/txt", "weight/*"]);
        let compiled = compile("u1", &query);
        assert!(compiled.filter.matches(&event("note/txt", &["s"], 1.0, Some(1.0))));
        assert!(compiled.filter.matches(&event("weight/kg", &["s"], 1.0, Some(1.0))));
        assert!(!compiled.filter.matches(&event("note/html", &["s"], 1.0, Some(1.0))));
    }

    #[test]
    fn test_streams_and_time_nest_disjunctions() {
        let query = EventsQuery::new()
            .streams(vec![
                StreamsSelection::any(&["a"]),
                StreamsSelection::any(&["b"]).and_not(&["c"]),
            ])
            .time_window_at(Some(10.0), None, 100.0);
        let compiled = compile("u1", &query);

        assert!(matches!(compiled.filter, Filter::And(_)));
        assert_eq!(top_level_ors(&compiled.filter), 2);
        assert!(compiled.filter.matches(&event("x/y", &["b"], 5.0, None)));
        assert!(!compiled.filter.matches(&event("x/y", &["b", "c"], 5.0, None)));
        assert!(!compiled.filter.matches(&event("x/y", &["a"], 1.0, Some(2.0))));
    }

    #[test]
    fn test_wildcard_stream_block_is_unconstrained() {
        let query = EventsQuery::new().streams(vec![StreamsSelection::any(&["*"])]);
        let compiled = compile("u1", &query);
        assert!(compiled.filter.matches(&event("x/y", &["anything"], 1.0, Some(1.0))));
    }

    #[test]
    fn test_empty_stream_scope_matches_nothing() {
        let anything = event("x/y", &["a"], 1.0, Some(1.0));

        let no_blocks = compile("u1", &EventsQuery::new().streams(Vec::new()));
        assert!(!no_blocks.filter.matches(&anything));

        let empty_any = StreamsSelection::default();
        let compiled = compile("u1", &EventsQuery::new().streams(vec![empty_any.clone()]));
        assert!(!compiled.filter.matches(&anything));

        // an empty block does not widen its siblings
        let compiled = compile(
            "u1",
            &EventsQuery::new().streams(vec![empty_any, StreamsSelection::any(&["a"])]),
        );
        assert!(compiled.filter.matches(&anything));
        assert!(!compiled.filter.matches(&event("x/y", &["b"], 1.0, Some(1.0))));
    }

    #[test]
    fn test_all_groups_require_each_group() {
        let selection = StreamsSelection::any(&["a"]).and_any(&["b", "b-child"]);
        let compiled = compile("u1", &EventsQuery::new().streams(vec![selection]));
        assert!(compiled.filter.matches(&event("x/y", &["a", "b-child"], 1.0, Some(1.0))));
        assert!(!compiled.filter.matches(&event("x/y", &["a"], 1.0, Some(1.0))));
    }

    #[test]
    fn test_history_excluded_by_default() {
        let compiled = compile("u1", &EventsQuery::new());
        let mut snapshot = event("x/y", &["s"], 1.0, Some(1.0));
        snapshot.insert("headId".into(), json!("e0"));
        assert!(!compiled.filter.matches(&snapshot));
        assert_eq!(compiled.options.sort, vec![SortKey::descending("time")]);
    }

    #[test]
    fn test_history_of_matches_head_and_snapshots() {
        let compiled = compile("u1", &EventsQuery::new().history_of("e"));
        let mut snapshot = event("x/y", &["s"], 1.0, Some(1.0));
        snapshot.insert("id".into(), json!("other"));
        snapshot.insert("headId".into(), json!("e"));
        assert!(compiled.filter.matches(&snapshot));
        assert!(compiled.filter.matches(&event("x/y", &["s"], 1.0, Some(1.0))));
        assert_eq!(compiled.options.sort, vec![SortKey::ascending("modified")]);
    }

    #[test]
    fn test_ids_only_projection() {
        let compiled = compile("u1", &EventsQuery::new().ids_only().skip(2).limit(5));
        assert_eq!(compiled.options.projection, Some(vec!["id".to_string()]));
        assert_eq!(compiled.options.skip, 2);
        assert_eq!(compiled.options.limit, Some(5));
    }

    /// Literal reading of the window: finished events that started inside it
    /// or started before and ended inside or after it; running events when the
    /// window reaches the present.
    fn overlaps(time: f64, end: Option<f64>, from: Option<f64>, to: Option<f64>, now: f64) -> bool {
        let before_to = to.map_or(true, |t| time <= t);
        match (end, from) {
            (_, None) => before_to,
            (Some(end), Some(from)) => {
                let started_inside = time >= from && before_to;
                let spans_from = time < from && end >= from && before_to;
                started_inside || spans_from
            }
            (None, Some(_)) => before_to && running_eligible(to, now),
        }
    }

    proptest! {
        #[test]
        fn prop_window_clauses_match_overlap(
            time in 0.0f64..1000.0,
            duration in proptest::option::of(0.0f64..500.0),
            from in proptest::option::of(0.0f64..1000.0),
            to in proptest::option::of(0.0f64..1000.0),
            now in 0.0f64..1200.0,
        ) {
            let end = duration.map(|d| time + d);
            let query = EventsQuery::new().time_window_at(from, to, now);
            let compiled = compile("u1", &query);
            let doc = event("x/y", &["s"], time, end);
            prop_assert_eq!(compiled.filter.matches(&doc), overlaps(time, end, from, to, now));
        }

        #[test]
        fn prop_spanning_now_matches_running(
            time in 0.0f64..1000.0,
            from in 0.0f64..1000.0,
            stream in "[a-c]",
        ) {
            let now = 1000.0;
            let query = EventsQuery::new()
                .streams(vec![StreamsSelection::any(&[stream.as_str()]), StreamsSelection::any(&["z"])])
                .time_window_at(Some(from), Some(now), now);
            let compiled = compile("u1", &query);
            prop_assert!(compiled.filter.matches(&event("x/y", &[stream.as_str()], time, None)));
        }

        #[test]
        fn prop_disjunctions_stay_nested(
            blocks in proptest::collection::vec("[a-e]", 0..4),
            types in proptest::collection::vec("(note|weight)/(txt|\\*)", 0..3),
            from in proptest::option::of(0.0f64..100.0),
        ) {
            let selections = blocks.iter().map(|b| StreamsSelection::any(&[b.as_str()])).collect();
            let query = EventsQuery::new()
                .streams(selections)
                .types(&types)
                .time_window_at(from, None, 50.0);
            let compiled = compile("u1", &query);
            prop_assert!(matches!(compiled.filter, Filter::And(_)));
            if let Filter::And(conditions) = &compiled.filter {
                prop_assert!(conditions.iter().all(|c| !matches!(c, Filter::And(_))));
            }
        }
    }

    #[test]
    fn test_window_sample_cases() {
        let now = 1000.0;
        assert!(overlaps(5.0, Some(15.0), Some(10.0), Some(20.0), now));
        assert!(!overlaps(5.0, Some(8.0), Some(10.0), Some(20.0), now));
        assert_eq!(
            time_window_clauses(None, None, now),
            Vec::<QueryClause>::new()
        );
    }
}
