//! Query model sent to the Lakerunner query API.
//!
//! A log query is a tree of [`QueryClause`]s: [`Filter`] leaves joined by
//! [`BinaryClause`] `and`/`or` nodes. The tree is wrapped in a [`BaseExpr`],
//! which is either posted on its own (tags endpoint) or keyed inside a
//! [`GraphRequest`] (graph endpoint).

// External crates
use serde::Serialize;
use std::collections::BTreeMap;

/// Tag holding the service name of a log row.
pub const SERVICE_NAME_TAG: &str = "resource.service.name";
/// Tag holding the severity of a log row.
pub const LEVEL_TAG: &str = "_cardinalhq.level";
/// Tag holding the message body of a log row.
pub const MESSAGE_TAG: &str = "_cardinalhq.message";
/// Tag present on every log row, used to match everything.
pub const TELEMETRY_TYPE_TAG: &str = "log.telemetry_type";

/// Dataset name for log queries.
pub const LOGS_DATASET: &str = "logs";

/// Query construction errors.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("filter must be in format 'key:value', got '{0}'")]
    InvalidFilter(String),
    #[error("invalid time expression '{0}'")]
    InvalidTime(String),
    #[error("start time {start} is after end time {end}")]
    InvertedRange { start: String, end: String },
}

/// Comparison applied by a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Regex,
    Has,
    Exists,
}

/// Leaf condition on a single tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    pub k: String,
    pub v: Vec<String>,
    pub op: FilterOp,
    pub data_type: String,
    pub extracted: bool,
    pub computed: bool,
}

/// Logical operator joining two clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOp {
    And,
    Or,
}

/// Inner node of a filter tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BinaryClause {
    pub op: LogicalOp,
    pub q1: Box<QueryClause>,
    pub q2: Box<QueryClause>,
}

/// Any node of a filter tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryClause {
    Filter(Filter),
    Binary(BinaryClause),
}

impl From<Filter> for QueryClause {
    fn from(filter: Filter) -> Self {
        Self::Filter(filter)
    }
}

/// Result ordering of an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Order {
    #[serde(rename = "DESC")]
    Desc,
    #[serde(rename = "ASC")]
    Asc,
}

/// A single query expression.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseExpr {
    pub id: String,
    pub dataset: String,
    pub limit: usize,
    pub order: Order,
    pub return_results: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<QueryClause>,
}

/// Body of a graph endpoint request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphRequest {
    pub base_expressions: BTreeMap<String, BaseExpr>,
    pub formulae: Vec<String>,
}

/// URL query parameters shared by every endpoint. Empty values are omitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    pub start: String,
    pub end: String,
    pub tag_name: String,
    pub data_type: String,
}

impl QueryParams {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            ..Self::default()
        }
    }

    /// Restrict a tags query to the values of one tag.
    pub fn with_tag(mut self, tag_name: impl Into<String>, data_type: impl Into<String>) -> Self {
        self.tag_name = tag_name.into();
        self.data_type = data_type.into();
        self
    }

    /// Non-empty parameters, in wire order.
    pub fn pairs(&self) -> Vec<(&'static str, &str)> {
        [
            ("s", self.start.as_str()),
            ("e", self.end.as_str()),
            ("tagName", self.tag_name.as_str()),
            ("dataType", self.data_type.as_str()),
        ]
        .into_iter()
        .filter(|(_, v)| !v.is_empty())
        .collect()
    }
}

/// Build a string-typed filter leaf.
pub fn create_filter(key: &str, op: FilterOp, values: Vec<String>) -> Filter {
    Filter {
        k: key.to_string(),
        v: values,
        op,
        data_type: "string".to_string(),
        extracted: false,
        computed: false,
    }
}

/// Join clauses with `and`, nesting to the right: `(c1 and (c2 and c3))`.
pub fn and_all(clauses: Vec<QueryClause>) -> Option<QueryClause> {
    nest(LogicalOp::And, clauses)
}

/// Join clauses with `or`, nesting to the right: `(c1 or (c2 or c3))`.
pub fn or_all(clauses: Vec<QueryClause>) -> Option<QueryClause> {
    nest(LogicalOp::Or, clauses)
}

fn nest(op: LogicalOp, clauses: Vec<QueryClause>) -> Option<QueryClause> {
    clauses.into_iter().rev().reduce(|right, left| {
        QueryClause::Binary(BinaryClause {
            op,
            q1: Box::new(left),
            q2: Box::new(right),
        })
    })
}

/// Expression returning up to `limit` newest rows of `dataset`.
pub fn create_expression(dataset: &str, limit: usize, filter: Option<QueryClause>) -> BaseExpr {
    BaseExpr {
        id: "logs_query".to_string(),
        dataset: dataset.to_string(),
        limit,
        order: Order::Desc,
        return_results: true,
        filter,
    }
}

/// Graph request over a set of named expressions, with no formulae.
pub fn create_graph_request(expressions: BTreeMap<String, BaseExpr>) -> GraphRequest {
    GraphRequest {
        base_expressions: expressions,
        formulae: Vec::new(),
    }
}

/// Whether a filter value reads like a regular expression.
fn looks_like_regex(value: &str) -> bool {
    value.contains('\\') || value.contains(".*") || value.contains('^') || value.contains('$')
}

/// Split `key:value` on the first colon. Both halves are trimmed and the
/// key must not be empty.
fn split_filter_arg(arg: &str) -> Result<(&str, &str), QueryError> {
    let (key, value) = arg
        .split_once(':')
        .ok_or_else(|| QueryError::InvalidFilter(arg.to_string()))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(QueryError::InvalidFilter(arg.to_string()));
    }
    Ok((key, value.trim()))
}

/// Parse a `key:value` filter argument. Values that look like a regular
/// expression become `regex` filters, everything else `eq`.
pub fn parse_filter_arg(arg: &str) -> Result<Filter, QueryError> {
    let (key, value) = split_filter_arg(arg)?;
    let op = if looks_like_regex(value) {
        FilterOp::Regex
    } else {
        FilterOp::Eq
    };
    Ok(create_filter(key, op, vec![value.to_string()]))
}

/// Parse a `key:value` argument into a `regex` filter.
pub fn parse_regex_filter_arg(arg: &str) -> Result<Filter, QueryError> {
    let (key, value) = split_filter_arg(arg)?;
    Ok(create_filter(key, FilterOp::Regex, vec![value.to_string()]))
}

/// Parse a `key:value` argument into an `eq` filter, whatever the value looks like.
pub fn parse_exact_filter_arg(arg: &str) -> Result<Filter, QueryError> {
    let (key, value) = split_filter_arg(arg)?;
    Ok(create_filter(key, FilterOp::Eq, vec![value.to_string()]))
}

/// Filter options of a log query.
#[derive(Debug, Clone, Default)]
pub struct LogFilterArgs {
    pub app: Option<String>,
    pub level: Option<String>,
    pub message_regex: Option<String>,
    pub filters: Vec<String>,
    pub regex_filters: Vec<String>,
}

impl LogFilterArgs {
    pub fn has_filters(&self) -> bool {
        self.app.is_some()
            || self.level.is_some()
            || !self.filters.is_empty()
            || !self.regex_filters.is_empty()
    }
}

/// Filter tree for a log rows query.
///
/// The primary clause selects the service: `app` when given, otherwise any
/// row carrying a service name. A level filter without `app` takes the
/// primary slot. An explicit `resource.service.name` filter argument replaces
/// the primary clause.
pub fn build_log_filter(args: &LogFilterArgs) -> Result<QueryClause, QueryError> {
    let mut primary = match &args.app {
        Some(app) => create_filter(SERVICE_NAME_TAG, FilterOp::Eq, vec![app.clone()]),
        None => create_filter(SERVICE_NAME_TAG, FilterOp::Has, vec![String::new()]),
    };
    let mut rest: Vec<QueryClause> = Vec::new();

    if let Some(level) = &args.level {
        let level_filter = create_filter(LEVEL_TAG, FilterOp::Eq, vec![level.clone()]);
        if args.app.is_some() {
            rest.push(level_filter.into());
        } else {
            primary = level_filter;
        }
    }

    if let Some(pattern) = &args.message_regex {
        rest.push(create_filter(MESSAGE_TAG, FilterOp::Regex, vec![pattern.clone()]).into());
    }

    let mut custom = Vec::with_capacity(args.filters.len() + args.regex_filters.len());
    for arg in &args.filters {
        custom.push(parse_filter_arg(arg)?);
    }
    for arg in &args.regex_filters {
        custom.push(parse_regex_filter_arg(arg)?);
    }

    if let Some(pos) = custom.iter().position(|f| f.k == SERVICE_NAME_TAG) {
        primary = custom.remove(pos);
    }

    let mut clauses: Vec<QueryClause> = vec![primary.into()];
    clauses.extend(rest);
    clauses.extend(custom.into_iter().map(QueryClause::from));

    Ok(and_all(clauses).unwrap_or_else(|| {
        create_filter(SERVICE_NAME_TAG, FilterOp::Has, vec![String::new()]).into()
    }))
}

/// Filter tree for an attribute listing. Without filter options every row
/// with a telemetry type matches.
pub fn build_attribute_filter(args: &LogFilterArgs) -> Result<QueryClause, QueryError> {
    let mut clauses: Vec<QueryClause> = Vec::new();
    for arg in &args.filters {
        clauses.push(parse_filter_arg(arg)?.into());
    }
    for arg in &args.regex_filters {
        clauses.push(parse_regex_filter_arg(arg)?.into());
    }
    clauses.extend(shorthand_filters(args));

    Ok(and_all(clauses).unwrap_or_else(|| {
        create_filter(TELEMETRY_TYPE_TAG, FilterOp::Has, vec![String::new()]).into()
    }))
}

/// Filter tree for a tag value listing. Filter arguments always compare
/// exactly; without any, rows where `tag` exists match.
pub fn build_tag_values_filter(tag: &str, args: &LogFilterArgs) -> Result<QueryClause, QueryError> {
    let mut clauses: Vec<QueryClause> = Vec::new();
    for arg in &args.filters {
        clauses.push(parse_exact_filter_arg(arg)?.into());
    }
    clauses.extend(shorthand_filters(args));

    Ok(and_all(clauses)
        .unwrap_or_else(|| create_filter(tag, FilterOp::Exists, vec![String::new()]).into()))
}

fn shorthand_filters(args: &LogFilterArgs) -> Vec<QueryClause> {
    let mut clauses = Vec::new();
    if let Some(app) = &args.app {
        clauses.push(create_filter(SERVICE_NAME_TAG, FilterOp::Eq, vec![app.clone()]).into());
    }
    if let Some(level) = &args.level {
        clauses.push(create_filter(LEVEL_TAG, FilterOp::Eq, vec![level.clone()]).into());
    }
    clauses
}
