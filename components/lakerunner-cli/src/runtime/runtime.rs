// Local crates
use crate::{
    client::client::QueryClient,
    helpers::{load_config::Settings, shutdown::Shutdown},
    query::{
        query::{
            LOGS_DATASET, LogFilterArgs, QueryParams, build_attribute_filter, build_log_filter,
            build_tag_values_filter, create_expression, create_graph_request,
        },
        time_range::TimeRange,
    },
    render::render::{DistinctValues, LogLine, attribute_names, render_columns, tag_value},
    stream::decoder::DecodeResult,
};

// External crates
use anyhow::{Context, Result};
use chrono::Utc;
use futures::{Stream, StreamExt};
use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;
use tracing::instrument;

/// Expression limit used by the tag listing commands.
const TAG_QUERY_LIMIT: usize = 1000;

/// Options of `logs get`.
#[derive(Debug, Clone, Default)]
pub struct LogsQuery {
    pub filters: LogFilterArgs,
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: usize,
    pub columns: Vec<String>,
}

/// Options of `logs get-attr` and `logs get-values`.
#[derive(Debug, Clone, Default)]
pub struct TagsQuery {
    pub filters: LogFilterArgs,
    pub start: Option<String>,
    pub end: Option<String>,
}

/// Counts reported after a stream has been printed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrintSummary {
    /// Events received from the stream.
    pub received: usize,
    /// Lines written to the output.
    pub printed: usize,
}

fn start_shutdown(settings: &Settings) -> Shutdown {
    let shutdown = Shutdown::new();
    shutdown.trigger_on_ctrl_c();
    shutdown.trigger_after(Duration::from_secs(settings.request_timeout_secs));
    shutdown
}

fn resolve_range(start: Option<&str>, end: Option<&str>) -> Result<(String, String)> {
    let range =
        TimeRange::resolve(start, end, Utc::now()).context("failed to parse time range")?;
    Ok(range.to_params())
}

fn connect(settings: &Settings) -> Result<QueryClient> {
    let client = QueryClient::new(settings).context("failed to create query client")?;
    tracing::debug!(base_url = client.base_url(), "Query client ready");
    Ok(client)
}

/// Report an early stop unless the caller ended the stream itself, then
/// release the Ctrl-C and deadline watchers.
fn finish(shutdown: &Shutdown, stopped_by_caller: bool) {
    if !stopped_by_caller && shutdown.is_triggered() {
        tracing::warn!("Query stopped before the service finished streaming");
        eprintln!("Query stopped before the service finished streaming (deadline or Ctrl-C)");
    }
    shutdown.trigger();
}

/// `logs get`: stream log rows and print them.
#[instrument(
    name = "lakerunner_runtime::logs_get",
    target = "runtime::runtime",
    skip_all,
    level = "debug"
)]
pub async fn run_logs_get(settings: &Settings, query: LogsQuery) -> Result<()> {
    let client = connect(settings)?;
    let (start, end) = resolve_range(query.start.as_deref(), query.end.as_deref())?;

    let filter = build_log_filter(&query.filters).context("invalid filter")?;
    let expression = create_expression(LOGS_DATASET, query.limit, Some(filter));
    let request = create_graph_request(BTreeMap::from([("a".to_string(), expression)]));
    let params = QueryParams::new(start.clone(), end.clone());

    let shutdown = start_shutdown(settings);
    let mut stream = client
        .query_graph(&request, &params, shutdown.token())
        .await
        .context("failed to query logs")?;

    let mut out = std::io::stdout();
    writeln!(out, "Querying logs from {start} to {end}...")?;
    write_filter_summary(&mut out, &query.filters)?;
    if let Some(pattern) = &query.filters.message_regex {
        writeln!(out, "Message Regex Filter: _cardinalhq.message = {pattern}")?;
    }
    writeln!(out, "Limit: {} results", query.limit)?;
    if !query.columns.is_empty() {
        writeln!(out, "Columns: {}", query.columns.join(", "))?;
    }
    writeln!(out, "---")?;

    let summary = print_log_rows(&mut stream, query.limit, &query.columns, &mut out).await?;
    tracing::debug!(
        received = summary.received,
        printed = summary.printed,
        "Log query finished"
    );

    let limit_reached = summary.printed >= query.limit;
    if limit_reached {
        // Remaining rows are not needed; stop reading the response body.
        stream.cancel();
    }
    finish(&shutdown, limit_reached);
    Ok(())
}

/// `logs get-attr`: list the attribute names present on matching rows.
#[instrument(
    name = "lakerunner_runtime::logs_get_attr",
    target = "runtime::runtime",
    skip_all,
    level = "debug"
)]
pub async fn run_logs_get_attr(settings: &Settings, query: TagsQuery) -> Result<()> {
    let client = connect(settings)?;
    let (start, end) = resolve_range(query.start.as_deref(), query.end.as_deref())?;

    let filter = build_attribute_filter(&query.filters).context("invalid filter")?;
    let expression = create_expression(LOGS_DATASET, TAG_QUERY_LIMIT, Some(filter));
    let params = QueryParams::new(start.clone(), end.clone());

    let shutdown = start_shutdown(settings);
    let stream = client
        .query_tags(&expression, &params, shutdown.token())
        .await
        .context("failed to query tags")?;

    let mut out = std::io::stdout();
    writeln!(out, "Querying tags from {start} to {end}...")?;
    write_filter_summary(&mut out, &query.filters)?;
    writeln!(out, "---")?;

    print_attributes(stream, &mut out).await?;
    finish(&shutdown, false);
    Ok(())
}

/// `logs get-values <tag>`: list the distinct values of one tag.
#[instrument(
    name = "lakerunner_runtime::logs_get_values",
    target = "runtime::runtime",
    skip_all,
    fields(tag = %tag),
    level = "debug"
)]
pub async fn run_logs_get_values(settings: &Settings, tag: &str, query: TagsQuery) -> Result<()> {
    let client = connect(settings)?;
    let (start, end) = resolve_range(query.start.as_deref(), query.end.as_deref())?;

    let filter = build_tag_values_filter(tag, &query.filters).context("invalid filter")?;
    let expression = create_expression(LOGS_DATASET, TAG_QUERY_LIMIT, Some(filter));
    let params = QueryParams::new(start.clone(), end.clone()).with_tag(tag, "string");

    let shutdown = start_shutdown(settings);
    let stream = client
        .query_tags(&expression, &params, shutdown.token())
        .await
        .context("failed to query tag values")?;

    let mut out = std::io::stdout();
    writeln!(out, "Querying values for tag '{tag}' from {start} to {end}...")?;
    write_filter_summary(&mut out, &query.filters)?;
    writeln!(out, "---")?;

    print_tag_values(stream, tag, &mut out).await?;
    finish(&shutdown, false);
    Ok(())
}

fn write_filter_summary<W: Write>(out: &mut W, filters: &LogFilterArgs) -> std::io::Result<()> {
    if let Some(app) = &filters.app {
        writeln!(out, "App Filter: resource.service.name = {app}")?;
    }
    if let Some(level) = &filters.level {
        writeln!(out, "Level Filter: _cardinalhq.level = {level}")?;
    }
    for f in &filters.filters {
        writeln!(out, "Filter: {f}")?;
    }
    for f in &filters.regex_filters {
        writeln!(out, "Regex Filter: {f}")?;
    }
    Ok(())
}

/// Print log rows until the stream ends or `limit` rows have been printed.
/// Only `timeseries`, `event` and `data` events are rows.
pub async fn print_log_rows<S, W>(
    mut stream: S,
    limit: usize,
    columns: &[String],
    out: &mut W,
) -> Result<PrintSummary>
where
    S: Stream<Item = DecodeResult> + Unpin,
    W: Write,
{
    let mut summary = PrintSummary::default();

    while summary.printed < limit {
        let Some(item) = stream.next().await else {
            break;
        };
        let event = item.context("log stream failed")?;
        summary.received += 1;

        if !event.is_log_row() {
            continue;
        }

        let line = if columns.is_empty() {
            LogLine::from_event(&event).render()
        } else {
            render_columns(&event, columns)
        };
        writeln!(out, "{line}")?;
        summary.printed += 1;
    }

    if summary.received == 0 && limit > 0 {
        writeln!(out, "No responses received from the API")?;
    }
    Ok(summary)
}

/// Print each attribute name once, in first-seen order.
pub async fn print_attributes<S, W>(mut stream: S, out: &mut W) -> Result<PrintSummary>
where
    S: Stream<Item = DecodeResult> + Unpin,
    W: Write,
{
    let mut summary = PrintSummary::default();
    let mut names = DistinctValues::default();

    while let Some(item) = stream.next().await {
        let event = item.context("tags stream failed")?;
        summary.received += 1;

        if event.kind != "data" {
            continue;
        }
        for name in attribute_names(&event) {
            if names.insert(name) {
                writeln!(out, "{name}")?;
                summary.printed += 1;
            }
        }
    }

    if summary.received == 0 {
        writeln!(out, "No tags found for the specified criteria")?;
    } else if names.is_empty() {
        writeln!(out, "No tags found in the response")?;
    }
    Ok(summary)
}

/// Print each value of `tag` once, in first-seen order.
pub async fn print_tag_values<S, W>(mut stream: S, tag: &str, out: &mut W) -> Result<PrintSummary>
where
    S: Stream<Item = DecodeResult> + Unpin,
    W: Write,
{
    let mut summary = PrintSummary::default();
    let mut values = DistinctValues::default();

    while let Some(item) = stream.next().await {
        let event = item.context("tag values stream failed")?;
        summary.received += 1;

        if event.kind != "data" {
            continue;
        }
        if let Some(value) = tag_value(&event, tag) {
            if values.insert(value) {
                writeln!(out, "{value}")?;
                summary.printed += 1;
            }
        }
    }

    if summary.received == 0 {
        writeln!(out, "No tag values found for the specified criteria")?;
    } else if values.is_empty() {
        writeln!(out, "No values found for this tag")?;
    }
    Ok(summary)
}
