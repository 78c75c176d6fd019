use crate::helpers::load_config::{Settings, SettingsOverrides};
use crate::instrumentation::tracing::{LogFormat, init_panic_handler, init_tracing};
use crate::query::query::LogFilterArgs;
use crate::render::render::parse_columns;
use crate::runtime::runtime::{self, LogsQuery, TagsQuery};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "lakerunner",
    long_about = "Query logs, attributes and attribute values from a Lakerunner deployment. \
        Results are streamed from the query API and printed as they arrive.",
    about = "CLI tool to query Lakerunner",
    version,
    term_width = 100,
    after_help = "\
    EXAMPLES:
        lakerunner logs get --app checkout --level ERROR -s e-30m
        lakerunner logs get -m 'timeout.*' -c timestamp,level,message --limit 50
        lakerunner logs get-attr -f resource.service.name:checkout
        lakerunner logs get-values _cardinalhq.level -a checkout

    ENVIRONMENT:
        LAKERUNNER_QUERY_URL, LAKERUNNER_API_KEY, LAKERUNNER_REQUEST_TIMEOUT_SECS"
)]
struct Cli {
    /// Query API base URL (overrides LAKERUNNER_QUERY_URL)
    #[arg(long, global = true, value_name = "URL")]
    endpoint: Option<String>,

    /// API key (overrides LAKERUNNER_API_KEY)
    #[arg(long, global = true, value_name = "KEY")]
    api_key: Option<String>,

    /// TOML settings file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print debug diagnostics to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Format of diagnostics written to stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Text)]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Query logs
    Logs {
        #[command(subcommand)]
        command: LogsCommands,
    },

    /// Display version information
    Version,
}

#[derive(Subcommand, Debug)]
enum LogsCommands {
    /// Stream matching log rows
    Get(GetArgs),

    /// List attribute names present on matching logs
    GetAttr(AttrArgs),

    /// List distinct values of one attribute
    GetValues(ValuesArgs),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Args, Debug, Default)]
struct TimeArgs {
    /// Start time: now, e-1h, now-30m, RFC 3339 or epoch milliseconds
    #[arg(short, long, default_value = "e-1h")]
    start: String,

    /// End time: now, RFC 3339 or epoch milliseconds
    #[arg(short, long, default_value = "now")]
    end: String,
}

#[derive(Args, Debug, Default)]
struct ShorthandArgs {
    /// Only logs of this service (resource.service.name)
    #[arg(short, long)]
    app: Option<String>,

    /// Only logs of this level (_cardinalhq.level)
    #[arg(short, long)]
    level: Option<String>,
}

#[derive(Args, Debug)]
struct GetArgs {
    /// Regex matched against the log message
    #[arg(short, long)]
    message_regex: Option<String>,

    /// Maximum number of rows
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    limit: u64,

    /// Filter as key:value, repeatable
    #[arg(short, long = "filter", value_name = "KEY:VALUE")]
    filters: Vec<String>,

    /// Regex filter as key:pattern, repeatable
    #[arg(short, long = "regex", value_name = "KEY:PATTERN")]
    regex: Vec<String>,

    /// Columns to print, comma separated (timestamp, level, message, service, pod or any tag)
    #[arg(short, long)]
    columns: Option<String>,

    #[command(flatten)]
    shorthand: ShorthandArgs,

    #[command(flatten)]
    time: TimeArgs,
}

#[derive(Args, Debug)]
struct AttrArgs {
    /// Filter as key:value, repeatable
    #[arg(short, long = "filter", value_name = "KEY:VALUE")]
    filters: Vec<String>,

    /// Regex filter as key:pattern, repeatable
    #[arg(short, long = "regex", value_name = "KEY:PATTERN")]
    regex: Vec<String>,

    #[command(flatten)]
    shorthand: ShorthandArgs,

    #[command(flatten)]
    time: TimeArgs,
}

#[derive(Args, Debug)]
struct ValuesArgs {
    /// Attribute whose values are listed, e.g. resource.service.name
    tag: String,

    /// Exact filter as key:value, repeatable
    #[arg(short, long = "filter", value_name = "KEY:VALUE")]
    filters: Vec<String>,

    #[command(flatten)]
    shorthand: ShorthandArgs,

    #[command(flatten)]
    time: TimeArgs,
}

/// Entry function for CLI
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    // Held until the command returns so buffered diagnostics are flushed.
    let _guard = init_tracing(cli.verbose, cli.log_format.into());
    init_panic_handler();

    let overrides = SettingsOverrides {
        config_file: cli.config,
        query_url: cli.endpoint,
        api_key: cli.api_key,
    };

    match cli.command {
        Commands::Logs { command } => run_logs(command, &overrides).await?,
        Commands::Version => show_version(),
    }

    Ok(())
}

//
// ------------------------ Command Implementations ------------------------------
//

async fn run_logs(command: LogsCommands, overrides: &SettingsOverrides) -> Result<()> {
    let settings = Settings::load(overrides).context("failed to load settings")?;
    tracing::debug!(
        query_url = %settings.query_url,
        timeout_secs = settings.request_timeout_secs,
        "Settings loaded"
    );

    match command {
        LogsCommands::Get(args) => runtime::run_logs_get(&settings, args.into()).await,
        LogsCommands::GetAttr(args) => runtime::run_logs_get_attr(&settings, args.into()).await,
        LogsCommands::GetValues(args) => {
            let tag = args.tag.clone();
            runtime::run_logs_get_values(&settings, &tag, args.into()).await
        }
    }
}

/// Show version information
fn show_version() {
    println!("Lakerunner CLI {}", env!("CARGO_PKG_VERSION"));
}

impl From<GetArgs> for LogsQuery {
    fn from(args: GetArgs) -> Self {
        Self {
            filters: LogFilterArgs {
                app: args.shorthand.app,
                level: args.shorthand.level,
                message_regex: args.message_regex,
                filters: args.filters,
                regex_filters: args.regex,
            },
            start: Some(args.time.start),
            end: Some(args.time.end),
            limit: usize::try_from(args.limit).unwrap_or(usize::MAX),
            columns: args.columns.as_deref().map(parse_columns).unwrap_or_default(),
        }
    }
}

impl From<AttrArgs> for TagsQuery {
    fn from(args: AttrArgs) -> Self {
        Self {
            filters: LogFilterArgs {
                app: args.shorthand.app,
                level: args.shorthand.level,
                message_regex: None,
                filters: args.filters,
                regex_filters: args.regex,
            },
            start: Some(args.time.start),
            end: Some(args.time.end),
        }
    }
}

impl From<ValuesArgs> for TagsQuery {
    fn from(args: ValuesArgs) -> Self {
        Self {
            filters: LogFilterArgs {
                app: args.shorthand.app,
                level: args.shorthand.level,
                message_regex: None,
                filters: args.filters,
                regex_filters: Vec::new(),
            },
            start: Some(args.time.start),
            end: Some(args.time.end),
        }
    }
}
