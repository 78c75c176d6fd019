use anyhow::Result;
use lakerunner_cli::cli;

#[tokio::main]
async fn main() -> Result<()> {
    // The CLI layer parses arguments, installs tracing and dispatches the command.
    cli::cli::run().await
}
