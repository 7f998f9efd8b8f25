use anyhow::Result;
use clap::{Parser, Subcommand};
use lotline_pipeline::{report_runs_markdown, run_once_from_env};

#[derive(Debug, Parser)]
#[command(name = "lotline-cli")]
#[command(about = "Lotline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the batch reconciliation pipeline once.
    Run,
    /// Summarize the most recent pipeline runs.
    Report {
        #[arg(long, default_value_t = 3)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = run_once_from_env().await?;
            println!(
                "run complete: run_id={} listings={} unmatched={} merged={} conflicts={} reports={}",
                summary.run_id,
                summary.listings,
                summary.unmatched,
                summary.merged_events,
                summary.conflicting_events,
                summary.reports_dir
            );
        }
        Commands::Report { runs } => {
            println!("{}", report_runs_markdown(runs, None)?);
        }
    }

    Ok(())
}
