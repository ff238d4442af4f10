use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use tradedesk::{
    commands::{run, trades},
    config::parse_date,
    context::AppContext,
};

#[derive(Parser)]
#[command(name = "tradedesk")]
#[command(about = "Intraday trade lifecycle engine for strategy-driven orders")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a trading session until market close
    Run {
        /// JSON settings file (environment variables override its values)
        #[arg(long, value_name = "PATH")]
        settings: Option<PathBuf>,
    },
    /// Summarize the trade journal of one day
    Trades {
        /// JSON settings file (environment variables override its values)
        #[arg(long, value_name = "PATH")]
        settings: Option<PathBuf>,
        /// Day to summarize as YYYY-MM-DD (defaults to today in market time)
        #[arg(long)]
        date: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match cli.command {
        Commands::Run { settings } => {
            let app_context = AppContext::initialize(settings.as_deref()).await?;
            info!("Starting trading session. Not financial advice. Use at your own risk.");
            run::run(&app_context).await?;
        }
        Commands::Trades { settings, date } => {
            let app_context = AppContext::initialize(settings.as_deref()).await?;
            let date = date.map(|raw| parse_date("--date", &raw)).transpose()?;
            trades::run(&app_context, date).await?;
        }
    }

    Ok(())
}
