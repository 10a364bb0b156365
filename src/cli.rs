use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::commands;
use crate::constants::DEFAULT_BATCH_MINUTES;
use crate::models::Settings;

#[derive(Parser)]
#[command(name = "klinesync")]
#[command(about = "Bybit kline ingestion with gap reconciliation", long_about = None)]
pub struct Cli {
    /// Symbols, comma separated
    #[arg(long, global = true, default_value = "BTCUSDT")]
    pub symbol: String,

    /// Timeframe labels, comma separated (1, 5, 1h, 1d, 1W, 1M)
    #[arg(long, global = true, default_value = "1")]
    pub timeframes: String,

    /// First day to load when a pair has no data (YYYY-MM-DD)
    #[arg(long, global = true, default_value = "2024-07-01")]
    pub start_date: String,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// SQLite path (overrides KLINESYNC_DB)
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load history, then stream live klines until Ctrl-C (default)
    Stream,
    /// One-shot history load for every pair
    Backfill {
        /// Minutes per reconciliation batch
        #[arg(long, default_value_t = DEFAULT_BATCH_MINUTES)]
        batch_size: i64,
    },
    /// Find and fill gaps between --start-date and --end-date
    Gaps {
        /// End of the checked window (default: now)
        #[arg(long)]
        end_date: Option<String>,
    },
    /// Show latest candle, health and indicators per stored pair
    Status,
}

/// Options shared by every command
pub struct CommonArgs {
    pub symbols: String,
    pub timeframes: String,
    pub start_date: String,
    pub settings: Settings,
}

pub fn run() {
    let cli = Cli::parse();
    crate::utils::init_tracing(&cli.log_level);

    let mut settings = Settings::from_env();
    if let Some(path) = cli.database {
        settings.database_path = path;
    }
    let common = CommonArgs {
        symbols: cli.symbol,
        timeframes: cli.timeframes,
        start_date: cli.start_date,
        settings,
    };

    match cli.command.unwrap_or(Commands::Stream) {
        Commands::Stream => {
            commands::stream::run(common);
        }
        Commands::Backfill { batch_size } => {
            commands::backfill::run(common, batch_size);
        }
        Commands::Gaps { end_date } => {
            commands::gaps::run(common, end_date);
        }
        Commands::Status => {
            commands::status::run(common);
        }
    }
}
