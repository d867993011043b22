use std::collections::HashSet;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chat_archiver::sync::SyncOptions;
use chat_archiver::{run, Config};

#[derive(Debug, Parser)]
#[command(name = "chat-archiver", version, about = "Continuous chat archiver")]
struct Cli {
    /// Account credential, including its kind prefix. Repeatable.
    #[arg(long = "token", value_name = "TOKEN", required = true)]
    tokens: Vec<String>,

    /// Log verbosity.
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log: LogLevel,

    /// Periodic progress summaries.
    #[arg(long, value_enum, default_value_t = StatsMode::Auto)]
    stats: StatsMode,

    /// Only archive this server. Repeatable; default is every visible one.
    #[arg(long = "guild", value_name = "ID")]
    guilds: Vec<u64>,

    /// Disable history backfill; archive realtime events only.
    #[arg(long)]
    no_sync: bool,

    /// Disable reaction archival.
    #[arg(long)]
    no_reactions: bool,

    /// Path of the archive database.
    database: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warning,
    Info,
    Verbose,
    Debug,
}

impl LogLevel {
    fn filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Verbose => "debug",
            LogLevel::Debug => "trace",
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StatsMode {
    Yes,
    No,
    Auto,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(cli.log.filter()))
        .with_writer(std::io::stderr)
        .init();

    let stats = match cli.stats {
        StatsMode::Yes => true,
        StatsMode::No => false,
        StatsMode::Auto => std::io::stderr().is_terminal(),
    };

    let config = Config {
        tokens: cli.tokens,
        database_path: cli.database,
        options: SyncOptions {
            guild_filter: cli.guilds.into_iter().collect::<HashSet<_>>(),
            no_sync: cli.no_sync,
            no_reactions: cli.no_reactions,
            stats,
        },
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to start runtime");
            return ExitCode::from(2);
        }
    };

    let shutdown = CancellationToken::new();
    runtime.spawn(wait_for_signal(shutdown.clone()));

    match runtime.block_on(run(config, shutdown)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "unrecoverable error");
            ExitCode::from(2)
        }
    }
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => return,
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
    shutdown.cancel();
}
