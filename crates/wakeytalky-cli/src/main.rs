use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use wakeytalky_core::Config;

mod commands;

#[derive(Parser)]
#[command(name = "wakeytalky-cli", version, about = "WakeyTalky alarm CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Alarm management
    Alarm {
        #[command(subcommand)]
        action: commands::alarm::AlarmAction,
    },
    /// Act on ringing alarms
    Ring {
        #[command(subcommand)]
        action: commands::ring::RingAction,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: commands::config::ConfigAction,
    },
    /// Run in the foreground, firing alarms and snooze timers
    Daemon(commands::daemon::DaemonArgs),
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing() {
    let level = Config::load_or_default().log.level;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Alarm { action } => commands::alarm::run(action).await,
        Commands::Ring { action } => commands::ring::run(action).await,
        Commands::Config { action } => commands::config::run(action),
        Commands::Daemon(args) => commands::daemon::run(args).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
