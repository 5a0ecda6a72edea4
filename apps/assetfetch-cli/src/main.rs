use clap::{Parser, Subcommand};

mod commands;
mod decoder;
mod disk_cache;
mod transport;

use commands::{ConfigCmd, FetchArgs, KeyArgs};

#[derive(Parser)]
#[command(name = "assetfetch", version, about = "Asset fetch pipeline utilities")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch and decode assets through the cache and HTTP pipeline
    Fetch(FetchArgs),
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
    /// Print the destination key each locator is throttled under
    Key(KeyArgs),
}

#[tokio::main]
async fn main() {
    assetfetch_otel::init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Fetch(args) => commands::fetch::cmd_fetch(args).await,
        Commands::Config { cmd } => commands::config::cmd_config(cmd),
        Commands::Key(args) => {
            commands::key::cmd_key(&args);
            Ok(())
        }
    };
    if let Err(e) = result {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}
