use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod engine;

use commands::{
    logout, whoami, ConfigCommand, ListCommand, LoginCommand, MutateCommand, OptionsCommand,
    PrintTestCommand, WatchCommand,
};
use config::Config;

#[derive(Parser)]
#[command(name = "comanda")]
#[command(version)]
#[command(about = "Realtime order and staff sync for restaurant teams", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow a collection live
    Watch(WatchCommand),

    /// Fetch a collection and print a filtered view
    List(ListCommand),

    /// Send a change for one row
    Mutate(MutateCommand),

    /// Inspect and normalize item options documents
    Options(OptionsCommand),

    /// Save a session
    Login(LoginCommand),

    /// Forget the saved session
    Logout,

    /// Show the saved session
    Whoami,

    /// Manage configuration
    Config(ConfigCommand),

    /// Print a test receipt
    PrintTest(PrintTestCommand),
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "comanda=info,comanda_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config)?;

    match &cli.command {
        Some(Commands::Watch(cmd)) => cmd.run(&config)?,
        Some(Commands::List(cmd)) => cmd.run(&config)?,
        Some(Commands::Mutate(cmd)) => cmd.run(&config)?,
        Some(Commands::Options(cmd)) => cmd.run()?,
        Some(Commands::Login(cmd)) => cmd.run(&config)?,
        Some(Commands::Logout) => logout(&config)?,
        Some(Commands::Whoami) => whoami(&config)?,
        Some(Commands::Config(cmd)) => cmd.run(&config)?,
        Some(Commands::PrintTest(cmd)) => cmd.run(&config)?,
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}
