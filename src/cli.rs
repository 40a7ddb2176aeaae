use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "coinvest")]
#[command(version = "0.1.0")]
#[command(about = "Recurring-payment auto-invest engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Enable dry run mode (in-memory stores, paper exchanges)
    #[arg(short, long, default_value = "false")]
    pub dry_run: bool,

    /// Config directory
    #[arg(short, long, default_value = "config")]
    pub config: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine: drain payment events and reconcile orders
    Serve,
    /// Run a single reconciliation pass and exit
    Reconcile,
    /// Run database migrations and exit
    Migrate,
    /// Validate the configuration and exit
    CheckConfig,
}
