use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version)]
#[command(about = "Solana batch transfer utility")]
#[command(
    long_about = "Executes SOL or SPL token transfers one after another from a YAML configuration. \
    Amounts are value expressions evaluated against live balances; requests rotate over RPC nodes and proxies."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Print the resolved config (private keys counted, not shown) and exit
    #[arg(long)]
    pub print_config: bool,

    /// Print the transfers with their effective values and exit
    #[arg(long)]
    pub print_transfers: bool,

    /// Print sender and recipient balances and exit
    #[arg(long)]
    pub print_balances: bool,

    /// Resolve values and log them without signing or sending anything
    #[arg(long)]
    pub emulate: bool,

    /// Do not wait for transaction confirmation
    #[arg(long)]
    pub no_confirmation: bool,

    /// Timeout in seconds for transaction confirmation
    #[arg(long, default_value = "30")]
    pub confirm_timeout: u64,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate a sample config file
    GenerateConfig {
        /// Path to output config file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}
