use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "sigbridge")]
#[command(about = "Capture and streaming server for USB measurement instruments", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Override the configured listen port
    #[arg(short, long)]
    pub port: Option<u16>,

    #[command(subcommand)]
    pub command: Option<CliCommand>,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Print version information
    Version,
}
