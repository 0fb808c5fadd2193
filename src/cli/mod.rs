use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "checkboard",
    about = "Store checklist compliance tracking engine"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    Status,
    Doctor,
    Trends {
        #[arg(long)]
        weeks: Option<u32>,
    },
    Submit {
        #[arg(long)]
        location: String,
        #[arg(long = "type")]
        checklist_type: String,
        #[arg(long)]
        completed: u32,
        #[arg(long)]
        total: u32,
        #[arg(long)]
        by: Option<String>,
    },
    Service,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    Set { key: String, value: String },
    Get { key: String },
}
