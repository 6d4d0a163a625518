use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::{
    config::Config,
    events::{Event, TimestampedEvent},
    lock::Lock,
};

/// The command line interface for the harness station service.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// Port to serve on
    #[arg(long, default_value_t = 3123)]
    pub port: u16,

    /// Also log to daily rotated files in this directory
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),
}

/// Helpful examples for users.
#[derive(Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,

    /// Show an example JSON event, as sent on the event stream.
    Event,

    /// Show an example JSON lock, as listed.
    Lock,
}

impl Examples {
    /// The example's text.
    pub fn render(&self) -> String {
        match self {
            Examples::Config => Config::example().serialize_pretty(),
            Examples::Event => TimestampedEvent::now(Event::example_raw_line()).to_json(),
            Examples::Lock => {
                serde_json::to_string_pretty(&Lock::example()).expect("Locks should serialize")
            }
        }
    }
}

/// Run a subcommand.
pub fn handle_command(command: Commands) {
    match command {
        Commands::Examples(example) => println!("{}", example.render()),
    }
}
