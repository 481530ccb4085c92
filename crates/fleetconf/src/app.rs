use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(about = "Manage gateway .conf files on a remote host over SSH")]
pub struct Args {
    /// Path to the config file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the .conf files in the remote config directory
    List,

    /// Print one or more configs
    Read {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Create a new config from a local file ("-" for stdin)
    Create { name: String, file: PathBuf },

    /// Replace a config if it still matches the content you last read
    Update {
        name: String,
        /// The content you based your change on
        #[arg(long)]
        current: PathBuf,
        /// The new content
        #[arg(long)]
        new: PathBuf,
    },

    /// Restart the service that consumes the configs
    Restart,
}
