//! Command-line arguments.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "reel", version, about)]
pub struct Cli {
    /// Configuration file (TOML, YAML or JSON). Defaults to `reel.toml` in the config directory.
    #[arg(long, short, env = "REEL_CONFIG", global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    pub log_format: LogFormat,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Drain write orders onto tape until interrupted.
    Serve,
    /// Store files as objects, named after the file. Open containers are sealed on exit.
    Put {
        #[arg(long, short)]
        bucket: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Seal the open container of one bucket, or of all of them.
    Seal { bucket: Option<String> },
    /// Read a container back (from disk or tape), or a single object out of it.
    Get {
        id: String,
        #[arg(long)]
        object: Option<String>,
        /// Write to this file instead of standard output.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Lifecycle state of a container.
    Status { id: String },
    /// Commit a pre-built tar archive straight to tape.
    Submit {
        #[arg(long, short)]
        bucket: String,
        path: PathBuf,
    },
    /// Requeue containers that are ready but have no write order.
    Sweep,
    /// Return a bucket's parked write orders to the queue.
    Requeue { bucket: String },
    /// Outstanding write orders.
    Orders { bucket: Option<String> },
    /// Tape catalog.
    Tapes { bucket: Option<String> },
    DriveStatus { index: u32 },
    LibraryStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use rstest::rstest;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[rstest]
    #[case(&["reel", "serve"], LogFormat::Pretty)]
    #[case(&["reel", "--log-format", "json", "sweep"], LogFormat::Json)]
    #[case(&["reel", "orders", "--log-format", "json"], LogFormat::Json)]
    fn test_global_flags(#[case] args: &[&str], #[case] format: LogFormat) {
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.log_format, format);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_put_needs_files() {
        assert!(Cli::try_parse_from(["reel", "put", "--bucket", "backup"]).is_err());
        let cli = Cli::try_parse_from(["reel", "put", "-b", "backup", "a.bin", "b.bin"]).unwrap();
        assert!(matches!(cli.command, Command::Put { files, .. } if files.len() == 2));
    }
}
