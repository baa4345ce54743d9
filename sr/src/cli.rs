//! CLI command definitions and subcommands

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::debug;

/// SessionReel - session event streaming and replay
#[derive(Parser)]
#[command(
    name = "sr",
    about = "Stream, cancel and replay conversational agent sessions",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Control socket path (overrides config)
    #[arg(short, long, global = true, help = "Control socket path")]
    pub socket: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground
    Serve,

    /// Send a message and stream the agent's turn
    Send {
        session: String,
        message: String,
    },

    /// Cancel the running turn of a session
    Cancel { session: String },

    /// Follow live events until the current turn ends
    Watch { session: String },

    /// Print stored events
    History {
        session: String,

        /// First sequence to print
        #[arg(short, long, default_value = "1")]
        from: u64,

        /// Maximum number of events
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Replay a session with its original timing
    Replay {
        session: String,

        /// Playback speed multiplier
        #[arg(short, long)]
        rate: Option<f64>,

        /// Sequence to start from (clamped to the stored range)
        #[arg(short, long, allow_negative_numbers = true)]
        from: Option<i64>,
    },

    /// Show the current or most recent interaction
    Status { session: String },

    /// Check the daemon is alive
    Ping,

    /// Ask the daemon to shut down
    Stop,
}

/// Log file location
pub fn get_log_path() -> PathBuf {
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sessionreel")
        .join("logs")
        .join("sessionreel.log");
    debug!(?path, "get_log_path: returning path");
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_history_flags() {
        let cli = Cli::try_parse_from(["sr", "history", "s1", "--from", "5", "-n", "10"]).unwrap();
        match cli.command {
            Command::History { session, from, limit } => {
                assert_eq!(session, "s1");
                assert_eq!(from, 5);
                assert_eq!(limit, Some(10));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_replay_with_globals() {
        let cli = Cli::try_parse_from(["sr", "replay", "s1", "--rate", "2.5", "--socket", "/tmp/x.sock"]).unwrap();
        assert_eq!(cli.socket, Some(PathBuf::from("/tmp/x.sock")));
        match cli.command {
            Command::Replay { session, rate, from } => {
                assert_eq!(session, "s1");
                assert_eq!(rate, Some(2.5));
                assert_eq!(from, None);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_send_requires_message() {
        assert!(Cli::try_parse_from(["sr", "send", "s1"]).is_err());
    }

    #[test]
    fn test_log_path_ends_with_log_file() {
        assert!(get_log_path().ends_with("sessionreel/logs/sessionreel.log"));
    }
}
