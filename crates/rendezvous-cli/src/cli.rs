//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Overrides;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path (defaults to ./rendezvous.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Client identifier shared by every instance of one network
    #[arg(long, global = true)]
    pub client_id: Option<String>,

    /// Local name to advertise
    #[arg(long, global = true)]
    pub self_id: Option<String>,

    /// Per-step link establishment timeout in milliseconds
    #[arg(long, global = true)]
    pub link_timeout_ms: Option<u64>,

    /// Run central-only, without publishing a GATT service
    #[arg(long, global = true)]
    pub no_peripheral: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// Bridge stdin and stdout: each line read is sent, each message received is printed
    Run,
    /// Start, wait for peers, send one message and exit
    Send {
        /// Message content
        message: String,
        /// Treat the message as hex-encoded bytes
        #[arg(long)]
        hex: bool,
        /// Also write the message to every subscribed remote characteristic
        #[arg(long)]
        write: bool,
        /// Seconds to wait for peers before sending
        #[arg(short, long)]
        wait: Option<u64>,
    },
    /// Scan for a while and list the peers linked in that window
    Peers {
        /// Seconds to scan
        #[arg(short, long)]
        wait: Option<u64>,
    },
    /// Print the service and characteristic UUIDs derived from the client identifier
    Identity,
    /// Print the effective configuration as TOML
    Config,
    /// Exchange a message between two in-memory bridges
    Demo {
        /// Message the first bridge sends
        #[arg(default_value = "ping")]
        message: String,
    },
}

impl Cli {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            client_id: self.client_id.clone(),
            self_id: self.self_id.clone(),
            link_timeout_ms: self.link_timeout_ms,
            no_peripheral: self.no_peripheral,
            verbose: self.verbose,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "rendezvous",
            "send",
            "ping",
            "--client-id",
            "team1",
            "--self-id",
            "X",
            "--no-peripheral",
        ]);

        assert_eq!(
            cli.command,
            Commands::Send {
                message: "ping".to_string(),
                hex: false,
                write: false,
                wait: None,
            }
        );
        let overrides = cli.overrides();
        assert_eq!(overrides.client_id.as_deref(), Some("team1"));
        assert_eq!(overrides.self_id.as_deref(), Some("X"));
        assert!(overrides.no_peripheral);
    }

    #[test]
    fn test_demo_default_message() {
        let cli = Cli::parse_from(["rendezvous", "demo"]);
        assert_eq!(
            cli.command,
            Commands::Demo {
                message: "ping".to_string()
            }
        );
    }
}
