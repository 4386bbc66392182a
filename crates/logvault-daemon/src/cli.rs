use std::path::PathBuf;

use clap::{Parser, Subcommand};

const GLOBAL_USAGE: &str = "Collects log files from watched directories into an object store.

Common actions for logvault:

- logvault start:      Starts the logvault process and blocks indefinitely
- logvault version:    Prints the version
";

#[derive(Parser)]
#[command(name = "logvault", about = "Tool used for log archival.", long_about = GLOBAL_USAGE)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the archival daemon and block until a signal arrives
    Start {
        /// Configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print the version of logvault
    Version,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_requires_a_config_path() {
        assert!(Cli::try_parse_from(["logvault", "start"]).is_err());

        let cli = Cli::try_parse_from(["logvault", "start", "-c", "/etc/logvault.yaml"]).unwrap();
        match cli.command {
            Command::Start { config } => {
                assert_eq!(config, PathBuf::from("/etc/logvault.yaml"));
            }
            _ => panic!("expected start command"),
        }
    }

    #[test]
    fn version_takes_no_arguments() {
        let cli = Cli::try_parse_from(["logvault", "version"]).unwrap();
        assert!(matches!(cli.command, Command::Version));
        assert!(Cli::try_parse_from(["logvault", "version", "extra"]).is_err());
    }
}
