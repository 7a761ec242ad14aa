//! Command line of the `jade` binary.

use crate::config::JadeConfig;
use crate::daemon::storage_client;
use anyhow::Result;
use clap::{Parser, Subcommand};
use jade_storage::StorageFormat;
use jade_transport::{DataTransferTarget, StorageMessageResponse};
use std::path::PathBuf;

/// Parsed `jade` arguments.
#[derive(Parser, Debug)]
#[command(name = "jade")]
#[command(about = "JADE distributed storage: master, storage agent and data transfer client", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file; defaults apply when it is missing.
    #[arg(short, long, global = true, default_value = "/etc/jade/jade.toml", env = "JADE_CONFIG")]
    pub config: PathBuf,

    /// What to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the master: agent registry and registration API.
    Master,
    /// Run a storage agent.
    Agent,
    /// Check that an agent answers on its socket address.
    Ping {
        /// Agent socket address.
        addr: String,
    },
    /// Store a local file or directory on an agent.
    Put {
        /// File or directory to send.
        local: PathBuf,
        /// Agent socket address.
        addr: String,
        /// Path on the agent.
        remote: String,
        /// Storage format; inferred from the local path when omitted.
        #[arg(short, long)]
        format: Option<StorageFormat>,
        /// Authorization token.
        #[arg(short, long, env = "JADE_AUTH_TOKEN")]
        token: Option<String>,
        /// Bundle to account the transfer against.
        #[arg(long)]
        bundle_id: Option<u64>,
    },
    /// Fetch data from an agent into a local path.
    Get {
        /// Path on the agent.
        remote: String,
        /// Agent socket address.
        addr: String,
        /// Local destination.
        local: PathBuf,
        /// Storage format of the remote data.
        #[arg(short, long)]
        format: Option<StorageFormat>,
        /// Authorization token.
        #[arg(short, long, env = "JADE_AUTH_TOKEN")]
        token: Option<String>,
    },
}

impl Cli {
    /// True for the long-running master and agent commands.
    pub fn is_daemon(&self) -> bool {
        matches!(self.command, Command::Master | Command::Agent)
    }

    /// Runs a client command and returns the process exit code.
    pub async fn run(self) -> Result<i32> {
        let config = JadeConfig::load_or_default(&self.config)?;
        let client = storage_client(&config.transfer);
        let response = match self.command {
            Command::Master | Command::Agent => {
                anyhow::bail!("master and agent run as daemons")
            }
            Command::Ping { addr } => client.ping(&addr).await?,
            Command::Put {
                local,
                addr,
                remote,
                format,
                token,
                bundle_id,
            } => {
                let format = format.unwrap_or_else(|| default_format(&local));
                let mut target = DataTransferTarget::new(addr, remote, format);
                if let Some(token) = token {
                    target = target.with_token(token);
                }
                if let Some(id) = bundle_id {
                    target = target.with_bundle_id(id);
                }
                client.persist_data(&local, &target).await?
            }
            Command::Get {
                remote,
                addr,
                local,
                format,
                token,
            } => {
                let format = format.unwrap_or(StorageFormat::DataDirectory);
                let mut target = DataTransferTarget::new(addr, remote, format);
                if let Some(token) = token {
                    target = target.with_token(token);
                }
                client.retrieve_data(&local, &target).await?
            }
        };
        Ok(report(&response))
    }
}

fn default_format(local: &std::path::Path) -> StorageFormat {
    if local.is_dir() {
        StorageFormat::DataDirectory
    } else {
        StorageFormat::SingleDataFile
    }
}

fn report(response: &StorageMessageResponse) -> i32 {
    if response.is_ok() {
        println!("OK {}", response.message);
        println!("Transferred: {} bytes", response.transferred_bytes);
        println!("Persisted: {} bytes", response.persisted_bytes);
        if !response.checksum.is_empty() {
            println!("Checksum: {}", jade_storage::to_hex(&response.checksum));
        }
        0
    } else {
        eprintln!("ERROR {}", response.message);
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_parses() {
        let cli = Cli::try_parse_from([
            "jade",
            "put",
            "/tmp/data",
            "agent:10000",
            "/storage/bundle",
            "--format",
            "DATA_DIRECTORY",
            "--bundle-id",
            "42",
        ])
        .unwrap();
        match cli.command {
            Command::Put {
                local,
                addr,
                remote,
                format,
                bundle_id,
                ..
            } => {
                assert_eq!(local, PathBuf::from("/tmp/data"));
                assert_eq!(addr, "agent:10000");
                assert_eq!(remote, "/storage/bundle");
                assert_eq!(format, Some(StorageFormat::DataDirectory));
                assert_eq!(bundle_id, Some(42));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_daemons_parse_with_config() {
        let cli = Cli::try_parse_from(["jade", "master", "--config", "/etc/jade/master.toml"]).unwrap();
        assert!(cli.is_daemon());
        assert_eq!(cli.config, PathBuf::from("/etc/jade/master.toml"));
        assert!(Cli::try_parse_from(["jade", "agent"]).unwrap().is_daemon());
    }

    #[test]
    fn test_usage_errors() {
        assert!(Cli::try_parse_from(["jade"]).is_err());
        assert!(Cli::try_parse_from(["jade", "ping"]).is_err());
        assert!(Cli::try_parse_from(["jade", "put", "a", "b", "c", "--format", "TIFF"]).is_err());
        let help = Cli::try_parse_from(["jade", "--help"]).unwrap_err();
        assert!(!help.use_stderr());
    }

    #[test]
    fn test_report_exit_codes() {
        assert_eq!(report(&StorageMessageResponse::ok("done")), 0);
        assert_eq!(report(&StorageMessageResponse::error("No file found for /x")), 1);
    }

    #[test]
    fn test_default_format_follows_source() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(default_format(dir.path()), StorageFormat::DataDirectory);
        assert_eq!(default_format(&dir.path().join("f.bin")), StorageFormat::SingleDataFile);
    }

    #[tokio::test]
    async fn test_ping_unreachable_agent_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "jade",
            "--config",
            dir.path().join("absent.toml").to_str().unwrap(),
            "ping",
            "127.0.0.1:1",
        ])
        .unwrap();
        assert!(cli.run().await.is_err());
    }
}
