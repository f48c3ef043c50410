use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rustftp::client;
use rustftp::protocol::TFTP_PORT;
use rustftp::server::{ServerConfig, TftpServer};

/// A TFTP server and client (RFC 1350 with option negotiation).
#[derive(Parser, Debug)]
#[command(name = "rustftp", version, about)]
struct Cli {
    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,

    /// Plain RFC 1350 mode: do not negotiate options.
    #[arg(long = "rfc1350", global = true)]
    rfc1350: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve a directory over TFTP.
    Server {
        /// Directory to serve.
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// UDP port to listen on.
        #[arg(long, default_value_t = TFTP_PORT)]
        port: u16,

        /// Disable creation of new files.
        #[arg(long)]
        nocreate: bool,

        /// Disable writing any files.
        #[arg(long, conflicts_with = "ow")]
        nowrite: bool,

        /// Allow overwriting existing files.
        #[arg(long)]
        ow: bool,

        /// Reject transfer modes other than octet.
        #[arg(long)]
        strict: bool,
    },

    /// Download HOST:PATH into LOCAL.
    Get {
        remote: RemoteSpec,
        local: PathBuf,

        /// Server port.
        #[arg(long, default_value_t = TFTP_PORT)]
        port: u16,
    },

    /// Upload LOCAL to HOST:PATH.
    Put {
        remote: RemoteSpec,
        local: PathBuf,

        /// Server port.
        #[arg(long, default_value_t = TFTP_PORT)]
        port: u16,
    },
}

/// A `host:path` pair naming a file on a remote server.
#[derive(Debug, Clone)]
struct RemoteSpec {
    host: String,
    path: String,
}

impl FromStr for RemoteSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((host, path)) if !host.is_empty() && !path.is_empty() => Ok(Self {
                host: host.to_string(),
                path: path.to_string(),
            }),
            _ => Err(format!("expected HOST:PATH, got {s:?}")),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Command::Server {
            root,
            port,
            nocreate,
            nowrite,
            ow,
            strict,
        } => {
            let config = ServerConfig {
                root,
                disable_create: nocreate,
                disable_write: nowrite,
                allow_overwrite: ow,
                strict,
                rfc1350: cli.rfc1350,
            };
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let server = TftpServer::bind(addr, config).await?;
            server.serve().await
        }
        Command::Get {
            remote,
            local,
            port,
        } => {
            let server = resolve(&remote.host, port).await?;
            client::get(server, &remote.path, &local, cli.rfc1350).await
        }
        Command::Put {
            remote,
            local,
            port,
        } => {
            let server = resolve(&remote.host, port).await?;
            client::put(server, &local, &remote.path, cli.rfc1350).await
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| anyhow!("cannot resolve {host}"))
}
