//! Clap definitions for `cloudvault` and `cloudvaultd`

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Connection flags shared by every client subcommand
#[derive(Clone, Debug, Args)]
pub struct ConnectOpts {
    /// Server (cloudvault://user@host:port)
    #[arg(short, long, global = true)]
    pub server: Option<String>,

    /// Username; overrides the one in the server URL
    #[arg(short, long, global = true)]
    pub user: Option<String>,

    /// Directory holding ca.pem and crl.pem
    #[arg(long, global = true)]
    pub pki_dir: Option<PathBuf>,

    /// Encrypted private key (PKCS#8 PEM)
    #[arg(long, global = true)]
    pub key: Option<PathBuf>,

    /// Read the key passphrase from this file instead of the environment or stdin
    #[arg(long, global = true)]
    pub passphrase_file: Option<PathBuf>,

    /// Blocking I/O timeout in seconds (0 disables)
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// TOML config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// No progress bars
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Debug, Parser)]
#[command(author, version, about = "CloudVault client - store files on a CloudVault server")]
pub struct ClientCli {
    #[command(flatten)]
    pub connect: ConnectOpts,

    #[command(subcommand)]
    pub command: ClientCommand,
}

#[derive(Clone, Debug, Subcommand)]
pub enum ClientCommand {
    /// Upload one or more local files
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Remote name (single file only)
        #[arg(long = "as")]
        remote_name: Option<String>,
    },
    /// Download files into a directory (existing local files are never overwritten)
    Download {
        #[arg(required = true)]
        names: Vec<String>,
        #[arg(short, long, default_value = ".")]
        dest: PathBuf,
    },
    /// List stored files
    List,
    /// Rename a stored file
    Rename { from: String, to: String },
    /// Delete stored files
    Delete {
        #[arg(required = true)]
        names: Vec<String>,
    },
}

#[derive(Debug, Parser)]
#[command(author, version, about = "CloudVault storage daemon")]
pub struct DaemonCli {
    #[command(subcommand)]
    pub command: DaemonCommand,
}

#[derive(Clone, Debug, Subcommand)]
pub enum DaemonCommand {
    /// Accept client connections
    Serve(ServeOpts),
    /// Generate a demo CA, server certificate, CRL and user keys
    Provision(ProvisionOpts),
}

#[derive(Clone, Debug, Args)]
pub struct ServeOpts {
    /// Bind address (host:port)
    #[arg(long)]
    pub bind: Option<String>,

    /// Root of the per-user storage directories
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Directory with server.pem, server.key and users/
    #[arg(long)]
    pub pki_dir: Option<PathBuf>,

    /// Blocking I/O timeout in seconds (0 disables)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Write log lines to this file instead of stderr
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Do not write the JSONL transfer journal
    #[arg(long)]
    pub no_journal: bool,

    /// TOML config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Clone, Debug, Args)]
pub struct ProvisionOpts {
    /// Output directory
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// user:passphrase pairs
    #[arg(long = "user", value_parser = parse_user_spec, required = true)]
    pub users: Vec<(String, String)>,

    /// Extra DNS names for the server certificate
    #[arg(long = "server-name")]
    pub server_names: Vec<String>,

    /// List the server certificate in the CRL (for testing clients)
    #[arg(long)]
    pub revoke_server: bool,
}

fn parse_user_spec(s: &str) -> Result<(String, String), String> {
    match s.split_once(':') {
        Some((name, pass)) if !name.is_empty() && !pass.is_empty() => {
            Ok((name.to_string(), pass.to_string()))
        }
        _ => Err(format!("expected user:passphrase, got '{s}'")),
    }
}
