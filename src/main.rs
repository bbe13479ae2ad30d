//! cloudvault - command-line client
//!
//! Connects once, runs every requested operation over the same session and
//! logs out at the end.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::{BufRead, Write};
use std::path::Path;

use cloudvault::cli::{ClientCli, ClientCommand, ConnectOpts};
use cloudvault::client::default_key_path;
use cloudvault::config::{load_client_config, ClientConfig};
use cloudvault::error::ProtocolError;
use cloudvault::pki::{load_encrypted_signing_key, users_dir, TrustStore};
use cloudvault::progress::TransferBar;
use cloudvault::url::parse_server_url;
use cloudvault::{Client, Operation, OperationOutcome};

const PASSPHRASE_ENV: &str = "CLOUDVAULT_PASSPHRASE";

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let cli = ClientCli::parse();
    let mut cfg = load_client_config(cli.connect.config.as_deref())?;
    apply_overrides(&mut cfg, &cli.connect);

    let server = cfg
        .server
        .clone()
        .context("no server given (use --server cloudvault://user@host:port)")?;
    let remote = parse_server_url(&server)
        .with_context(|| format!("invalid server URL: {server}"))?;
    let username = cli
        .connect
        .user
        .clone()
        .or(remote.username.clone())
        .or(cfg.username.clone())
        .context("no username given (use --user or user@host in the URL)")?;

    let trust = TrustStore::from_dir(&cfg.pki_dir)
        .with_context(|| format!("loading trust anchors from {}", cfg.pki_dir.display()))?;
    let key_path = cfg
        .key_path
        .clone()
        .unwrap_or_else(|| default_key_path(&users_dir(&cfg.pki_dir), &username));
    let passphrase_file = cli.connect.passphrase_file.clone();

    let mut client = Client::connect(
        &remote.addr(),
        &username,
        trust,
        || {
            let pass = read_passphrase(passphrase_file.as_deref())
                .map_err(|e| ProtocolError::InvalidCredential(e.to_string()))?;
            load_encrypted_signing_key(&key_path, &pass)
        },
        cfg.options(),
    )
    .with_context(|| format!("connecting to {} as {}", remote.addr(), username))?;

    let result = run(&mut client, cli.command, cli.connect.quiet);
    // the session may already be gone after a failure
    if let Err(e) = client.logout() {
        eprintln!("logout: {e}");
    }
    result
}

fn apply_overrides(cfg: &mut ClientConfig, opts: &ConnectOpts) {
    if let Some(s) = &opts.server {
        cfg.server = Some(s.clone());
    }
    if let Some(d) = &opts.pki_dir {
        cfg.pki_dir = d.clone();
    }
    if let Some(k) = &opts.key {
        cfg.key_path = Some(k.clone());
    }
    if let Some(t) = opts.timeout {
        cfg.io_timeout_secs = t;
    }
}

fn operations(command: ClientCommand) -> Result<Vec<Operation>> {
    Ok(match command {
        ClientCommand::Upload { files, remote_name } => {
            if remote_name.is_some() && files.len() > 1 {
                bail!("--as only applies to a single file");
            }
            files
                .into_iter()
                .map(|source| Operation::Upload {
                    source,
                    remote_name: remote_name.clone(),
                })
                .collect()
        }
        ClientCommand::Download { names, dest } => names
            .into_iter()
            .map(|name| Operation::Download {
                name,
                dest_dir: dest.clone(),
            })
            .collect(),
        ClientCommand::List => vec![Operation::List],
        ClientCommand::Rename { from, to } => vec![Operation::Rename { from, to }],
        ClientCommand::Delete { names } => names
            .into_iter()
            .map(|name| Operation::Delete { name })
            .collect(),
    })
}

fn run(client: &mut Client, command: ClientCommand, quiet: bool) -> Result<()> {
    let mut failures = 0usize;
    for op in operations(command)? {
        let kind = op.kind();
        let mut bar = TransferBar::new(quiet);
        match client.perform_operation(op, &mut bar) {
            Ok(outcome) => report(outcome),
            Err(e) => {
                failures += 1;
                eprintln!("{kind} failed: {e}");
                if !client.is_usable() {
                    eprintln!("session lost; reconnecting as {}", client.username());
                    client.reconnect().context("reconnect after failure")?;
                }
            }
        }
    }
    if failures > 0 {
        bail!("{failures} operation(s) failed");
    }
    Ok(())
}

fn report(outcome: OperationOutcome) {
    match outcome {
        OperationOutcome::Uploaded { name, bytes } => println!("uploaded {name} ({bytes} bytes)"),
        OperationOutcome::Downloaded { path, bytes } => {
            println!("downloaded {} ({bytes} bytes)", path.display())
        }
        OperationOutcome::Listed(names) => {
            if names.is_empty() {
                println!("(no files)");
            }
            for n in names {
                println!("{n}");
            }
        }
        OperationOutcome::Renamed => println!("renamed"),
        OperationOutcome::Deleted => println!("deleted"),
    }
}

/// Passphrase from a file, then the environment, then a stdin prompt.
fn read_passphrase(file: Option<&Path>) -> Result<String> {
    if let Some(p) = file {
        let s = std::fs::read_to_string(p)
            .with_context(|| format!("read passphrase file {}", p.display()))?;
        return Ok(s.trim_end_matches(['\r', '\n']).to_string());
    }
    if let Ok(s) = std::env::var(PASSPHRASE_ENV) {
        return Ok(s);
    }
    eprint!("Passphrase: ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let pass = line.trim_end_matches(['\r', '\n']).to_string();
    if pass.is_empty() {
        bail!("empty passphrase");
    }
    Ok(pass)
}
