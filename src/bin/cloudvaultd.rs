use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use cloudvault::cli::{DaemonCli, DaemonCommand, ProvisionOpts, ServeOpts};
use cloudvault::config::load_server_config;
use cloudvault::log::TransferLog;
use cloudvault::logger::{Logger, TextLogger};
use cloudvault::pki::{
    self, provision, server_cert_path, server_key_path, users_dir, ProvisionOptions,
    ProvisionUser, ServerIdentity, TrustStore,
};
use cloudvault::protocol::timeouts;
use cloudvault::registry::IdentityRegistry;
use cloudvault::server::{serve, ServerContext};

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\nShutting down cloudvaultd (Ctrl-C)...");
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    match DaemonCli::parse().command {
        DaemonCommand::Serve(opts) => serve_main(opts),
        DaemonCommand::Provision(opts) => provision_main(opts),
    }
}

fn serve_main(opts: ServeOpts) -> Result<()> {
    let mut cfg = load_server_config(opts.config.as_deref())?;
    if let Some(b) = opts.bind {
        cfg.bind = b;
    }
    if let Some(r) = opts.root {
        cfg.data_root = r;
    }
    if let Some(d) = opts.pki_dir {
        cfg.pki_dir = d;
    }
    if let Some(t) = opts.timeout {
        cfg.io_timeout_secs = t;
    }
    if opts.log_file.is_some() {
        cfg.log_file = opts.log_file;
    }
    if opts.no_journal {
        cfg.journal = false;
    }

    std::fs::create_dir_all(&cfg.data_root)
        .with_context(|| format!("create data root {}", cfg.data_root.display()))?;
    let data_root = std::fs::canonicalize(&cfg.data_root)
        .with_context(|| format!("Failed to canonicalize root path: {}", cfg.data_root.display()))?;

    let identity = ServerIdentity::load(
        &server_cert_path(&cfg.pki_dir),
        &server_key_path(&cfg.pki_dir),
    )
    .context("Failed to load server identity (run `cloudvaultd provision` first)")?;
    let registry = IdentityRegistry::load_dir(&users_dir(&cfg.pki_dir))
        .context("Failed to load user roster")?;
    if registry.is_empty() {
        eprintln!(
            "WARNING: no users under {}; every login will be refused",
            users_dir(&cfg.pki_dir).display()
        );
    }

    let logger: Arc<dyn Logger> = match &cfg.log_file {
        Some(p) => Arc::new(
            TextLogger::new(p).with_context(|| format!("open log file {}", p.display()))?,
        ),
        None => Arc::new(TextLogger::stderr()),
    };

    println!("Starting CloudVault daemon:");
    println!("  Root:  {}", data_root.display());
    println!("  Bind:  {}", cfg.bind);
    let mut names: Vec<&str> = registry.usernames().collect();
    names.sort_unstable();
    println!("  Users: {}", names.join(", "));
    if cfg.bind.starts_with("0.0.0.0") {
        eprintln!("WARNING: Binding to 0.0.0.0 exposes the daemon to all network interfaces");
    }

    let mut ctx = ServerContext::new(identity, registry, data_root.clone(), logger);
    ctx.io_timeout = timeouts::io_timeout(cfg.io_timeout_secs);
    if cfg.journal {
        let journal = TransferLog::new(&data_root);
        println!("  Journal: {}", journal.path().display());
        ctx.journal = Some(journal);
    }
    serve(&cfg.bind, Arc::new(ctx))
}

fn provision_main(opts: ProvisionOpts) -> Result<()> {
    let dir = opts.dir.unwrap_or_else(pki::config_dir);
    std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let users: Vec<ProvisionUser> = opts
        .users
        .into_iter()
        .map(|(name, passphrase)| ProvisionUser { name, passphrase })
        .collect();
    provision(
        &dir,
        &users,
        &ProvisionOptions {
            server_names: opts.server_names,
            revoke_server: opts.revoke_server,
        },
    )?;

    let trust = TrustStore::from_dir(&dir).context("re-read provisioned trust anchors")?;
    println!("Provisioned {} in {}", users.len(), dir.display());
    println!("  CA fingerprint (SHA-256): {}", trust.ca_fingerprint());
    for u in &users {
        println!("  user {}", u.name);
    }
    Ok(())
}
