mod cli;
mod config;
mod serve;
mod storage;

use std::path::{Path, PathBuf};

use crate::cli::{AuditCommand, ConfigCommand};
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use hushbox_core::storage::RecordStore;
use hushbox_guard::audit::verify_chain;
use hushbox_vault::{ArtifactVault, NewArtifact};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use zeroize::Zeroizing;

/// Entry point wiring the CLI to the vault.
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => config::default_path()?,
    };
    let config = config::load_from_path(&config_path)?;
    match cli.command {
        cli::Command::Serve { identity } => serve::run_serve(&config, identity).await?,
        cli::Command::Request { json, identity } => {
            serve::run_request(&config, &json, identity).await?
        }
        cli::Command::Sweep => run_sweep(&config).await?,
        cli::Command::Audit(AuditCommand::Verify { path }) => run_audit_verify(&config, path)?,
        cli::Command::Health => run_health_check(&config).await?,
        cli::Command::Config(ConfigCommand::Init) => init_config(&config_path)?,
        cli::Command::Version => print_version(),
    }

    Ok(())
}

fn init_tracing() {
    // Stdout carries responses; logs go to stderr.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("hushbox {}", env!("CARGO_PKG_VERSION"));
}

async fn run_sweep(config: &config::Config) -> Result<()> {
    let vault = storage::vault_from_config(config)?;
    let removed = vault
        .sweep_expired()
        .await
        .map_err(|e| eyre!(e.to_string()))?;
    println!("Removed {removed} expired artifact(s)");
    Ok(())
}

fn run_audit_verify(config: &config::Config, path: Option<PathBuf>) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => storage::audit_log_path(config)?,
    };
    let report = verify_chain(&path).map_err(|e| eyre!("{}: {e}", path.display()))?;
    println!(
        "Audit log ok: {} entries, head {}",
        report.entries, report.head_hash
    );
    Ok(())
}

/// Runs a save/resume/delete check against the configured record store.
async fn run_health_check(config: &config::Config) -> Result<()> {
    let vault = storage::vault_from_config(config)?;
    run_vault_health(&vault).await?;
    println!("Storage: ok");
    Ok(())
}

async fn run_vault_health<S: RecordStore + 'static>(vault: &ArtifactVault<S>) -> Result<()> {
    let payload = b"ok";
    let created = vault
        .create(NewArtifact {
            owner_scope_id: "health".into(),
            plaintext: Zeroizing::new(payload.to_vec()),
            ttl: chrono::Duration::minutes(5),
            position: None,
            secret_code: None,
        })
        .await
        .map_err(|e| eyre!(e.to_string()))?;
    let opened = vault
        .read(&created.lookup_key, &created.lookup_key)
        .await
        .map_err(|e| eyre!(e.to_string()));
    let removed = vault
        .delete(&created.lookup_key)
        .await
        .map_err(|e| eyre!(e.to_string()))?;

    let opened = opened?;
    if opened.plaintext.as_slice() != payload || removed.is_none() {
        color_eyre::eyre::bail!("storage round-trip failed");
    }
    Ok(())
}

fn init_config(path: &Path) -> Result<()> {
    let path = config::write_if_missing(&config::Config::default(), path)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}
