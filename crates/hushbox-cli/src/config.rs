use std::{
    fs,
    path::{Path, PathBuf},
};

use color_eyre::{
    eyre::{bail, WrapErr},
    Result,
};
use dirs::config_dir;
use hushbox_core::{collab::CodeSettings, retry::RetryPolicy};
use hushbox_dispatch::DispatchSettings;
use hushbox_guard::rate_limit::RateLimitSettings;
use hushbox_storage::key_derivation::KdfParams;
use hushbox_vault::VaultSettings;
use serde::{Deserialize, Serialize};

/// Shorter minted codes are too easy to enumerate.
const MIN_CODE_LENGTH: usize = 4;

/// Configuration loaded from `~/.config/hushbox/config.toml` (platform-specific).
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Override for the data directory holding artifact records.
    pub data_dir: Option<PathBuf>,
    /// Override for the audit log file.
    pub audit_log: Option<PathBuf>,
    pub kdf: KdfParams,
    pub rate_limit: RateLimitSettings,
    pub ttl: TtlConfig,
    pub codes: CodeSettings,
    pub store_retry: RetryPolicy,
    pub dispatch: DispatchSettings,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct TtlConfig {
    /// Used when a request carries no TTL hint.
    pub default_secs: u64,
    pub max_secs: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        let vault = VaultSettings::default();
        Self {
            default_secs: vault.default_ttl_secs,
            max_secs: vault.max_ttl_secs,
        }
    }
}

impl Config {
    pub fn vault_settings(&self) -> VaultSettings {
        VaultSettings {
            default_ttl_secs: self.ttl.default_secs,
            max_ttl_secs: self.ttl.max_secs,
            kdf: self.kdf,
            codes: self.codes.clone(),
            store_retry: self.store_retry,
            ..VaultSettings::default()
        }
    }

    /// Reject settings that would quietly switch off a protection.
    pub fn validate(&self) -> Result<()> {
        if self.codes.length < MIN_CODE_LENGTH {
            bail!("codes.length must be at least {MIN_CODE_LENGTH}");
        }
        if self.rate_limit.window_secs == 0 {
            bail!("rate_limit.window_secs must be positive");
        }
        if self.rate_limit.max_operations == 0 {
            bail!("rate_limit.max_operations must be positive");
        }
        if self.ttl.default_secs == 0 || self.ttl.default_secs > self.ttl.max_secs {
            bail!("ttl.default_secs must be between 1 and ttl.max_secs");
        }
        Ok(())
    }
}

/// Load config from a given path; if missing or empty, return defaults.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = toml::from_str(&contents)?;
    cfg.validate()
        .wrap_err_with(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Resolve the default config path (platform aware).
pub fn default_path() -> Result<PathBuf> {
    let base = config_dir().ok_or_else(|| color_eyre::eyre::eyre!("no config dir available"))?;
    Ok(base.join("hushbox").join("config.toml"))
}

/// Write `config` to `path`, creating parent directories as needed. An existing
/// file is left untouched so user edits are never clobbered.
pub fn write_if_missing(config: &Config, path: &Path) -> Result<PathBuf> {
    if path.exists() {
        return Ok(path.to_path_buf());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let body = toml::to_string_pretty(config)?;
    fs::write(path, body)?;
    Ok(path.to_path_buf())
}
