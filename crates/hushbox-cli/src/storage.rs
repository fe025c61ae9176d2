use std::{path::PathBuf, sync::Arc};

use color_eyre::Result;
use dirs::data_dir;
use hushbox_core::collab::RandomCodeGenerator;
use hushbox_storage::file_record_store::FileRecordStore;
use hushbox_vault::ArtifactVault;
use tracing::debug;

use crate::config::Config;

const RECORDS_DIR: &str = "artifacts";
const AUDIT_LOG_FILE: &str = "audit.jsonl";

/// Resolve the default data directory for Hushbox.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("hushbox"))
}

fn data_root(config: &Config) -> Result<PathBuf> {
    match &config.data_dir {
        Some(root) => Ok(root.clone()),
        None => default_data_dir(),
    }
}

pub fn audit_log_path(config: &Config) -> Result<PathBuf> {
    match &config.audit_log {
        Some(path) => Ok(path.clone()),
        None => Ok(data_root(config)?.join(AUDIT_LOG_FILE)),
    }
}

/// Build the file-backed record store, honoring config overrides.
pub fn store_from_config(config: &Config) -> Result<FileRecordStore> {
    let root = data_root(config)?.join(RECORDS_DIR);
    debug!(?root, "initializing record store");
    Ok(FileRecordStore::new(root))
}

pub fn vault_from_config(config: &Config) -> Result<ArtifactVault<FileRecordStore>> {
    let settings = config.vault_settings();
    let codes = Arc::new(RandomCodeGenerator::new(settings.codes.clone()));
    ArtifactVault::new(Arc::new(store_from_config(config)?), codes, settings)
        .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))
}

/// Config rooted at a temp dir with cheap key derivation, for tests.
#[cfg(test)]
pub fn test_config(root: impl Into<PathBuf>) -> Config {
    Config {
        data_dir: Some(root.into()),
        kdf: hushbox_storage::key_derivation::KdfParams::light(),
        ..Config::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_data_dir_override() {
        let config = test_config("/srv/hushbox");
        assert_eq!(
            store_from_config(&config).unwrap().root(),
            PathBuf::from("/srv/hushbox/artifacts")
        );
        assert_eq!(
            audit_log_path(&config).unwrap(),
            PathBuf::from("/srv/hushbox/audit.jsonl")
        );
    }

    #[test]
    fn audit_log_override_wins() {
        let config = Config {
            audit_log: Some(PathBuf::from("/var/log/audit.jsonl")),
            ..test_config("/srv/hushbox")
        };
        assert_eq!(
            audit_log_path(&config).unwrap(),
            PathBuf::from("/var/log/audit.jsonl")
        );
    }
}
