//! Collaborators consumed by the vault: owner-scope resolution and minting of
//! lookup keys / secret codes.

use std::collections::BTreeSet;

use async_trait::async_trait;
use rand::{rngs::OsRng, Rng};
use serde::{Deserialize, Serialize};

use crate::error::VaultError;

/// Characters used in minted codes: uppercase and digits without look-alikes
/// (0/O, 1/I/L).
pub const CODE_ALPHABET: &[u8] = b"23456789ABCDEFGHJKMNPQRSTUVWXYZ";

/// Shape of minted codes, e.g. `DR-7F3K9Q`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CodeSettings {
    pub prefix: String,
    pub length: usize,
}

impl Default for CodeSettings {
    fn default() -> Self {
        Self {
            prefix: "DR-".to_string(),
            length: 6,
        }
    }
}

impl CodeSettings {
    /// Whether `code` could have been produced by a generator with these settings.
    pub fn matches(&self, code: &str) -> bool {
        code.strip_prefix(self.prefix.as_str())
            .map(|body| {
                body.len() == self.length && body.bytes().all(|b| CODE_ALPHABET.contains(&b))
            })
            .unwrap_or(false)
    }
}

/// Produces collision-resistant public codes.
pub trait CodeGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Generator backed by the OS RNG.
#[derive(Debug, Clone, Default)]
pub struct RandomCodeGenerator {
    settings: CodeSettings,
}

impl RandomCodeGenerator {
    pub fn new(settings: CodeSettings) -> Self {
        Self { settings }
    }
}

impl CodeGenerator for RandomCodeGenerator {
    fn generate(&self) -> String {
        let mut rng = OsRng;
        let body: String = (0..self.settings.length)
            .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        format!("{}{}", self.settings.prefix, body)
    }
}

/// Resolves the organization an artifact belongs to from what the upstream
/// authenticated session claims.
#[async_trait]
pub trait OwnerScopeResolver: Send + Sync {
    async fn resolve(&self, claimed: &str) -> Result<String, VaultError>;
}

/// Resolver that accepts scopes from a fixed allow-list. An empty list accepts
/// any non-empty scope.
#[derive(Debug, Clone, Default)]
pub struct AllowListScopeResolver {
    allowed: BTreeSet<String>,
}

impl AllowListScopeResolver {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl OwnerScopeResolver for AllowListScopeResolver {
    async fn resolve(&self, claimed: &str) -> Result<String, VaultError> {
        let scope = claimed.trim();
        if scope.is_empty() {
            return Err(VaultError::validation("owner scope is required"));
        }
        if !self.allowed.is_empty() && !self.allowed.contains(scope) {
            return Err(VaultError::validation("unknown owner scope"));
        }
        Ok(scope.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn generated_codes_match_their_settings() {
        let generator = RandomCodeGenerator::default();
        let settings = CodeSettings::default();
        for _ in 0..100 {
            let code = generator.generate();
            assert!(settings.matches(&code), "unexpected code {code}");
        }
    }

    #[test]
    fn generated_codes_do_not_repeat() {
        let generator = RandomCodeGenerator::new(CodeSettings {
            prefix: "DR-".into(),
            length: 10,
        });
        let codes: HashSet<String> = (0..1000).map(|_| generator.generate()).collect();
        assert_eq!(codes.len(), 1000);
    }

    #[test]
    fn matches_rejects_foreign_shapes() {
        let settings = CodeSettings::default();
        assert!(settings.matches("DR-7F3K9Q"));
        assert!(!settings.matches("DR-7F3K9"));
        assert!(!settings.matches("XX-7F3K9Q"));
        assert!(!settings.matches("DR-7F3K0Q"));
        assert!(!settings.matches("dr-7f3k9q"));
    }

    #[tokio::test]
    async fn allow_list_resolver_enforces_membership() {
        let resolver = AllowListScopeResolver::new(["org-1"]);
        assert_eq!(resolver.resolve(" org-1 ").await.unwrap(), "org-1");
        assert!(matches!(
            resolver.resolve("org-2").await,
            Err(VaultError::Validation { .. })
        ));
        assert!(matches!(
            resolver.resolve("  ").await,
            Err(VaultError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn empty_allow_list_accepts_any_scope() {
        let resolver = AllowListScopeResolver::default();
        assert_eq!(resolver.resolve("org-9").await.unwrap(), "org-9");
    }
}
