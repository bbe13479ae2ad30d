//! Read-only roster of known users and their long-term public keys

use anyhow::{Context, Result};
use p256::ecdsa::VerifyingKey;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::pki::{load_public_key, user_public_key_path};
use crate::protocol::MAX_USERNAME_LEN;
use crate::protocol_core::validate_file_name;

/// Built once at startup and shared (behind an `Arc`) by every connection
/// thread. Never mutated after construction.
#[derive(Debug, Clone, Default)]
pub struct IdentityRegistry {
    users: HashMap<String, VerifyingKey>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `<users_dir>/<name>/public.pem`. Directories without a
    /// public key are skipped.
    pub fn load_dir(users_dir: &Path) -> Result<Self> {
        let mut users = HashMap::new();
        let entries = fs::read_dir(users_dir)
            .with_context(|| format!("read users dir {}", users_dir.display()))?;
        for entry in entries {
            let entry = entry.context("read users dir entry")?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.len() > MAX_USERNAME_LEN || validate_file_name(&name).is_err() {
                continue;
            }
            let key_path = user_public_key_path(users_dir, &name);
            if !key_path.exists() {
                continue;
            }
            let key = load_public_key(&key_path)
                .with_context(|| format!("load public key for {}", name))?;
            users.insert(name, key);
        }
        Ok(Self { users })
    }

    pub fn lookup(&self, username: &str) -> Option<&VerifyingKey> {
        self.users.get(username)
    }

    pub fn contains(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn usernames(&self) -> impl Iterator<Item = &str> {
        self.users.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::{provision, users_dir, ProvisionOptions, ProvisionUser};
    use tempfile::TempDir;

    #[test]
    fn test_load_provisioned_users() {
        let tmp = TempDir::new().unwrap();
        let users = vec![
            ProvisionUser {
                name: "alice".into(),
                passphrase: "a".into(),
            },
            ProvisionUser {
                name: "bob".into(),
                passphrase: "b".into(),
            },
        ];
        provision(tmp.path(), &users, &ProvisionOptions::default()).unwrap();
        // stray directory without a key
        std::fs::create_dir_all(users_dir(tmp.path()).join("carol")).unwrap();

        let reg = IdentityRegistry::load_dir(&users_dir(tmp.path())).unwrap();
        assert_eq!(reg.len(), 2);
        assert!(reg.contains("alice"));
        assert!(reg.lookup("bob").is_some());
        assert!(!reg.contains("carol"));
        assert!(reg.lookup("mallory").is_none());
    }

    #[test]
    fn test_missing_users_dir_is_error() {
        let tmp = TempDir::new().unwrap();
        assert!(IdentityRegistry::load_dir(&tmp.path().join("nope")).is_err());
    }
}
