//! Local credential file
//!
//! `shareport login` writes the approved identity to ~/.shareport/config.json;
//! `share` and `watch` read it, `logout` removes it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const CONFIG_DIR: &str = ".shareport";
const CONFIG_FILE: &str = "config.json";

/// Identity saved after a successful device login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub user_id: Uuid,
    /// Placeholder credential presented to the store API
    pub token: String,
}

impl Credentials {
    pub fn for_user(user_id: Uuid) -> Self {
        Self {
            user_id,
            token: user_id.to_string(),
        }
    }
}

/// Location of the credential file
#[derive(Debug, Clone)]
pub struct CredentialsStore {
    path: PathBuf,
}

impl CredentialsStore {
    /// `~/.shareport/config.json`
    pub fn default_location() -> Result<Self> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(Self::with_base_dir(home.join(CONFIG_DIR)))
    }

    pub fn with_base_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            path: dir.into().join(CONFIG_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saved credentials, `None` when logged out
    pub fn load(&self) -> Result<Option<Credentials>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let json = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read config file: {:?}", self.path))?;
        let credentials = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config file: {:?}", self.path))?;
        Ok(Some(credentials))
    }

    pub fn save(&self, credentials: &Credentials) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let json =
            serde_json::to_string_pretty(credentials).context("Failed to serialize credentials")?;
        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write config file: {:?}", self.path))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))
                .with_context(|| format!("Failed to restrict config file: {:?}", self.path))?;
        }

        Ok(())
    }

    /// Remove saved credentials; returns whether any existed
    pub fn clear(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to remove config file: {:?}", self.path))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_logged_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialsStore::with_base_dir(dir.path());
        assert_eq!(store.load().unwrap(), None);
        assert!(!store.clear().unwrap());
    }

    #[test]
    fn test_save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialsStore::with_base_dir(dir.path().join("nested"));
        let credentials = Credentials::for_user(Uuid::new_v4());

        store.save(&credentials).unwrap();
        assert_eq!(store.load().unwrap(), Some(credentials));

        assert!(store.clear().unwrap());
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_file_uses_camel_case_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialsStore::with_base_dir(dir.path());
        let user_id = Uuid::new_v4();
        store.save(&Credentials::for_user(user_id)).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["userId"], user_id.to_string());
        assert_eq!(raw["token"], user_id.to_string());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialsStore::with_base_dir(dir.path());
        fs::write(store.path(), "{not json").unwrap();
        assert!(store.load().is_err());
    }
}
