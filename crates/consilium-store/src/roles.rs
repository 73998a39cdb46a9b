//! Reusable prompt roles
//!
//! Each role lives in `<roles_root>/<role_id>/metadata.json`:
//! `{"id": "...", "name": "...", "prompt": "...", "locale": "..."}`.
//! A registry profile's `role_id` selects the prompt prepended to the
//! introduction turn.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::fs;
use tracing::{debug, info, warn};

use consilium_core::{ConsiliumError, Result};

const METADATA_FILE: &str = "metadata.json";
const LEGACY_PROMPT_FILE: &str = "prompt.txt";

/// A reusable prompt role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    #[serde(rename = "id")]
    pub role_id: String,
    pub name: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMetadata {
    id: Option<String>,
    name: Option<String>,
    prompt: Option<String>,
    locale: Option<String>,
}

/// Roles loaded from disk, keyed by role id
#[derive(Debug)]
pub struct RoleCatalog {
    root: PathBuf,
    roles: RwLock<BTreeMap<String, Role>>,
}

impl RoleCatalog {
    /// Open (and create) a roles directory and load every role in it
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let catalog = Self {
            root: root.into(),
            roles: RwLock::new(BTreeMap::new()),
        };
        fs::create_dir_all(&catalog.root).await?;
        catalog.reload().await?;
        Ok(catalog)
    }

    /// Default location (`~/.consilium/roles`)
    pub fn default_root() -> Result<PathBuf> {
        Ok(crate::session::default_config_root()?.join("roles"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Re-read every role directory
    pub async fn reload(&self) -> Result<usize> {
        let mut loaded = BTreeMap::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(child) = dir.next_entry().await? {
            if !child.file_type().await?.is_dir() {
                continue;
            }
            match self.load_role(&child.path()).await {
                Ok(role) => {
                    loaded.insert(role.role_id.clone(), role);
                }
                Err(e) => warn!("Skipping role directory {}: {}", child.path().display(), e),
            }
        }

        let count = loaded.len();
        *self.roles.write().unwrap_or_else(|e| e.into_inner()) = loaded;
        debug!("Loaded {} roles from {}", count, self.root.display());
        Ok(count)
    }

    /// Roles sorted by name (case-insensitive)
    pub fn list(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self
            .roles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        roles.sort_by_key(|role| role.name.to_lowercase());
        roles
    }

    pub fn get(&self, role_id: &str) -> Option<Role> {
        self.roles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(role_id)
            .cloned()
    }

    /// Trimmed prompt of a role, `None` if unknown or blank
    pub fn prompt_for(&self, role_id: &str) -> Option<String> {
        self.get(role_id)
            .map(|role| role.prompt.trim().to_string())
            .filter(|prompt| !prompt.is_empty())
    }

    /// Create an empty role with a generated id
    pub async fn create(&self, name: &str) -> Result<Role> {
        let role = Role {
            role_id: uuid::Uuid::new_v4().simple().to_string(),
            name: name.trim().to_string(),
            prompt: String::new(),
            locale: None,
        };
        self.write(&role).await?;
        info!("Created role {} ({})", role.name, role.role_id);
        Ok(role)
    }

    pub async fn save_prompt(&self, role_id: &str, prompt: &str) -> Result<Role> {
        let mut role = self.require(role_id)?;
        role.prompt = prompt.to_string();
        self.write(&role).await?;
        Ok(role)
    }

    pub async fn rename(&self, role_id: &str, name: &str) -> Result<Role> {
        let mut role = self.require(role_id)?;
        role.name = name.trim().to_string();
        self.write(&role).await?;
        Ok(role)
    }

    pub async fn delete(&self, role_id: &str) -> Result<()> {
        self.require(role_id)?;
        let dir = self.root.join(role_id);
        if fs::try_exists(&dir).await? {
            fs::remove_dir_all(&dir).await?;
        }
        self.roles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(role_id);
        info!("Deleted role {}", role_id);
        Ok(())
    }

    fn require(&self, role_id: &str) -> Result<Role> {
        self.get(role_id)
            .ok_or_else(|| ConsiliumError::Other(format!("Unknown role '{}'", role_id)))
    }

    async fn write(&self, role: &Role) -> Result<()> {
        let dir = self.root.join(&role.role_id);
        fs::create_dir_all(&dir).await?;
        let content = serde_json::to_string_pretty(role)?;
        fs::write(dir.join(METADATA_FILE), content).await?;
        self.roles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(role.role_id.clone(), role.clone());
        Ok(())
    }

    /// Load one role directory, migrating a legacy `prompt.txt`
    async fn load_role(&self, dir: &Path) -> Result<Role> {
        let dir_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let metadata_path = dir.join(METADATA_FILE);
        let raw = if fs::try_exists(&metadata_path).await? {
            let content = fs::read_to_string(&metadata_path).await?;
            serde_json::from_str::<RawMetadata>(&content).unwrap_or_else(|e| {
                warn!("Failed to read role metadata {}: {}", metadata_path.display(), e);
                RawMetadata::default()
            })
        } else {
            RawMetadata::default()
        };

        let role_id = raw.id.filter(|id| !id.is_empty()).unwrap_or(dir_name);
        let mut needs_write = raw.name.as_deref().map_or(true, str::is_empty);
        let name = raw
            .name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("Role {}", role_id.chars().take(8).collect::<String>()));

        let legacy_path = dir.join(LEGACY_PROMPT_FILE);
        let prompt = match raw.prompt {
            Some(prompt) => prompt,
            None if fs::try_exists(&legacy_path).await? => {
                needs_write = true;
                fs::read_to_string(&legacy_path).await.unwrap_or_default()
            }
            None => String::new(),
        };

        let role = Role {
            role_id,
            name,
            prompt,
            locale: raw
                .locale
                .and_then(|l| l.split('.').next().map(str::to_string))
                .filter(|l| !l.is_empty()),
        };

        if needs_write {
            let content = serde_json::to_string_pretty(&role)?;
            fs::write(&metadata_path, content).await?;
            if fs::try_exists(&legacy_path).await? {
                if let Err(e) = fs::remove_file(&legacy_path).await {
                    warn!("Failed to remove legacy prompt file {}: {}", legacy_path.display(), e);
                }
            }
        }
        Ok(role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_save_rename_delete() {
        let dir = TempDir::new().unwrap();
        let catalog = RoleCatalog::open(dir.path()).await.unwrap();

        let role = catalog.create("Reviewer").await.unwrap();
        assert_eq!(role.role_id.len(), 32);
        assert!(catalog.prompt_for(&role.role_id).is_none());

        catalog
            .save_prompt(&role.role_id, "  You review code.  ")
            .await
            .unwrap();
        catalog.rename(&role.role_id, "Code Reviewer").await.unwrap();

        let reopened = RoleCatalog::open(dir.path()).await.unwrap();
        let loaded = reopened.get(&role.role_id).unwrap();
        assert_eq!(loaded.name, "Code Reviewer");
        assert_eq!(reopened.prompt_for(&role.role_id).as_deref(), Some("You review code."));

        reopened.delete(&role.role_id).await.unwrap();
        assert!(reopened.get(&role.role_id).is_none());
        assert!(reopened.delete(&role.role_id).await.is_err());
    }

    #[tokio::test]
    async fn test_legacy_prompt_migration() {
        let dir = TempDir::new().unwrap();
        let role_dir = dir.path().join("abcdef1234");
        std::fs::create_dir_all(&role_dir).unwrap();
        std::fs::write(role_dir.join("prompt.txt"), "Legacy prompt").unwrap();

        let catalog = RoleCatalog::open(dir.path()).await.unwrap();
        let role = catalog.get("abcdef1234").unwrap();
        assert_eq!(role.name, "Role abcdef12");
        assert_eq!(role.prompt, "Legacy prompt");
        assert!(role_dir.join("metadata.json").exists());
        assert!(!role_dir.join("prompt.txt").exists());
    }

    #[tokio::test]
    async fn test_list_sorted_by_name() {
        let dir = TempDir::new().unwrap();
        let catalog = RoleCatalog::open(dir.path()).await.unwrap();
        catalog.create("zeta").await.unwrap();
        catalog.create("Alpha").await.unwrap();
        let names: Vec<String> = catalog.list().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["Alpha", "zeta"]);
    }
}
