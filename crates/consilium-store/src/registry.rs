//! Agent registry
//!
//! Members are described by immutable descriptors plus user overrides, both
//! persisted in one JSON settings file:
//!
//! ```json
//! { "members": [ { "id": "codex", "handler": "codex", "display_name": "Codex",
//!                  "default_executable": "codex", "overrides": { "enabled": false } } ] }
//! ```
//!
//! Every mutation is written back immediately and broadcast as a
//! [`RegistryEvent`].

use consilium_core::{ConsiliumError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, trace, warn};

const EVENT_CAPACITY: usize = 64;

/// Stable description of an agent member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    #[serde(rename = "id", alias = "agent_id")]
    pub agent_id: String,
    /// Backend id (`codex`, `claude`, `gemini`)
    pub handler: String,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    pub default_executable: String,
    #[serde(default)]
    pub default_enabled: bool,
    #[serde(default)]
    pub default_role: Option<String>,
}

impl AgentDescriptor {
    pub fn new(
        agent_id: impl Into<String>,
        handler: impl Into<String>,
        display_name: impl Into<String>,
        default_executable: impl Into<String>,
    ) -> Self {
        let display_name = display_name.into();
        Self {
            agent_id: agent_id.into(),
            handler: handler.into(),
            description: format!("Agent '{}'", display_name),
            display_name,
            default_executable: default_executable.into(),
            default_enabled: true,
            default_role: None,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.default_enabled = enabled;
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.default_role = Some(role.into());
        self
    }
}

/// Per-workspace user overrides; `None` falls back to the descriptor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
}

impl AgentOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Default::default()
        }
    }

    /// Apply every field set in `patch`, returning the names of changed fields
    pub fn apply(&mut self, patch: &AgentOverrides) -> Vec<&'static str> {
        let mut changed = Vec::new();
        macro_rules! merge {
            ($field:ident) => {
                if patch.$field.is_some() && patch.$field != self.$field {
                    self.$field = patch.$field.clone();
                    changed.push(stringify!($field));
                }
            };
        }
        merge!(enabled);
        merge!(command_path);
        merge!(role_id);
        merge!(display_name);
        merge!(description);
        merge!(backend_id);
        changed
    }
}

/// Descriptor with overrides resolved
#[derive(Debug, Clone, PartialEq)]
pub struct AgentProfile {
    pub descriptor: AgentDescriptor,
    pub overrides: AgentOverrides,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl AgentProfile {
    pub fn new(descriptor: AgentDescriptor, overrides: AgentOverrides) -> Self {
        Self {
            descriptor,
            overrides,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.descriptor.agent_id
    }

    pub fn display_name(&self) -> String {
        non_blank(&self.overrides.display_name)
            .unwrap_or_else(|| self.descriptor.display_name.trim())
            .to_string()
    }

    pub fn description(&self) -> String {
        non_blank(&self.overrides.description)
            .unwrap_or_else(|| self.descriptor.description.trim())
            .to_string()
    }

    /// Explicit command path override, else the default executable
    pub fn command_path(&self) -> String {
        non_blank(&self.overrides.command_path)
            .unwrap_or_else(|| self.descriptor.default_executable.trim())
            .to_string()
    }

    pub fn is_enabled(&self) -> bool {
        self.overrides
            .enabled
            .unwrap_or(self.descriptor.default_enabled)
    }

    pub fn backend_id(&self) -> Option<String> {
        non_blank(&self.overrides.backend_id)
            .or_else(|| Some(self.descriptor.handler.trim()).filter(|h| !h.is_empty()))
            .map(str::to_string)
    }

    pub fn role_id(&self) -> Option<String> {
        non_blank(&self.overrides.role_id)
            .or_else(|| non_blank(&self.descriptor.default_role))
            .map(str::to_string)
    }

    /// Legacy names an agent's session may have been stored under
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases = vec![self.display_name()];
        if self.descriptor.display_name != aliases[0] {
            aliases.push(self.descriptor.display_name.clone());
        }
        aliases
    }
}

/// Change notification emitted by the registry
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Loaded { count: usize },
    ProfileCreated { profile: AgentProfile },
    ProfileUpdated { profile: AgentProfile, changes: Vec<String> },
    ProfileRemoved { agent_id: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemberEntry {
    #[serde(flatten)]
    descriptor: AgentDescriptor,
    #[serde(default, skip_serializing_if = "AgentOverrides::is_empty")]
    overrides: AgentOverrides,
}

/// Built-in members used when the settings file defines none
pub fn default_descriptors() -> Vec<AgentDescriptor> {
    vec![
        AgentDescriptor::new("codex", "codex", "Codex", "codex"),
        AgentDescriptor::new("claude", "claude", "Claude", "claude"),
        AgentDescriptor::new("gemini", "gemini", "Gemini", "gemini"),
    ]
}

fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    for c in value.trim().to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}

/// Event-driven agent store
pub struct AgentRegistry {
    settings_path: PathBuf,
    profiles: RwLock<Vec<AgentProfile>>,
    /// Top-level settings keys other than `members`, preserved on write
    extra_settings: RwLock<Map<String, Value>>,
    write_lock: Mutex<()>,
    events: broadcast::Sender<RegistryEvent>,
}

impl AgentRegistry {
    pub fn new(settings_path: impl Into<PathBuf>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            settings_path: settings_path.into(),
            profiles: RwLock::new(Vec::new()),
            extra_settings: RwLock::new(Map::new()),
            write_lock: Mutex::new(()),
            events,
        }
    }

    /// Registry backed by `<workspace>/.consilium/settings.json`
    pub fn for_workspace(workspace: &Path) -> Self {
        Self::new(workspace.join(".consilium").join("settings.json"))
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    /// Subscribe to change events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Load profiles from settings and emit `Loaded`
    pub async fn load(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;

        let mut settings = self.read_settings().await;
        let members = settings.remove("members");

        let mut profiles = Vec::new();
        match members {
            Some(Value::Array(entries)) => {
                for raw in entries {
                    match serde_json::from_value::<MemberEntry>(raw) {
                        Ok(entry) if !entry.descriptor.agent_id.trim().is_empty() => {
                            trace!("Registry loaded profile {}", entry.descriptor.agent_id);
                            profiles.push(AgentProfile::new(entry.descriptor, entry.overrides));
                        }
                        Ok(_) => warn!("Skipping member entry with empty id"),
                        Err(e) => warn!("Skipping malformed member entry: {}", e),
                    }
                }
            }
            Some(other) => warn!("Settings `members` is not a list: {}", other),
            None => {}
        }

        let seeded = profiles.is_empty();
        if seeded {
            info!("No members configured, using defaults");
            profiles = default_descriptors()
                .into_iter()
                .map(|d| AgentProfile::new(d, AgentOverrides::default()))
                .collect();
        }

        let count = profiles.len();
        *self.profiles.write().unwrap_or_else(|e| e.into_inner()) = profiles;
        *self.extra_settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
        if seeded {
            self.write_settings().await?;
        }

        info!("Registry loaded {} members", count);
        self.emit(RegistryEvent::Loaded { count });
        Ok(count)
    }

    /// Current snapshot of profiles, in registration order
    pub fn list_profiles(&self) -> Vec<AgentProfile> {
        self.profiles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn get_profile(&self, agent_id: &str) -> Option<AgentProfile> {
        self.profiles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|p| p.agent_id() == agent_id)
            .cloned()
    }

    /// Insert or replace a profile
    pub async fn upsert_profile(
        &self,
        descriptor: AgentDescriptor,
        overrides: AgentOverrides,
    ) -> Result<AgentProfile> {
        let _guard = self.write_lock.lock().await;
        let profile = AgentProfile::new(descriptor, overrides);

        let existed = {
            let mut profiles = self.profiles.write().unwrap_or_else(|e| e.into_inner());
            match profiles.iter_mut().find(|p| p.agent_id() == profile.agent_id()) {
                Some(existing) => {
                    *existing = profile.clone();
                    true
                }
                None => {
                    profiles.push(profile.clone());
                    false
                }
            }
        };
        self.write_settings().await?;

        if existed {
            self.emit(RegistryEvent::ProfileUpdated {
                profile: profile.clone(),
                changes: Vec::new(),
            });
        } else {
            self.emit(RegistryEvent::ProfileCreated {
                profile: profile.clone(),
            });
        }
        Ok(profile)
    }

    /// Create a new member with an id derived from its display name
    pub async fn create_member(
        &self,
        display_name: &str,
        handler: &str,
        default_executable: &str,
    ) -> Result<AgentProfile> {
        let base = match slugify(display_name) {
            slug if slug.is_empty() => "agent".to_string(),
            slug => slug,
        };
        let agent_id = {
            let profiles = self.profiles.read().unwrap_or_else(|e| e.into_inner());
            let mut candidate = base.clone();
            let mut suffix = 2;
            while profiles.iter().any(|p| p.agent_id() == candidate) {
                candidate = format!("{}-{}", base, suffix);
                suffix += 1;
            }
            candidate
        };

        let descriptor = AgentDescriptor::new(agent_id, handler, display_name, default_executable)
            .with_enabled(false);
        self.upsert_profile(descriptor, AgentOverrides::default())
            .await
    }

    /// Merge override fields into an existing profile
    pub async fn patch_overrides(
        &self,
        agent_id: &str,
        patch: AgentOverrides,
    ) -> Result<AgentProfile> {
        let _guard = self.write_lock.lock().await;

        let (profile, changes) = {
            let mut profiles = self.profiles.write().unwrap_or_else(|e| e.into_inner());
            let profile = profiles
                .iter_mut()
                .find(|p| p.agent_id() == agent_id)
                .ok_or_else(|| ConsiliumError::AgentNotFound(agent_id.to_string()))?;
            let changes: Vec<String> = profile
                .overrides
                .apply(&patch)
                .into_iter()
                .map(str::to_string)
                .collect();
            (profile.clone(), changes)
        };

        if changes.is_empty() {
            return Ok(profile);
        }

        trace!("Registry patch overrides {}: {:?}", agent_id, changes);
        self.write_settings().await?;
        self.emit(RegistryEvent::ProfileUpdated {
            profile: profile.clone(),
            changes,
        });
        Ok(profile)
    }

    /// Enable or disable a member
    pub async fn set_enabled(&self, agent_id: &str, enabled: bool) -> Result<AgentProfile> {
        self.patch_overrides(agent_id, AgentOverrides::enabled(enabled))
            .await
    }

    /// Remove a profile; returns false if it did not exist
    pub async fn remove_profile(&self, agent_id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let removed = {
            let mut profiles = self.profiles.write().unwrap_or_else(|e| e.into_inner());
            let before = profiles.len();
            profiles.retain(|p| p.agent_id() != agent_id);
            profiles.len() != before
        };

        if !removed {
            warn!("Attempted to remove unknown agent '{}'", agent_id);
            return Ok(false);
        }

        self.write_settings().await?;
        self.emit(RegistryEvent::ProfileRemoved {
            agent_id: agent_id.to_string(),
        });
        Ok(true)
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    async fn read_settings(&self) -> Map<String, Value> {
        let content = match tokio::fs::read_to_string(&self.settings_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Map::new(),
            Err(e) => {
                warn!("Failed to read settings file: {}", e);
                return Map::new();
            }
        };
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                warn!("Settings file is not a JSON object, ignoring");
                Map::new()
            }
            Err(e) => {
                warn!("Failed to parse settings file: {}", e);
                Map::new()
            }
        }
    }

    async fn write_settings(&self) -> Result<()> {
        let mut settings = self
            .extra_settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let members: Vec<MemberEntry> = self
            .list_profiles()
            .into_iter()
            .map(|p| MemberEntry {
                descriptor: p.descriptor,
                overrides: p.overrides,
            })
            .collect();
        settings.insert("members".to_string(), serde_json::to_value(&members)?);

        if let Some(parent) = self.settings_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(&Value::Object(settings))?;
        tokio::fs::write(&self.settings_path, content)
            .await
            .map_err(|e| ConsiliumError::Registry(format!("Failed to write settings: {}", e)))?;
        debug!("Registry wrote settings ({} members)", members.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(temp: &TempDir) -> AgentRegistry {
        AgentRegistry::new(temp.path().join("settings.json"))
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("  My Agent!! "), "my-agent");
        assert_eq!(slugify("***"), "");
    }

    #[test]
    fn test_profile_resolution() {
        let descriptor = AgentDescriptor::new("codex", "codex", "Codex", "codex").with_role("dev");
        let mut profile = AgentProfile::new(descriptor, AgentOverrides::default());
        assert_eq!(profile.display_name(), "Codex");
        assert_eq!(profile.command_path(), "codex");
        assert_eq!(profile.role_id().as_deref(), Some("dev"));
        assert!(profile.is_enabled());

        profile.overrides.display_name = Some("Rex".to_string());
        profile.overrides.command_path = Some("  ~/bin/codex ".to_string());
        profile.overrides.enabled = Some(false);
        profile.overrides.backend_id = Some("  ".to_string());
        assert_eq!(profile.display_name(), "Rex");
        assert_eq!(profile.command_path(), "~/bin/codex");
        assert!(!profile.is_enabled());
        assert_eq!(profile.backend_id().as_deref(), Some("codex"));
        assert_eq!(profile.aliases(), vec!["Rex".to_string(), "Codex".to_string()]);
    }

    #[test]
    fn test_overrides_apply_reports_changes() {
        let mut overrides = AgentOverrides::enabled(true);
        let changes = overrides.apply(&AgentOverrides {
            enabled: Some(true),
            role_id: Some("reviewer".to_string()),
            ..Default::default()
        });
        assert_eq!(changes, vec!["role_id"]);
    }

    #[tokio::test]
    async fn test_load_seeds_defaults() {
        let temp = TempDir::new().unwrap();
        let registry = registry(&temp);
        let mut events = registry.subscribe();

        assert_eq!(registry.load().await.unwrap(), 3);
        let ids: Vec<_> = registry
            .list_profiles()
            .iter()
            .map(|p| p.agent_id().to_string())
            .collect();
        assert_eq!(ids, vec!["codex", "claude", "gemini"]);
        assert!(temp.path().join("settings.json").exists());
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::Loaded { count: 3 }
        ));
    }

    #[tokio::test]
    async fn test_overrides_persist_across_reload() {
        let temp = TempDir::new().unwrap();
        let registry = registry(&temp);
        registry.load().await.unwrap();

        registry.set_enabled("claude", false).await.unwrap();

        let reloaded = AgentRegistry::new(temp.path().join("settings.json"));
        reloaded.load().await.unwrap();
        let claude = reloaded.get_profile("claude").unwrap();
        assert!(!claude.is_enabled());
        assert!(reloaded.get_profile("codex").unwrap().is_enabled());
    }

    #[tokio::test]
    async fn test_malformed_members_skipped_and_extra_keys_kept() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"theme": "dark", "members": [
                {"id": "codex", "handler": "codex", "display_name": "Codex", "default_executable": "codex"},
                {"display_name": "Broken"}
            ]}"#,
        )
        .unwrap();

        let registry = AgentRegistry::new(&path);
        assert_eq!(registry.load().await.unwrap(), 1);
        registry.set_enabled("codex", true).await.unwrap();

        let written: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["theme"], "dark");
        assert_eq!(written["members"][0]["overrides"]["enabled"], true);
    }

    #[tokio::test]
    async fn test_create_patch_remove_events() {
        let temp = TempDir::new().unwrap();
        let registry = registry(&temp);
        registry.load().await.unwrap();
        let mut events = registry.subscribe();

        let profile = registry
            .create_member("Codex", "codex", "/opt/codex")
            .await
            .unwrap();
        assert_eq!(profile.agent_id(), "codex-2");
        assert!(!profile.is_enabled());
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::ProfileCreated { .. }
        ));

        registry.set_enabled("codex-2", true).await.unwrap();
        match events.recv().await.unwrap() {
            RegistryEvent::ProfileUpdated { profile, changes } => {
                assert!(profile.is_enabled());
                assert_eq!(changes, vec!["enabled".to_string()]);
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert!(registry.remove_profile("codex-2").await.unwrap());
        assert!(!registry.remove_profile("codex-2").await.unwrap());
        assert!(matches!(
            events.recv().await.unwrap(),
            RegistryEvent::ProfileRemoved { agent_id } if agent_id == "codex-2"
        ));
    }

    #[tokio::test]
    async fn test_patch_unknown_agent() {
        let temp = TempDir::new().unwrap();
        let registry = registry(&temp);
        registry.load().await.unwrap();
        let err = registry.set_enabled("nobody", true).await.unwrap_err();
        assert!(matches!(err, ConsiliumError::AgentNotFound(_)));
    }
}
