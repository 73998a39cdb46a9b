//! Agent session and chat history persistence
//!
//! Layout under `<config_root>/workspaces/<hash>/`:
//! - `agents/<agent_id>.json` one session record per agent
//! - `history.jsonl` append-only chat history
//! - `logs/` per-run log files

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use consilium_core::{ConsiliumError, ReplyRef, Result};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, trace, warn};

/// Lines scanned first when looking for the last message id
const LAST_ID_FAST_SCAN: usize = 256;

/// Persisted resume state of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSession {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message_count: u64,
}

impl AgentSession {
    pub fn fresh() -> Self {
        Self {
            session_id: None,
            created_at: Utc::now(),
            last_message_at: None,
            message_count: 0,
        }
    }
}

/// Author role of a history record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRole {
    User,
    Assistant,
    #[serde(other)]
    System,
}

/// One line of `history.jsonl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub role: HistoryRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub msg_id: Option<u64>,
    #[serde(default, alias = "replyto", skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyRef>,
}

impl HistoryRecord {
    pub fn new(role: HistoryRole, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            role,
            content: content.into(),
            agent: None,
            display_name: None,
            msg_id: None,
            reply_to: None,
        }
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_msg_id(mut self, msg_id: u64) -> Self {
        self.msg_id = Some(msg_id);
        self
    }

    pub fn with_reply_to(mut self, reply_to: Option<ReplyRef>) -> Self {
        self.reply_to = reply_to;
        self
    }
}

/// Accept message ids written either as numbers or as digit strings
fn lenient_id<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_as_id))
}

fn value_as_id(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Session persistence interface consumed by the dispatch layer and courier
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the session of an agent, falling back to legacy alias records
    async fn load_session(&self, agent_id: &str, aliases: &[String]) -> Result<AgentSession>;

    /// Persist the session id and message counter of an agent
    async fn save_session(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
        message_count: u64,
    ) -> Result<()>;

    /// Load the persisted chat history, oldest first
    async fn load_history(&self) -> Result<Vec<HistoryRecord>>;

    /// Append one record to the chat history
    async fn append_to_history(&self, record: HistoryRecord) -> Result<()>;

    /// Highest message id in the persisted history (0 when empty)
    async fn last_message_id(&self) -> Result<u64>;
}

/// Hash of a workspace path used as its session directory name
pub fn workspace_hash(workspace: &Path) -> String {
    let digest = Sha256::digest(workspace.to_string_lossy().as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Default configuration root (`~/.consilium`)
pub fn default_config_root() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".consilium"))
        .ok_or_else(|| ConsiliumError::Session("Cannot determine home directory".to_string()))
}

/// File-backed session store
#[derive(Debug)]
pub struct FileSessionStore {
    workspace: PathBuf,
    session_dir: PathBuf,
    history_tail_lines: usize,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileSessionStore {
    /// Open the store for a workspace under `~/.consilium`
    pub async fn open(workspace: &Path, history_tail_lines: usize) -> Result<Self> {
        Self::open_in(&default_config_root()?, workspace, history_tail_lines).await
    }

    /// Open the store for a workspace under an explicit configuration root
    pub async fn open_in(
        config_root: &Path,
        workspace: &Path,
        history_tail_lines: usize,
    ) -> Result<Self> {
        let workspace = std::path::absolute(workspace)?;
        let session_dir = Self::session_dir_for(config_root, &workspace);
        fs::create_dir_all(session_dir.join("agents")).await?;
        debug!("Session directory: {}", session_dir.display());

        Ok(Self {
            workspace,
            session_dir,
            history_tail_lines,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Session directory of a workspace, without touching the filesystem
    pub fn session_dir_for(config_root: &Path, workspace: &Path) -> PathBuf {
        config_root.join("workspaces").join(workspace_hash(workspace))
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.session_dir.join("logs")
    }

    fn agents_dir(&self) -> PathBuf {
        self.session_dir.join("agents")
    }

    fn history_file(&self) -> PathBuf {
        self.session_dir.join("history.jsonl")
    }

    fn agent_file(&self, name: &str) -> PathBuf {
        self.agents_dir().join(format!("{}.json", name.to_lowercase()))
    }

    /// Read the last `limit` non-empty lines of the history file
    async fn read_history_tail(&self, limit: usize) -> Result<Vec<String>> {
        let path = self.history_file();
        if limit == 0 || !fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }

        let bytes = fs::read(&path).await?;
        let content = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let start = lines.len().saturating_sub(limit);
        trace!("Read history tail: {} of {} lines", lines.len() - start, lines.len());
        Ok(lines[start..].iter().map(|l| l.to_string()).collect())
    }

    fn last_id_in(lines: &[String]) -> Option<u64> {
        lines.iter().rev().find_map(|raw| {
            let payload: serde_json::Value = serde_json::from_str(raw).ok()?;
            payload.get("msg_id").and_then(value_as_id)
        })
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    #[instrument(skip(self, aliases))]
    async fn load_session(&self, agent_id: &str, aliases: &[String]) -> Result<AgentSession> {
        let target = self.agent_file(agent_id);

        let mut search_order: Vec<&str> = vec![agent_id];
        for alias in aliases {
            if !search_order.contains(&alias.as_str()) {
                search_order.push(alias);
            }
        }

        for candidate in search_order {
            let path = self.agent_file(candidate);
            if !fs::try_exists(&path).await? {
                continue;
            }

            let content = fs::read_to_string(&path).await?;
            let session: AgentSession = match serde_json::from_str(&content) {
                Ok(session) => session,
                Err(e) => {
                    warn!("Failed to parse session file {}: {}", path.display(), e);
                    break;
                }
            };
            info!(
                "Loaded {} session: {}",
                candidate,
                session.session_id.as_deref().unwrap_or("N/A")
            );

            if path != target && !fs::try_exists(&target).await? {
                match fs::rename(&path, &target).await {
                    Ok(()) => debug!("Migrated session file {} -> {}", candidate, agent_id),
                    Err(e) => debug!("Failed to migrate session file {}: {}", candidate, e),
                }
            }
            return Ok(session);
        }

        debug!("Created new session data for {}", agent_id);
        Ok(AgentSession::fresh())
    }

    #[instrument(skip(self))]
    async fn save_session(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
        message_count: u64,
    ) -> Result<()> {
        let path = self.agent_file(agent_id);
        let _guard = self.write_lock.lock().await;

        let mut created_at = Utc::now();
        if fs::try_exists(&path).await? {
            match fs::read_to_string(&path)
                .await
                .map_err(ConsiliumError::from)
                .and_then(|c| serde_json::from_str::<AgentSession>(&c).map_err(Into::into))
            {
                Ok(existing) => created_at = existing.created_at,
                Err(e) => warn!("Failed to read existing session for {}: {}", agent_id, e),
            }
        }

        let session = AgentSession {
            session_id: session_id.map(str::to_string),
            created_at,
            last_message_at: Some(Utc::now()),
            message_count,
        };
        fs::write(&path, serde_json::to_string_pretty(&session)?).await?;
        debug!("Saved {} session: {:?}", agent_id, session_id);
        Ok(())
    }

    async fn load_history(&self) -> Result<Vec<HistoryRecord>> {
        let lines = self.read_history_tail(self.history_tail_lines).await?;
        let mut history = Vec::with_capacity(lines.len());
        for raw in lines {
            match serde_json::from_str::<HistoryRecord>(&raw) {
                Ok(record) => history.push(record),
                Err(e) => warn!("Corrupted history line skipped: {}", e),
            }
        }
        info!("Loaded {} messages from history", history.len());
        Ok(history)
    }

    async fn append_to_history(&self, record: HistoryRecord) -> Result<()> {
        let line = serde_json::to_string(&record)?;
        let _guard = self.write_lock.lock().await;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_file())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    async fn last_message_id(&self) -> Result<u64> {
        let lines = self.read_history_tail(LAST_ID_FAST_SCAN).await?;
        if let Some(id) = Self::last_id_in(&lines) {
            return Ok(id);
        }
        if LAST_ID_FAST_SCAN < self.history_tail_lines {
            let lines = self.read_history_tail(self.history_tail_lines).await?;
            return Ok(Self::last_id_in(&lines).unwrap_or(0));
        }
        Ok(0)
    }
}

/// In-memory session store for tests and headless runs without persistence
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, AgentSession>>,
    history: Mutex<Vec<HistoryRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the history (e.g. to simulate a restored workspace)
    pub fn with_history(self, history: Vec<HistoryRecord>) -> Self {
        *self.history.lock().unwrap_or_else(|e| e.into_inner()) = history;
        self
    }

    /// Current session of an agent, if one was saved
    pub fn session(&self, agent_id: &str) -> Option<AgentSession> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&agent_id.to_lowercase())
            .cloned()
    }

    pub fn history_snapshot(&self) -> Vec<HistoryRecord> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load_session(&self, agent_id: &str, aliases: &[String]) -> Result<AgentSession> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let found = std::iter::once(agent_id)
            .chain(aliases.iter().map(String::as_str))
            .find_map(|name| sessions.get(&name.to_lowercase()).cloned());
        Ok(found.unwrap_or_else(AgentSession::fresh))
    }

    async fn save_session(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
        message_count: u64,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let created_at = sessions
            .get(&agent_id.to_lowercase())
            .map(|s| s.created_at)
            .unwrap_or_else(Utc::now);
        sessions.insert(
            agent_id.to_lowercase(),
            AgentSession {
                session_id: session_id.map(str::to_string),
                created_at,
                last_message_at: Some(Utc::now()),
                message_count,
            },
        );
        Ok(())
    }

    async fn load_history(&self) -> Result<Vec<HistoryRecord>> {
        Ok(self.history_snapshot())
    }

    async fn append_to_history(&self, record: HistoryRecord) -> Result<()> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        Ok(())
    }

    async fn last_message_id(&self) -> Result<u64> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        Ok(history.iter().rev().find_map(|r| r.msg_id).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store(root: &TempDir, workspace: &TempDir) -> FileSessionStore {
        FileSessionStore::open_in(root.path(), workspace.path(), 2000)
            .await
            .unwrap()
    }

    #[test]
    fn test_workspace_hash_is_stable() {
        let a = workspace_hash(Path::new("/home/me/project"));
        let b = workspace_hash(Path::new("/home/me/project"));
        let c = workspace_hash(Path::new("/home/me/other"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_fresh_session() {
        let root = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let store = store(&root, &workspace).await;

        let session = store.load_session("codex", &[]).await.unwrap();
        assert!(session.session_id.is_none());
        assert_eq!(session.message_count, 0);
    }

    #[tokio::test]
    async fn test_save_and_load_session() {
        let root = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let store = store(&root, &workspace).await;

        store.save_session("codex", Some("thread-1"), 3).await.unwrap();
        let first = store.load_session("codex", &[]).await.unwrap();
        assert_eq!(first.session_id.as_deref(), Some("thread-1"));
        assert_eq!(first.message_count, 3);

        store.save_session("codex", None, 4).await.unwrap();
        let second = store.load_session("codex", &[]).await.unwrap();
        assert!(second.session_id.is_none());
        assert_eq!(second.created_at, first.created_at);
    }

    #[tokio::test]
    async fn test_alias_migration() {
        let root = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let store = store(&root, &workspace).await;

        store.save_session("Claude", Some("legacy"), 9).await.unwrap();
        let session = store
            .load_session("claude-2", &["Claude".to_string()])
            .await
            .unwrap();
        assert_eq!(session.session_id.as_deref(), Some("legacy"));

        let agents = store.session_dir().join("agents");
        assert!(agents.join("claude-2.json").exists());
        assert!(!agents.join("claude.json").exists());
    }

    #[tokio::test]
    async fn test_history_roundtrip_and_last_id() {
        let root = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let store = store(&root, &workspace).await;

        assert_eq!(store.last_message_id().await.unwrap(), 0);

        store
            .append_to_history(HistoryRecord::new(HistoryRole::User, "hello").with_msg_id(1))
            .await
            .unwrap();
        store
            .append_to_history(
                HistoryRecord::new(HistoryRole::Assistant, "hi")
                    .with_agent("codex")
                    .with_msg_id(2)
                    .with_reply_to(Some(ReplyRef::Id(1))),
            )
            .await
            .unwrap();

        let history = store.load_history().await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].agent.as_deref(), Some("codex"));
        assert_eq!(history[1].reply_to, Some(ReplyRef::Id(1)));
        assert_eq!(store.last_message_id().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_history_tolerates_corrupt_lines_and_string_ids() {
        let root = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let store = store(&root, &workspace).await;

        let content = concat!(
            "{\"role\":\"user\",\"content\":\"a\",\"msg_id\":\"41\"}\n",
            "not json\n",
            "{\"role\":\"assistant\",\"content\":\"b\",\"agent\":\"gemini\"}\n",
        );
        std::fs::write(store.session_dir().join("history.jsonl"), content).unwrap();

        let history = store.load_history().await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].msg_id, Some(41));
        assert_eq!(store.last_message_id().await.unwrap(), 41);
    }

    #[tokio::test]
    async fn test_history_tail_limit() {
        let root = TempDir::new().unwrap();
        let workspace = TempDir::new().unwrap();
        let store = FileSessionStore::open_in(root.path(), workspace.path(), 3)
            .await
            .unwrap();

        for id in 1..=5 {
            store
                .append_to_history(HistoryRecord::new(HistoryRole::User, "x").with_msg_id(id))
                .await
                .unwrap();
        }

        let history = store.load_history().await.unwrap();
        let ids: Vec<_> = history.iter().filter_map(|r| r.msg_id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySessionStore::new();
        store.save_session("Codex", Some("t"), 1).await.unwrap();
        let loaded = store.load_session("codex", &[]).await.unwrap();
        assert_eq!(loaded.session_id.as_deref(), Some("t"));

        store
            .append_to_history(HistoryRecord::new(HistoryRole::User, "x").with_msg_id(7))
            .await
            .unwrap();
        assert_eq!(store.last_message_id().await.unwrap(), 7);
    }
}
