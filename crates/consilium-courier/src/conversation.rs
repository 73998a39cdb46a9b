//! Conversation wiring: registry, runtimes, persistence and the courier
//!
//! The conversation owns everything a running chat needs and keeps it in
//! step with the agent registry. Registry change events become runtime
//! registrations, participation changes and member notices; published
//! journal entries are appended to the persisted history before the host
//! sees them.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use consilium_backend::{
    AgentRuntime, AgentRuntimeTable, BackendKind, CliRunner, DispatchController, DispatchSettings,
    TurnObserver,
};
use consilium_core::fail_open::fail_open;
use consilium_core::{
    ConsiliumConfig, CourierMessage, JournalEntry, Notice, ParticipantId, Result, RunSignals,
};
use consilium_store::{
    AgentProfile, AgentRegistry, HistoryRecord, HistoryRole, RegistryEvent, RoleCatalog, SessionStore,
};

use crate::collaborator::CourierCollaborator;
use crate::courier::{Courier, CourierOptions};
use crate::step_gate::{StepContinue, StepGate, StepToggle};
use crate::tasks::BackgroundTasks;

/// Operator message that opens a fresh workspace
pub const INTRODUCTION_TEXT: &str = "Hello! Introduce yourself briefly (one sentence).";

/// Collaborator the courier talks to: persists history, resolves roles and
/// forwards everything else to the host
struct Recorder {
    host: Arc<dyn CourierCollaborator>,
    store: Arc<dyn SessionStore>,
    runtimes: Arc<AgentRuntimeTable>,
    roles: Option<Arc<RoleCatalog>>,
    operator_name: String,
}

impl TurnObserver for Recorder {
    fn notice(&self, notice: Notice) {
        self.host.notice(notice);
    }

    fn tool_call(&self, agent: &ParticipantId, tool: &str, detail: &str) {
        self.host.tool_call(agent, tool, detail);
    }
}

#[async_trait]
impl CourierCollaborator for Recorder {
    async fn publish_entry(&self, entry: &JournalEntry) {
        let record = if entry.author.is_operator() {
            HistoryRecord::new(HistoryRole::User, &entry.text).with_display_name(&self.operator_name)
        } else {
            let display_name = self
                .runtimes
                .display_name(&entry.author)
                .unwrap_or_else(|| entry.author.to_string());
            HistoryRecord::new(HistoryRole::Assistant, &entry.text)
                .with_agent(entry.author.as_str())
                .with_display_name(display_name)
        };
        let record = record
            .with_msg_id(entry.id)
            .with_reply_to(entry.metadata.reply_to.clone());

        fail_open("history_append", || self.store.append_to_history(record)).await;

        if entry.metadata.is_error {
            warn!("Agent {} returned error-marked content; forwarding to chat", entry.author);
        }
        self.host.publish_entry(entry).await;
    }

    fn role_prompt(&self, agent_id: &ParticipantId) -> Option<String> {
        let role_id = self.runtimes.get(agent_id)?.snapshot().role_id?;
        self.roles.as_ref()?.prompt_for(&role_id)
    }
}

/// Everything a conversation is built from
pub struct ConversationParts<R: CliRunner> {
    pub workspace: PathBuf,
    pub config: ConsiliumConfig,
    pub runner: Arc<R>,
    pub store: Arc<dyn SessionStore>,
    pub registry: Arc<AgentRegistry>,
    pub roles: Option<Arc<RoleCatalog>>,
    /// UI side: receives notices and published entries
    pub host: Arc<dyn CourierCollaborator>,
}

/// A running group chat
pub struct Conversation<R: CliRunner + 'static> {
    config: ConsiliumConfig,
    registry: Arc<AgentRegistry>,
    store: Arc<dyn SessionStore>,
    runtimes: Arc<AgentRuntimeTable>,
    signals: Arc<RunSignals>,
    courier: Arc<Courier<R>>,
    host: Arc<dyn CourierCollaborator>,
    tasks: BackgroundTasks,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<R: CliRunner + 'static> Conversation<R> {
    /// Wire the components, load the registry and start following it
    #[instrument(skip(parts), fields(workspace = %parts.workspace.display()))]
    pub async fn start(parts: ConversationParts<R>) -> Result<Arc<Self>> {
        let ConversationParts {
            workspace,
            config,
            runner,
            store,
            registry,
            roles,
            host,
        } = parts;

        let signals = Arc::new(RunSignals::new());
        let runtimes = Arc::new(AgentRuntimeTable::new());
        let last_message_id = fail_open("last_message_id", || store.last_message_id())
            .await
            .unwrap_or(0);

        let dispatcher = Arc::new(DispatchController::new(
            runner,
            Arc::clone(&store),
            Arc::clone(&runtimes),
            Arc::clone(&signals),
            DispatchSettings::new(&workspace, &config),
        ));
        let gate = Arc::new(StepGate::new(config.step_mode, Arc::clone(&signals)));
        let recorder = Arc::new(Recorder {
            host: Arc::clone(&host),
            store: Arc::clone(&store),
            runtimes: Arc::clone(&runtimes),
            roles,
            operator_name: config.operator_name.clone(),
        });
        let courier = Arc::new(Courier::new(
            dispatcher,
            recorder,
            gate,
            CourierOptions::from_config(&config, last_message_id),
        ));

        let conversation = Arc::new(Self {
            config,
            registry: Arc::clone(&registry),
            store,
            runtimes,
            signals,
            courier,
            host,
            tasks: BackgroundTasks::new(),
            listener: Mutex::new(None),
        });

        registry.load().await?;
        let events = registry.subscribe();
        conversation.sync_profiles(false).await;

        let listener = tokio::spawn(Self::follow_registry(Arc::downgrade(&conversation), events));
        *conversation.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(listener);

        info!(
            "Conversation started with {} member(s), last message id {}",
            conversation.runtimes.ids().len(),
            last_message_id
        );
        Ok(conversation)
    }

    pub fn courier(&self) -> &Arc<Courier<R>> {
        &self.courier
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn runtimes(&self) -> &Arc<AgentRuntimeTable> {
        &self.runtimes
    }

    pub fn signals(&self) -> &Arc<RunSignals> {
        &self.signals
    }

    pub fn config(&self) -> &ConsiliumConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<StepGate> {
        self.courier.gate()
    }

    /// Persisted history (tail-limited by the store)
    pub async fn history(&self) -> Vec<HistoryRecord> {
        fail_open("history_load", || self.store.load_history())
            .await
            .unwrap_or_default()
    }

    /// Send the introduction turn unless the workspace already has history
    ///
    /// Returns whether it was sent.
    pub async fn introduce(self: &Arc<Self>) -> bool {
        if !self.history().await.is_empty() {
            info!("Restoring existing session - skipping introduction");
            return false;
        }
        info!("New session - sending introduction prompt");
        self.courier
            .enqueue_message(CourierMessage::init(ParticipantId::operator(), INTRODUCTION_TEXT))
            .await;
        self.spawn_drain();
        true
    }

    /// Post an operator message and start delivering it
    ///
    /// `@@name` makes the message private to that agent; `@name` moves the
    /// named agents to the front of the queue.
    pub async fn submit(self: &Arc<Self>, text: &str) -> Option<JournalEntry> {
        let entry = self.post_operator_message(text).await?;
        self.spawn_drain();
        Some(entry)
    }

    /// Record an operator message without draining
    pub async fn post_operator_message(&self, text: &str) -> Option<JournalEntry> {
        if self.signals.is_shutting_down() {
            debug!("Ignoring operator message during shutdown");
            return None;
        }

        let mentions = self.courier.roster().mention_directory().parse(text);
        let mut message = CourierMessage::new(ParticipantId::operator(), text);
        if let Some(target) = mentions.private_to {
            message = message.private_to(target);
        } else if !mentions.prioritized.is_empty() {
            message = message.with_mentions(mentions.prioritized);
        }
        Some(self.courier.enqueue_message(message).await)
    }

    /// Run the courier on a background task
    pub fn spawn_drain(self: &Arc<Self>) {
        let courier = Arc::clone(&self.courier);
        self.tasks.spawn(async move { courier.drain().await });
    }

    /// Run the courier until the queue is empty
    pub async fn drain(&self) {
        self.courier.drain().await;
    }

    pub fn toggle_step_mode(&self) -> StepToggle {
        let toggle = self.gate().toggle();
        self.announce_step_toggle(toggle);
        toggle
    }

    pub fn set_step_mode(&self, enabled: bool) -> StepToggle {
        let toggle = self.gate().set_step_mode(enabled);
        self.announce_step_toggle(toggle);
        toggle
    }

    fn announce_step_toggle(&self, toggle: StepToggle) {
        self.host.notice(Notice::StepModeChanged {
            enabled: toggle.enabled,
        });
        if toggle.released {
            self.host.notice(Notice::StepAutoContinue);
        }
    }

    /// Approve the delivery waiting at the step gate
    pub fn continue_step(&self) -> StepContinue {
        let outcome = self.gate().continue_step();
        if outcome != StepContinue::Released {
            self.host.notice(Notice::NoPendingSteps);
        }
        outcome
    }

    /// Enable or disable an agent (persisted in the registry)
    pub async fn set_agent_enabled(self: &Arc<Self>, agent_id: &ParticipantId, enabled: bool) -> Result<()> {
        let profile = self.registry.set_enabled(agent_id.as_str(), enabled).await?;
        self.apply_event(RegistryEvent::ProfileUpdated {
            profile,
            changes: vec!["enabled".to_string()],
        })
        .await;
        Ok(())
    }

    /// Stop in-flight turns without ending the conversation
    ///
    /// Pending participants stay queued and are served by the next drain.
    pub async fn interrupt(&self) {
        if self.signals.is_interrupt_requested() {
            return;
        }
        info!("Interrupting conversation...");
        self.signals.request_interrupt();
        self.runtimes.kill_all();

        let cancelled = self.tasks.shutdown(self.config.runtime.background_grace()).await;
        if cancelled > 0 {
            debug!("Cancelled {} background task(s) during interrupt", cancelled);
        }

        self.signals.clear_interrupt();
        self.host.notice(Notice::Interrupted);
        info!("Conversation interrupted");
    }

    /// Stop everything; the conversation does not accept messages afterwards
    pub async fn shutdown(&self) {
        info!("Shutting down conversation");
        self.signals.request_shutdown();
        self.runtimes.kill_all();
        self.tasks.shutdown(self.config.runtime.background_grace()).await;
        if let Some(listener) = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take() {
            listener.abort();
        }
    }

    async fn follow_registry(conversation: Weak<Self>, mut events: tokio::sync::broadcast::Receiver<RegistryEvent>) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Registry listener lagged by {} event(s); resyncing", skipped);
                    RegistryEvent::Loaded { count: 0 }
                }
                Err(RecvError::Closed) => break,
            };
            let Some(conversation) = conversation.upgrade() else {
                break;
            };
            if conversation.signals.is_shutting_down() {
                break;
            }
            conversation.apply_event(event).await;
        }
        debug!("Registry listener stopped");
    }

    /// Apply one registry change; applying the same change twice is a no-op
    pub async fn apply_event(self: &Arc<Self>, event: RegistryEvent) {
        match event {
            RegistryEvent::Loaded { .. } => self.sync_profiles(true).await,
            RegistryEvent::ProfileCreated { profile } => {
                let known = self.runtimes.get(&profile.agent_id().into()).is_some();
                self.apply_profile(&profile).await;
                if !known {
                    self.host.notice(Notice::MemberAdded {
                        display_name: profile.display_name(),
                    });
                }
            }
            RegistryEvent::ProfileUpdated { profile, .. } => self.apply_profile(&profile).await,
            RegistryEvent::ProfileRemoved { agent_id } => {
                let agent_id = ParticipantId::from(agent_id);
                if let Some(handle) = self.runtimes.remove(&agent_id) {
                    self.courier.mark_participant_disabled(&agent_id);
                    self.host.notice(Notice::MemberRemoved {
                        display_name: handle.display_name(),
                    });
                }
            }
        }
    }

    /// Register every profile and drop runtimes whose profile is gone
    ///
    /// With `announce`, members that appear or disappear are reported.
    async fn sync_profiles(self: &Arc<Self>, announce: bool) {
        let profiles = self.registry.list_profiles();
        for stale in self.runtimes.ids() {
            if profiles.iter().any(|p| p.agent_id() == stale.as_str()) {
                continue;
            }
            if let Some(handle) = self.runtimes.remove(&stale) {
                self.courier.mark_participant_disabled(&stale);
                if announce {
                    self.host.notice(Notice::MemberRemoved {
                        display_name: handle.display_name(),
                    });
                }
            }
        }
        for profile in &profiles {
            let known = self.runtimes.get(&profile.agent_id().into()).is_some();
            self.apply_profile(profile).await;
            if announce && !known {
                self.host.notice(Notice::MemberAdded {
                    display_name: profile.display_name(),
                });
            }
        }
    }

    async fn apply_profile(self: &Arc<Self>, profile: &AgentProfile) {
        let agent_id = ParticipantId::from(profile.agent_id());
        let existing = self.runtimes.get(&agent_id);
        let was_enabled = existing.as_ref().map(|h| h.is_enabled());
        let enabled = profile.is_enabled();

        let mut runtime = AgentRuntime::new(
            agent_id.clone(),
            &profile.display_name(),
            BackendKind::resolve(profile.backend_id().as_deref()),
        )
        .with_command(&profile.command_path())
        .with_role(profile.role_id())
        .with_enabled(was_enabled.unwrap_or(enabled));

        if existing.is_none() {
            let aliases = profile.aliases();
            let session = fail_open("session_load", || {
                self.store.load_session(agent_id.as_str(), &aliases)
            })
            .await;
            if let Some(session) = session {
                runtime = runtime.with_session(session.session_id, session.message_count);
            }
        }
        self.runtimes.register(runtime);

        match was_enabled {
            Some(was) if was != enabled => self.apply_participation(&agent_id, &profile.display_name(), enabled),
            None if enabled => self.courier.mark_participant_enabled(&agent_id),
            _ => {}
        }
    }

    fn apply_participation(self: &Arc<Self>, agent_id: &ParticipantId, display_name: &str, enabled: bool) {
        self.runtimes.set_enabled(agent_id, enabled);
        if enabled {
            self.courier.mark_participant_enabled(agent_id);
        } else {
            self.courier.mark_participant_disabled(agent_id);
        }
        info!("{} {} for chat participation", agent_id, if enabled { "enabled" } else { "disabled" });
        self.host.notice(Notice::Participation {
            display_name: display_name.to_string(),
            enabled,
        });
        if enabled && self.courier.has_unseen(agent_id) {
            self.spawn_drain();
        }
    }
}
