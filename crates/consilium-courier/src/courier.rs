//! The courier: journal ingestion, scheduling and the drain loop
//!
//! Every message lands in the journal first. Scheduling then decides who
//! needs a turn: everyone but the author for a broadcast, only the target
//! for an `@@private` message, nobody but the operator for a secret agent
//! reply. `drain` pops participants one at a time, builds their unseen
//! context, waits at the step gate and dispatches the turn; replies come back
//! in through `enqueue_message`, so a conversation keeps flowing until every
//! participant has seen everything.

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, instrument, trace, Level};

use consilium_backend::classify::is_silent_response;
use consilium_backend::{CliRunner, DispatchController, TurnObserver, TurnOutcome, TurnRequest};
use consilium_core::{
    ConsiliumConfig, CourierMessage, JournalEntry, MessageMetadata, MessageStatus, Notice, ParticipantId,
    RunSignals,
};

use crate::collaborator::CourierCollaborator;
use crate::context::ContextBuilder;
use crate::header::extract_header;
use crate::journal::Journal;
use crate::pending::PendingQueue;
use crate::roster::Roster;
use crate::step_gate::{GateDecision, StepGate};

/// Courier construction options
#[derive(Debug, Clone)]
pub struct CourierOptions {
    pub operator_name: String,
    /// Highest persisted message id; journal ids continue after it
    pub last_message_id: u64,
    pub max_context_entries: Option<usize>,
}

impl CourierOptions {
    pub fn from_config(config: &ConsiliumConfig, last_message_id: u64) -> Self {
        Self {
            operator_name: config.operator_name.clone(),
            last_message_id,
            max_context_entries: config.runtime.max_context_entries,
        }
    }
}

impl Default for CourierOptions {
    fn default() -> Self {
        Self::from_config(&ConsiliumConfig::default(), 0)
    }
}

#[derive(Debug, Default)]
struct CourierState {
    journal: Journal,
    pending: PendingQueue,
}

/// Routes journal entries to participants, one turn at a time
pub struct Courier<R: CliRunner> {
    state: Mutex<CourierState>,
    draining: AtomicBool,
    dispatcher: Arc<DispatchController<R>>,
    collaborator: Arc<dyn CourierCollaborator>,
    gate: Arc<StepGate>,
    context: ContextBuilder,
    operator_name: String,
}

/// Clears the drain flag even if the drain future is dropped mid-turn
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Forwards dispatch notices to the collaborator
struct Relay<'a>(&'a dyn CourierCollaborator);

impl TurnObserver for Relay<'_> {
    fn notice(&self, notice: Notice) {
        self.0.notice(notice);
    }

    fn tool_call(&self, agent: &ParticipantId, tool: &str, detail: &str) {
        self.0.tool_call(agent, tool, detail);
    }
}

impl<R: CliRunner> Courier<R> {
    pub fn new(
        dispatcher: Arc<DispatchController<R>>,
        collaborator: Arc<dyn CourierCollaborator>,
        gate: Arc<StepGate>,
        options: CourierOptions,
    ) -> Self {
        if options.last_message_id > 0 {
            debug!("Courier initialized with last_message_id={}", options.last_message_id);
        }
        Self {
            state: Mutex::new(CourierState {
                journal: Journal::new(options.last_message_id),
                pending: PendingQueue::new(),
            }),
            draining: AtomicBool::new(false),
            dispatcher,
            collaborator,
            gate,
            context: ContextBuilder::new(options.max_context_entries),
            operator_name: options.operator_name,
        }
    }

    pub fn dispatcher(&self) -> &Arc<DispatchController<R>> {
        &self.dispatcher
    }

    pub fn gate(&self) -> &Arc<StepGate> {
        &self.gate
    }

    fn signals(&self) -> &RunSignals {
        self.dispatcher.signals()
    }

    fn lock(&self) -> MutexGuard<'_, CourierState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current participants: the operator, then agents in registration order
    pub fn roster(&self) -> Roster {
        let mut roster = Roster::new(&self.operator_name);
        for runtime in self.dispatcher.runtimes().snapshots() {
            roster.push_agent(runtime.agent_id, &runtime.display_name, runtime.enabled);
        }
        roster
    }

    /// Record a message in the journal and schedule its delivery
    ///
    /// Non-init entries are published to the collaborator.
    pub async fn enqueue_message(&self, message: CourierMessage) -> JournalEntry {
        let entry = {
            let mut state = self.lock();
            let entry = state
                .journal
                .append(&message.author, &message.text, message.metadata);
            self.schedule(&mut state, &entry);
            entry
        };

        if !entry.is_init() {
            self.collaborator.publish_entry(&entry).await;
        }
        entry
    }

    fn schedule(&self, state: &mut CourierState, entry: &JournalEntry) {
        let author = &entry.author;
        let operator = ParticipantId::operator();

        if entry.is_secret() && !author.is_operator() {
            state.journal.advance_cursor(&operator, entry.id);
            debug!("Secret reply from {} delivered directly to operator", author);
            self.debug_state(state, "enqueue (secret reply)");
            return;
        }

        let include_operator = !entry.is_init();

        if author.is_operator() {
            if let Some(target) = entry.metadata.private_to.as_ref() {
                state.pending.enqueue(target);
                if include_operator {
                    state.pending.enqueue(&operator);
                }
                state.pending.prioritize(target);
                debug!("Private delivery to: {}", target);
                self.debug_state(state, "schedule (private)");
                return;
            }
        }

        let mut participants = vec![operator];
        participants.extend(self.dispatcher.runtimes().enabled_ids());
        for participant in &participants {
            state.journal.ensure_registered(participant);
            if participant == author || (!include_operator && participant.is_operator()) {
                continue;
            }
            state.pending.enqueue(participant);
        }

        if author.is_operator() && !entry.metadata.mentions.is_empty() {
            for mentioned in entry.metadata.mentions.iter().rev() {
                state.pending.prioritize(mentioned);
            }
            debug!("Prioritized mentions: {:?}", entry.metadata.mentions);
        }
        self.debug_state(state, "schedule");
    }

    /// Deliver to pending participants until the queue is empty
    ///
    /// Re-entrant calls return immediately; the running drain picks up
    /// whatever they would have delivered. Stops early on shutdown or
    /// interrupt.
    pub async fn drain(&self) {
        loop {
            {
                let Some(_guard) = DrainGuard::acquire(&self.draining) else {
                    return;
                };
                self.drain_pending().await;
            }
            // Entries scheduled after the last pop
            if self.signals().should_stop() || self.lock().pending.is_empty() {
                return;
            }
        }
    }

    async fn drain_pending(&self) {
        self.debug_state(&self.lock(), "drain start");
        loop {
            if self.signals().should_stop() {
                debug!("Courier drain aborted due to shutdown/interrupt");
                break;
            }

            let Some(participant) = self.lock().pending.pop() else {
                break;
            };

            if participant.is_operator() {
                self.deliver_to_operator();
                continue;
            }

            if !self.dispatcher.runtimes().is_enabled(&participant) {
                self.lock().pending.purge(&participant);
                continue;
            }

            let context = {
                let mut state = self.lock();
                self.context.build(&mut state.journal, &participant)
            };
            if context.is_empty() {
                debug!("Courier skip {}: no unseen messages", participant);
                continue;
            }

            let init_flag = context.iter().any(JournalEntry::is_init);
            if !init_flag && self.wait_for_step(&participant).await == GateDecision::Abort {
                debug!("Step-mode denied delivery to {}", participant);
                continue;
            }

            debug!(
                "Courier deliver -> {} context_ids={:?} init={}",
                participant,
                context.iter().map(|e| e.id).collect::<Vec<_>>(),
                init_flag
            );
            self.deliver(&participant, &context, init_flag).await;
            self.debug_state(&self.lock(), "post delivery");
        }
        self.debug_state(&self.lock(), "drain end");
    }

    fn deliver_to_operator(&self) {
        let mut state = self.lock();
        let latest = state.journal.latest_id();
        if latest > 0 {
            state.journal.advance_cursor(&ParticipantId::operator(), latest);
            debug!("Courier synced operator cursor={}", latest);
        }
    }

    async fn wait_for_step(&self, participant: &ParticipantId) -> GateDecision {
        let display_name = self.roster().display_name(participant);
        self.gate
            .wait(participant, || {
                self.collaborator
                    .notice(Notice::WaitingForApproval { display_name });
            })
            .await
    }

    #[instrument(skip(self, participant, context), fields(agent = %participant))]
    async fn deliver(&self, participant: &ParticipantId, context: &[JournalEntry], init_flag: bool) {
        let roster = self.roster();
        let display_name = roster.display_name(participant);
        let formatted = roster.format_context(context);

        self.collaborator.notice(Notice::Processing {
            display_name: display_name.clone(),
        });
        trace!("{} thinking with context:\n{}", participant, formatted);

        let request = TurnRequest::new(participant.clone(), formatted)
            .init(init_flag)
            .with_participants(roster.participant_names(participant))
            .with_role_prompt(self.collaborator.role_prompt(participant));
        let outcome = self
            .dispatcher
            .dispatch(&request, &Relay(self.collaborator.as_ref()))
            .await;

        if !self.dispatcher.runtimes().is_enabled(participant) {
            info!("{} disabled during processing, discarding response", participant);
            return;
        }

        match outcome {
            TurnOutcome::Reply(text) => self.post_reply(participant, &display_name, &text, false).await,
            TurnOutcome::ErrorReply(text) => self.post_reply(participant, &display_name, &text, true).await,
            TurnOutcome::Silent => self.collaborator.notice(Notice::StayedSilent { display_name }),
            TurnOutcome::Failed(error) => {
                self.collaborator
                    .notice(Notice::ProcessingError { display_name, error })
            }
            TurnOutcome::Skipped => debug!("Turn for {} skipped", participant),
        }
    }

    async fn post_reply(&self, participant: &ParticipantId, display_name: &str, text: &str, is_error: bool) {
        let (header, body) = extract_header(text.trim());
        let mut metadata = MessageMetadata {
            is_error,
            ..Default::default()
        };

        if let Some(header) = header {
            if let Some(reply_to) = header.reply_to {
                let secret = reply_to
                    .id()
                    .is_some_and(|id| self.lock().journal.is_secret(id));
                if secret {
                    metadata.status = MessageStatus::Secret;
                    metadata.private_to = Some(ParticipantId::operator());
                    debug!("{} replied to secret message {}", participant, reply_to);
                }
                metadata.reply_to = Some(reply_to);
            }
            metadata.targets = header.targets;
            metadata.header = Some(Value::Object(header.raw));
        }

        let body = body.trim();
        if body.is_empty() {
            self.collaborator.notice(Notice::EmptyResponse {
                display_name: display_name.to_string(),
            });
            return;
        }
        if is_silent_response(body) {
            self.collaborator.notice(Notice::StayedSilent {
                display_name: display_name.to_string(),
            });
            return;
        }

        debug!(
            "Queued response from {}: {}",
            participant,
            body.chars().take(60).collect::<String>()
        );
        self.enqueue_message(CourierMessage::new(participant.clone(), body).with_metadata(metadata))
            .await;
    }

    /// Re-admit an agent after it was enabled
    ///
    /// It is queued again if it has unseen entries.
    pub fn mark_participant_enabled(&self, participant: &ParticipantId) {
        if participant.is_operator() {
            return;
        }
        let mut state = self.lock();
        state.journal.ensure_registered(participant);
        state.pending.purge(participant);
        if state.journal.has_unseen(participant) {
            state.pending.enqueue(participant);
        }
        self.debug_state(&state, "enabled");
    }

    /// Drop a disabled agent from the pending queue
    pub fn mark_participant_disabled(&self, participant: &ParticipantId) {
        if participant.is_operator() {
            return;
        }
        let mut state = self.lock();
        state.pending.purge(participant);
        self.debug_state(&state, "disabled");
    }

    pub fn journal_snapshot(&self) -> Vec<JournalEntry> {
        self.lock().journal.entries().to_vec()
    }

    pub fn pending_snapshot(&self) -> Vec<ParticipantId> {
        self.lock().pending.snapshot()
    }

    pub fn cursor(&self, participant: &ParticipantId) -> u64 {
        self.lock().journal.cursor(participant)
    }

    /// Whether the journal holds an entry by someone else the participant has not seen
    pub fn has_unseen(&self, participant: &ParticipantId) -> bool {
        self.lock().journal.has_unseen(participant)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    fn debug_state(&self, state: &CourierState, note: &str) {
        if !tracing::enabled!(Level::DEBUG) {
            return;
        }
        debug!(
            "Courier state [{}]: pending={:?} cursors={:?} journal_tail={:?} next_id={}",
            note,
            state.pending.snapshot(),
            state.journal.cursors(),
            state.journal.tail_ids(5),
            state.journal.next_id()
        );
    }
}
