//! Step-mode gate: operator approval before each delivery
//!
//! Two states. Open lets deliveries through; closed (step mode on) suspends
//! the first delivery that asks, until the operator continues, step mode is
//! switched off, or a shutdown/interrupt arrives. There is a single waiter
//! slot; a second wait request joins the outstanding one.

use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

use consilium_core::{ParticipantId, RunSignals};

/// Result of waiting at the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    /// Shutdown or interrupt; drop this delivery
    Abort,
}

/// Result of an operator continue request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepContinue {
    Released,
    /// Step mode is on but nobody is waiting
    NothingPending,
    StepModeOff,
}

/// Result of switching step mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepToggle {
    pub enabled: bool,
    /// A suspended delivery was let through by switching step mode off
    pub released: bool,
}

#[derive(Debug, Default)]
struct GateState {
    step_mode: bool,
    waiting: Option<ParticipantId>,
}

#[derive(Debug)]
pub struct StepGate {
    state: Mutex<GateState>,
    changed: watch::Sender<u64>,
    signals: Arc<RunSignals>,
}

impl StepGate {
    pub fn new(step_mode: bool, signals: Arc<RunSignals>) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            state: Mutex::new(GateState {
                step_mode,
                waiting: None,
            }),
            changed,
            signals,
        }
    }

    pub fn is_step_mode(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).step_mode
    }

    /// Participant currently suspended at the gate
    pub fn waiting_for(&self) -> Option<ParticipantId> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .waiting
            .clone()
    }

    pub fn set_step_mode(&self, enabled: bool) -> StepToggle {
        let released = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.step_mode = enabled;
            !enabled && state.waiting.take().is_some()
        };
        if released {
            debug!("Step mode disabled during pause, auto-continuing");
        }
        self.bump();
        StepToggle { enabled, released }
    }

    pub fn toggle(&self) -> StepToggle {
        let enabled = !self.is_step_mode();
        self.set_step_mode(enabled)
    }

    /// Operator approval for the suspended delivery
    pub fn continue_step(&self) -> StepContinue {
        let outcome = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !state.step_mode {
                StepContinue::StepModeOff
            } else if state.waiting.take().is_some() {
                StepContinue::Released
            } else {
                StepContinue::NothingPending
            }
        };
        if outcome == StepContinue::Released {
            debug!("Operator advanced to next step");
            self.bump();
        }
        outcome
    }

    /// Wait for permission to deliver to `participant`
    ///
    /// `on_suspend` runs once, when this call is the one that closes the
    /// gate (not when it joins an outstanding wait).
    pub async fn wait(&self, participant: &ParticipantId, on_suspend: impl FnOnce()) -> GateDecision {
        let mut rx = self.changed.subscribe();
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if !state.step_mode {
                return GateDecision::Proceed;
            }
            if self.signals.should_stop() {
                return GateDecision::Abort;
            }
            if state.waiting.is_none() {
                state.waiting = Some(participant.clone());
                drop(state);
                debug!("Step mode: waiting before dispatching to {}", participant);
                on_suspend();
            } else {
                debug!("Step wait already in progress; joining it");
            }
        }

        loop {
            if self.signals.should_stop() {
                self.state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .waiting = None;
                debug!("Step wait ended due to shutdown/interrupt");
                return GateDecision::Abort;
            }
            {
                let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if !state.step_mode || state.waiting.is_none() {
                    return GateDecision::Proceed;
                }
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return GateDecision::Abort;
                    }
                }
                _ = self.signals.stopped() => {}
            }
        }
    }

    fn bump(&self) {
        self.changed.send_modify(|generation| *generation += 1);
    }
}
