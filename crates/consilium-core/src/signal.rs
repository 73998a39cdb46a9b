//! Shutdown and interrupt signals shared by the courier and the backends

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tracing::info;

/// Process-wide stop flags
///
/// Shutdown is terminal. Interrupt is cleared again once the in-flight work
/// has been torn down, so the conversation can continue afterwards.
#[derive(Debug)]
pub struct RunSignals {
    shutdown: AtomicBool,
    interrupt: AtomicBool,
    changed: watch::Sender<u64>,
}

impl RunSignals {
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            shutdown: AtomicBool::new(false),
            interrupt: AtomicBool::new(false),
            changed,
        }
    }

    pub fn request_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested");
        }
        self.bump();
    }

    pub fn request_interrupt(&self) {
        if !self.interrupt.swap(true, Ordering::SeqCst) {
            info!("Interrupt requested");
        }
        self.bump();
    }

    pub fn clear_interrupt(&self) {
        self.interrupt.store(false, Ordering::SeqCst);
        self.bump();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn is_interrupt_requested(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// True while either shutdown or interrupt is raised
    pub fn should_stop(&self) -> bool {
        self.is_shutting_down() || self.is_interrupt_requested()
    }

    /// Resolve once shutdown or interrupt is raised
    pub async fn stopped(&self) {
        let mut rx = self.changed.subscribe();
        loop {
            if self.should_stop() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn bump(&self) {
        self.changed.send_modify(|generation| *generation += 1);
    }
}

impl Default for RunSignals {
    fn default() -> Self {
        Self::new()
    }
}
