//! Fail-open helper for side effects that must never abort a turn
//!
//! Session saves, history appends and registry persistence are bookkeeping.
//! A failing disk write is logged and the conversation carries on.
//!
//! DO NOT use fail-open for:
//! - Agent dispatch (its failures are turn results)
//! - Journal appends (state)

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Execute an operation that should fail open
///
/// Logs the error via `tracing::warn!` on failure and returns `None`.
///
/// # Usage
///
/// ```no_run
/// use consilium_core::fail_open::fail_open;
/// use consilium_core::Result;
///
/// async fn save_session() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let saved = fail_open("session_save", || save_session()).await;
///     // saved is None if save_session() failed
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}
