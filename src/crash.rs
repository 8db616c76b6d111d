//! Best-effort crash recording.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use rollout_core::{CorrelationId, CrashedData, EventBody, NewEvent};
use rollout_store::EventLog;

/// Exit status after a panic.
pub const PANIC_EXIT_CODE: i32 = 70;

/// How long crash paths wait for the log writer. The panicking thread may
/// itself hold the writer lock.
const CRASH_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Record `Crashed`, then close the log. Failures are logged, never raised.
pub fn record_crash(log: &EventLog, message: String, stack: String, code: &str) {
    let event = NewEvent::new(
        CorrelationId::process(),
        EventBody::Crashed(CrashedData {
            message,
            stack,
            code: Some(code.to_string()),
        }),
    );
    if let Err(e) = log.try_append(event, CRASH_WRITE_TIMEOUT) {
        error!(error = %e, "failed to record crash");
    }
    if let Err(e) = log.try_close(CRASH_WRITE_TIMEOUT) {
        error!(error = %e, "failed to close event log after crash");
    }
}

/// On any panic: run the default hook, record the crash, exit with
/// [`PANIC_EXIT_CODE`].
pub fn install_panic_hook(log: Arc<EventLog>) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        let location = info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()));
        let message = panic_message(info.payload(), location.as_deref());
        let stack = std::backtrace::Backtrace::force_capture().to_string();
        error!(%message, "panic");
        record_crash(&log, message, stack, "PANIC");
        std::process::exit(PANIC_EXIT_CODE);
    }));
}

fn panic_message(payload: &(dyn Any + Send), location: Option<&str>) -> String {
    let text = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic with non-string payload".to_string());
    match location {
        Some(loc) => format!("{text} at {loc}"),
        None => text,
    }
}
