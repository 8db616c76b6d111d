//! Process lifecycle records: boot, orderly stop, fatal exit.

use std::time::Duration;

use tracing::{error, info, warn};

use rollout_core::{CorrelationId, EventBody, NewEvent, Record};
use rollout_engine::TriggerController;
use rollout_server::{ServerHandle, ShutdownCoordinator};
use rollout_store::{ErrorKind, EventLog, LogError};

use crate::crash;

/// Record `Booted` under a fresh process id.
pub fn boot(log: &EventLog) -> Result<Record, LogError> {
    let existing = log.count()?;
    let record = log.append(NewEvent::new(CorrelationId::process(), EventBody::Booted))?;
    info!(seq = record.seq, existing, "boot recorded");
    Ok(record)
}

/// Orderly stop. Triggers are refused first, then the HTTP server stops,
/// then running releases get up to `timeout` to record their outcome.
/// `Stopped` is appended last and the log closed.
pub async fn shutdown(
    controller: &TriggerController,
    coordinator: &ShutdownCoordinator,
    server: ServerHandle,
    log: &EventLog,
    timeout: Duration,
) -> Result<(), LogError> {
    controller.begin_shutdown();
    if !coordinator
        .graceful_shutdown(vec![server.into_task()], timeout)
        .await
    {
        warn!("http server did not stop in time");
    }

    info!(in_flight = controller.in_flight(), "draining releases");
    if !controller.drain(timeout).await {
        warn!(
            in_flight = controller.in_flight(),
            "stopping with releases still running"
        );
    }

    log.append(NewEvent::new(CorrelationId::process(), EventBody::Stopped))?;
    log.close()?;
    info!("shutdown complete");
    Ok(())
}

/// Record a fatal error as `Crashed` and close the log.
pub fn record_fatal(log: &EventLog, err: &anyhow::Error) {
    let code = fatal_code(err);
    let message = format!("{err:#}");
    error!(error = %message, code, "fatal error");
    crash::record_crash(log, message, format!("{err:?}"), code);
}

/// Stable code stored in `Crashed.code` for fatal errors.
fn fatal_code(err: &anyhow::Error) -> &'static str {
    if let Some(e) = err.downcast_ref::<LogError>() {
        return match e.kind() {
            ErrorKind::IoFailure => "IO_FAILURE",
            ErrorKind::InvalidRange => "INVALID_RANGE",
        };
    }
    if err.downcast_ref::<std::io::Error>().is_some() {
        return "IO_FAILURE";
    }
    "FATAL"
}
