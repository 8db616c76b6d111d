//! Diagnostic tap: follows the event log and writes every record to the
//! process log.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use rollout_store::{EventLog, LogError};

/// Subscribe to `log` and spawn a task logging each record at info level.
/// The task ends when the log is closed.
pub fn spawn_tap(log: &Arc<EventLog>) -> Result<JoinHandle<()>, LogError> {
    let mut records = log.subscribe()?;
    Ok(tokio::spawn(async move {
        while let Some(item) = records.next().await {
            match item {
                Ok(record) => match serde_json::to_string(&record) {
                    Ok(json) => info!(
                        target: "rollout::events",
                        seq = record.seq,
                        name = %record.name(),
                        id = %record.id,
                        record = %json,
                        "event"
                    ),
                    Err(e) => warn!(seq = record.seq, error = %e, "unserializable event"),
                },
                Err(e) => {
                    warn!(error = %e, "event tap stopped");
                    break;
                }
            }
        }
        info!("event tap closed");
    }))
}
