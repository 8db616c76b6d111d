//! `/health` endpoint.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;

use rollout_engine::Phase;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `"ok"`, `"shuttingDown"` once triggers are refused, or `"degraded"`
    /// when the event log cannot be read.
    pub status: &'static str,
    pub uptime_secs: u64,
    /// Newest sequence number in the event log.
    pub head: Option<u64>,
    pub services: BTreeMap<String, Phase>,
}

impl HealthResponse {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// `head` is `None` when the log could not be read.
pub fn health_check(
    start_time: Instant,
    accepting: bool,
    head: Option<Option<u64>>,
    services: BTreeMap<String, Phase>,
) -> HealthResponse {
    let status = match (accepting, head) {
        (false, _) => "shuttingDown",
        (true, None) => "degraded",
        (true, Some(_)) => "ok",
    };
    HealthResponse {
        status,
        uptime_secs: start_time.elapsed().as_secs(),
        head: head.flatten(),
        services,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_follows_accepting() {
        let ok = health_check(Instant::now(), true, Some(None), BTreeMap::new());
        assert_eq!(ok.status, "ok");
        assert!(ok.is_ok());
        assert_eq!(
            health_check(Instant::now(), false, Some(None), BTreeMap::new()).status,
            "shuttingDown"
        );
    }

    #[test]
    fn unreadable_log_is_degraded() {
        let resp = health_check(Instant::now(), true, None, BTreeMap::new());
        assert_eq!(resp.status, "degraded");
        assert!(!resp.is_ok());
        assert!(resp.head.is_none());
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        assert!(health_check(start, true, Some(None), BTreeMap::new()).uptime_secs >= 59);
    }

    #[test]
    fn serialization() {
        let services = BTreeMap::from([("api".to_string(), Phase::RunningWithPending)]);
        let resp = health_check(Instant::now(), true, Some(Some(7)), services);
        let parsed = serde_json::to_value(&resp).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["head"], 7);
        assert_eq!(parsed["services"]["api"], "runningWithPending");
        assert!(parsed["uptimeSecs"].is_number());
    }
}
