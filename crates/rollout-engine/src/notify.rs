use std::sync::Arc;

use tracing::error;

use rollout_core::{CorrelationId, ErroredData, EventBody, NewEvent, Service, TriggeredData};
use rollout_store::EventLog;

/// Records deployment lifecycle events.
///
/// Append failures are logged and swallowed: a broken audit log must not
/// stop deployments.
#[derive(Clone)]
pub struct Notifier {
    log: Arc<EventLog>,
}

impl Notifier {
    pub fn new(log: Arc<EventLog>) -> Self {
        Self { log }
    }

    pub fn triggered(&self, id: &CorrelationId, service: &Service, tag: &str) {
        self.record(
            id,
            EventBody::DeploymentTriggered(TriggeredData {
                service: service.handle.clone(),
                image: service.docker_image.clone(),
                tag: tag.to_string(),
            }),
        );
    }

    pub fn succeeded(&self, id: &CorrelationId) {
        self.record(id, EventBody::DeploymentSucceeded);
    }

    pub fn errored(&self, id: &CorrelationId, data: ErroredData) {
        self.record(id, EventBody::DeploymentErrored(data));
    }

    fn record(&self, id: &CorrelationId, body: EventBody) {
        let name = body.name();
        if let Err(e) = self.log.append(NewEvent::new(id.clone(), body)) {
            error!(%id, %name, error = %e, "failed to record event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollout_core::EventName;
    use rollout_store::{LogConfig, QueryOptions};

    #[test]
    fn records_lifecycle_events() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(EventLog::open(dir.path().join("events.db"), LogConfig::default()).unwrap());
        let notifier = Notifier::new(log.clone());
        let id = CorrelationId::new();
        let svc = Service::new("api", "acme/api", "1s11");

        notifier.triggered(&id, &svc, "2024-05-01-abcdef123456");
        notifier.errored(
            &id,
            ErroredData {
                message: "m".into(),
                stack: "s".into(),
            },
        );

        let records: Vec<_> = log
            .query(&QueryOptions::default())
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name(), EventName::DeploymentTriggered);
        assert_eq!(records[1].name(), EventName::DeploymentErrored);
        assert!(records.iter().all(|r| r.id == id));
        match &records[0].body {
            EventBody::DeploymentTriggered(data) => {
                assert_eq!(data.service, "api");
                assert_eq!(data.image, "acme/api");
                assert_eq!(data.tag, "2024-05-01-abcdef123456");
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn append_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(EventLog::open(dir.path().join("events.db"), LogConfig::default()).unwrap());
        log.close().unwrap();
        Notifier::new(log).succeeded(&CorrelationId::new());
    }
}
