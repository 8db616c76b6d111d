use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use rollout_core::{CorrelationId, Service};

use crate::error::{ExecutorError, TriggerError};
use crate::executor::{Completion, Executor};
use crate::notify::Notifier;
use crate::registry::ServiceRegistry;

/// Where a service's deployment pipeline stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Idle,
    Running,
    RunningWithPending,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::RunningWithPending => "runningWithPending",
        })
    }
}

struct Request {
    id: CorrelationId,
    tag: String,
}

enum State {
    Idle,
    Running,
    RunningWithPending(Request),
}

impl State {
    fn phase(&self) -> Phase {
        match self {
            Self::Idle => Phase::Idle,
            Self::Running => Phase::Running,
            Self::RunningWithPending(_) => Phase::RunningWithPending,
        }
    }
}

struct Slot {
    service: Service,
    state: Mutex<State>,
}

struct Inner {
    slots: HashMap<String, Arc<Slot>>,
    executor: Arc<dyn Executor>,
    notifier: Notifier,
    tracker: TaskTracker,
    accepting: AtomicBool,
}

/// Coalesces deploy requests so each service has at most one release in
/// flight.
///
/// A request for an idle service starts immediately. Requests arriving while
/// a release runs wait in a single pending slot; a newer request replaces
/// the waiting one, which is then never executed. When a release finishes,
/// the pending request (if any) starts under its own id.
///
/// Every accepted request gets a fresh id and a `DeploymentTriggered` event
/// before `trigger` returns. Each release that actually runs ends with
/// exactly one `DeploymentSucceeded` or `DeploymentErrored` for its id.
#[derive(Clone)]
pub struct TriggerController {
    inner: Arc<Inner>,
}

impl TriggerController {
    pub fn new(registry: &ServiceRegistry, executor: Arc<dyn Executor>, notifier: Notifier) -> Self {
        let slots = registry
            .iter()
            .map(|service| {
                let slot = Slot {
                    service: service.clone(),
                    state: Mutex::new(State::Idle),
                };
                (service.handle.clone(), Arc::new(slot))
            })
            .collect();

        Self {
            inner: Arc::new(Inner {
                slots,
                executor,
                notifier,
                tracker: TaskTracker::new(),
                accepting: AtomicBool::new(true),
            }),
        }
    }

    /// Accept a deploy request for `handle` at `tag`.
    ///
    /// Never waits for a release to finish. Fails for unregistered handles,
    /// after shutdown has begun, or when the executor cannot start the
    /// release (the request is still recorded, along with its error).
    /// Must be called within a Tokio runtime.
    #[instrument(skip(self), fields(id))]
    pub fn trigger(&self, handle: &str, tag: &str) -> Result<CorrelationId, TriggerError> {
        let slot = self
            .inner
            .slots
            .get(handle)
            .ok_or_else(|| TriggerError::UnknownService(handle.to_string()))?;

        let request = Request {
            id: CorrelationId::new(),
            tag: tag.to_string(),
        };
        let id = request.id.clone();
        tracing::Span::current().record("id", tracing::field::display(&id));

        {
            let mut state = slot.state.lock();
            if !self.is_accepting() {
                return Err(TriggerError::ShuttingDown);
            }
            self.inner.notifier.triggered(&id, &slot.service, tag);

            match std::mem::replace(&mut *state, State::Running) {
                State::Idle => {}
                State::Running => {
                    debug!("release in flight, request queued");
                    *state = State::RunningWithPending(request);
                    return Ok(id);
                }
                State::RunningWithPending(superseded) => {
                    debug!(superseded = %superseded.id, "pending request replaced");
                    *state = State::RunningWithPending(request);
                    return Ok(id);
                }
            }
        }

        match self.start(slot, &request) {
            Ok(()) => Ok(id),
            Err(source) => {
                warn!(error = %source, "release failed to launch");
                self.inner.notifier.errored(&id, source.to_errored());
                self.advance(slot);
                Err(TriggerError::Launch { id, source })
            }
        }
    }

    pub fn phases(&self) -> BTreeMap<String, Phase> {
        self.inner
            .slots
            .iter()
            .map(|(handle, slot)| (handle.clone(), slot.state.lock().phase()))
            .collect()
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Releases currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Stop accepting requests and discard pending ones. Releases already
    /// running are left to finish.
    pub fn begin_shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        for (handle, slot) in &self.inner.slots {
            let mut state = slot.state.lock();
            if !matches!(*state, State::RunningWithPending(_)) {
                continue;
            }
            if let State::RunningWithPending(dropped) = std::mem::replace(&mut *state, State::Running)
            {
                info!(service = %handle, id = %dropped.id, "pending deployment dropped for shutdown");
            }
        }
    }

    /// Wait up to `timeout` for running releases to record their outcome.
    /// Returns `false` if some were still running.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.inner.tracker.close();
        let drained = tokio::time::timeout(timeout, self.inner.tracker.wait())
            .await
            .is_ok();
        if !drained {
            warn!(
                in_flight = self.inner.tracker.len(),
                "releases still running at shutdown"
            );
        }
        drained
    }

    fn start(&self, slot: &Arc<Slot>, request: &Request) -> Result<(), ExecutorError> {
        let completion = self.inner.executor.launch(&slot.service, &request.tag)?;
        info!(
            service = %slot.service.handle,
            id = %request.id,
            tag = %request.tag,
            "deployment started"
        );
        self.track(Arc::clone(slot), request.id.clone(), completion);
        Ok(())
    }

    fn track(&self, slot: Arc<Slot>, id: CorrelationId, completion: Completion) {
        let this = self.clone();
        self.inner.tracker.spawn(async move {
            let outcome = completion.await;
            this.finish(&slot, &id, outcome);
        });
    }

    fn finish(&self, slot: &Arc<Slot>, id: &CorrelationId, outcome: Result<(), ExecutorError>) {
        match outcome {
            Ok(()) => {
                info!(service = %slot.service.handle, %id, "deployment succeeded");
                self.inner.notifier.succeeded(id);
            }
            Err(e) => {
                warn!(service = %slot.service.handle, %id, error = %e, "deployment failed");
                self.inner.notifier.errored(id, e.to_errored());
            }
        }
        self.advance(slot);
    }

    /// Start the pending request, if any, or go idle. A pending request that
    /// fails to launch is recorded and the next one (if any) is tried.
    fn advance(&self, slot: &Arc<Slot>) {
        loop {
            let next = {
                let mut state = slot.state.lock();
                match std::mem::replace(&mut *state, State::Idle) {
                    State::RunningWithPending(next) if self.is_accepting() => {
                        *state = State::Running;
                        next
                    }
                    State::RunningWithPending(dropped) => {
                        info!(id = %dropped.id, "pending deployment dropped for shutdown");
                        return;
                    }
                    State::Idle | State::Running => return,
                }
            };

            match self.start(slot, &next) {
                Ok(()) => return,
                Err(e) => {
                    warn!(id = %next.id, error = %e, "queued release failed to launch");
                    self.inner.notifier.errored(&next.id, e.to_errored());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashSet, VecDeque};

    use rollout_core::{EventBody, EventName, Record};
    use rollout_store::{EventLog, LogConfig, QueryOptions, MAX_LIMIT};
    use tokio::sync::oneshot;

    /// Executor whose releases finish only when the test says so.
    #[derive(Default)]
    struct GatedExecutor {
        launches: Mutex<Vec<(String, String)>>,
        gates: Mutex<VecDeque<oneshot::Sender<Result<(), ExecutorError>>>>,
        refuse_tags: Mutex<HashSet<String>>,
    }

    impl GatedExecutor {
        fn launched_tags(&self) -> Vec<String> {
            self.launches.lock().iter().map(|(_, tag)| tag.clone()).collect()
        }

        fn refuse(&self, tag: &str) {
            self.refuse_tags.lock().insert(tag.to_string());
        }

        /// Finish the oldest running release.
        fn complete(&self, outcome: Result<(), ExecutorError>) {
            let gate = self.gates.lock().pop_front().expect("no running release");
            let _ = gate.send(outcome);
        }
    }

    impl Executor for GatedExecutor {
        fn launch(&self, service: &Service, tag: &str) -> Result<Completion, ExecutorError> {
            if self.refuse_tags.lock().contains(tag) {
                return Err(ExecutorError::launch("li-release: not found"));
            }
            self.launches
                .lock()
                .push((service.handle.clone(), tag.to_string()));
            let (tx, rx) = oneshot::channel();
            self.gates.lock().push_back(tx);
            Ok(Box::pin(async move {
                rx.await
                    .unwrap_or_else(|_| Err(ExecutorError::run("gate dropped", "")))
            }))
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        log: Arc<EventLog>,
        exec: Arc<GatedExecutor>,
        ctl: TriggerController,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(EventLog::open(dir.path().join("events.db"), LogConfig::default()).unwrap());
        let exec = Arc::new(GatedExecutor::default());
        let registry = ServiceRegistry::new([
            Service::new("api", "acme/api", "1s11"),
            Service::new("web", "acme/web", "1s12"),
        ]);
        let ctl = TriggerController::new(&registry, exec.clone(), Notifier::new(log.clone()));
        Harness {
            _dir: dir,
            log,
            exec,
            ctl,
        }
    }

    impl Harness {
        fn records(&self) -> Vec<Record> {
            let opts = QueryOptions {
                limit: MAX_LIMIT,
                ..Default::default()
            };
            self.log
                .query(&opts)
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap()
        }

        fn events_for(&self, id: &CorrelationId) -> Vec<EventName> {
            self.records()
                .into_iter()
                .filter(|r| &r.id == id)
                .map(|r| r.name())
                .collect()
        }
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    const T1: &str = "2024-05-01-aaaaaaaaaaaa";
    const T2: &str = "2024-05-01-bbbbbbbbbbbb";
    const T3: &str = "2024-05-01-cccccccccccc";

    #[tokio::test]
    async fn idle_trigger_starts_immediately() {
        let h = harness();
        let id = h.ctl.trigger("api", T1).unwrap();

        assert_eq!(h.exec.launched_tags(), vec![T1]);
        assert_eq!(h.ctl.phases().get("api").copied(), Some(Phase::Running));
        assert_eq!(h.events_for(&id), vec![EventName::DeploymentTriggered]);

        h.exec.complete(Ok(()));
        eventually(|| h.ctl.phases().get("api").copied() == Some(Phase::Idle)).await;
        assert_eq!(
            h.events_for(&id),
            vec![EventName::DeploymentTriggered, EventName::DeploymentSucceeded]
        );
    }

    #[tokio::test]
    async fn rapid_triggers_coalesce_to_latest() {
        let h = harness();
        let id1 = h.ctl.trigger("api", T1).unwrap();
        let id2 = h.ctl.trigger("api", T2).unwrap();
        let id3 = h.ctl.trigger("api", T3).unwrap();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_eq!(h.ctl.phases().get("api").copied(), Some(Phase::RunningWithPending));
        assert_eq!(h.exec.launched_tags(), vec![T1]);

        h.exec.complete(Ok(()));
        eventually(|| h.exec.launched_tags().len() == 2).await;
        assert_eq!(h.exec.launched_tags(), vec![T1, T3]);
        assert_eq!(h.ctl.phases().get("api").copied(), Some(Phase::Running));

        h.exec.complete(Err(ExecutorError::run("exit status 1", "upgrade refused")));
        eventually(|| h.ctl.phases().get("api").copied() == Some(Phase::Idle)).await;

        assert_eq!(
            h.events_for(&id1),
            vec![EventName::DeploymentTriggered, EventName::DeploymentSucceeded]
        );
        assert_eq!(h.events_for(&id2), vec![EventName::DeploymentTriggered]);
        assert_eq!(
            h.events_for(&id3),
            vec![EventName::DeploymentTriggered, EventName::DeploymentErrored]
        );

        let errored = h
            .records()
            .into_iter()
            .find(|r| r.name() == EventName::DeploymentErrored)
            .unwrap();
        match errored.body {
            EventBody::DeploymentErrored(data) => {
                assert_eq!(data.message, "exit status 1");
                assert_eq!(data.stack, "upgrade refused");
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[tokio::test]
    async fn triggered_events_follow_acceptance_order() {
        let h = harness();
        let ids = [
            h.ctl.trigger("api", T1).unwrap(),
            h.ctl.trigger("api", T2).unwrap(),
            h.ctl.trigger("api", T3).unwrap(),
        ];
        let triggered: Vec<CorrelationId> = h
            .records()
            .into_iter()
            .filter(|r| r.name() == EventName::DeploymentTriggered)
            .map(|r| r.id)
            .collect();
        assert_eq!(triggered, ids);
    }

    #[tokio::test]
    async fn handles_run_independently() {
        let h = harness();
        h.ctl.trigger("api", T1).unwrap();
        h.ctl.trigger("web", T2).unwrap();

        assert_eq!(h.ctl.phases().get("api").copied(), Some(Phase::Running));
        assert_eq!(h.ctl.phases().get("web").copied(), Some(Phase::Running));
        assert_eq!(h.exec.launched_tags(), vec![T1, T2]);
        assert_eq!(h.ctl.in_flight(), 2);

        let phases = h.ctl.phases();
        assert_eq!(phases.len(), 2);
        assert!(phases.values().all(|p| *p == Phase::Running));
    }

    #[tokio::test]
    async fn concurrent_triggers_across_threads() {
        let h = harness();
        let handles: Vec<_> = ["api", "web"]
            .into_iter()
            .map(|handle| {
                let ctl = h.ctl.clone();
                let rt = tokio::runtime::Handle::current();
                std::thread::spawn(move || {
                    let _guard = rt.enter();
                    for tag in [T1, T2, T3] {
                        ctl.trigger(handle, tag).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // one release per handle, one queued request each
        assert_eq!(h.exec.launches.lock().len(), 2);
        assert_eq!(h.ctl.phases().get("api").copied(), Some(Phase::RunningWithPending));
        assert_eq!(h.ctl.phases().get("web").copied(), Some(Phase::RunningWithPending));
        assert_eq!(h.records().len(), 6);
    }

    #[tokio::test]
    async fn unknown_service_records_nothing() {
        let h = harness();
        let err = h.ctl.trigger("worker", T1).unwrap_err();
        assert!(matches!(err, TriggerError::UnknownService(ref handle) if handle == "worker"));
        assert!(h.records().is_empty());
        assert_eq!(h.ctl.phases().get("worker").copied(), None);
    }

    #[tokio::test]
    async fn launch_failure_surfaces_and_is_recorded() {
        let h = harness();
        h.exec.refuse(T1);

        let err = h.ctl.trigger("api", T1).unwrap_err();
        let TriggerError::Launch { id, source } = err else {
            panic!("expected launch error");
        };
        assert_eq!(source.kind(), "EXECUTOR_LAUNCH");
        assert_eq!(
            h.events_for(&id),
            vec![EventName::DeploymentTriggered, EventName::DeploymentErrored]
        );
        assert_eq!(h.ctl.phases().get("api").copied(), Some(Phase::Idle));

        // the slot is usable again
        h.ctl.trigger("api", T2).unwrap();
        assert_eq!(h.exec.launched_tags(), vec![T2]);
    }

    #[tokio::test]
    async fn queued_launch_failure_returns_to_idle() {
        let h = harness();
        h.exec.refuse(T2);
        let id1 = h.ctl.trigger("api", T1).unwrap();
        let id2 = h.ctl.trigger("api", T2).unwrap();

        h.exec.complete(Ok(()));
        eventually(|| h.ctl.phases().get("api").copied() == Some(Phase::Idle)).await;

        assert_eq!(h.exec.launched_tags(), vec![T1]);
        assert_eq!(
            h.events_for(&id1),
            vec![EventName::DeploymentTriggered, EventName::DeploymentSucceeded]
        );
        assert_eq!(
            h.events_for(&id2),
            vec![EventName::DeploymentTriggered, EventName::DeploymentErrored]
        );
    }

    #[tokio::test]
    async fn shutdown_rejects_and_drops_pending() {
        let h = harness();
        let id1 = h.ctl.trigger("api", T1).unwrap();
        let id2 = h.ctl.trigger("api", T2).unwrap();

        h.ctl.begin_shutdown();
        assert!(!h.ctl.is_accepting());
        assert_eq!(h.ctl.phases().get("api").copied(), Some(Phase::Running));
        assert!(matches!(
            h.ctl.trigger("web", T3),
            Err(TriggerError::ShuttingDown)
        ));

        let ctl = h.ctl.clone();
        let drain = tokio::spawn(async move { ctl.drain(Duration::from_secs(5)).await });
        h.exec.complete(Ok(()));
        assert!(drain.await.unwrap());

        assert_eq!(h.exec.launched_tags(), vec![T1]);
        assert_eq!(h.ctl.phases().get("api").copied(), Some(Phase::Idle));
        assert_eq!(
            h.events_for(&id1),
            vec![EventName::DeploymentTriggered, EventName::DeploymentSucceeded]
        );
        assert_eq!(h.events_for(&id2), vec![EventName::DeploymentTriggered]);
    }

    #[tokio::test]
    async fn drain_times_out_with_release_running() {
        let h = harness();
        h.ctl.trigger("api", T1).unwrap();
        h.ctl.begin_shutdown();
        assert!(!h.ctl.drain(Duration::from_millis(50)).await);
        assert_eq!(h.ctl.in_flight(), 1);
    }

    #[test]
    fn phase_display_matches_serde() {
        for phase in [Phase::Idle, Phase::Running, Phase::RunningWithPending] {
            let json = serde_json::to_value(phase).unwrap();
            assert_eq!(json, phase.to_string());
        }
    }
}
