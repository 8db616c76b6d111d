use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use rollout_core::Service;

use crate::error::ExecutorError;

/// Keep the tail of release output; the failure reason is usually last.
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Resolves when a launched release finishes.
pub type Completion = BoxFuture<'static, Result<(), ExecutorError>>;

/// Capability that performs a deployment.
pub trait Executor: Send + Sync {
    /// Start releasing `service` at `tag`. Returns as soon as the release is
    /// running; errors here mean it never started.
    fn launch(&self, service: &Service, tag: &str) -> Result<Completion, ExecutorError>;
}

/// Rancher credentials forwarded to the release command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RancherEnv {
    pub url: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

impl RancherEnv {
    /// Read from the process environment. `RANCHER_URL` falls back to
    /// `CATTLE_URL`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).filter(|v| !v.is_empty());
        Self {
            url: read("RANCHER_URL").or_else(|| read("CATTLE_URL")),
            access_key: read("CATTLE_ACCESS_KEY"),
            secret_key: read("CATTLE_SECRET_KEY"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReleaseConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Kill the release after this long. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            program: "li-release".into(),
            args: vec!["upgrade-rancher-container".into()],
            timeout: None,
        }
    }
}

/// Runs the external release command as a child process.
pub struct ReleaseExecutor {
    config: ReleaseConfig,
    rancher: RancherEnv,
}

impl ReleaseExecutor {
    pub fn new(config: ReleaseConfig, rancher: RancherEnv) -> Self {
        Self { config, rancher }
    }

    /// Variables set for one release, on top of the inherited environment.
    pub fn release_env(&self, service: &Service, tag: &str) -> Vec<(&'static str, String)> {
        let mut env = Vec::with_capacity(5);
        if let Some(url) = &self.rancher.url {
            env.push(("RANCHER_URL", url.clone()));
        }
        if let Some(key) = &self.rancher.access_key {
            env.push(("CATTLE_ACCESS_KEY", key.clone()));
        }
        if let Some(secret) = &self.rancher.secret_key {
            env.push(("CATTLE_SECRET_KEY", secret.clone()));
        }
        env.push(("RANCHER_SERVICE_ID", service.rancher_service_id.clone()));
        env.push(("DOCKER_IMAGE_TAG", service.image_ref(tag)));
        env
    }
}

impl Executor for ReleaseExecutor {
    fn launch(&self, service: &Service, tag: &str) -> Result<Completion, ExecutorError> {
        let child = tokio::process::Command::new(&self.config.program)
            .args(&self.config.args)
            .envs(self.release_env(service, tag))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::launch(format!("{}: {e}", self.config.program)))?;

        debug!(
            service = %service.handle,
            image = %service.image_ref(tag),
            pid = child.id(),
            "release started"
        );

        let timeout = self.config.timeout;
        Ok(Box::pin(async move {
            let waited = match timeout {
                Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                    .await
                    .map_err(|_| ExecutorError::Timeout(limit))?,
                None => child.wait_with_output().await,
            };
            let output =
                waited.map_err(|e| ExecutorError::run(format!("waiting for release: {e}"), ""))?;

            if output.status.success() {
                return Ok(());
            }
            let trail = if output.stderr.is_empty() {
                &output.stdout
            } else {
                &output.stderr
            };
            Err(ExecutorError::run(
                format!("release command exited with {}", output.status),
                tail(trail),
            ))
        }))
    }
}

fn tail(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(MAX_OUTPUT_BYTES);
    String::from_utf8_lossy(&bytes[start..]).trim_end().to_string()
}
