//! Job spawner — starts one isolated worker per fix request.
//!
//! Supports:
//! - **Kubernetes**: a namespaced `batch/v1` Job per worker
//! - **Docker**: an auto-removing container per worker
//!
//! Both backends share the launch contract built here (job ID, arguments,
//! environment, labels) and the same resource ceilings. The backend is picked
//! once at startup by `create_spawner`.

mod docker;
mod kubernetes;

pub use docker::DockerSpawner;
pub use kubernetes::KubernetesSpawner;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;

use crate::config::{SpawnerBackend, WorkerConfig};
use crate::error::SpawnError;

/// Label carried by every worker Job/container.
pub const APP_LABEL: &str = "agent-worker";

/// What a worker needs to know about the ticket it should fix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub ticket_id: String,
    pub project: String,
    pub channel_id: String,
    pub user_id: String,
    pub platform: String,
}

/// Fully-resolved startup parameters for one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLaunch {
    pub job_id: String,
    /// Job/container name.
    pub name: String,
    pub args: Vec<String>,
    /// Non-secret environment values.
    pub env: Vec<(String, String)>,
    pub labels: BTreeMap<String, String>,
}

impl WorkerLaunch {
    pub fn new(job_id: &str, request: &SpawnRequest, config: &WorkerConfig) -> Self {
        let args = vec![
            "--headless".to_string(),
            "--job-id".to_string(),
            job_id.to_string(),
            "--redis-url".to_string(),
            config.redis_url.clone(),
            "--platform".to_string(),
            request.platform.clone(),
            "--channel-id".to_string(),
            request.channel_id.clone(),
            format!("fix #{} in {}", request.ticket_id, request.project),
        ];

        let env = vec![
            ("JOB_ID".to_string(), job_id.to_string()),
            ("TICKET_ID".to_string(), request.ticket_id.clone()),
            ("PROJECT".to_string(), request.project.clone()),
            ("CHANNEL_ID".to_string(), request.channel_id.clone()),
            ("USER_ID".to_string(), request.user_id.clone()),
            ("PLATFORM".to_string(), request.platform.clone()),
        ];

        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), APP_LABEL.to_string());
        labels.insert("job-id".to_string(), job_id.to_string());

        Self {
            job_id: job_id.to_string(),
            name: format!("agent-job-{job_id}"),
            args,
            env,
            labels,
        }
    }
}

/// Mint a fresh job ID: 8 lowercase hex characters.
pub fn new_job_id() -> String {
    format!("{:08x}", rand::thread_rng().r#gen::<u32>())
}

/// Starts worker processes.
#[async_trait]
pub trait JobSpawner: Send + Sync {
    /// Backend name for logs.
    fn backend(&self) -> &'static str;

    /// Start a worker for `request` and return its job ID as soon as the
    /// backend has accepted it. Does not wait for the worker to finish.
    async fn spawn(&self, request: &SpawnRequest) -> Result<String, SpawnError>;
}

/// Create the configured spawner backend.
pub async fn create_spawner(
    backend: SpawnerBackend,
    config: WorkerConfig,
) -> Result<Arc<dyn JobSpawner>, SpawnError> {
    if config.image.trim().is_empty() {
        return Err(SpawnError::MissingImage);
    }
    // Fail at startup rather than on the first request.
    config.resources.nano_cpus()?;
    config.resources.memory_bytes()?;

    match backend {
        SpawnerBackend::Kubernetes => {
            let spawner = KubernetesSpawner::connect(config).await?;
            tracing::info!("Using Kubernetes spawner (namespace: {})", spawner.namespace());
            Ok(Arc::new(spawner))
        }
        SpawnerBackend::Docker => {
            let spawner = DockerSpawner::connect(config).await?;
            tracing::info!("Using Docker spawner (network: {})", spawner.network());
            Ok(Arc::new(spawner))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SpawnRequest {
        SpawnRequest {
            ticket_id: "42".into(),
            project: "backend".into(),
            channel_id: "C1".into(),
            user_id: "U1".into(),
            platform: "slack".into(),
        }
    }

    #[test]
    fn job_ids_are_short_hex_tokens() {
        let id = new_job_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(new_job_id(), new_job_id());
    }

    #[test]
    fn launch_encodes_worker_contract() {
        let config = WorkerConfig {
            redis_url: "redis://cache:6379".into(),
            ..WorkerConfig::default()
        };
        let launch = WorkerLaunch::new("ab12cd34", &request(), &config);

        assert_eq!(launch.name, "agent-job-ab12cd34");
        assert_eq!(launch.args[0], "--headless");
        let pairs: Vec<&[String]> = launch.args[1..9].chunks(2).collect();
        assert_eq!(pairs[0], ["--job-id", "ab12cd34"]);
        assert_eq!(pairs[1], ["--redis-url", "redis://cache:6379"]);
        assert_eq!(pairs[2], ["--platform", "slack"]);
        assert_eq!(pairs[3], ["--channel-id", "C1"]);
        assert_eq!(launch.args.last().unwrap(), "fix #42 in backend");

        assert!(launch.env.contains(&("TICKET_ID".into(), "42".into())));
        assert!(launch.env.contains(&("USER_ID".into(), "U1".into())));
        assert_eq!(launch.labels["job-id"], "ab12cd34");
        assert_eq!(launch.labels["app"], APP_LABEL);
    }

    #[tokio::test]
    async fn factory_requires_an_image() {
        let result = create_spawner(SpawnerBackend::Docker, WorkerConfig::default()).await;
        assert!(matches!(result, Err(SpawnError::MissingImage)));
    }
}
