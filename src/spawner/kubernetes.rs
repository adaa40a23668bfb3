//! Kubernetes backend — one `batch/v1` Job per worker.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, PostParams};
use kube::Client;
use serde_json::json;
use tracing::info;

use super::{JobSpawner, SpawnRequest, WorkerLaunch, new_job_id};
use crate::config::WorkerConfig;
use crate::error::SpawnError;

/// Spawns workers as Kubernetes Jobs.
pub struct KubernetesSpawner {
    client: Client,
    config: WorkerConfig,
}

impl KubernetesSpawner {
    /// Connect using in-cluster config or the local kubeconfig.
    pub async fn connect(config: WorkerConfig) -> Result<Self, SpawnError> {
        let client = Client::try_default()
            .await
            .map_err(|e| SpawnError::Unavailable {
                backend: "kubernetes".into(),
                reason: e.to_string(),
            })?;
        Ok(Self { client, config })
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }
}

/// Build the Job manifest for a launch.
///
/// Never restarts, retries at most `backoff_limit` times, and is garbage
/// collected `ttl_after_finished_secs` after completion. Credentials are
/// referenced from the pre-existing Secret, never inlined.
pub fn build_job(launch: &WorkerLaunch, config: &WorkerConfig) -> Result<Job, SpawnError> {
    let mut env: Vec<serde_json::Value> = launch
        .env
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();
    env.extend(config.credentials.iter().map(|name| {
        json!({
            "name": name,
            "valueFrom": {
                "secretKeyRef": { "name": config.secret_name, "key": name }
            }
        })
    }));

    let resources = json!({
        "cpu": config.resources.cpu,
        "memory": config.resources.memory,
    });

    let manifest = json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": launch.name,
            "namespace": config.namespace,
            "labels": launch.labels,
        },
        "spec": {
            "backoffLimit": config.backoff_limit,
            "ttlSecondsAfterFinished": config.ttl_after_finished_secs,
            "template": {
                "metadata": { "labels": launch.labels },
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [{
                        "name": "worker",
                        "image": config.image,
                        "args": launch.args,
                        "env": env,
                        "resources": {
                            "requests": resources,
                            "limits": resources,
                        },
                    }],
                },
            },
        },
    });

    serde_json::from_value(manifest).map_err(|e| SpawnError::CreateFailed {
        job_id: launch.job_id.clone(),
        reason: format!("invalid Job manifest: {e}"),
    })
}

#[async_trait]
impl JobSpawner for KubernetesSpawner {
    fn backend(&self) -> &'static str {
        "kubernetes"
    }

    async fn spawn(&self, request: &SpawnRequest) -> Result<String, SpawnError> {
        let job_id = new_job_id();
        let launch = WorkerLaunch::new(&job_id, request, &self.config);
        let job = build_job(&launch, &self.config)?;

        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.config.namespace);
        jobs.create(&PostParams::default(), &job)
            .await
            .map_err(|e| SpawnError::CreateFailed {
                job_id: job_id.clone(),
                reason: e.to_string(),
            })?;

        info!(
            job_id = %job_id,
            name = %launch.name,
            namespace = %self.config.namespace,
            ticket = %request.ticket_id,
            project = %request.project,
            "Created Kubernetes worker job"
        );
        Ok(job_id)
    }
}
