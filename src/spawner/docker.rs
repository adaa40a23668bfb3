//! Docker backend — one auto-removing container per worker.
//!
//! The worker joins the dispatcher's own network so it can reach the broker
//! by the same address. Network choice, in priority order: networks the
//! dispatcher's container is attached to, the configured override, `bridge`.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use tracing::{debug, info, warn};

use super::{JobSpawner, SpawnRequest, WorkerLaunch, new_job_id};
use crate::config::WorkerConfig;
use crate::error::SpawnError;

/// Fallback when nothing else names a network.
const DEFAULT_NETWORK: &str = "bridge";

/// Spawns workers as standalone Docker containers.
pub struct DockerSpawner {
    docker: Docker,
    config: WorkerConfig,
    network: String,
}

impl DockerSpawner {
    /// Connect to the local Docker daemon and resolve the worker network.
    pub async fn connect(config: WorkerConfig) -> Result<Self, SpawnError> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| SpawnError::Unavailable {
            backend: "docker".into(),
            reason: e.to_string(),
        })?;

        docker.ping().await.map_err(|e| SpawnError::Unavailable {
            backend: "docker".into(),
            reason: e.to_string(),
        })?;

        let detected = detect_own_networks(&docker).await;
        let network = choose_network(&detected, config.docker_network.as_deref());

        Ok(Self {
            docker,
            config,
            network,
        })
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    fn container_config(&self, launch: &WorkerLaunch) -> Result<Config<String>, SpawnError> {
        let mut env: Vec<String> = launch
            .env
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        env.extend(forwarded_credentials(&self.config.credentials, |name| {
            std::env::var(name).ok()
        }));

        let labels: HashMap<String, String> = launch
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Config {
            image: Some(self.config.image.clone()),
            cmd: Some(launch.args.clone()),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(HostConfig {
                auto_remove: Some(true),
                network_mode: Some(self.network.clone()),
                memory: Some(self.config.resources.memory_bytes()?),
                nano_cpus: Some(self.config.resources.nano_cpus()?),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

#[async_trait]
impl JobSpawner for DockerSpawner {
    fn backend(&self) -> &'static str {
        "docker"
    }

    async fn spawn(&self, request: &SpawnRequest) -> Result<String, SpawnError> {
        let job_id = new_job_id();
        let launch = WorkerLaunch::new(&job_id, request, &self.config);
        let config = self.container_config(&launch)?;

        let options = CreateContainerOptions {
            name: launch.name.clone(),
            platform: None,
        };
        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| SpawnError::CreateFailed {
                job_id: job_id.clone(),
                reason: e.to_string(),
            })?;

        start_or_discard(
            &launch.name,
            self.docker
                .start_container(&launch.name, None::<StartContainerOptions<String>>),
            || {
                self.docker.remove_container(
                    &launch.name,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
            },
        )
        .await
        .map_err(|e| SpawnError::StartFailed {
            job_id: job_id.clone(),
            reason: e.to_string(),
        })?;

        info!(
            job_id = %job_id,
            container = %launch.name,
            network = %self.network,
            ticket = %request.ticket_id,
            project = %request.project,
            "Started Docker worker container"
        );
        Ok(job_id)
    }
}

/// Start a created container. `auto_remove` only covers containers that ran,
/// so one that fails to start is removed here.
async fn start_or_discard<E, RemoveFut>(
    name: &str,
    start: impl Future<Output = Result<(), E>>,
    remove: impl FnOnce() -> RemoveFut,
) -> Result<(), E>
where
    E: Display,
    RemoveFut: Future<Output = Result<(), E>>,
{
    let Err(e) = start.await else {
        return Ok(());
    };
    warn!(container = name, error = %e, "Worker container failed to start; removing it");
    if let Err(remove_err) = remove().await {
        warn!(container = name, error = %remove_err, "Failed to remove unstarted container");
    }
    Err(e)
}

/// Networks the dispatcher's own container is attached to.
///
/// Inside a container the hostname is the short container ID. Outside one,
/// inspection fails and the result is empty.
async fn detect_own_networks(docker: &Docker) -> Vec<String> {
    let hostname = match std::env::var("HOSTNAME") {
        Ok(h) if !h.trim().is_empty() => h.trim().to_string(),
        _ => match tokio::fs::read_to_string("/etc/hostname").await {
            Ok(h) => h.trim().to_string(),
            Err(_) => return Vec::new(),
        },
    };

    match docker
        .inspect_container(&hostname, None::<InspectContainerOptions>)
        .await
    {
        Ok(info) => {
            let mut networks: Vec<String> = info
                .network_settings
                .and_then(|settings| settings.networks)
                .map(|networks| networks.into_keys().collect())
                .unwrap_or_default();
            networks.sort();
            debug!(hostname = %hostname, ?networks, "Detected dispatcher networks");
            networks
        }
        Err(e) => {
            debug!(hostname = %hostname, error = %e, "Not running in a container; skipping network detection");
            Vec::new()
        }
    }
}

/// Pick the worker network: detected (preferring user-defined networks) →
/// override → `bridge`.
fn choose_network(detected: &[String], override_network: Option<&str>) -> String {
    let user_defined = detected
        .iter()
        .find(|n| !matches!(n.as_str(), "bridge" | "host" | "none"));
    if let Some(network) = user_defined.or(detected.first()) {
        return network.clone();
    }
    if let Some(network) = override_network.filter(|n| !n.trim().is_empty()) {
        return network.to_string();
    }
    DEFAULT_NETWORK.to_string()
}

/// `NAME=value` pairs for every credential present in the environment.
fn forwarded_credentials<F>(names: &[String], lookup: F) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    names
        .iter()
        .filter_map(|name| match lookup(name) {
            Some(value) => Some(format!("{name}={value}")),
            None => {
                warn!(credential = %name, "Credential not set in dispatcher environment; not forwarded");
                None
            }
        })
        .collect()
}
