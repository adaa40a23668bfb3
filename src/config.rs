//! Configuration types.
//!
//! Everything is read from environment variables. `from_lookup` takes an
//! arbitrary key lookup so configuration parsing can be tested without
//! touching the process environment.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::{ConfigError, SpawnError};

/// Message bus and conversation store tuning.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Delay between stream polls.
    pub poll_interval: Duration,
    /// TTL applied to streams, conversation records and the reverse index.
    pub key_ttl: Duration,
    /// Approximate cap on stream length (`MAXLEN ~`).
    pub stream_max_len: usize,
    /// TTL for cached clarification prompts.
    pub clarification_ttl: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            key_ttl: Duration::from_secs(2 * 60 * 60), // 2 hours
            stream_max_len: 1000,
            clarification_ttl: Duration::from_secs(5 * 60), // 5 minutes
        }
    }
}

/// Which broker implementation backs the bus and state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Redis,
    /// In-process broker; only useful for local runs with the CLI channel.
    Memory,
}

/// Which backend starts worker processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnerBackend {
    Kubernetes,
    Docker,
}

impl SpawnerBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpawnerBackend::Kubernetes => "kubernetes",
            SpawnerBackend::Docker => "docker",
        }
    }
}

/// CPU/memory ceiling applied identically by both spawner backends.
///
/// Quantities use Kubernetes notation (`"2"`, `"500m"`, `"4Gi"`, `"512M"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu: String,
    pub memory: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu: "2".to_string(),
            memory: "4Gi".to_string(),
        }
    }
}

impl ResourceLimits {
    /// CPU limit in billionths of a CPU (Docker `NanoCpus`).
    pub fn nano_cpus(&self) -> Result<i64, SpawnError> {
        let invalid = |reason: &str| SpawnError::InvalidResource {
            value: self.cpu.clone(),
            reason: reason.to_string(),
        };

        let cpu = self.cpu.trim();
        if let Some(millis) = cpu.strip_suffix('m') {
            let millis: i64 = millis.parse().map_err(|_| invalid("not an integer"))?;
            return Ok(millis * 1_000_000);
        }
        let cores: f64 = cpu.parse().map_err(|_| invalid("not a number"))?;
        if cores <= 0.0 {
            return Err(invalid("must be positive"));
        }
        Ok((cores * 1_000_000_000.0).round() as i64)
    }

    /// Memory limit in bytes.
    pub fn memory_bytes(&self) -> Result<i64, SpawnError> {
        let memory = self.memory.trim();
        let split = memory
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(memory.len());
        let (digits, suffix) = memory.split_at(split);

        let value: i64 = digits.parse().map_err(|_| SpawnError::InvalidResource {
            value: self.memory.clone(),
            reason: "missing numeric value".to_string(),
        })?;

        let multiplier: i64 = match suffix {
            "" => 1,
            "K" | "k" => 1_000,
            "M" => 1_000_000,
            "G" => 1_000_000_000,
            "Ki" => 1 << 10,
            "Mi" => 1 << 20,
            "Gi" => 1 << 30,
            other => {
                return Err(SpawnError::InvalidResource {
                    value: self.memory.clone(),
                    reason: format!("unknown suffix {other:?}"),
                });
            }
        };

        Ok(value * multiplier)
    }
}

/// Worker process settings shared by both spawner backends.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Container image for the worker.
    pub image: String,
    /// Broker address handed to the worker (`--redis-url`).
    pub redis_url: String,
    pub resources: ResourceLimits,
    /// Names of credential environment variables forwarded to the worker.
    pub credentials: Vec<String>,
    /// Kubernetes namespace for worker Jobs.
    pub namespace: String,
    /// Pre-existing Kubernetes Secret holding the credentials.
    pub secret_name: String,
    /// Docker network override, used when auto-detection finds nothing.
    pub docker_network: Option<String>,
    /// Seconds a finished Kubernetes Job lingers before garbage collection.
    pub ttl_after_finished_secs: i32,
    /// Kubernetes Job retry budget.
    pub backoff_limit: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            resources: ResourceLimits::default(),
            credentials: Vec::new(),
            namespace: "default".to_string(),
            secret_name: "agent-worker-secrets".to_string(),
            docker_network: None,
            ttl_after_finished_secs: 3600,
            backoff_limit: 1,
        }
    }
}

/// A tracked project and the repository its tickets live in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectConfig {
    pub name: String,
    /// `owner/repo` on the ticket provider.
    pub repo: String,
}

impl ProjectConfig {
    pub fn new(name: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            repo: repo.into(),
        }
    }
}

/// Intent classifier settings.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub api_key: SecretString,
    pub model: String,
}

/// Telegram adapter settings.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub allowed_users: Vec<String>,
}

/// Full dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub broker: BrokerKind,
    pub redis_url: String,
    pub bus: BusConfig,
    pub spawner: SpawnerBackend,
    pub worker: WorkerConfig,
    pub projects: Vec<ProjectConfig>,
    /// How often the listener sweeps finished subscription tasks.
    pub sweep_interval: Duration,
    pub classifier: Option<ClassifierConfig>,
    pub github_token: Option<SecretString>,
    pub telegram: Option<TelegramConfig>,
}

impl DispatcherConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration using an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let broker = match get("DISPATCH_BROKER").as_deref() {
            None | Some("redis") => BrokerKind::Redis,
            Some("memory") => BrokerKind::Memory,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "DISPATCH_BROKER".into(),
                    message: format!("expected redis or memory, got {other}"),
                });
            }
        };

        let redis_url =
            get("DISPATCH_REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());

        let defaults = BusConfig::default();
        let bus = BusConfig {
            poll_interval: parse_millis(&get, "DISPATCH_POLL_INTERVAL_MS")?
                .unwrap_or(defaults.poll_interval),
            key_ttl: parse_secs(&get, "DISPATCH_STREAM_TTL_SECS")?.unwrap_or(defaults.key_ttl),
            stream_max_len: parse_number(&get, "DISPATCH_STREAM_MAXLEN")?
                .unwrap_or(defaults.stream_max_len),
            clarification_ttl: parse_secs(&get, "DISPATCH_CLARIFICATION_TTL_SECS")?
                .unwrap_or(defaults.clarification_ttl),
        };

        let spawner = match get("DISPATCH_SPAWNER").as_deref() {
            None | Some("kubernetes") | Some("k8s") => SpawnerBackend::Kubernetes,
            Some("docker") => SpawnerBackend::Docker,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "DISPATCH_SPAWNER".into(),
                    message: format!("expected kubernetes or docker, got {other}"),
                });
            }
        };

        let worker_defaults = WorkerConfig::default();
        let worker = WorkerConfig {
            image: get("DISPATCH_WORKER_IMAGE").unwrap_or_default(),
            redis_url: get("DISPATCH_WORKER_REDIS_URL").unwrap_or_else(|| redis_url.clone()),
            resources: ResourceLimits {
                cpu: get("DISPATCH_WORKER_CPU").unwrap_or(worker_defaults.resources.cpu),
                memory: get("DISPATCH_WORKER_MEMORY").unwrap_or(worker_defaults.resources.memory),
            },
            credentials: split_list(get("DISPATCH_WORKER_CREDENTIALS").as_deref()),
            namespace: get("DISPATCH_NAMESPACE").unwrap_or(worker_defaults.namespace),
            secret_name: get("DISPATCH_SECRET_NAME").unwrap_or(worker_defaults.secret_name),
            docker_network: get("DISPATCH_DOCKER_NETWORK"),
            ..worker_defaults
        };

        let projects = parse_projects(get("DISPATCH_PROJECTS").as_deref())?;

        let sweep_interval = parse_secs(&get, "DISPATCH_SWEEP_INTERVAL_SECS")?
            .unwrap_or(Duration::from_secs(30));

        let classifier = get("ANTHROPIC_API_KEY").map(|key| ClassifierConfig {
            api_key: SecretString::from(key),
            model: get("DISPATCH_CLASSIFIER_MODEL")
                .unwrap_or_else(|| "claude-3-5-haiku-latest".to_string()),
        });

        let telegram = get("TELEGRAM_BOT_TOKEN").map(|token| TelegramConfig {
            bot_token: SecretString::from(token),
            allowed_users: {
                let users = split_list(get("TELEGRAM_ALLOWED_USERS").as_deref());
                if users.is_empty() {
                    vec!["*".to_string()]
                } else {
                    users
                }
            },
        });

        Ok(Self {
            broker,
            redis_url,
            bus,
            spawner,
            worker,
            projects,
            sweep_interval,
            classifier,
            github_token: get("GITHUB_TOKEN").map(SecretString::from),
            telegram,
        })
    }

    /// Names of all configured projects.
    pub fn project_names(&self) -> Vec<String> {
        self.projects.iter().map(|p| p.name.clone()).collect()
    }
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `name=owner/repo,name2=owner/repo2`.
fn parse_projects(raw: Option<&str>) -> Result<Vec<ProjectConfig>, ConfigError> {
    split_list(raw)
        .into_iter()
        .map(|entry| {
            let (name, repo) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "DISPATCH_PROJECTS".into(),
                    message: format!("expected name=owner/repo, got {entry}"),
                })?;
            let (name, repo) = (name.trim(), repo.trim());
            if name.is_empty() || !repo.contains('/') {
                return Err(ConfigError::InvalidValue {
                    key: "DISPATCH_PROJECTS".into(),
                    message: format!("expected name=owner/repo, got {entry}"),
                });
            }
            Ok(ProjectConfig::new(name, repo))
        })
        .collect()
}

fn parse_number<F>(get: &F, key: &str) -> Result<Option<usize>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("not a number: {raw}"),
            })
        })
        .transpose()
}

fn parse_secs<F>(get: &F, key: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_number(get, key)?.map(|n| Duration::from_secs(n as u64)))
}

fn parse_millis<F>(get: &F, key: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_number(get, key)?.map(|n| Duration::from_millis(n as u64)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_environment_is_empty() {
        let config = DispatcherConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.broker, BrokerKind::Redis);
        assert_eq!(config.spawner, SpawnerBackend::Kubernetes);
        assert_eq!(config.bus.poll_interval, Duration::from_millis(500));
        assert_eq!(config.bus.key_ttl, Duration::from_secs(7200));
        assert_eq!(config.bus.stream_max_len, 1000);
        assert!(config.projects.is_empty());
        assert!(config.classifier.is_none());
        assert!(config.telegram.is_none());
    }

    #[test]
    fn parses_projects_and_overrides() {
        let config = DispatcherConfig::from_lookup(lookup(&[
            ("DISPATCH_SPAWNER", "docker"),
            ("DISPATCH_PROJECTS", "backend=acme/api, frontend=acme/web"),
            ("DISPATCH_POLL_INTERVAL_MS", "100"),
            ("DISPATCH_WORKER_CREDENTIALS", "GITHUB_TOKEN,ANTHROPIC_API_KEY"),
        ]))
        .unwrap();

        assert_eq!(config.spawner, SpawnerBackend::Docker);
        assert_eq!(
            config.projects,
            vec![
                ProjectConfig::new("backend", "acme/api"),
                ProjectConfig::new("frontend", "acme/web"),
            ]
        );
        assert_eq!(config.bus.poll_interval, Duration::from_millis(100));
        assert_eq!(config.worker.credentials.len(), 2);
        assert_eq!(config.worker.redis_url, config.redis_url);
    }

    #[test]
    fn rejects_malformed_project_entry() {
        let result = DispatcherConfig::from_lookup(lookup(&[("DISPATCH_PROJECTS", "backend")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn rejects_unknown_spawner() {
        let result = DispatcherConfig::from_lookup(lookup(&[("DISPATCH_SPAWNER", "nomad")]));
        assert!(result.is_err());
    }

    #[test]
    fn telegram_defaults_to_everyone() {
        let config =
            DispatcherConfig::from_lookup(lookup(&[("TELEGRAM_BOT_TOKEN", "123:abc")])).unwrap();
        assert_eq!(config.telegram.unwrap().allowed_users, vec!["*"]);
    }

    #[test]
    fn resource_quantities() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.nano_cpus().unwrap(), 2_000_000_000);
        assert_eq!(limits.memory_bytes().unwrap(), 4 * 1024 * 1024 * 1024);

        let limits = ResourceLimits {
            cpu: "500m".into(),
            memory: "512M".into(),
        };
        assert_eq!(limits.nano_cpus().unwrap(), 500_000_000);
        assert_eq!(limits.memory_bytes().unwrap(), 512_000_000);

        let bad = ResourceLimits {
            cpu: "lots".into(),
            memory: "4Xi".into(),
        };
        assert!(bad.nano_cpus().is_err());
        assert!(bad.memory_bytes().is_err());
    }
}
