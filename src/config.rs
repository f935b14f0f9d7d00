//! Configuration types.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Environment variable prefix for every setting.
const ENV_PREFIX: &str = "CONVO_QUEUE_";

/// Job manager configuration.
#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    /// Maximum number of non-terminal (queued + running) jobs.
    pub max_queue_size: usize,
    /// Time-to-live for queued and finished jobs.
    pub job_ttl: Duration,
    /// How often the TTL sweep runs.
    pub cleanup_interval: Duration,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            job_ttl: Duration::from_secs(3600), // 1 hour
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Where the computation graph lives and what may be loaded.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Directory every graph manifest must resolve inside.
    pub base_dir: PathBuf,
    /// Manifest location, absolute or relative to `base_dir`.
    pub path: PathBuf,
    /// Allowed manifest file extensions, without the leading dot.
    pub allowed_extensions: Vec<String>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./graphs"),
            path: PathBuf::from("echo.json"),
            allowed_extensions: vec!["json".to_string()],
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of execution units kept alive.
    pub max_workers: usize,
    /// Hard wall-clock limit for one task.
    pub execution_timeout: Duration,
    /// How long shutdown waits for each unit before abandoning it.
    pub termination_timeout: Duration,
    /// Delay before retrying dispatch when every worker is busy.
    pub dispatch_retry_delay: Duration,
    /// Delay before a crashed unit is replaced.
    pub respawn_delay: Duration,
    pub graph: GraphConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            execution_timeout: Duration::from_secs(300), // 5 minutes
            termination_timeout: Duration::from_secs(5),
            dispatch_retry_delay: Duration::from_millis(100),
            respawn_delay: Duration::from_millis(250),
            graph: GraphConfig::default(),
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Optional directory for a daily-rolling log file.
    pub log_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_dir: None,
        }
    }
}

/// Process configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub jobs: JobManagerConfig,
    pub pool: PoolConfig,
    pub server: ServerConfig,
}

impl Config {
    /// Build config from `CONVO_QUEUE_*` environment variables.
    ///
    /// Unset or unparsable values fall back to the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let jobs = JobManagerConfig {
            max_queue_size: env_parse("MAX_QUEUE_SIZE").unwrap_or(defaults.jobs.max_queue_size),
            job_ttl: env_parse("JOB_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.jobs.job_ttl),
            cleanup_interval: env_parse("CLEANUP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.jobs.cleanup_interval),
        };

        let graph = GraphConfig {
            base_dir: env_var("GRAPH_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.pool.graph.base_dir),
            path: env_var("GRAPH_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.pool.graph.path),
            allowed_extensions: env_var("GRAPH_EXTENSIONS")
                .map(|s| {
                    s.split(',')
                        .map(|e| e.trim().trim_start_matches('.').to_string())
                        .filter(|e| !e.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.pool.graph.allowed_extensions),
        };

        let pool = PoolConfig {
            max_workers: env_parse("MAX_WORKERS").unwrap_or(defaults.pool.max_workers),
            execution_timeout: env_parse("EXECUTION_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.pool.execution_timeout),
            termination_timeout: env_parse("TERMINATION_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.pool.termination_timeout),
            dispatch_retry_delay: env_parse("DISPATCH_RETRY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.pool.dispatch_retry_delay),
            respawn_delay: env_parse("RESPAWN_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.pool.respawn_delay),
            graph,
        };

        let server = ServerConfig {
            bind: env_parse("BIND").unwrap_or(defaults.server.bind),
            log_dir: env_var("LOG_DIR").map(PathBuf::from),
        };

        let config = Self { jobs, pool, server };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}MAX_WORKERS"),
                message: "at least one worker is required".to_string(),
            });
        }
        if self.jobs.max_queue_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}MAX_QUEUE_SIZE"),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.jobs.cleanup_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}CLEANUP_INTERVAL_SECS"),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.pool.graph.allowed_extensions.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}GRAPH_EXTENSIONS"),
                message: "at least one extension is required".to_string(),
            });
        }
        Ok(())
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .filter(|s| !s.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_var(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key = %format!("{ENV_PREFIX}{key}"), value = %raw, "Ignoring unparsable setting");
            None
        }
    }
}
