//! Configuration loaded from the environment.
//!
//! Every value has a default except the database URL. Variables are read from
//! the process environment after loading an optional `.env` file.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub database: Option<DatabaseConfig>,
    pub vault: VaultConfig,
    pub coordinator: CoordinatorConfig,
    pub reconnect: ReconnectConfig,
    pub session: SessionConfig,
    pub health: HealthConfig,
    pub dedup: DedupConfig,
    pub webhook: WebhookConfig,
}

impl Config {
    /// Load configuration from `.env` and the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };

        let database = match env.string("DATABASE_URL") {
            Some(url) => Some(DatabaseConfig {
                url: SecretString::from(url),
                pool_size: env.parse("DATABASE_POOL_SIZE")?.unwrap_or(10),
            }),
            None => None,
        };

        let vault_defaults = VaultConfig::default();
        let vault = VaultConfig {
            root: env
                .string("TETHER_CREDENTIALS_DIR")
                .map(PathBuf::from)
                .unwrap_or(vault_defaults.root),
            backup_retain: env
                .parse("TETHER_BACKUP_RETAIN")?
                .unwrap_or(vault_defaults.backup_retain),
            backup_interval: env
                .secs("TETHER_BACKUP_INTERVAL_SECS")?
                .unwrap_or(vault_defaults.backup_interval),
            lock_timeout: env
                .millis("TETHER_CREDENTIAL_LOCK_TIMEOUT_MS")?
                .unwrap_or(vault_defaults.lock_timeout),
            freshness_timeout: env
                .millis("TETHER_FRESHNESS_TIMEOUT_MS")?
                .unwrap_or(vault_defaults.freshness_timeout),
        };

        let coord_defaults = CoordinatorConfig::default();
        let coordinator = CoordinatorConfig {
            heartbeat_interval: env
                .secs("TETHER_HEARTBEAT_INTERVAL_SECS")?
                .unwrap_or(coord_defaults.heartbeat_interval),
            stale_after: env
                .secs("TETHER_OWNER_STALE_SECS")?
                .unwrap_or(coord_defaults.stale_after),
        };

        let rc = ReconnectConfig::default();
        let reconnect = ReconnectConfig {
            max_attempts: env.parse("TETHER_RECONNECT_MAX_ATTEMPTS")?.unwrap_or(rc.max_attempts),
            base_delay: env.millis("TETHER_RECONNECT_BASE_MS")?.unwrap_or(rc.base_delay),
            max_delay: env.millis("TETHER_RECONNECT_MAX_MS")?.unwrap_or(rc.max_delay),
            restart_delay: env
                .millis("TETHER_RESTART_DELAY_MS")?
                .unwrap_or(rc.restart_delay),
            rate_limit_base: env
                .secs("TETHER_RATE_LIMIT_BASE_SECS")?
                .unwrap_or(rc.rate_limit_base),
            rate_limit_max: env
                .secs("TETHER_RATE_LIMIT_MAX_SECS")?
                .unwrap_or(rc.rate_limit_max),
            jitter_ratio: env.parse("TETHER_JITTER_RATIO")?.unwrap_or(rc.jitter_ratio),
            credential_cooldown: env
                .secs("TETHER_CREDENTIAL_COOLDOWN_SECS")?
                .unwrap_or(rc.credential_cooldown),
            unknown_cooldown: env
                .secs("TETHER_UNKNOWN_COOLDOWN_SECS")?
                .unwrap_or(rc.unknown_cooldown),
        };
        if !(0.0..=1.0).contains(&reconnect.jitter_ratio) {
            return Err(ConfigError::InvalidValue {
                key: "TETHER_JITTER_RATIO".to_string(),
                message: "must be between 0.0 and 1.0".to_string(),
            });
        }

        let sc = SessionConfig::default();
        let session = SessionConfig {
            init_lock_ceiling: env
                .secs("TETHER_INIT_LOCK_CEILING_SECS")?
                .unwrap_or(sc.init_lock_ceiling),
            pairing_code_validity: env
                .secs("TETHER_PAIRING_CODE_VALIDITY_SECS")?
                .unwrap_or(sc.pairing_code_validity),
            start_wait: env.secs("TETHER_START_WAIT_SECS")?.unwrap_or(sc.start_wait),
        };

        let hc = HealthConfig::default();
        let health = HealthConfig {
            probe_interval: env
                .secs("TETHER_PROBE_INTERVAL_SECS")?
                .unwrap_or(hc.probe_interval),
            probe_timeout: env
                .secs("TETHER_PROBE_TIMEOUT_SECS")?
                .unwrap_or(hc.probe_timeout),
            max_probe_failures: env
                .parse("TETHER_MAX_PROBE_FAILURES")?
                .unwrap_or(hc.max_probe_failures),
            silence_threshold: env
                .secs("TETHER_SILENCE_THRESHOLD_SECS")?
                .unwrap_or(hc.silence_threshold),
            check_interval: env
                .secs("TETHER_HEALTH_CHECK_INTERVAL_SECS")?
                .unwrap_or(hc.check_interval),
        };

        let dc = DedupConfig::default();
        let dedup = DedupConfig {
            bucket_width: env.secs("TETHER_DEDUP_BUCKET_SECS")?.unwrap_or(dc.bucket_width),
            echo_window: env.secs("TETHER_ECHO_WINDOW_SECS")?.unwrap_or(dc.echo_window),
            collapse_whitespace: env
                .parse("TETHER_DEDUP_COLLAPSE_WHITESPACE")?
                .unwrap_or(dc.collapse_whitespace),
            case_insensitive: env
                .parse("TETHER_DEDUP_CASE_INSENSITIVE")?
                .unwrap_or(dc.case_insensitive),
            keep_distinct_ids: env
                .parse("TETHER_DEDUP_KEEP_DISTINCT_IDS")?
                .unwrap_or(dc.keep_distinct_ids),
        };
        if dedup.bucket_width.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "TETHER_DEDUP_BUCKET_SECS".to_string(),
                message: "must be at least 1 second".to_string(),
            });
        }

        let wc = WebhookConfig::default();
        let webhook = WebhookConfig {
            url: env.string("TETHER_WEBHOOK_URL"),
            secret: env.string("TETHER_WEBHOOK_SECRET").map(SecretString::from),
            timeout: env.secs("TETHER_WEBHOOK_TIMEOUT_SECS")?.unwrap_or(wc.timeout),
            max_attempts: env
                .parse("TETHER_WEBHOOK_MAX_ATTEMPTS")?
                .unwrap_or(wc.max_attempts),
            initial_backoff: env
                .millis("TETHER_WEBHOOK_BACKOFF_MS")?
                .unwrap_or(wc.initial_backoff),
            forward_outbound: env
                .parse("TETHER_WEBHOOK_FORWARD_OUTBOUND")?
                .unwrap_or(wc.forward_outbound),
        };

        Ok(Self {
            database,
            vault,
            coordinator,
            reconnect,
            session,
            health,
            dedup,
            webhook,
        })
    }

    /// Database configuration, or an error naming the missing variable.
    pub fn require_database(&self) -> Result<&DatabaseConfig, ConfigError> {
        self.database
            .as_ref()
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "DATABASE_URL".to_string(),
                hint: "Set DATABASE_URL to a PostgreSQL connection string".to_string(),
            })
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    fn secs(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_secs))
    }

    fn millis(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }
}

/// PostgreSQL connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: SecretString,
    pub pool_size: usize,
}

impl DatabaseConfig {
    /// The connection URL.
    pub fn url(&self) -> &str {
        self.url.expose_secret()
    }
}

/// Credential vault settings.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Root directory holding one subdirectory per agent.
    pub root: PathBuf,
    /// Number of timestamped snapshots kept per agent.
    pub backup_retain: usize,
    /// Interval between snapshots while connected.
    pub backup_interval: Duration,
    /// How long to wait for the cross-process mirror lock.
    pub lock_timeout: Duration,
    /// Upper bound on the lifecycle lookup during freshness validation.
    pub freshness_timeout: Duration,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            root: default_credentials_dir(),
            backup_retain: 5,
            backup_interval: Duration::from_secs(30 * 60),
            lock_timeout: Duration::from_secs(5),
            freshness_timeout: Duration::from_secs(3),
        }
    }
}

impl VaultConfig {
    /// Vault rooted at a specific directory.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_freshness_timeout(mut self, timeout: Duration) -> Self {
        self.freshness_timeout = timeout;
        self
    }
}

/// Get the default credential directory (~/.tether/credentials).
pub fn default_credentials_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tether")
        .join("credentials")
}

/// Instance ownership settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How often a connected owner refreshes its heartbeat.
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which another instance may take over.
    pub stale_after: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(120),
        }
    }
}

/// Reconnection policy settings.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Delay before reconnecting after a restart-required close.
    pub restart_delay: Duration,
    pub rate_limit_base: Duration,
    pub rate_limit_max: Duration,
    /// Fraction of the delay randomized in either direction.
    pub jitter_ratio: f64,
    /// Cooldown armed after credentials are invalidated.
    pub credential_cooldown: Duration,
    /// Cooldown armed after an unclassifiable failure.
    pub unknown_cooldown: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            restart_delay: Duration::from_millis(250),
            rate_limit_base: Duration::from_secs(30),
            rate_limit_max: Duration::from_secs(10 * 60),
            jitter_ratio: 0.2,
            credential_cooldown: Duration::from_secs(10 * 60),
            unknown_cooldown: Duration::from_secs(2 * 60),
        }
    }
}

impl ReconnectConfig {
    /// Disable jitter (deterministic delays).
    pub fn without_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }
}

/// Session state machine settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Age after which a held initialization lock is discarded.
    pub init_lock_ceiling: Duration,
    /// How long an issued pairing code stays valid.
    pub pairing_code_validity: Duration,
    /// How long `start()` waits for the session to leave INITIALIZING.
    pub start_wait: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            init_lock_ceiling: Duration::from_secs(60),
            pairing_code_validity: Duration::from_secs(60),
            start_wait: Duration::from_secs(20),
        }
    }
}

/// Health monitor settings.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub max_probe_failures: u32,
    /// Inbound silence after which the session is considered dead.
    pub silence_threshold: Duration,
    pub check_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            max_probe_failures: 3,
            silence_threshold: Duration::from_secs(10 * 60),
            check_interval: Duration::from_secs(60),
        }
    }
}

/// Duplicate and echo suppression settings.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Width of the coarse time bucket in the fallback key.
    pub bucket_width: Duration,
    /// Window in which a local send's network echo is recognized.
    pub echo_window: Duration,
    /// Collapse runs of whitespace before hashing content.
    pub collapse_whitespace: bool,
    /// Lowercase content before hashing.
    pub case_insensitive: bool,
    /// Store a network message whose fallback key matches an earlier
    /// network record with a different external id. Off by default: any
    /// fallback-key match is a duplicate, since ids differ across origin
    /// paths for the same message.
    pub keep_distinct_ids: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            bucket_width: Duration::from_secs(10),
            echo_window: Duration::from_secs(30),
            collapse_whitespace: true,
            case_insensitive: false,
            keep_distinct_ids: false,
        }
    }
}

/// Webhook forwarding settings.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Target URL. Forwarding is disabled when unset.
    pub url: Option<String>,
    /// Shared secret sent with every delivery.
    pub secret: Option<SecretString>,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    /// Forward outbound messages as well as inbound ones.
    pub forward_outbound: bool,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            secret: None,
            timeout: Duration::from_secs(10),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            forward_outbound: true,
        }
    }
}
