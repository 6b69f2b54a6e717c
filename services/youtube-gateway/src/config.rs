//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys come from YOUTUBE_API_KEYS or `quota.api_keys_file` and the Redis
//! password from REDIS_PASSWORD, never from the TOML directly, so secrets stay
//! out of checked-in config.

use common::Secret;
use key_pool::{DispatchSettings, PoolSettings, RedisSettings, ThresholdPolicy, ZonedClock};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// Ordered API keys, resolved from env or `quota.api_keys_file`
    #[serde(skip)]
    pub api_keys: Vec<Secret<String>>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// YouTube Data API settings
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub jitter_min_ms: u64,
    #[serde(default)]
    pub jitter_max_ms: u64,
}

/// Daily quota and rotation thresholds
#[derive(Debug, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u64,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_fraction_min")]
    pub fraction_min: f64,
    #[serde(default = "default_fraction_max")]
    pub fraction_max: f64,
    #[serde(default = "default_requests_min")]
    pub requests_min: u64,
    #[serde(default = "default_requests_max")]
    pub requests_max: u64,
    /// File with one key per line (alternative to YOUTUBE_API_KEYS)
    #[serde(default)]
    pub api_keys_file: Option<PathBuf>,
}

/// Shared ledger store settings
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_host")]
    pub host: String,
    #[serde(default = "default_store_port")]
    pub port: u16,
    #[serde(default)]
    pub db: i64,
    #[serde(skip)]
    pub password: Option<Secret<String>>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_delay")]
    pub connect_delay_secs: u64,
    #[serde(default = "default_store_timeout")]
    pub timeout_secs: u64,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

fn default_max_connections() -> usize {
    1000
}

fn default_base_url() -> String {
    "https://www.googleapis.com/youtube/v3".into()
}

fn default_upstream_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_daily_limit() -> u64 {
    10_000
}

fn default_timezone() -> String {
    "America/Los_Angeles".into()
}

fn default_fraction_min() -> f64 {
    0.75
}

fn default_fraction_max() -> f64 {
    0.85
}

fn default_requests_min() -> u64 {
    800
}

fn default_requests_max() -> u64 {
    1200
}

fn default_store_host() -> String {
    "redis".into()
}

fn default_store_port() -> u16 {
    6379
}

fn default_key_prefix() -> String {
    "youtube_api:".into()
}

fn default_connect_attempts() -> u32 {
    15
}

fn default_connect_delay() -> u64 {
    10
}

fn default_store_timeout() -> u64 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_upstream_timeout(),
            max_retries: default_max_retries(),
            jitter_min_ms: 0,
            jitter_max_ms: 0,
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
            timezone: default_timezone(),
            fraction_min: default_fraction_min(),
            fraction_max: default_fraction_max(),
            requests_min: default_requests_min(),
            requests_max: default_requests_max(),
            api_keys_file: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_store_host(),
            port: default_store_port(),
            db: 0,
            password: None,
            key_prefix: default_key_prefix(),
            connect_attempts: default_connect_attempts(),
            connect_delay_secs: default_connect_delay(),
            timeout_secs: default_store_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Defaults plus environment, for deployments without a config file.
    pub fn from_env() -> common::Result<Self> {
        Self::from_toml("")
    }

    fn from_toml(contents: &str) -> common::Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay environment variables on file values.
    ///
    /// API key resolution order:
    /// 1. YOUTUBE_API_KEYS env var (comma-separated)
    /// 2. api_keys_file path from config (one per line or comma-separated)
    fn apply_env(&mut self) -> common::Result<()> {
        if let Ok(keys) = std::env::var("YOUTUBE_API_KEYS") {
            self.api_keys = parse_keys(&keys);
        } else if let Some(ref key_file) = self.quota.api_keys_file {
            let keys = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read api_keys_file {}: {e}",
                    key_file.display()
                ))
            })?;
            self.api_keys = parse_keys(&keys);
        }

        if let Ok(host) = std::env::var("REDIS_HOST") {
            self.store.host = host;
        }
        if let Ok(port) = std::env::var("REDIS_PORT") {
            self.store.port = parse_env("REDIS_PORT", &port)?;
        }
        if let Ok(db) = std::env::var("REDIS_DB") {
            self.store.db = parse_env("REDIS_DB", &db)?;
        }
        if let Ok(password) = std::env::var("REDIS_PASSWORD") {
            let password = Secret::new(password);
            self.store.password = (!password.is_blank()).then_some(password);
        }
        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        if !self.upstream.base_url.starts_with("http://")
            && !self.upstream.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.upstream.base_url
            )));
        }
        if self.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "upstream timeout_secs must be greater than 0".into(),
            ));
        }
        if self.upstream.jitter_min_ms > self.upstream.jitter_max_ms {
            return Err(common::Error::Config(
                "jitter_min_ms must not exceed jitter_max_ms".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.quota.daily_limit == 0 {
            return Err(common::Error::Config(
                "daily_limit must be greater than 0".into(),
            ));
        }
        if self.store.timeout_secs == 0 {
            return Err(common::Error::Config(
                "store timeout_secs must be greater than 0".into(),
            ));
        }
        ZonedClock::from_name(&self.quota.timezone)
            .map_err(|e| common::Error::Config(e.to_string()))?;
        self.threshold_policy()
            .map_err(|e| common::Error::Config(e.to_string()))?;
        if self.api_keys.is_empty() {
            return Err(common::Error::Config(
                "no API keys configured (set YOUTUBE_API_KEYS or quota.api_keys_file)".into(),
            ));
        }
        Ok(())
    }

    /// Rotation thresholds, ranged unless min and max coincide.
    pub fn threshold_policy(&self) -> key_pool::Result<ThresholdPolicy> {
        ThresholdPolicy::ranged(
            self.quota.fraction_min..=self.quota.fraction_max,
            self.quota.requests_min..=self.quota.requests_max,
        )
    }

    pub fn clock(&self) -> key_pool::Result<ZonedClock> {
        ZonedClock::from_name(&self.quota.timezone)
    }

    pub fn redis_settings(&self) -> RedisSettings {
        RedisSettings {
            host: self.store.host.clone(),
            port: self.store.port,
            db: self.store.db,
            password: self.store.password.clone(),
            connect_attempts: self.store.connect_attempts,
            connect_delay: Duration::from_secs(self.store.connect_delay_secs),
            timeout: Duration::from_secs(self.store.timeout_secs),
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            daily_limit: self.quota.daily_limit,
            key_prefix: self.store.key_prefix.clone(),
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        let jitter = (self.upstream.jitter_max_ms > 0).then(|| {
            (
                Duration::from_millis(self.upstream.jitter_min_ms),
                Duration::from_millis(self.upstream.jitter_max_ms),
            )
        });
        DispatchSettings {
            base_url: self.upstream.base_url.clone(),
            timeout: Duration::from_secs(self.upstream.timeout_secs),
            max_retries: self.upstream.max_retries,
            jitter,
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("youtube-gateway.toml")
    }
}

/// Split on commas and newlines, dropping blanks.
fn parse_keys(raw: &str) -> Vec<Secret<String>> {
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| Secret::new(k.to_owned()))
        .collect()
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> common::Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| common::Error::Env {
        var: var.into(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_VARS: &[&str] = &[
        "YOUTUBE_API_KEYS",
        "REDIS_HOST",
        "REDIS_PORT",
        "REDIS_DB",
        "REDIS_PASSWORD",
        "CONFIG_PATH",
    ];

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn clear_env() {
        for var in ENV_VARS {
            unsafe { std::env::remove_var(var) };
        }
    }

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    fn full_toml() -> &'static str {
        r#"
[server]
listen_addr = "127.0.0.1:9000"
max_connections = 200

[upstream]
base_url = "http://127.0.0.1:9999/youtube/v3"
timeout_secs = 3
max_retries = 5
jitter_min_ms = 10
jitter_max_ms = 40

[quota]
daily_limit = 5000
timezone = "UTC"
fraction_min = 0.8
fraction_max = 0.8
requests_min = 100
requests_max = 100

[store]
host = "localhost"
port = 6380
db = 2
key_prefix = "yt:"
connect_attempts = 2
connect_delay_secs = 1
timeout_secs = 1
"#
    }

    #[test]
    fn defaults_apply_without_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        unsafe { set_env("YOUTUBE_API_KEYS", "k1,k2") };

        let config = Config::from_env().unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:8000".parse().unwrap());
        assert_eq!(config.server.max_connections, 1000);
        assert_eq!(config.upstream.base_url, "https://www.googleapis.com/youtube/v3");
        assert_eq!(config.upstream.timeout_secs, 10);
        assert_eq!(config.upstream.max_retries, 3);
        assert_eq!(config.quota.daily_limit, 10_000);
        assert_eq!(config.quota.timezone, "America/Los_Angeles");
        assert_eq!(config.store.host, "redis");
        assert_eq!(config.store.port, 6379);
        assert_eq!(config.store.key_prefix, "youtube_api:");
        assert_eq!(config.store.connect_attempts, 15);
        assert_eq!(config.api_keys.len(), 2);
        assert!(config.dispatch_settings().jitter.is_none());

        unsafe { clear_env() };
    }

    #[test]
    fn load_full_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        unsafe { set_env("YOUTUBE_API_KEYS", "only-key") };
        let (_dir, path) = write_config(full_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.max_connections, 200);
        assert_eq!(config.upstream.max_retries, 5);
        assert_eq!(config.quota.daily_limit, 5000);
        assert_eq!(config.store.db, 2);

        let dispatch = config.dispatch_settings();
        assert_eq!(dispatch.timeout, Duration::from_secs(3));
        assert_eq!(
            dispatch.jitter,
            Some((Duration::from_millis(10), Duration::from_millis(40)))
        );

        let redis = config.redis_settings();
        assert_eq!(redis.host, "localhost");
        assert_eq!(redis.port, 6380);
        assert_eq!(redis.connect_delay, Duration::from_secs(1));
        assert!(redis.password.is_none());

        let pool = config.pool_settings();
        assert_eq!(pool.daily_limit, 5000);
        assert_eq!(pool.key_prefix, "yt:");

        assert!(matches!(
            config.threshold_policy().unwrap(),
            ThresholdPolicy::Fixed(_)
        ));

        unsafe { clear_env() };
    }

    #[test]
    fn load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn load_invalid_toml() {
        let (_dir, path) = write_config("not valid {{{{ toml");
        let result = Config::load(&path);
        assert!(matches!(result, Err(common::Error::Toml(_))));
    }

    #[test]
    fn keys_from_env_are_trimmed_and_filtered() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        unsafe { set_env("YOUTUBE_API_KEYS", " a , ,b,,  c ") };

        let config = Config::from_env().unwrap();
        let keys: Vec<&str> = config.api_keys.iter().map(|k| k.expose().as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);

        unsafe { clear_env() };
    }

    #[test]
    fn keys_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("keys");
        std::fs::write(&key_path, "file-key-1\n\nfile-key-2\n").unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            format!("[quota]\napi_keys_file = \"{}\"\n", key_path.display()),
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.api_keys.len(), 2);
        assert_eq!(config.api_keys[1].expose(), "file-key-2");
    }

    #[test]
    fn env_keys_override_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        let (_dir, path) =
            write_config("[quota]\napi_keys_file = \"/nonexistent/path/keys\"\n");

        unsafe { set_env("YOUTUBE_API_KEYS", "env-key") };
        let config = Config::load(&path).unwrap();
        assert_eq!(config.api_keys.len(), 1);
        assert_eq!(config.api_keys[0].expose(), "env-key");

        unsafe { clear_env() };
    }

    #[test]
    fn missing_keys_file_is_an_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        let (_dir, path) =
            write_config("[quota]\napi_keys_file = \"/nonexistent/path/keys\"\n");

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("api_keys_file"), "got: {err}");
    }

    #[test]
    fn no_keys_is_fatal() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        unsafe { set_env("YOUTUBE_API_KEYS", " , ,") };

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("no API keys"), "got: {err}");

        unsafe { clear_env() };
    }

    #[test]
    fn redis_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        unsafe { set_env("YOUTUBE_API_KEYS", "k") };
        unsafe { set_env("REDIS_HOST", "cache.internal") };
        unsafe { set_env("REDIS_PORT", "7000") };
        unsafe { set_env("REDIS_DB", "3") };
        unsafe { set_env("REDIS_PASSWORD", "hunter2") };
        let (_dir, path) = write_config(full_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.store.host, "cache.internal");
        assert_eq!(config.store.port, 7000);
        assert_eq!(config.store.db, 3);
        assert_eq!(config.store.password.as_ref().unwrap().expose(), "hunter2");
        assert!(!format!("{config:?}").contains("hunter2"));

        unsafe { clear_env() };
    }

    #[test]
    fn blank_redis_password_is_ignored() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        unsafe { set_env("YOUTUBE_API_KEYS", "k") };
        unsafe { set_env("REDIS_PASSWORD", "  ") };

        let config = Config::from_env().unwrap();
        assert!(config.store.password.is_none());

        unsafe { clear_env() };
    }

    #[test]
    fn bad_redis_port_names_the_variable() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        unsafe { set_env("YOUTUBE_API_KEYS", "k") };
        unsafe { set_env("REDIS_PORT", "sixty") };

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, common::Error::Env { ref var, .. } if var == "REDIS_PORT"));

        unsafe { clear_env() };
    }

    fn assert_rejected(toml: &str, expected: &str) {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        unsafe { set_env("YOUTUBE_API_KEYS", "k") };
        let (_dir, path) = write_config(toml);

        let err = Config::load(&path).unwrap_err();
        assert!(
            err.to_string().contains(expected),
            "expected error containing {expected:?}, got: {err}"
        );

        unsafe { clear_env() };
    }

    #[test]
    fn invalid_base_url_rejected() {
        assert_rejected(
            "[upstream]\nbase_url = \"www.googleapis.com\"\n",
            "base_url must start with http",
        );
    }

    #[test]
    fn zero_timeouts_rejected() {
        assert_rejected("[upstream]\ntimeout_secs = 0\n", "timeout_secs");
        assert_rejected("[store]\ntimeout_secs = 0\n", "timeout_secs");
    }

    #[test]
    fn zero_max_connections_rejected() {
        assert_rejected("[server]\nmax_connections = 0\n", "max_connections");
    }

    #[test]
    fn zero_daily_limit_rejected() {
        assert_rejected("[quota]\ndaily_limit = 0\n", "daily_limit");
    }

    #[test]
    fn unknown_timezone_rejected() {
        assert_rejected("[quota]\ntimezone = \"Pacific/Nowhere\"\n", "Pacific/Nowhere");
    }

    #[test]
    fn bad_thresholds_rejected() {
        assert_rejected("[quota]\nfraction_min = 0.9\nfraction_max = 0.7\n", "inverted");
        assert_rejected("[quota]\nfraction_max = 1.5\n", "fraction");
        assert_rejected("[quota]\nrequests_min = 0\n", "request threshold");
    }

    #[test]
    fn inverted_jitter_rejected() {
        assert_rejected(
            "[upstream]\njitter_min_ms = 50\njitter_max_ms = 10\n",
            "jitter_min_ms",
        );
    }

    #[test]
    fn resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { clear_env() };
    }

    #[test]
    fn resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("youtube-gateway.toml"));
    }

    #[test]
    fn resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { clear_env() };
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(
            path,
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONFIG_PATH env var"
        );
        unsafe { clear_env() };
    }
}
