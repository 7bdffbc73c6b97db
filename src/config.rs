//! Configuration loader and validator for the board harvester.
use crate::model::Category;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema. Every section is
/// optional in the file and falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub app: App,
    pub credentials: Credentials,
    pub scraper: Scraper,
    pub session: Session,
    pub transport: Transport,
    pub proxy: Proxy,
    pub database: Database,
    pub helpers: Helpers,
    pub site: Site,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct App {
    pub data_dir: String,
    pub cookies_file: String,
    pub user_agent: String,
}

impl Default for App {
    fn default() -> Self {
        Self {
            data_dir: "./data".into(),
            cookies_file: "cookies.json".into(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Fetch scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Scraper {
    pub interval_seconds: f64,
    pub thread_count: usize,
    pub timeout_seconds: u64,
    pub max_connections: usize,
    pub max_page_retries: u32,
    pub max_board_retries: u32,
    pub max_item_page_retries: u32,
    pub join_grace_ms: u64,
    pub categories: Vec<Category>,
}

impl Default for Scraper {
    fn default() -> Self {
        Self {
            interval_seconds: 1.0,
            thread_count: 16,
            timeout_seconds: 10,
            max_connections: 64,
            max_page_retries: 20,
            max_board_retries: 10,
            max_item_page_retries: 10,
            join_grace_ms: 2000,
            categories: Category::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Session {
    pub probe_url: String,
    pub max_login_attempts: u32,
    pub max_blocked_attempts: u32,
    pub blocked_backoff_seconds: f64,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            probe_url: "https://q.10jqka.com.cn/gn/index/field/addtime/order/desc/page/30/ajax/1/"
                .into(),
            max_login_attempts: 6,
            max_blocked_attempts: 16,
            blocked_backoff_seconds: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// In-process CONNECT tunnel through the edge server.
    Tunnel,
    /// Supervised local forwarding proxy.
    Proxy,
    /// Plain direct connection.
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Transport {
    pub mode: TransportMode,
    pub edge_host: String,
    pub edge_port: u16,
    pub egress_check_url: String,
    pub fallback_to_direct: bool,
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            mode: TransportMode::Tunnel,
            edge_host: "110.242.70.68".into(),
            edge_port: 443,
            egress_check_url: "https://4.ipw.cn".into(),
            fallback_to_direct: true,
        }
    }
}

/// Local forwarding-proxy subprocess settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Proxy {
    pub binary: String,
    pub port: u32,
    pub server_ip: String,
    pub daemon_mode: bool,
    pub auto_restart: bool,
    pub health_check_interval_seconds: u64,
    pub startup_timeout_seconds: u64,
    pub pid_file: String,
}

impl Default for Proxy {
    fn default() -> Self {
        Self {
            binary: "./socket/thread_socket".into(),
            port: 8080,
            server_ip: "110.242.70.68".into(),
            daemon_mode: true,
            auto_restart: true,
            health_check_interval_seconds: 5,
            startup_timeout_seconds: 10,
            pid_file: "socket_proxy.pid".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Database {
    pub url: String,
    pub stale_timeout_hours: u64,
}

impl Default for Database {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/boards.db".into(),
            stale_timeout_hours: 1,
        }
    }
}

/// Command lines of the external helper processes. The operation name is
/// appended as the final argument.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Helpers {
    pub token: Vec<String>,
    pub crypto: Vec<String>,
    pub captcha: Vec<String>,
    pub timeout_seconds: u64,
}

impl Default for Helpers {
    fn default() -> Self {
        Self {
            token: vec!["node".into(), "helpers/token.js".into()],
            crypto: vec!["python3".into(), "helpers/crypto.py".into()],
            captcha: vec!["python3".into(), "helpers/captcha.py".into()],
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Site {
    pub base_url: String,
    pub upass_base: String,
    pub hawkeye_url: String,
    pub captcha_base: String,
}

impl Default for Site {
    fn default() -> Self {
        Self {
            base_url: "https://q.10jqka.com.cn".into(),
            upass_base: "https://upass.10jqka.com.cn".into(),
            hawkeye_url: "https://hawkeye.10jqka.com.cn/v1/hawkeye/generate".into(),
            captcha_base: "https://captcha.10jqka.com.cn".into(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn cookies_path(&self) -> PathBuf {
        Path::new(&self.app.data_dir).join(&self.app.cookies_file)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.scraper.timeout_seconds)
    }

    /// Concurrent detail connections: the pool size, capped by `max_connections`.
    pub fn connection_limit(&self) -> usize {
        self.scraper.thread_count.min(self.scraper.max_connections)
    }

    pub fn has_credentials(&self) -> bool {
        !self.credentials.username.trim().is_empty() && !self.credentials.password.is_empty()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate(self)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Like [`load`], but a missing file yields the defaults. The result is not
/// validated because CLI overrides are applied afterwards.
pub fn load_or_default(path: &Path) -> Result<(Config, bool), ConfigError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok((serde_yaml::from_str(&content)?, true)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok((Config::default(), false)),
        Err(err) => Err(err.into()),
    }
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.cookies_file.trim().is_empty() {
        return Err(ConfigError::Invalid("app.cookies_file must be non-empty"));
    }

    let s = &cfg.scraper;
    if !s.interval_seconds.is_finite() || s.interval_seconds < 0.0 {
        return Err(ConfigError::Invalid("scraper.interval_seconds must be >= 0"));
    }
    if !(1..=256).contains(&s.thread_count) {
        return Err(ConfigError::Invalid("scraper.thread_count must be within 1..=256"));
    }
    if s.timeout_seconds < 1 {
        return Err(ConfigError::Invalid("scraper.timeout_seconds must be >= 1"));
    }
    if !(1..=64).contains(&s.max_connections) {
        return Err(ConfigError::Invalid("scraper.max_connections must be within 1..=64"));
    }
    if s.max_page_retries == 0 || s.max_board_retries == 0 || s.max_item_page_retries == 0 {
        return Err(ConfigError::Invalid("scraper retry ceilings must be > 0"));
    }
    if s.categories.is_empty() {
        return Err(ConfigError::Invalid("scraper.categories must be non-empty"));
    }

    if cfg.session.probe_url.trim().is_empty() {
        return Err(ConfigError::Invalid("session.probe_url must be non-empty"));
    }
    if cfg.session.max_login_attempts == 0 || cfg.session.max_blocked_attempts == 0 {
        return Err(ConfigError::Invalid("session attempt ceilings must be > 0"));
    }
    if !cfg.session.blocked_backoff_seconds.is_finite() || cfg.session.blocked_backoff_seconds < 0.0 {
        return Err(ConfigError::Invalid("session.blocked_backoff_seconds must be >= 0"));
    }

    if cfg.transport.edge_host.trim().is_empty() {
        return Err(ConfigError::Invalid("transport.edge_host must be non-empty"));
    }
    if cfg.transport.edge_port == 0 {
        return Err(ConfigError::Invalid("transport.edge_port must be within 1..=65535"));
    }

    let p = &cfg.proxy;
    if !(1..=65535).contains(&p.port) {
        return Err(ConfigError::Invalid("proxy.port must be within 1..=65535"));
    }
    if p.binary.trim().is_empty() {
        return Err(ConfigError::Invalid("proxy.binary must be non-empty"));
    }
    if p.pid_file.trim().is_empty() {
        return Err(ConfigError::Invalid("proxy.pid_file must be non-empty"));
    }
    if p.health_check_interval_seconds == 0 || p.startup_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("proxy intervals must be > 0"));
    }

    if cfg.database.url.trim().is_empty() {
        return Err(ConfigError::Invalid("database.url must be non-empty"));
    }

    if cfg.helpers.token.is_empty() || cfg.helpers.crypto.is_empty() || cfg.helpers.captcha.is_empty() {
        return Err(ConfigError::Invalid("helpers.* command lines must be non-empty"));
    }

    if cfg.site.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("site.base_url must be non-empty"));
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  cookies_file: "cookies.json"

credentials:
  username: "YOUR_ACCOUNT"
  password: "YOUR_PASSWORD"

scraper:
  interval_seconds: 1.0
  thread_count: 32
  timeout_seconds: 10
  max_connections: 64
  max_page_retries: 20
  max_board_retries: 10
  max_item_page_retries: 10
  join_grace_ms: 2000
  categories: [industry, concept, region]

session:
  max_login_attempts: 6
  max_blocked_attempts: 16
  blocked_backoff_seconds: 2

transport:
  mode: tunnel
  edge_host: "110.242.70.68"
  edge_port: 443
  egress_check_url: "https://4.ipw.cn"
  fallback_to_direct: true

proxy:
  binary: "./socket/thread_socket"
  port: 8080
  server_ip: "110.242.70.68"
  daemon_mode: true
  auto_restart: true
  health_check_interval_seconds: 5
  startup_timeout_seconds: 10
  pid_file: "socket_proxy.pid"

database:
  url: "sqlite://./data/boards.db"
  stale_timeout_hours: 1

helpers:
  token: ["node", "helpers/token.js"]
  crypto: ["python3", "helpers/crypto.py"]
  captcha: ["python3", "helpers/captcha.py"]
  timeout_seconds: 30
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.scraper.thread_count, 32);
        assert_eq!(cfg.transport.mode, TransportMode::Tunnel);
        assert!(cfg.has_credentials());
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let cfg: Config = serde_yaml::from_str("scraper:\n  thread_count: 8\n").unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.scraper.thread_count, 8);
        assert_eq!(cfg.scraper.max_page_retries, 20);
        assert_eq!(cfg.proxy.port, 8080);
        assert!(!cfg.has_credentials());
    }

    #[test]
    fn thread_count_out_of_range() {
        for bad in [0usize, 257] {
            let mut cfg = Config::default();
            cfg.scraper.thread_count = bad;
            match validate(&cfg).unwrap_err() {
                ConfigError::Invalid(msg) => assert!(msg.contains("thread_count")),
                _ => panic!("wrong error"),
            }
        }
    }

    #[test]
    fn timeout_and_interval_bounds() {
        let mut cfg = Config::default();
        cfg.scraper.timeout_seconds = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(m)) if m.contains("timeout")));

        let mut cfg = Config::default();
        cfg.scraper.interval_seconds = -0.5;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(m)) if m.contains("interval")));

        let mut cfg = Config::default();
        cfg.scraper.interval_seconds = 0.0;
        validate(&cfg).unwrap();
    }

    #[test]
    fn proxy_port_bounds() {
        let mut cfg = Config::default();
        cfg.proxy.port = 70000;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(m)) if m.contains("proxy.port")));
        cfg.proxy.port = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn connection_limit_caps_pool_size() {
        let mut cfg = Config::default();
        cfg.scraper.thread_count = 200;
        assert_eq!(cfg.connection_limit(), 64);
        cfg.scraper.thread_count = 8;
        assert_eq!(cfg.connection_limit(), 8);
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = Config::default();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
        assert_eq!(cfg.cookies_path(), data_path.join("cookies.json"));
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.credentials.username, "YOUR_ACCOUNT");
        assert_eq!(cfg.scraper.categories.len(), 3);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let td = tempdir().unwrap();
        let (cfg, found) = load_or_default(&td.path().join("absent.yaml")).unwrap();
        assert!(!found);
        assert_eq!(cfg, Config::default());
    }
}
