use anyhow::{Context, Result};
use board_harvest::collab::Collaborators;
use board_harvest::config::{self, Config, TransportMode};
use board_harvest::db;
use board_harvest::harvest::Harvester;
use board_harvest::model::Category;
use board_harvest::proxy::ProxySupervisor;
use board_harvest::scheduler::{ScrapeSettings, Scheduler};
use board_harvest::session::{
    CookieFile, LoginEndpoints, PasswordLogin, SessionError, SessionManager, SessionPolicy, SiteClient,
};
use board_harvest::transport::{egress_ip, ReqwestTransport, Transport, TunnelTransport};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG: u8 = 1;
const EXIT_FATAL: u8 = 2;
const EXIT_RUN_FAILED: u8 = 4;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(short = 'c', long, default_value = "config.yaml")]
    config: PathBuf,

    /// Account name
    #[arg(short = 'u', long = "user")]
    user: Option<String>,

    #[arg(short = 'p', long)]
    password: Option<String>,

    /// Mean delay between requests, in seconds
    #[arg(short = 'b', long)]
    interval: Option<f64>,

    /// Categories to scrape (industry|concept|region or 1|2|3), e.g. `-B 2 3`
    #[arg(short = 'B', long = "board", num_args = 1.., value_parser = parse_category)]
    boards: Vec<Category>,

    /// Worker pool size
    #[arg(short = 'H', long)]
    threads: Option<usize>,

    /// Request timeout, in seconds
    #[arg(short = 't', long)]
    timeout: Option<u64>,

    #[arg(long, value_enum, conflicts_with_all = ["proxy", "direct"])]
    mode: Option<TransportMode>,

    /// Shortcut for --mode proxy
    #[arg(short = 's', long, conflicts_with = "direct")]
    proxy: bool,

    /// Shortcut for --mode direct
    #[arg(short = 'd', long)]
    direct: bool,

    #[arg(short = 'P', long = "proxy-port")]
    proxy_port: Option<u32>,

    /// Print an example configuration and exit
    #[arg(long)]
    print_config: bool,
}

/// Stale-batch age in hours as a duration, saturating on overflow.
fn stale_after(hours: u64) -> Duration {
    Duration::from_secs(hours.saturating_mul(3600))
}

fn parse_category(s: &str) -> Result<Category, String> {
    Category::parse(s).ok_or_else(|| format!("unknown category {s:?}; expected industry, concept, region or 1-3"))
}

impl Args {
    fn apply(&self, cfg: &mut Config) {
        if let Some(user) = &self.user {
            cfg.credentials.username = user.clone();
        }
        if let Some(password) = &self.password {
            cfg.credentials.password = password.clone();
        }
        if let Some(interval) = self.interval {
            cfg.scraper.interval_seconds = interval;
        }
        if !self.boards.is_empty() {
            let mut boards: Vec<Category> = Vec::new();
            for board in &self.boards {
                if !boards.contains(board) {
                    boards.push(*board);
                }
            }
            cfg.scraper.categories = boards;
        }
        if let Some(threads) = self.threads {
            cfg.scraper.thread_count = threads;
        }
        if let Some(timeout) = self.timeout {
            cfg.scraper.timeout_seconds = timeout;
        }
        if let Some(mode) = self.mode {
            cfg.transport.mode = mode;
        } else if self.proxy {
            cfg.transport.mode = TransportMode::Proxy;
        } else if self.direct {
            cfg.transport.mode = TransportMode::Direct;
        }
        if let Some(port) = self.proxy_port {
            cfg.proxy.port = port;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            cfg.database.url = url;
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let (mut cfg, found) = config::load_or_default(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if !found {
        warn!(path = %args.config.display(), "config file not found; using defaults");
    }
    args.apply(&mut cfg);
    cfg.validate()?;
    if !cfg.has_credentials() {
        anyhow::bail!("credentials missing: set credentials.username/password or pass -u/-p");
    }
    cfg.ensure_dirs()
        .with_context(|| format!("failed to create data dir {}", cfg.app.data_dir))?;
    Ok(cfg)
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            warn!(?err, "SIGTERM handler unavailable");
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Picks the transport for the configured mode. A proxy that fails to start
/// falls back to a direct connection when allowed.
async fn build_transport(cfg: &Config) -> Result<(Arc<dyn Transport>, Option<Arc<ProxySupervisor>>), u8> {
    let timeout = cfg.request_timeout();
    let direct = |timeout: Duration| -> Result<Arc<dyn Transport>, u8> {
        ReqwestTransport::direct(timeout)
            .map(|t| Arc::new(t) as Arc<dyn Transport>)
            .map_err(|err| {
                error!(%err, "failed to build HTTP client");
                EXIT_FATAL
            })
    };

    match cfg.transport.mode {
        TransportMode::Tunnel => {
            let tunnel = TunnelTransport::new(cfg.transport.edge_host.clone(), cfg.transport.edge_port, timeout)
                .map_err(|err| {
                    error!(%err, "failed to set up tunnel transport");
                    EXIT_FATAL
                })?;
            let transport: Arc<dyn Transport> = Arc::new(tunnel);
            Ok((transport, None))
        }
        TransportMode::Direct => Ok((direct(timeout)?, None)),
        TransportMode::Proxy => {
            let supervisor = ProxySupervisor::from_config(&cfg.proxy).map_err(|err| {
                error!(%err, "invalid proxy settings");
                EXIT_CONFIG
            })?;
            let supervisor = Arc::new(supervisor);
            match supervisor.start().await {
                Ok(()) => {
                    let transport = ReqwestTransport::via_local_proxy(supervisor.port(), timeout).map_err(|err| {
                        error!(%err, "failed to build proxied HTTP client");
                        EXIT_FATAL
                    })?;
                    let transport: Arc<dyn Transport> = Arc::new(transport);
                    Ok((transport, Some(supervisor)))
                }
                Err(err) if cfg.transport.fallback_to_direct => {
                    warn!(%err, "proxy unavailable; falling back to direct connection");
                    supervisor.stop().await;
                    Ok((direct(timeout)?, None))
                }
                Err(err) => {
                    error!(%err, "proxy unavailable and fallback disabled");
                    supervisor.stop().await;
                    Err(EXIT_FATAL)
                }
            }
        }
    }
}

async fn run(args: Args) -> u8 {
    let cfg = match load_config(&args) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("{err:#}");
            return EXIT_CONFIG;
        }
    };

    let pool = match db::init_pool(&cfg.database.url).await {
        Ok(pool) => pool,
        Err(err) => {
            error!(?err, "failed to open database");
            return EXIT_CONFIG;
        }
    };
    if let Err(err) = db::run_migrations(&pool).await {
        error!(?err, "failed to run migrations");
        return EXIT_FATAL;
    }
    match db::reclaim_stale(&pool, stale_after(cfg.database.stale_timeout_hours)).await {
        Ok(0) => {}
        Ok(n) => warn!(reclaimed = n, "marked stale running batches as failed"),
        Err(err) => warn!(?err, "failed to reclaim stale batches"),
    }

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("shutdown requested; stopping after in-flight requests");
        signal_token.cancel();
    });

    let (transport, supervisor) = match build_transport(&cfg).await {
        Ok(built) => built,
        Err(code) => return code,
    };
    info!(transport = transport.name(), "transport ready");
    if !cfg.transport.egress_check_url.trim().is_empty() {
        match egress_ip(transport.as_ref(), &cfg.transport.egress_check_url).await {
            Ok(ip) => info!(%ip, "egress address"),
            Err(err) => warn!(%err, "could not determine egress address"),
        }
    }

    let code = harvest_all(&cfg, pool.clone(), transport, cancel.clone()).await;

    if let Some(supervisor) = supervisor {
        supervisor.stop().await;
    }
    pool.close().await;
    if cancel.is_cancelled() {
        EXIT_INTERRUPTED
    } else {
        code
    }
}

async fn harvest_all(cfg: &Config, pool: db::Pool, transport: Arc<dyn Transport>, cancel: CancellationToken) -> u8 {
    let collab = match Collaborators::from_config(&cfg.helpers) {
        Ok(collab) => collab,
        Err(err) => {
            error!(%err, "invalid helper configuration");
            return EXIT_CONFIG;
        }
    };

    let cookie_file = CookieFile::new(cfg.cookies_path());
    let cookies = cookie_file.load().await;
    info!(cookies = cookies.len(), path = %cookie_file.path().display(), "loaded session cookies");
    let client = Arc::new(SiteClient::new(transport, collab.tokens.clone(), cookies, cfg.app.user_agent.clone()));
    let login = PasswordLogin::new(
        cfg.credentials.username.clone(),
        cfg.credentials.password.clone(),
        collab.cipher.clone(),
        collab.captcha.clone(),
        LoginEndpoints::from_site(&cfg.site),
    );
    let session = Arc::new(SessionManager::new(
        client,
        Arc::new(login),
        cookie_file,
        SessionPolicy::from_config(cfg),
        cancel.clone(),
    ));

    match session.ensure_valid().await {
        Ok(()) => info!("session valid"),
        Err(SessionError::Cancelled) => return EXIT_INTERRUPTED,
        Err(err) => {
            error!(%err, "could not establish a session");
            return EXIT_FATAL;
        }
    }

    let scheduler = Scheduler::new(session, ScrapeSettings::from_config(cfg));
    let harvester = Harvester::new(pool, scheduler, cancel.clone());

    let mut code = 0;
    for &category in &cfg.scraper.categories {
        if cancel.is_cancelled() {
            return EXIT_INTERRUPTED;
        }
        match harvester.harvest(category).await {
            Ok(report) => {
                if !report.failed_boards.is_empty() {
                    warn!(%category, failed = ?report.failed_boards, "boards abandoned in this run");
                }
            }
            Err(err) if err.is_fatal() => {
                error!(%category, %err, "aborting");
                return err.exit_code();
            }
            Err(err) => {
                error!(%category, %err, "category run failed");
                code = EXIT_RUN_FAILED;
            }
        }
    }
    code
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.print_config {
        print!("{}", config::example());
        return ExitCode::SUCCESS;
    }

    ExitCode::from(run(args).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_config() {
        let args = Args::parse_from([
            "board-harvest", "-u", "alice", "-p", "pw", "-B", "2", "-B", "region", "-H", "8", "-t", "5", "-d",
        ]);
        let mut cfg = Config::default();
        args.apply(&mut cfg);
        assert_eq!(cfg.credentials.username, "alice");
        assert_eq!(cfg.scraper.categories, vec![Category::Concept, Category::Region]);
        assert_eq!(cfg.scraper.thread_count, 8);
        assert_eq!(cfg.scraper.timeout_seconds, 5);
        assert_eq!(cfg.transport.mode, TransportMode::Direct);
        assert!(cfg.has_credentials());
    }

    #[test]
    fn categories_take_several_values_per_flag() {
        let args = Args::parse_from(["board-harvest", "-c", "other.yaml", "-B", "2", "3", "-B", "1", "2"]);
        assert_eq!(args.config, PathBuf::from("other.yaml"));
        let mut cfg = Config::default();
        args.apply(&mut cfg);
        assert_eq!(cfg.scraper.categories, vec![Category::Concept, Category::Region, Category::Industry]);
    }

    #[test]
    fn stale_age_saturates() {
        assert_eq!(stale_after(2), Duration::from_secs(7200));
        assert_eq!(stale_after(u64::MAX), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn proxy_and_direct_conflict() {
        assert!(Args::try_parse_from(["board-harvest", "-s", "-d"]).is_err());
        assert!(Args::try_parse_from(["board-harvest", "--mode", "tunnel", "-s"]).is_err());
        assert!(Args::try_parse_from(["board-harvest", "-B", "7"]).is_err());
    }

    #[test]
    fn out_of_range_threads_fail_validation() {
        let args = Args::parse_from(["board-harvest", "-H", "300"]);
        let mut cfg = Config::default();
        args.apply(&mut cfg);
        assert!(cfg.validate().is_err());
    }
}
