//! Pincer - intercepting proxy for security testing
//!
//! Runs the proxy headless, logging held items, completed exchanges and
//! attack progress until interrupted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pincer::app::{App, Config, EventSink, ProxyEvent};
use pincer::error::UserHint;
use pincer::proxy::CertFormat;

/// Intercepting HTTP/HTTPS/WebSocket proxy
#[derive(Parser, Debug)]
#[command(name = "pincer")]
#[command(author, version, about = "Intercepting proxy for security testing", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "PINCER_CONFIG")]
    config: Option<String>,

    /// Address to listen on
    #[arg(short, long, env = "PINCER_LISTEN")]
    listen: Option<String>,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long, env = "PINCER_PORT")]
    port: Option<u16>,

    /// Hold every request for an operator decision
    #[arg(long, env = "PINCER_INTERCEPT")]
    intercept: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "PINCER_LOG_LEVEL")]
    log_level: String,

    /// Log file path (enables file logging)
    #[arg(long, env = "PINCER_LOG_FILE")]
    log_file: Option<String>,

    /// Enable JSON structured logging
    #[arg(long, env = "PINCER_LOG_JSON")]
    log_json: bool,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate_config: bool,

    /// Write the root certificate to this path and exit
    #[arg(long, value_name = "PATH")]
    export_ca: Option<PathBuf>,

    /// Encoding for --export-ca
    #[arg(long, value_enum, default_value = "pem")]
    ca_format: CaFormat,

    /// Replace the root certificate and exit
    #[arg(long)]
    regenerate_ca: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CaFormat {
    Pem,
    Der,
}

impl From<CaFormat> for CertFormat {
    fn from(format: CaFormat) -> Self {
        match format {
            CaFormat::Pem => CertFormat::Pem,
            CaFormat::Der => CertFormat::Der,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Every TLS config names its provider explicitly; this only covers
    // code that asks for the process default. Already installed is fine.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();

    if cli.generate_config {
        return generate_default_config();
    }

    init_logging(&cli)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Pincer");

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            if let Some(hint) = e.downcast_ref::<pincer::error::ConfigError>() {
                tracing::error!("{}", hint.user_hint());
            }
            return Err(e);
        }
    };

    if cli.validate_config {
        tracing::info!("Configuration is valid");
        return Ok(());
    }

    if cli.export_ca.is_some() || cli.regenerate_ca {
        return manage_ca(&cli, config);
    }

    run_headless(config).await?;

    tracing::info!("Pincer shut down gracefully");
    Ok(())
}

/// Initialize the logging system
fn init_logging(cli: &Cli) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if let Some(log_path) = &cli.log_file {
        // File-based logging with rotation
        let path = std::path::Path::new(log_path);
        let file_appender = match (path.parent(), path.file_name()) {
            (Some(dir), Some(name)) if !dir.as_os_str().is_empty() => {
                std::fs::create_dir_all(dir).ok();
                RollingFileAppender::new(Rotation::DAILY, dir, name)
            }
            _ => {
                let log_dir = Config::data_dir()
                    .map(|d| d.join("logs"))
                    .unwrap_or_else(|_| PathBuf::from("."));
                std::fs::create_dir_all(&log_dir).ok();
                RollingFileAppender::new(Rotation::DAILY, log_dir, log_path)
            }
        };

        if cli.log_json {
            let file_layer = fmt::layer().json().with_writer(file_appender).with_ansi(false);
            subscriber.with(file_layer).init();
        } else {
            let file_layer = fmt::layer().with_writer(file_appender).with_ansi(false);
            subscriber.with(file_layer).init();
        }
    } else if cli.log_json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }

    Ok(())
}

/// Load configuration with CLI overrides
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(listen) = &cli.listen {
        config.proxy.listen_addr = listen.clone();
    }
    if let Some(port) = cli.port {
        config.proxy.port = port;
    }
    if cli.intercept {
        config.proxy.intercept_enabled = true;
    }

    config.validate()?;
    Ok(config)
}

/// Generate default configuration file
fn generate_default_config() -> Result<()> {
    let config = Config::default();
    let toml = toml::to_string_pretty(&config).context("Failed to serialize configuration")?;

    println!("{}", toml);
    Ok(())
}

fn manage_ca(cli: &Cli, config: Config) -> Result<()> {
    let app = App::new(config, EventSink::disabled())?;

    if cli.regenerate_ca {
        let info = app.regenerate_ca().map_err(|e| anyhow::anyhow!(e.user_hint()))?;
        tracing::info!("New root certificate written to {:?}", info.cert_path);
    }

    if let Some(path) = &cli.export_ca {
        let bytes = app
            .export_ca(cli.ca_format.into())
            .map_err(|e| anyhow::anyhow!(e.user_hint()))?;
        std::fs::write(path, bytes).with_context(|| format!("Failed to write {:?}", path))?;
        tracing::info!("Root certificate exported to {:?}", path);
    }
    Ok(())
}

/// Run the proxy until SIGINT/SIGTERM
async fn run_headless(config: Config) -> Result<()> {
    let (events, event_rx) = EventSink::channel(
        config.notifications.channel_capacity,
        config.notifications.max_per_second,
    );
    let mut app = App::new(config, events)?;

    let addr = app.start_proxy().await.map_err(|e| anyhow::anyhow!(e.user_hint()))?;
    tracing::info!("Proxy ready on {} (exclusions: {})", addr, app.exclusions().summary());
    tracing::info!("Trust {:?} in the client to intercept HTTPS", app.ca_info().cert_path);

    let logger = tokio::spawn(log_events(event_rx));

    wait_for_shutdown().await?;

    app.shutdown().await;
    drop(app);
    logger.abort();
    Ok(())
}

/// Log observer events; held items auto-forward after the intercept timeout
async fn log_events(mut rx: mpsc::Receiver<ProxyEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            ProxyEvent::RequestIntercepted(ex) => {
                tracing::info!(id = ex.id, "Holding request {} {}", ex.method, ex.url);
            }
            ProxyEvent::ResponseIntercepted(ex) => {
                tracing::info!(id = ex.id, "Holding response for {}", ex.url);
            }
            ProxyEvent::FrameIntercepted(msg) => {
                tracing::info!(id = msg.id, session = msg.session_id, "Holding WebSocket frame");
            }
            ProxyEvent::ExchangeCompleted(ex) => {
                let status = ex.response.as_ref().map(|r| r.status).unwrap_or(0);
                tracing::info!(id = ex.id, state = ?ex.state, "{} {} -> {}", ex.method, ex.url, status);
            }
            ProxyEvent::WebSocketMessage(msg) => {
                tracing::debug!(
                    session = msg.session_id,
                    "WebSocket {} {} bytes",
                    msg.direction.label(),
                    msg.size
                );
            }
            ProxyEvent::AttackProgress(p) => {
                tracing::info!("Attack {}: {}/{} ({:.1}%)", p.attack_id, p.completed, p.total, p.percentage);
            }
            ProxyEvent::AttackFinished { attack_id, status } => {
                tracing::info!("Attack {} finished: {:?}", attack_id, status);
            }
            ProxyEvent::Status(message) => tracing::info!("{}", message),
            ProxyEvent::Error(message) => tracing::warn!("{}", message),
        }
    }
}

/// Handle shutdown signals
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating shutdown");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to register Ctrl+C handler")?;
        tracing::info!("Received Ctrl+C, initiating shutdown");
    }

    Ok(())
}
