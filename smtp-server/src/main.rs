use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use miette::{miette, Context, IntoDiagnostic, Result};
use smtp::SmtpServer;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    config::{Cfg, CfgLog, LogFormat, Overrides},
    credentials::CredentialStore,
    notifier::SlackNotifier,
    session::Backend,
};

mod config;
mod credentials;
mod dispatcher;
mod filters;
mod message;
mod notifier;
mod server;
mod session;

/// Forwards mail received over SMTP to Slack direct messages.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: Utf8PathBuf,

    /// Log level or filter directive (overrides `log.level`).
    #[arg(long)]
    log_level: Option<String>,

    /// Address to listen on, e.g. `0.0.0.0:25`.
    #[arg(long)]
    listen_addr: Option<String>,

    /// Require SMTP authentication.
    #[arg(short = 'a', long)]
    auth_enabled: bool,

    /// Path to the `username:bcrypt-hash` user database.
    #[arg(long)]
    user_database: Option<Utf8PathBuf>,

    /// Path to a file holding the Slack token.
    #[arg(long)]
    slack_token_file: Option<Utf8PathBuf>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            log_level: self.log_level.clone(),
            listen_addr: self.listen_addr.clone(),
            auth_enabled: self.auth_enabled.then_some(true),
            user_database: self.user_database.clone(),
            slack_token: None,
            slack_token_file: self.slack_token_file.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = Cfg::load(&args.config, &args.overrides().or(Overrides::from_env()))?;
    init_tracing(&cfg.log)?;
    if !args.config.exists() {
        warn!(path = %args.config, "config file not found, using defaults");
    }
    cfg.validate()?;
    info!(config = ?cfg, "loaded configuration");

    let credentials = if cfg.smtp.auth.enabled {
        let path = cfg
            .smtp
            .auth
            .user_database
            .as_deref()
            .ok_or_else(|| miette!("smtp.auth.user_database is required when auth is enabled"))?;
        CredentialStore::load(path)
            .await
            .wrap_err("failed to load user database")?
    } else {
        CredentialStore::default()
    };

    let token = cfg
        .slack
        .token
        .clone()
        .ok_or_else(|| miette!("slack.token is required"))?;
    let notifier = SlackNotifier::connect(token)
        .await
        .wrap_err("failed to initialise slack client")?;

    let (dispatcher, worker) = dispatcher::channel(cfg.smtp.queue_capacity);
    let prefer_html_body = cfg.smtp.prefer_html_body;
    let worker = tokio::spawn(async move { worker.run(&notifier, prefer_html_body).await });

    let backend = Backend::new(
        cfg.smtp.auth.enabled,
        Arc::new(credentials),
        Arc::new(cfg.smtp.policies.clone()),
        dispatcher,
    );
    let smtp_server = SmtpServer::new(backend, cfg.smtp.server_config());

    let listener = TcpListener::bind(&cfg.smtp.listen_addr)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("binding {}", cfg.smtp.listen_addr))?;
    info!(addr = %cfg.smtp.listen_addr, "SMTP server listening");

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutdown requested");
                    shutdown.cancel();
                }
                Err(e) => error!(error = %e, "unable to listen for shutdown signal"),
            }
        }
    });

    server::serve(listener, smtp_server, shutdown).await?;

    info!("waiting for queued messages to be delivered");
    worker.await.into_diagnostic()?;
    info!("shutdown complete");
    Ok(())
}

fn init_tracing(log: &CfgLog) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&log.level)
            .into_diagnostic()
            .wrap_err_with(|| format!("invalid log level '{}'", log.level))?,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Fmt => builder.try_init(),
    }
    .map_err(|e| miette!("initialising logging: {e}"))
}
