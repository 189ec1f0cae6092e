use anyhow::{Context, Result};
use clap::Parser;
use mailq::config::Config;
use mailq::mailer::{LogMailer, Mailer, SmtpMailer};
use mailq::server;
use mailq::service::EmailService;
use mailq::store::JobStore;
use mailq::worker::Worker;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    init_logging(&config.log_level, config.log_json)?;

    let store = JobStore::open(&config.database_path)
        .with_context(|| format!("opening job store at {}", config.database_path.display()))?;

    // no worker is running yet, so anything still marked running was orphaned
    store.rescue_running()?;

    let shutdown = CancellationToken::new();
    let mailer: Arc<dyn Mailer> = match config.smtp_settings() {
        Some(settings) => {
            info!(host = %settings.host, port = settings.port, "delivering email over SMTP");
            Arc::new(SmtpMailer::new(&settings).context("configuring SMTP transport")?)
        }
        None => {
            warn!("MAILQ_SMTP_HOST is not set; emails will only be logged and then recorded as sent");
            Arc::new(LogMailer)
        }
    };

    let worker = Worker::new(store.clone(), mailer, config.worker_config());
    let worker_handle = tokio::spawn(worker.run(shutdown.clone()));

    let app = server::router(EmailService::new(store), &config.adapter());
    let served = server::serve(config.listen_addr, app, shutdown_signal()).await;

    shutdown.cancel();
    worker_handle.await.context("email worker panicked")?;
    info!("mailq stopped");

    served
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl-C, shutting down"),
        Err(e) => tracing::error!("failed to listen for Ctrl-C: {e}"),
    }
}

fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_file(false)
        .with_line_number(false);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    Ok(())
}
