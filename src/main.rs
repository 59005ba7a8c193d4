use anyhow::Result;
use clap::{Parser, Subcommand};
use orderbell::config::Config;
use orderbell::device::{DevicePlatform, NullPlatform, WebhookPlatform};
use orderbell::ring::tone::Speaker;
use orderbell::router::Watermark;
use orderbell::server::AppState;
use orderbell::{jobs, logger, phone, server, store, Services};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing as log;

#[derive(Parser)]
#[command(name = "orderbell", about = "Order alert daemon for the shop back office")]
struct Cli {
    /// Bind address for the HTTP API; overrides ORDERBELL_BIND.
    #[arg(long)]
    bind: Option<SocketAddr>,
    /// Backend url (`memory:` or an https origin); overrides
    /// ORDERBELL_BACKEND_URL.
    #[arg(long)]
    backend: Option<String>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (the default).
    Serve,
    /// One reconciliation pass over recent orders, then exit.
    SyncOnce {
        /// How far back to look for unalerted orders.
        #[arg(long, default_value_t = 60)]
        lookback_minutes: i64,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logger::init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(backend) = cli.backend {
        config.backend.url = backend;
    }

    let store = store::open(&config.backend)?;
    let platform: Arc<dyn DevicePlatform> = match &config.webhook {
        Some(webhook) => Arc::new(WebhookPlatform::new(
            webhook.url.clone(),
            webhook.token.clone(),
        )),
        None => Arc::new(NullPlatform),
    };
    let staff_views = phone::staff_view_set(&config.staff_views)?;
    let services = Services::build(
        store,
        Speaker::shared(),
        platform,
        config.settings_path.clone(),
        staff_views,
    );
    services.settings.load().await;

    match cli.command.unwrap_or(Command::Serve) {
        Command::SyncOnce { lookback_minutes } => {
            let since = Watermark::at(chrono::Utc::now() - chrono::Duration::minutes(lookback_minutes));
            jobs::reconcile_once(&services.store, &services.router, &since).await?;
            Ok(())
        }
        Command::Serve => {
            let cancel = CancellationToken::new();
            let tasks = services.start(&cancel);

            let shutdown = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::info!("shutting down");
                    shutdown.cancel();
                }
            });

            let state = AppState {
                notifications: Arc::clone(&services.notifications),
                phone: Arc::clone(&services.phone),
                engine: Arc::clone(&services.engine),
                settings: Arc::clone(&services.settings),
                api_token: config.api_token.clone(),
            };
            server::serve(state, config.bind, cancel.clone()).await?;

            services.phone.shutdown().await;
            for task in tasks {
                let _ = task.await;
            }
            Ok(())
        }
    }
}
