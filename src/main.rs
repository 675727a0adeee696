use gac_consensus::config::Config;
use gac_consensus::consensus::kmeans::KMeans;
use gac_consensus::consensus::pca::Pca;
use gac_consensus::db::Database;
use gac_consensus::tasks::{self, PollLeases, ScoringContext};
use gac_consensus::webhook::{ScoreNotifier, WebhookSender};
use log::{error, info, warn};
use std::env;
use std::error::Error;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();

    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error + Send + Sync>> {
    let once = env::args().skip(1).any(|arg| arg == "--once");
    let config = Config::from_env()?;

    let database = Arc::new(Database::new(&config.database_url).await?);
    info!("Connected to {}", config.database_url);

    let notifier: Option<Arc<dyn ScoreNotifier>> = match &config.webhook {
        Some(webhook) => Some(Arc::new(WebhookSender::new(webhook)?)),
        None => {
            warn!("WEBHOOK_URL or WEBHOOK_SECRET not set; score events will not be sent");
            None
        }
    };

    let ctx = ScoringContext {
        store: database,
        reducer: Arc::new(Pca),
        detector: Arc::new(KMeans::new(config.kmeans_seed)),
        notifier,
        leases: PollLeases::new(),
        threshold: config.constitutionable_threshold,
    };

    if once {
        let report = tasks::run_batch(&ctx).await?;
        info!(
            "Scored {} poll(s), {} failed, {} counter repair(s)",
            report.scored.len(),
            report.failed.len(),
            report.reconciled
        );
        return Ok(());
    }

    let updater = tokio::spawn(tasks::update_gac_scores_task(ctx, config.interval));
    tokio::signal::ctrl_c().await?;
    info!("Shutting down GAC updater");
    updater.abort();
    Ok(())
}
