//! Crawler binary.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use biliset_client::{Api, ClientError, SessionManager, Transport};
use biliset_crawler::{CrawlerConfig, CrawlerError, Pipeline, RunMode};
use biliset_store::{DatasetLayout, DatasetStore, MaintenanceEngine};

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("biliset=info".parse().expect("static directive"))
        .add_directive("hyper=warn".parse().expect("static directive"))
        .add_directive("reqwest=warn".parse().expect("static directive"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("starting biliset-crawler");

    let config = CrawlerConfig::from_env();
    info!(mode = ?config.mode, keywords = config.keywords.len(), "configuration loaded");

    let layout = DatasetLayout::new(
        &config.store.metadata_dir,
        &config.store.media_dir,
        &config.store.index_file,
    );
    let store = match DatasetStore::open(layout, config.store.update_index_on_save).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("failed to open dataset: {e}");
            std::process::exit(1);
        }
    };

    let exit_code = match config.mode {
        RunMode::Crawl => run_crawl(config, store).await,
        mode => run_maintenance(mode, &config, store).await,
    };

    std::process::exit(exit_code);
}

async fn run_crawl(config: CrawlerConfig, store: Arc<DatasetStore>) -> i32 {
    if config.keywords.is_empty() {
        error!("no keywords configured (BILISET_KEYWORDS)");
        return 1;
    }

    let transport = match Transport::new(config.transport.clone()) {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            error!("failed to build transport: {e}");
            return 1;
        }
    };
    let api = Api::new(Arc::clone(&transport));
    let session = Arc::new(SessionManager::new(
        Arc::clone(&transport),
        config.session.clone(),
    ));

    let force_login = std::env::var("BILISET_FORCE_LOGIN")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);
    match session.login(force_login).await {
        Ok(_) => info!("session established"),
        Err(ClientError::NetworkUnavailable) => {
            error!("network unavailable, aborting");
            return 1;
        }
        Err(ClientError::NoAuthenticator) => {
            // Stored credentials were absent or rejected and no interactive
            // login is wired in; public endpoints still work.
            warn!("no usable session, continuing unauthenticated");
        }
        Err(e) => {
            error!("login failed: {e}");
            return 1;
        }
    }

    // Ctrl-C propagates as the single cancellation signal.
    let (shutdown_tx, _) = watch::channel(false);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        });
    }

    let pipeline = Pipeline::new(config, api, store, session);
    match pipeline.run(shutdown_tx).await {
        Ok(report) => {
            match serde_json::to_string_pretty(&report) {
                Ok(rendered) => info!("aggregate report:\n{rendered}"),
                Err(_) => info!(?report, "aggregate report"),
            }
            0
        }
        Err(e) => {
            error!("crawl aborted: {e}");
            match e {
                CrawlerError::Client(ClientError::NetworkUnavailable) => 2,
                _ => 1,
            }
        }
    }
}

async fn run_maintenance(mode: RunMode, config: &CrawlerConfig, store: Arc<DatasetStore>) -> i32 {
    let engine = MaintenanceEngine::new(store);
    let dry_run = config.dry_run;

    let rendered = match mode {
        RunMode::Analyze => engine
            .analyze()
            .await
            .and_then(|r| Ok(serde_json::to_string_pretty(&r)?)),
        RunMode::SyncIndex => engine
            .sync_index(dry_run)
            .await
            .and_then(|r| Ok(serde_json::to_string_pretty(&r)?)),
        RunMode::Clean => {
            let clean_media = env_flag("BILISET_CLEAN_MEDIA_ORPHANS");
            let clean_metadata = env_flag("BILISET_CLEAN_METADATA_ORPHANS");
            let update_index = env_flag("BILISET_UPDATE_INDEX");
            engine
                .clean(clean_media, clean_metadata, update_index, dry_run)
                .await
                .and_then(|r| Ok(serde_json::to_string_pretty(&r)?))
        }
        RunMode::FilterDuration => engine
            .filter_by_duration(config.filter_max_duration, dry_run)
            .await
            .and_then(|r| Ok(serde_json::to_string_pretty(&r)?)),
        RunMode::Crawl => unreachable!("crawl handled separately"),
    };

    match rendered {
        Ok(report) => {
            info!("maintenance report:\n{report}");
            0
        }
        Err(e) => {
            error!("maintenance failed: {e}");
            1
        }
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false)
}
