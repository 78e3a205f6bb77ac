use std::panic;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::languages::LanguageRegistry;
use crate::pipeline::JudgePipeline;
use crate::queue::QueueConsumer;
use crate::reporter::{CallbackReporter, Reporter};
use crate::store::MongoStore;

mod compare;
mod compiler;
mod config;
mod domain;
mod languages;
mod pipeline;
mod queue;
mod reporter;
mod sandbox;
mod store;
mod workspace;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    set_panic_hook();

    if dotenvy::dotenv().is_err() {
        tracing::debug!("no .env file loaded");
    }

    let config = Config::from_env()?;

    let redis_client = redis::Client::open(config.redis_url.clone())?;
    let mut redis_connection = redis_client.get_multiplexed_async_connection().await?;
    let _: String = redis::cmd("PING")
        .query_async(&mut redis_connection)
        .await?;
    tracing::info!("connected to redis");

    let store = MongoStore::connect(&config.mongo_uri, &config.mongo_db, config.store_timeout)
        .await
        .map_err(|err| format!("could not connect to mongodb: {err}"))?;
    tracing::info!(database = %config.mongo_db, "connected to mongodb");

    let languages = match &config.lang_config_path {
        Some(path) => LanguageRegistry::from_json_file(path)?,
        None => LanguageRegistry::builtin(),
    };

    let reporter: Option<Arc<dyn Reporter>> = match &config.callback {
        Some(callback) => Some(Arc::new(CallbackReporter::new(callback)?)),
        None => None,
    };

    tokio::fs::create_dir_all(&config.scratch_dir).await?;

    let pipeline = Arc::new(JudgePipeline::new(
        Arc::new(store),
        sandbox::create(config.sandbox_backend),
        reporter,
        Arc::new(languages),
        config.scratch_dir.clone(),
    ));

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let consumer = QueueConsumer::new(redis_connection, config.queue_name.clone());
    let handler_cancel = cancel.clone();
    consumer
        .start(cancel, move |submission_id| {
            let pipeline = pipeline.clone();
            let cancel = handler_cancel.clone();
            async move {
                pipeline.process(&cancel, &submission_id).await;
            }
        })
        .await;

    tracing::info!("judge daemon stopped");
    Ok(())
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        tracing::info!("shutdown signal received, finishing in-flight work");
        cancel.cancel();
    });
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
