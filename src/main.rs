mod config;
mod crm;
mod enrich;
mod events;
mod idempotency;
mod intel;
mod jobs;
mod kv;
mod llm;
mod notify;
mod outcome;
mod queue;
mod runner;
mod security;
mod server;
mod signals;
mod staging;
mod util;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::crm::CrmClient;
use crate::enrich::EnrichmentClient;
use crate::events::EventStore;
use crate::idempotency::IdempotencyGuard;
use crate::jobs::Clients;
use crate::kv::RedisKv;
use crate::llm::{GeminiTransport, LlmClient};
use crate::notify::Notifier;
use crate::queue::{Queue, RetryPolicy};
use crate::runner::Runner;
use crate::staging::Staging;

fn main() -> anyhow::Result<()> {
    // .env first so the config file can stay free of secrets in dev.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mode = args.get(1).map(String::as_str).unwrap_or("serve");
    match mode {
        "--version" | "-V" => {
            println!("leadflow {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        "--help" | "-h" => {
            println!("leadflow {}", env!("CARGO_PKG_VERSION"));
            println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
            println!("Usage: leadflow [COMMAND]\n");
            println!("Commands:");
            println!("  serve     Run the webhook ingress server (default)");
            println!("  worker    Run the background job worker");
            println!("\nOptions:");
            println!("  -h, --help       Print help");
            println!("  -V, --version    Print version");
            return Ok(());
        }
        "serve" | "worker" => {}
        other => {
            eprintln!("Unknown command: '{}'. Use serve or worker.", other);
            std::process::exit(1);
        }
    }

    let config_path = std::env::var("LEADFLOW_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));
    let config = match AppConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config load failed: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config error: {}", error);
        }
        std::process::exit(1);
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async move {
            match mode {
                "worker" => run_worker(config).await,
                _ => run_server(config).await,
            }
        })
}

struct Stores {
    kv: Arc<dyn crate::kv::Kv>,
    events: Arc<EventStore>,
    guard: Arc<IdempotencyGuard>,
    queue: Arc<Queue>,
    staging: Arc<Staging>,
}

async fn build_stores(config: &AppConfig) -> anyhow::Result<Stores> {
    let kv: Arc<dyn crate::kv::Kv> = Arc::new(RedisKv::connect(&config.redis.url).await?);
    let events = Arc::new(EventStore::new(kv.clone(), config.service.event_ttl_secs));
    let guard = Arc::new(IdempotencyGuard::new(
        kv.clone(),
        config.service.idempotency_ttl_secs,
    ));
    let queue = Arc::new(Queue::new(
        kv.clone(),
        &config.redis.queue_name,
        RetryPolicy {
            max_retries: config.queue.max_retries,
            intervals_secs: config.queue.retry_intervals_secs.clone(),
        },
    ));
    let staging = Arc::new(Staging::new(events.clone(), guard.clone(), queue.clone()));
    Ok(Stores {
        kv,
        events,
        guard,
        queue,
        staging,
    })
}

async fn run_server(config: AppConfig) -> anyhow::Result<()> {
    config.warn_on_missing_secrets();
    let stores = build_stores(&config).await?;
    let config = Arc::new(config);
    info!(
        dry_run = config.service.dry_run,
        debug_endpoints = config.service.allow_debug_endpoints,
        "Starting ingress server"
    );

    let state = server::AppState {
        config: config.clone(),
        events: stores.events,
        guard: stores.guard,
        queue: stores.queue,
        staging: stores.staging,
    };
    server::serve(state, &config.service.bind_addr).await
}

async fn run_worker(config: AppConfig) -> anyhow::Result<()> {
    let stores = build_stores(&config).await?;
    let kv = stores.kv.clone();
    let request_timeout = Duration::from_secs(config.service.request_timeout_secs);
    let config = Arc::new(config);

    let clients = Clients {
        config: config.clone(),
        crm: Arc::new(CrmClient::new(
            config.crm.clone(),
            config.service.dry_run,
            kv.clone(),
            request_timeout,
        )),
        llm: Arc::new(LlmClient::new(
            Arc::new(GeminiTransport::new(&config.llm, request_timeout)),
            config.llm.prompt_char_budget,
        )),
        enrich: Arc::new(EnrichmentClient::new(config.enrich.clone(), kv)),
        notifier: Notifier::webhook(&config.notify.webhook_url),
        staging: stores.staging.clone(),
    };

    let runner = Arc::new(Runner::new(
        stores.events,
        stores.guard,
        stores.queue.clone(),
        clients,
    ));

    info!(
        concurrency = config.service.worker_concurrency,
        queue = %config.redis.queue_name,
        dry_run = config.service.dry_run,
        "Starting workers"
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();
    for _ in 0..config.service.worker_concurrency.max(1) {
        handles.push(tokio::spawn(runner::worker_loop(
            runner.clone(),
            stores.queue.clone(),
            shutdown.clone(),
        )));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, letting workers finish their jobs");
    shutdown.store(true, Ordering::Relaxed);
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}
