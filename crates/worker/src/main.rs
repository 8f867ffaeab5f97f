use std::sync::Arc;

use anyhow::{bail, Context};
use imgserv_core::image::{FitsFileSource, ImageLocation};
use imgserv_db::repositories::FitsFileRepo;
use imgserv_db::{DbPool, PgMetadataLookup};
use imgserv_worker::service::parse_query;
use imgserv_worker::{
    catalog, retention, CutoutService, EventBus, ExtractingExecutor, FsResultStore, JobEvent,
    JobQueue, WorkerConfig,
};
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "\
usage:
  imgserv-worker                                  read requests from stdin, one query per line
  imgserv-worker ID=<db.kind[.filter]> POS=...    run a single cutout and print its status
  imgserv-worker ingest <db.kind> <filter> <file>...
                                                  catalogue FITS files for lookup

A request line looks like: ID=ci_hsc.calexp.r&POS=CIRCLE 320.94 -0.289128 0.01";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if matches!(args.first().map(String::as_str), Some("help" | "-h" | "--help")) {
        println!("{USAGE}");
        return Ok(());
    }

    let config = WorkerConfig::from_env()?;
    let pool = imgserv_db::create_pool(&config.database_url)
        .await
        .context("connecting to the metadata store")?;
    tracing::info!("Database connection pool created");

    imgserv_db::health_check(&pool)
        .await
        .context("metadata store health check")?;
    imgserv_db::run_migrations(&pool)
        .await
        .context("running migrations")?;
    tracing::info!("Database migrations applied");

    match args.first().map(String::as_str) {
        Some("ingest") => ingest(&pool, &config, &args[1..]).await,
        Some(_) => run_once(build_service(pool, &config)?, &args).await,
        None => serve(build_service(pool, &config)?, &config).await,
    }
}

/// Structured logs to stderr, keeping stdout for job status output.
/// `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "imgserv_worker=debug,imgserv_core=info,imgserv_db=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn build_service(pool: DbPool, config: &WorkerConfig) -> anyhow::Result<CutoutService> {
    let store = Arc::new(
        FsResultStore::new(&config.result_dir)
            .with_context(|| format!("creating {}", config.result_dir.display()))?,
    );
    let source = Arc::new(FitsFileSource::new(&config.image_root));
    let executor = Arc::new(ExtractingExecutor::new(source, store.clone()));
    let queue = JobQueue::new(
        executor,
        store,
        Arc::new(EventBus::default()),
        config.queue_config(),
    );

    tracing::info!(
        max_concurrent = config.max_concurrent_jobs,
        retention_secs = config.result_retention.as_secs(),
        result_dir = %config.result_dir.display(),
        image_root = %config.image_root.display(),
        "Job queue ready"
    );
    Ok(CutoutService::new(
        Arc::new(PgMetadataLookup::new(pool)),
        queue,
        config.default_filter.clone(),
    ))
}

async fn run_once(service: CutoutService, args: &[String]) -> anyhow::Result<()> {
    let params = parse_query(&args.join("&"));
    let handle = service.submit(&params).await?;
    let snapshot = handle.wait().await;

    println!("{}", serde_json::to_string_pretty(&handle.view())?);
    match snapshot.error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

async fn serve(service: CutoutService, config: &WorkerConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let sweeper = tokio::spawn(retention::run(
        service.queue().clone(),
        config.sweep_interval,
        cancel.clone(),
    ));
    let event_log = tokio::spawn(log_events(service.queue().subscribe(), cancel.clone()));

    let service = Arc::new(service);
    let mut requests = JoinSet::new();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tracing::info!("Worker started, reading requests from stdin");
    let drain = loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received");
                break false;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    requests.spawn(handle_request(Arc::clone(&service), line));
                }
                Ok(None) => {
                    tracing::info!(pending = requests.len(), "Input closed, waiting for pending jobs");
                    break true;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read request");
                    break true;
                }
            },
        }
    };

    if drain {
        while requests.join_next().await.is_some() {}
    } else {
        requests.shutdown().await;
    }

    cancel.cancel();
    let _ = tokio::join!(sweeper, event_log);
    tracing::info!("Worker stopped");
    Ok(())
}

/// Submit one request line and print its terminal status as a JSON line.
async fn handle_request(service: Arc<CutoutService>, line: String) {
    let params = parse_query(&line);
    let output = match service.submit(&params).await {
        Ok(handle) => {
            handle.wait().await;
            serde_json::to_value(handle.view())
        }
        Err(err) => {
            tracing::info!(error = %err, request = %line, "Request rejected");
            Ok(serde_json::json!({
                "errorKind": err.kind(),
                "message": err.to_string(),
            }))
        }
    };
    match output {
        Ok(value) => println!("{value}"),
        Err(e) => tracing::error!(error = %e, "Failed to serialize job status"),
    }
}

async fn log_events(mut rx: broadcast::Receiver<JobEvent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Ok(event) => tracing::debug!(
                    event_type = event.event_type,
                    job_id = %event.job_id,
                    fingerprint = %event.fingerprint,
                    "Job event"
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn ingest(pool: &DbPool, config: &WorkerConfig, args: &[String]) -> anyhow::Result<()> {
    let [dataset_id, filter, files @ ..] = args else {
        bail!("{USAGE}");
    };
    if files.is_empty() {
        bail!("{USAGE}");
    }

    let source = FitsFileSource::new(&config.image_root);
    for file in files {
        if FitsFileRepo::find_by_name(pool, file).await?.is_some() {
            tracing::info!(file = %file, "Already catalogued, skipping");
            continue;
        }
        let input = catalog::describe_file(&source, &ImageLocation::new(file.as_str()), dataset_id, filter)
            .with_context(|| format!("reading {file}"))?;
        let created = FitsFileRepo::create(pool, &input).await?;
        tracing::info!(
            fits_file_id = created.fits_file_id,
            file = %file,
            cards = input.key_values.len(),
            positions = input.positions.len(),
            "Catalogued file"
        );
    }
    Ok(())
}
