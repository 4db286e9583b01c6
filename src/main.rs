use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use remote_cache_proxy::breaker::CircuitBreaker;
use remote_cache_proxy::cache::MemoryCache;
use remote_cache_proxy::config::CliArgs;
use remote_cache_proxy::error::AppError;
use remote_cache_proxy::logging;
use remote_cache_proxy::router::RequestRouter;
use remote_cache_proxy::server;
use remote_cache_proxy::shutdown::ShutdownCoordinator;
use remote_cache_proxy::spooler::UploadSpooler;
use remote_cache_proxy::store::S3Client;
use remote_cache_proxy::watchdog::IdleWatchdog;

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    let _logging_guard = logging::init(config.log_file.as_deref());

    if let Err(e) = run(config).await {
        tracing::error!(error = %e, "fatal startup error");
        std::process::exit(1);
    }
}

async fn run(config: remote_cache_proxy::config::Config) -> Result<(), AppError> {
    let config = Arc::new(config);

    let store = Arc::new(S3Client::new(&config.region, config.s3_endpoint.as_deref()).await);

    let spooler = Arc::new(UploadSpooler::new(
        config.async_upload_cache_dir.clone(),
        config.max_entry_size_bytes,
        config.max_pending_upload_bytes,
    ));
    spooler.purge_all().await?;

    let cache = Arc::new(MemoryCache::new(config.max_cache_bytes, config.max_entry_size_bytes));
    let breaker = CircuitBreaker::new(config.errors_before_pausing, Duration::from_secs(config.pause_minutes * 60));
    let shutdown = Arc::new(ShutdownCoordinator::new(spooler.clone()));

    let watchdog = {
        let shutdown = shutdown.clone();
        Arc::new(IdleWatchdog::new(config.idle_minutes, move || {
            shutdown.trigger(0, "idle timeout");
        }))
    };

    let router = RequestRouter::new(cache, spooler, breaker, watchdog, store, shutdown, config.clone());

    let listener = TcpListener::bind((config.host, config.port))
        .await
        .map_err(|source| AppError::Bind {
            addr: format!("{}:{}", config.host, config.port),
            source,
        })?;

    server::serve(listener, router, Duration::from_secs(config.socket_timeout_seconds))
        .await
        .map_err(|e| AppError::Serve(e.to_string()))?;

    Ok(())
}
