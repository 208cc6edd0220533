use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use docpipe_core::models::exit_code;
use docpipe_core::PipelineConfig;
use docpipe_plugins::{FetcherRegistry, FileSystemFetcher, ParserConfig, PlainTextParser};
use docpipe_store::{SharedStore, SqliteTaskStore};
use docpipe_worker::{run_worker, WorkerContext, WorkerEnv};

fn init_telemetry() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "docpipe=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_telemetry();

    let env = match WorkerEnv::from_env() {
        Ok(env) => env,
        Err(err) => {
            tracing::error!(error = %err, "worker environment is incomplete");
            return ExitCode::from(exit_code::UNKNOWN as u8);
        }
    };

    let store = match SqliteTaskStore::connect(&env.store_url).await {
        Ok(store) => store,
        Err(err) => {
            tracing::error!(error = %err, "failed to open task store");
            return ExitCode::from(exit_code::UNKNOWN as u8);
        }
    };

    let parser_config = match env.parser_config_path.as_deref() {
        Some(path) => match ParserConfig::from_file(path) {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(error = %err, path = %path.display(), "bad parser config");
                return ExitCode::from(exit_code::UNKNOWN as u8);
            }
        },
        None => ParserConfig::default(),
    };

    let mut fetchers = FetcherRegistry::new();
    let fetch_root = env
        .fetch_root
        .clone()
        .unwrap_or_else(|| std::path::PathBuf::from("."));
    fetchers.register(Arc::new(FileSystemFetcher::new("fs", fetch_root)));

    let config = PipelineConfig::from_env();
    let ctx = WorkerContext {
        worker_id: env.worker_id,
        store: Arc::new(store) as SharedStore,
        fetchers,
        parser: Arc::new(PlainTextParser::new(parser_config)),
        max_retries: config.max_retries,
        parse_timeout: Duration::from_millis(config.parse_timeout_ms),
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    match run_worker(ctx, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            tracing::error!(error = %failure, "worker exiting after failure");
            ExitCode::from(failure.exit_code() as u8)
        }
    }
}
