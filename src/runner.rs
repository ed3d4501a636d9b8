//! Top-level program entry: loads settings, installs the tracing subscriber,
//! runs the processor to completion, and maps a fatal error to a nonzero
//! exit code the way a long-running service is expected to.

use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Settings;
use crate::error::CoreError;
use crate::mapper::Mapper;
use crate::processor::{self, ProcessorArgs};
use crate::source::{DataSource, HasHeader};
use crate::writer::TableOptions;

/// Installs the `tracing` subscriber from `RUST_LOG` (falling back to
/// `settings.logging.filter`), then runs `source`/`map` to completion,
/// installing a `ctrl_c`/SIGTERM listener that routes into the same
/// best-effort final flush as a clean stream end. Returns the process exit
/// code to use; never panics on a processing failure, only logs it.
pub async fn run_program<B, S, M>(settings: Settings, source: S, map: M) -> i32
where
    B: HasHeader + Send + Sync + 'static,
    S: DataSource<B>,
    M: Mapper<B>,
{
    install_tracing(&settings.logging.filter);

    let item_defaults = TableOptions {
        low_watermark: settings.indexer.item_low_watermark,
        high_watermark: settings.indexer.item_high_watermark,
    };
    let blocks_defaults = TableOptions {
        low_watermark: settings.indexer.blocks_low_watermark,
        high_watermark: settings.indexer.blocks_high_watermark,
    };

    let args = ProcessorArgs::new(settings.store.url.clone(), settings.store.database.clone(), source, map)
        .with_item_defaults(item_defaults)
        .with_blocks_defaults(blocks_defaults);

    match processor::run(args, shutdown_signal()).await {
        Ok(()) => 0,
        Err(err) => {
            log_fatal(&err);
            1
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn install_tracing(filter: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter.to_owned()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn log_fatal(err: &CoreError) {
    error!(error = %err, "fatal error, shutting down");
}
