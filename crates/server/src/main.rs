use anyhow::Result;
use clap::Parser;
use server::app::MetricsServer;
use server::config::ServerArgs;
use server::config::ServerConfig;
use utils::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let config = ServerConfig::from_args(ServerArgs::parse())
        .map_err(|e| anyhow::anyhow!("Invalid server configuration: {e:?}"))?;

    let _log_guard = match &config.log_dir {
        Some(log_dir) => Some(logging::init_with_file(log_dir, "server")?),
        None => {
            logging::init();
            None
        }
    };

    tracing::info!("Starting metrics server {}", &**version::VERSION);
    tracing::info!(
        address = %config.address,
        store_interval_secs = config.store_interval.as_secs(),
        file = ?config.file_storage_path,
        restore = config.restore,
        database = config.database_dsn.is_some(),
        signed = config.key.is_some(),
        "server configured"
    );

    MetricsServer::new(config).run().await
}
