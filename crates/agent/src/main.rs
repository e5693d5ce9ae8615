use agent::app::Agent;
use agent::config::AgentArgs;
use agent::config::AgentConfig;
use anyhow::Result;
use clap::Parser;
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
    logging::init();

    let config = AgentConfig::from_args(AgentArgs::parse())
        .map_err(|e| anyhow::anyhow!("Invalid agent configuration: {e:?}"))?;
    tracing::info!("Starting metrics agent {}", &**version::VERSION);
    tracing::info!(
        address = %config.address,
        format = ?config.content_format,
        batch_size = config.batch_size,
        rate_limit = config.rate_limit,
        "agent configured"
    );

    Agent::new(config).run().await
}
