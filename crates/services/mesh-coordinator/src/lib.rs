use inference_mesh::{Collaborators, Coordinator};
use mesh_config::CoordinatorConfig;
use tracing_subscriber::EnvFilter;

/// Install the global log subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &CoordinatorConfig) {
    let fallback = config.log_level.as_deref().unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    // A second init (tests) keeps the first subscriber.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Run the coordinator until ctrl-c, then shut down gracefully.
pub async fn run_coordinator(config: CoordinatorConfig) -> anyhow::Result<()> {
    init_tracing(&config);

    let collaborators = Collaborators::in_memory(&config);
    let mut coordinator = Coordinator::new(config, collaborators)?;
    let addr = coordinator.start().await?;
    tracing::info!(%addr, "mesh coordinator listening for nodes");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    coordinator.shutdown().await?;
    Ok(())
}
