use mesh_config::{config_path_from_env, load_coordinator_config};
use mesh_coordinator::run_coordinator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = config_path_from_env();
    let config = load_coordinator_config(&config_path)?;

    if let Err(e) = run_coordinator(config).await {
        eprintln!("Coordinator error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}
