use std::path::PathBuf;

use botherd_supervisor::{Supervisor, config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // The client install directory; settings and roster live under config/.
    let root: PathBuf = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let settings = config::load_settings(&root.join("config").join("settings.yaml"))?;
    let roster = config::load_roster(&root.join("config").join("bots.yaml"))?;
    tracing::info!(root = %root.display(), bots = roster.len(), "botherd starting");

    let supervisor = Supervisor::new(root, settings, roster).await?;
    supervisor.start_monitoring();
    supervisor.start_position_watcher();

    let started = supervisor.start_all().await;
    tracing::info!(started, "fleet launched");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested, stopping fleet");
    let stopped = supervisor.stop_all().await;
    tracing::info!(stopped, "fleet stopped");

    Ok(())
}
