use std::sync::Arc;

use anyhow::Context;
use jobsmith::config::JobsmithConfig;
use jobsmith::core::{Jobsmith, RegistryBuilder};
use jobsmith::jobs::{JobDeps, register_builtin_jobs};
use jobsmith::telemetry::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = JobsmithConfig::from_env().context("failed to load configuration")?;
    init_tracing(&config.logging);

    let mut builder = RegistryBuilder::new(config.retry.clone());
    register_builtin_jobs(&mut builder, JobDeps::from_config(&config))
        .context("failed to register built-in jobs")?;

    let jobsmith = Arc::new(Jobsmith::new(config, builder.build())?);
    jobsmith.start().await?;

    let bind_addr = jobsmith.config().server.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    let app = jobsmith::server::router(Arc::clone(&jobsmith));
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("shutdown signal received");
        })
        .await?;

    jobsmith.stop().await?;
    Ok(())
}
