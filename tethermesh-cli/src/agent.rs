// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tethermesh::common::config::AgentConfig;
use tethermesh::common::router::Router;

#[derive(Debug, Clone)]
pub struct AgentArgs {
  pub config_path: PathBuf,
}

fn default_client_id() -> String {
  std::env::var("HOSTNAME")
    .or_else(|_| std::env::var("COMPUTERNAME"))
    .ok()
    .filter(|name| !name.trim().is_empty())
    .unwrap_or_else(|| String::from("tethermesh-node"))
}

/// Runs a node until interrupted; tethers and listeners that fail are logged and skipped
#[tracing::instrument(skip_all, fields(config = ?args.config_path))]
pub async fn agent_main(args: AgentArgs) -> Result<()> {
  if !args.config_path.exists() {
    AgentConfig::template(default_client_id())
      .write(&args.config_path)
      .context("Failed writing configuration template")?;
    println!(
      "A configuration file was written to {:?}; edit it and relaunch",
      args.config_path
    );
    return Ok(());
  }
  let config = AgentConfig::load(&args.config_path).context("Failed loading configuration")?;
  let router = Arc::new(Router::from_agent_config(&config));
  tracing::info!(client_id = %router.client_id(), "node starting");

  for tether in &config.tethers {
    match router.connect(tether).await {
      Ok(established) => tracing::info!(
        relay = %tether.address(),
        peer = %established.client_id(),
        "connected"
      ),
      Err(err) => tracing::error!(relay = %tether.address(), err = ?err, "failed to connect"),
    }
  }

  for listener in &config.servers {
    match router.serve(listener.clone()).await {
      Ok(address) => tracing::info!(%address, kind = ?listener.listener_type, "listening"),
      Err(err) => tracing::error!(port = listener.port, err = ?err, "failed to run listener"),
    }
  }

  tokio::signal::ctrl_c()
    .await
    .context("Failed waiting for interrupt")?;
  tracing::info!("interrupted, shutting down");
  router.shutdown();
  Ok(())
}
