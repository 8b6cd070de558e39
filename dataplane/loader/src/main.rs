/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use anyhow::Context;
use clap::Parser;
use conntrack::shutdown::cancel_on_shutdown_signal;
use conntrack::{Config, Metrics, PluginManager, PluginRegistry};
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
struct Opt {
    #[clap(flatten)]
    config: Config,
    /// Plugins to run, by name.
    #[clap(
        long,
        env = "PLUGINS",
        value_delimiter = ',',
        default_value = "conntrack,conntrackgc"
    )]
    plugins: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let opt = Opt::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut registry = Registry::default();
    let metrics = Metrics::new(&mut registry);
    let plugins = PluginRegistry::with_defaults();

    let mut manager = PluginManager::new(opt.config, &metrics, &plugins, &opt.plugins)
        .context("failed to create plugin manager")?;

    let cancel = CancellationToken::new();
    cancel_on_shutdown_signal(cancel.clone()).context("failed to watch for shutdown signals")?;

    info!(plugins = ?manager.plugin_names(), "starting conntrack agent");
    let result = manager.start(cancel).await;
    manager.stop().await;

    let mut exposition = String::new();
    if encode(&mut exposition, &registry).is_ok() {
        debug!(metrics = %exposition, "final metric values");
    }

    result.context("plugin manager failed")?;
    info!("Exiting...");

    Ok(())
}
