/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::gc::{self, ConntrackGc};
use crate::metrics::Metrics;
use crate::monitor::{self, ConntrackMonitor};
use crate::{Error, Result};

pub const MAX_RECONCILE_TIME: Duration = Duration::from_secs(10);

/// Lifecycle shared by every agent plugin.
///
/// `init` must succeed before `start`; `stop` is safe to call at any point,
/// including before `start` and after it returned.
#[async_trait]
pub trait Plugin: Send {
    fn name(&self) -> &'static str;

    /// Reserved for plugins that generate datapath sources.
    async fn generate(&mut self) -> Result<()> {
        Ok(())
    }

    /// Reserved for plugins that compile datapath programs.
    async fn compile(&mut self) -> Result<()> {
        Ok(())
    }

    fn init(&mut self) -> Result<()>;

    /// Runs until `cancel` fires or the plugin can no longer make progress.
    async fn start(&mut self, cancel: CancellationToken) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;
}

type PluginConstructor = Box<dyn Fn(&Config, &Metrics) -> Box<dyn Plugin> + Send + Sync>;

/// Plugin constructors by name.
#[derive(Default)]
pub struct PluginRegistry {
    constructors: BTreeMap<String, PluginConstructor>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the conntrack monitor and the conntrack map GC.
    pub fn with_defaults() -> Self {
        let mut registry = PluginRegistry::new();
        registry.register(monitor::PLUGIN_NAME, |config, metrics| {
            Box::new(ConntrackMonitor::new(config.clone(), metrics.clone()))
        });
        registry.register(gc::PLUGIN_NAME, |config, metrics| {
            Box::new(ConntrackGc::new(config.clone(), metrics.clone()))
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&Config, &Metrics) -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        self.constructors
            .insert(name.to_string(), Box::new(constructor));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    fn build(&self, name: &str, config: &Config, metrics: &Metrics) -> Option<Box<dyn Plugin>> {
        self.constructors
            .get(name)
            .map(|constructor| constructor(config, metrics))
    }
}

/// Runs the enabled plugins side by side.
pub struct PluginManager {
    config: Config,
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginManager {
    pub fn new(
        config: Config,
        metrics: &Metrics,
        registry: &PluginRegistry,
        enabled: &[String],
    ) -> Result<Self> {
        let mut plugins = Vec::with_capacity(enabled.len());
        for name in enabled {
            let plugin = registry
                .build(name, &config, metrics)
                .ok_or_else(|| Error::PluginNotFoundError(name.clone()))?;
            info!(plugin = %name, "enabled plugin");
            plugins.push(plugin);
        }
        Ok(PluginManager { config, plugins })
    }

    pub fn with_plugins(config: Config, plugins: Vec<Box<dyn Plugin>>) -> Self {
        PluginManager { config, plugins }
    }

    pub fn plugin_names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|plugin| plugin.name()).collect()
    }

    /// Brings a plugin to a freshly initialized state.
    pub async fn reconcile(plugin: &mut dyn Plugin) -> Result<()> {
        plugin.generate().await?;
        plugin.compile().await?;
        plugin.stop().await?;
        plugin.init()?;
        info!(plugin = plugin.name(), "reconciled plugin");
        Ok(())
    }

    /// Reconciles and runs every plugin until `cancel` fires.
    ///
    /// A plugin that fails to reconcile or exits with an error is logged and
    /// left stopped while the others keep running. An error is returned only
    /// when no plugin ran until cancellation.
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<()> {
        if self.config.metrics_interval.is_zero() {
            return Err(Error::ZeroIntervalError);
        }

        let mut first_error = None;
        let mut runnable = Vec::with_capacity(self.plugins.len());
        for mut plugin in std::mem::take(&mut self.plugins) {
            let name = plugin.name();
            let reconciled = match timeout(MAX_RECONCILE_TIME, Self::reconcile(plugin.as_mut()))
                .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(Error::ReconcileError {
                    name,
                    source: Box::new(err),
                }),
                Err(_) => Err(Error::ReconcileTimeoutError(name)),
            };
            match reconciled {
                Ok(()) => runnable.push(plugin),
                Err(err) => {
                    error!(plugin = name, %err, "plugin disabled");
                    keep_first(&mut first_error, err);
                    self.plugins.push(plugin);
                }
            }
        }

        let mut tasks = Vec::with_capacity(runnable.len());
        for mut plugin in runnable {
            let name = plugin.name();
            let token = cancel.child_token();
            info!(plugin = name, "starting plugin");
            let task = tokio::spawn(async move {
                let result = plugin.start(token).await;
                if let Err(err) = &result {
                    error!(plugin = plugin.name(), %err, "plugin exited with error");
                }
                (plugin, result)
            });
            tasks.push((name, task));
        }
        info!(running = tasks.len(), "started plugin manager");

        let mut cancelled_cleanly = false;
        for (name, task) in tasks {
            match task.await {
                Ok((plugin, Ok(()))) => {
                    cancelled_cleanly = true;
                    self.plugins.push(plugin);
                }
                Ok((plugin, Err(err))) => {
                    keep_first(
                        &mut first_error,
                        Error::PluginExitedError {
                            name,
                            source: Box::new(err),
                        },
                    );
                    self.plugins.push(plugin);
                }
                Err(err) => {
                    // The plugin was dropped with its task; its handles are closed.
                    error!(plugin = name, %err, "plugin task failed");
                    keep_first(&mut first_error, Error::PluginTaskError { name, source: err });
                }
            }
        }

        match first_error {
            Some(err) if !cancelled_cleanly => Err(err),
            _ => {
                info!("stopping plugin manager");
                Ok(())
            }
        }
    }

    pub async fn stop(&mut self) {
        for plugin in self.plugins.iter_mut() {
            if let Err(err) = plugin.stop().await {
                error!(plugin = plugin.name(), %err, "failed to stop plugin");
            }
            info!(plugin = plugin.name(), "cleaned up resources for plugin");
        }
    }
}

fn keep_first(slot: &mut Option<Error>, err: Error) {
    if slot.is_none() {
        *slot = Some(err);
    }
}
