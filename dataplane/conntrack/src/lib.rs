/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

pub mod config;
pub mod decode;
pub mod events;
pub mod flow;
pub mod gc;
pub mod metrics;
pub mod monitor;
pub mod netutils;
pub mod plugin;
pub mod shutdown;
pub mod store;
pub mod subscriber;
pub mod tcp_state;

use thiserror::Error;

pub use config::Config;
pub use flow::FlowKey;
pub use gc::ConntrackGc;
pub use metrics::Metrics;
pub use monitor::ConntrackMonitor;
pub use plugin::{Plugin, PluginManager, PluginRegistry};
pub use store::ConnectionStore;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: `{0}`")]
    InvalidConfigError(String),
    #[error("invalid CIDR `{0}`")]
    InvalidCidrError(String),
    #[error("node address is not set; export NODE_IP")]
    MissingNodeIpError,
    #[error("plugin {0} used before init")]
    NotInitializedError(&'static str),
    #[error("failed to subscribe to conntrack events: {0}")]
    SubscribeError(#[source] std::io::Error),
    #[error("failed to open conntrack map at {path}: {source}")]
    MapOpenError {
        path: String,
        #[source]
        source: aya::maps::MapError,
    },
    #[error("plugin {0} not found in registry")]
    PluginNotFoundError(String),
    #[error("plugin manager requires a positive metrics interval")]
    ZeroIntervalError,
    #[error("timed out reconciling plugin {0}")]
    ReconcileTimeoutError(&'static str),
    #[error("failed to reconcile plugin {name}: {source}")]
    ReconcileError {
        name: &'static str,
        #[source]
        source: Box<Error>,
    },
    #[error("plugin {name} task failed: {source}")]
    PluginTaskError {
        name: &'static str,
        #[source]
        source: tokio::task::JoinError,
    },
    #[error("plugin {name} exited: {source}")]
    PluginExitedError {
        name: &'static str,
        #[source]
        source: Box<Error>,
    },
    #[error("conntrack subscription lost: {0}")]
    SubscriptionLostError(#[source] std::io::Error),
    #[error("conntrack GC sweep task failed: {0}")]
    SweepTaskError(#[source] tokio::task::JoinError),
    #[error("failed to install signal handler: {0}")]
    SignalHandlerError(#[source] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
