/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use std::net::IpAddr;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

pub const TCP_STATE_METRIC: &str = "tcp_state";
pub const TCP_CONNECTION_REMOTE_METRIC: &str = "tcp_connection_remote";
pub const UDP_CONNECTION_STATS_METRIC: &str = "udp_connection_stats";

pub const DIRECTION_ACTIVE: &str = "active";

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StateLabels {
    pub state: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RemoteLabels {
    pub address: String,
    pub port: String,
}

impl RemoteLabels {
    pub fn new(address: IpAddr, port: u16) -> Self {
        RemoteLabels {
            address: address.to_string(),
            port: port.to_string(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DirectionLabels {
    pub direction: String,
}

impl DirectionLabels {
    pub fn active() -> Self {
        DirectionLabels {
            direction: DIRECTION_ACTIVE.to_string(),
        }
    }
}

/// Metric families written by the conntrack plugins.
///
/// Every handle is cheap to clone and shares its value with the registered
/// family, so the registry owner can encode while the plugins write.
#[derive(Clone, Default)]
pub struct Metrics {
    pub tcp_state: Family<StateLabels, Gauge>,
    pub tcp_connection_remote: Family<RemoteLabels, Gauge>,
    pub udp_connection_stats: Family<DirectionLabels, Gauge>,
    pub events_dropped: Counter,
    pub decode_errors: Counter,
    pub gc_entries: Gauge,
    pub gc_evicted: Counter,
}

impl Metrics {
    /// Creates the families and registers them on the injected registry.
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Metrics::default();

        registry.register(
            TCP_STATE_METRIC,
            "TCP state transitions observed during the last metrics interval",
            metrics.tcp_state.clone(),
        );
        registry.register(
            TCP_CONNECTION_REMOTE_METRIC,
            "Active TCP connections to external endpoints",
            metrics.tcp_connection_remote.clone(),
        );
        registry.register(
            UDP_CONNECTION_STATS_METRIC,
            "Active UDP flows to external endpoints",
            metrics.udp_connection_stats.clone(),
        );
        registry.register(
            "conntrack_events_dropped",
            "Conntrack events dropped because a queue was full",
            metrics.events_dropped.clone(),
        );
        registry.register(
            "conntrack_decode_errors",
            "Malformed conntrack messages received from the kernel",
            metrics.decode_errors.clone(),
        );
        registry.register(
            "conntrack_gc_entries",
            "Entries left in the conntrack map after the last sweep",
            metrics.gc_entries.clone(),
        );
        registry.register(
            "conntrack_gc_evicted",
            "Entries evicted from the conntrack map",
            metrics.gc_evicted.clone(),
        );

        metrics
    }

    pub fn tcp_state_value(&self, state: &str) -> i64 {
        self.tcp_state
            .get_or_create(&StateLabels {
                state: state.to_string(),
            })
            .get()
    }

    pub fn tcp_remote_value(&self, address: IpAddr, port: u16) -> i64 {
        self.tcp_connection_remote
            .get_or_create(&RemoteLabels::new(address, port))
            .get()
    }

    pub fn udp_active_value(&self) -> i64 {
        self.udp_connection_stats
            .get_or_create(&DirectionLabels::active())
            .get()
    }
}
