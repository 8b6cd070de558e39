/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DECODE_WORKERS: usize = 4;
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1024;

/// Settings shared by the conntrack plugins.
///
/// Values are only validated by the plugins' `init`, so a bad subnet disables
/// the monitor without taking the map GC down with it.
#[derive(Debug, Parser, Clone)]
pub struct Config {
    #[clap(long, env = "POD_CIDR")]
    pub pod_cidr: Option<String>,
    #[clap(long, env = "SERVICE_CIDR")]
    pub service_cidr: Option<String>,
    #[clap(long, env = "NODE_IP")]
    pub node_ip: Option<String>,
    /// Seconds between two flushes of the TCP state histogram.
    #[clap(long, env = "METRICS_INTERVAL", default_value = "10", value_parser = parse_secs)]
    pub metrics_interval: Duration,
    /// Seconds between two sweeps of the conntrack map.
    #[clap(long, env = "CONNTRACK_GC_FREQUENCY", default_value = "15", value_parser = parse_secs)]
    pub gc_frequency: Duration,
    #[clap(
        long,
        env = "CONNTRACK_MAP_PATH",
        default_value = "/sys/fs/bpf/retina_conntrack_map"
    )]
    pub conntrack_map_path: PathBuf,
    #[clap(long, default_value_t = DEFAULT_DECODE_WORKERS)]
    pub decode_workers: usize,
    #[clap(long, default_value_t = DEFAULT_EVENT_QUEUE_CAPACITY)]
    pub event_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pod_cidr: None,
            service_cidr: None,
            node_ip: None,
            metrics_interval: Duration::from_secs(10),
            gc_frequency: Duration::from_secs(15),
            conntrack_map_path: PathBuf::from("/sys/fs/bpf").join(common::CONNTRACK_MAP_NAME),
            decode_workers: DEFAULT_DECODE_WORKERS,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
        }
    }
}

fn parse_secs(value: &str) -> Result<Duration, String> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|err| format!("expected a number of seconds: {}", err))
}
