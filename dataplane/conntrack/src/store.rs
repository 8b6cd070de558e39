/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use std::collections::BTreeMap;
use std::net::IpAddr;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::flow::{FlowKey, IPPROTO_TCP, IPPROTO_UDP};
use crate::metrics::{DirectionLabels, Metrics, RemoteLabels, StateLabels};
use crate::tcp_state;

/// In-memory connection accounting owned by the conntrack monitor.
///
/// Counters are updated per key; there is no lock over the store as a whole.
pub struct ConnectionStore {
    active: DashMap<FlowKey, u64>,
    // Active TCP connections per remote endpoint, mirrored into the
    // `tcp_connection_remote` gauges under the entry lock.
    remotes: DashMap<(IpAddr, u16), u64>,
    tcp_states: DashMap<u8, u64>,
    metrics: Metrics,
}

impl ConnectionStore {
    pub fn new(metrics: Metrics) -> Self {
        ConnectionStore {
            active: DashMap::new(),
            remotes: DashMap::new(),
            tcp_states: DashMap::new(),
            metrics,
        }
    }

    pub fn record_new(&self, flow: &FlowKey, tcp_state: Option<u8>) {
        match flow.protocol {
            IPPROTO_TCP => {
                self.increment_active(flow);
                self.increment_remote(flow);
                self.observe_state(tcp_state);
            }
            IPPROTO_UDP => {
                self.increment_active(flow);
                self.metrics
                    .udp_connection_stats
                    .get_or_create(&DirectionLabels::active())
                    .inc();
            }
            _ => {}
        }
    }

    pub fn record_update(&self, flow: &FlowKey, tcp_state: Option<u8>) {
        match flow.protocol {
            IPPROTO_TCP => self.observe_state(tcp_state),
            IPPROTO_UDP => debug!(%flow, "udp flow updated"),
            _ => {}
        }
    }

    /// Removes one active connection for `flow`.
    ///
    /// The remote gauges are only decremented when an active entry existed,
    /// so a destroy without a matching new never drives them negative. A remote
    /// endpoint without active connections loses its label set.
    pub fn record_destroy(&self, flow: &FlowKey, final_state: Option<u8>) {
        match flow.protocol {
            IPPROTO_TCP => {
                if self.decrement_active(flow) {
                    self.decrement_remote(flow);
                }
                self.observe_state(final_state);
            }
            IPPROTO_UDP => {
                if self.decrement_active(flow) {
                    self.metrics
                        .udp_connection_stats
                        .get_or_create(&DirectionLabels::active())
                        .dec();
                }
            }
            _ => {}
        }
    }

    /// Publishes the TCP state histogram to the `tcp_state` gauges and zeroes it.
    ///
    /// Each entry is read and reset under its shard lock, so increments racing
    /// with the flush land either in this interval or the next one.
    pub fn flush_and_reset(&self) {
        let mut by_name: BTreeMap<&'static str, i64> = BTreeMap::new();
        for mut entry in self.tcp_states.iter_mut() {
            let count = std::mem::take(entry.value_mut());
            *by_name.entry(tcp_state::name_for(*entry.key())).or_default() +=
                i64::try_from(count).unwrap_or(i64::MAX);
        }

        for (state, count) in by_name {
            self.metrics
                .tcp_state
                .get_or_create(&StateLabels {
                    state: state.to_string(),
                })
                .set(count);
        }
    }

    pub fn active_count(&self, flow: &FlowKey) -> u64 {
        self.active.get(flow).map(|count| *count).unwrap_or(0)
    }

    pub fn active_flows(&self) -> usize {
        self.active.len()
    }

    pub fn active_remotes(&self) -> usize {
        self.remotes.len()
    }

    pub fn state_count(&self, code: u8) -> u64 {
        self.tcp_states.get(&code).map(|count| *count).unwrap_or(0)
    }

    fn increment_active(&self, flow: &FlowKey) {
        *self.active.entry(*flow).or_insert(0) += 1;
    }

    // Returns true when an active connection was actually removed.
    fn decrement_active(&self, flow: &FlowKey) -> bool {
        match self.active.entry(*flow) {
            Entry::Occupied(mut entry) => match *entry.get() {
                0 => {
                    entry.remove();
                    debug!(%flow, "destroy for flow with no active connections");
                    false
                }
                1 => {
                    entry.remove();
                    true
                }
                _ => {
                    *entry.get_mut() -= 1;
                    true
                }
            },
            Entry::Vacant(_) => {
                debug!(%flow, "destroy for untracked flow");
                false
            }
        }
    }

    fn increment_remote(&self, flow: &FlowKey) {
        let mut count = self.remotes.entry((flow.dst_addr, flow.dst_port)).or_insert(0);
        *count += 1;
        self.metrics
            .tcp_connection_remote
            .get_or_create(&RemoteLabels::new(flow.dst_addr, flow.dst_port))
            .set(i64::try_from(*count).unwrap_or(i64::MAX));
    }

    fn decrement_remote(&self, flow: &FlowKey) {
        let labels = RemoteLabels::new(flow.dst_addr, flow.dst_port);
        match self.remotes.entry((flow.dst_addr, flow.dst_port)) {
            Entry::Occupied(mut entry) if *entry.get() > 1 => {
                *entry.get_mut() -= 1;
                self.metrics
                    .tcp_connection_remote
                    .get_or_create(&labels)
                    .set(i64::try_from(*entry.get()).unwrap_or(i64::MAX));
            }
            Entry::Occupied(entry) => {
                entry.remove();
                self.metrics.tcp_connection_remote.remove(&labels);
            }
            Entry::Vacant(_) => {}
        }
    }

    fn observe_state(&self, state: Option<u8>) {
        if let Some(code) = state {
            *self.tcp_states.entry(code).or_insert(0) += 1;
        }
    }
}
