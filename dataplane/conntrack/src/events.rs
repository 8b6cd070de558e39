/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use crate::flow::FlowKey;

/// A tracked connection as reported by ctnetlink.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Connection {
    /// Original direction tuple.
    pub flow: FlowKey,
    /// TCP state from `CTA_PROTOINFO_TCP_STATE`, absent for other protocols.
    pub tcp_state: Option<u8>,
    /// Kernel conntrack id, when the message carried one.
    pub id: Option<u32>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConntrackEvent {
    New(Connection),
    Update(Connection),
    Destroy(Connection),
    ExpectNew,
    ExpectDestroy,
    /// Any other netfilter message, carrying its netlink message type.
    Unknown(u16),
}
