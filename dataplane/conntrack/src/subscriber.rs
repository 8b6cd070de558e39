/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use std::io;

use async_trait::async_trait;
use netlink_sys::{
    protocols::NETLINK_NETFILTER, AsyncSocket, AsyncSocketExt, SocketAddr, TokioSocket,
};

pub const NFNLGRP_CONNTRACK_NEW: u32 = 1;
pub const NFNLGRP_CONNTRACK_UPDATE: u32 = 2;
pub const NFNLGRP_CONNTRACK_DESTROY: u32 = 3;
pub const NFNLGRP_CONNTRACK_EXP_NEW: u32 = 4;
pub const NFNLGRP_CONNTRACK_EXP_UPDATE: u32 = 5;
pub const NFNLGRP_CONNTRACK_EXP_DESTROY: u32 = 6;

/// Connection and expectation event groups.
pub const CONNTRACK_GROUPS: [u32; 6] = [
    NFNLGRP_CONNTRACK_NEW,
    NFNLGRP_CONNTRACK_UPDATE,
    NFNLGRP_CONNTRACK_DESTROY,
    NFNLGRP_CONNTRACK_EXP_NEW,
    NFNLGRP_CONNTRACK_EXP_UPDATE,
    NFNLGRP_CONNTRACK_EXP_DESTROY,
];

/// An open subscription delivering raw netlink datagrams.
#[async_trait]
pub trait ConntrackSource: Send + 'static {
    async fn recv(&mut self) -> io::Result<Vec<u8>>;
}

/// Opens subscriptions to the kernel conntrack notification channel.
pub trait Subscribe: Send + Sync {
    type Source: ConntrackSource;

    fn subscribe(&self) -> io::Result<Self::Source>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NetlinkSubscriber;

pub struct NetlinkSource {
    socket: TokioSocket,
}

impl Subscribe for NetlinkSubscriber {
    type Source = NetlinkSource;

    fn subscribe(&self) -> io::Result<NetlinkSource> {
        let mut socket = TokioSocket::new(NETLINK_NETFILTER)?;
        socket.socket_mut().bind(&SocketAddr::new(0, 0))?;
        for group in CONNTRACK_GROUPS {
            socket.socket_mut().add_membership(group)?;
        }
        Ok(NetlinkSource { socket })
    }
}

#[async_trait]
impl ConntrackSource for NetlinkSource {
    async fn recv(&mut self) -> io::Result<Vec<u8>> {
        let (datagram, _) = self.socket.recv_from_full().await?;
        Ok(datagram)
    }
}
