/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

#![no_std]

use core::mem::size_of;

/// Name the datapath pins the connection table under.
pub const CONNTRACK_MAP_NAME: &str = "retina_conntrack_map";

/// Maximum number of entries the datapath allocates for the connection table.
pub const CONNTRACK_MAP_MAX_ENTRIES: u32 = 262144;

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;
pub const TCP_URG: u8 = 0x20;
pub const TCP_ECE: u8 = 0x40;
pub const TCP_CWR: u8 = 0x80;

/// Key of the kernel-shared connection table.
///
/// Addresses and ports are stored exactly as the datapath writes them
/// (network byte order). The trailing padding is part of the key hash, so it
/// must always be zeroed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(C)]
pub struct ConnKey {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub proto: u8,
    pub _pad: [u8; 3],
}

impl ConnKey {
    pub const fn new(src_addr: u32, dst_addr: u32, src_port: u16, dst_port: u16, proto: u8) -> Self {
        ConnKey {
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            proto,
            _pad: [0; 3],
        }
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for ConnKey {}

/// Value of the kernel-shared connection table.
///
/// Matches the datapath program's value struct byte for byte: a one-byte
/// closing flag at offset 4 and the seen-flags byte at offset 5. A producer
/// that declares the closing flag as a `u16` moves `flags_seen` to offset 6
/// and cannot share this map.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ConnRecord {
    /// Monotonic second at which the entry expires.
    pub lifetime: u32,
    /// Non-zero once a FIN or RST was seen.
    pub is_closing: u8,
    /// Union of the TCP flags seen on the connection.
    pub flags_seen: u8,
    pub _pad: u16,
    /// Monotonic second of the last report sent to user space.
    pub last_report: u32,
}

impl ConnRecord {
    pub fn closing(&self) -> bool {
        self.is_closing != 0
    }

    pub fn expired(&self, now_secs: u32) -> bool {
        self.lifetime <= now_secs
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for ConnRecord {}

pub const CONN_KEY_SIZE: usize = 16;
pub const CONN_RECORD_SIZE: usize = 12;

const _: () = assert!(size_of::<ConnKey>() == CONN_KEY_SIZE);
const _: () = assert!(size_of::<ConnRecord>() == CONN_RECORD_SIZE);
