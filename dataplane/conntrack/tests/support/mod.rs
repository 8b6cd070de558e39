#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use aya::maps::MapError;
use common::{ConnKey, ConnRecord};
use conntrack::decode::{
    CTA_ID, CTA_IP_V4_DST, CTA_IP_V4_SRC, CTA_IP_V6_DST, CTA_IP_V6_SRC, CTA_PROTOINFO,
    CTA_PROTOINFO_TCP, CTA_PROTOINFO_TCP_STATE, CTA_PROTO_DST_PORT, CTA_PROTO_NUM,
    CTA_PROTO_SRC_PORT, CTA_TUPLE_IP, CTA_TUPLE_ORIG, CTA_TUPLE_PROTO,
};
use conntrack::gc::{ConnTable, MonotonicClock};
use conntrack::subscriber::{ConntrackSource, Subscribe};
use conntrack::{Config, FlowKey};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

pub const CT_NEW: u16 = 0x0100;
pub const CT_DELETE: u16 = 0x0102;
pub const EXP_NEW: u16 = 0x0200;
pub const EXP_DELETE: u16 = 0x0202;
pub const NLM_F_CREATE: u16 = 0x400;
const NLA_F_NESTED: u16 = 0x8000;

pub fn test_config() -> Config {
    Config {
        pod_cidr: Some("10.244.0.0/16".to_string()),
        service_cidr: Some("10.96.0.0/12".to_string()),
        node_ip: Some("192.168.1.10".to_string()),
        ..Default::default()
    }
}

fn pad(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

pub fn nla(kind: u16, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&((4 + value.len()) as u16).to_ne_bytes());
    buf.extend_from_slice(&kind.to_ne_bytes());
    buf.extend_from_slice(value);
    pad(&mut buf);
    buf
}

pub fn nested(kind: u16, children: &[Vec<u8>]) -> Vec<u8> {
    nla(kind | NLA_F_NESTED, &children.concat())
}

pub fn tuple(flow: &FlowKey) -> Vec<u8> {
    let (src_kind, src) = ip_attr(flow.src_addr, CTA_IP_V4_SRC, CTA_IP_V6_SRC);
    let (dst_kind, dst) = ip_attr(flow.dst_addr, CTA_IP_V4_DST, CTA_IP_V6_DST);
    nested(
        CTA_TUPLE_ORIG,
        &[
            nested(CTA_TUPLE_IP, &[nla(src_kind, &src), nla(dst_kind, &dst)]),
            nested(
                CTA_TUPLE_PROTO,
                &[
                    nla(CTA_PROTO_NUM, &[flow.protocol]),
                    nla(CTA_PROTO_SRC_PORT, &flow.src_port.to_be_bytes()),
                    nla(CTA_PROTO_DST_PORT, &flow.dst_port.to_be_bytes()),
                ],
            ),
        ],
    )
}

fn ip_attr(addr: IpAddr, v4: u16, v6: u16) -> (u16, Vec<u8>) {
    match addr {
        IpAddr::V4(ip) => (v4, ip.octets().to_vec()),
        IpAddr::V6(ip) => (v6, ip.octets().to_vec()),
    }
}

pub fn tcp_protoinfo(state: u8) -> Vec<u8> {
    nested(
        CTA_PROTOINFO,
        &[nested(
            CTA_PROTOINFO_TCP,
            &[nla(CTA_PROTOINFO_TCP_STATE, &[state])],
        )],
    )
}

/// A `nfgenmsg` followed by the given attributes.
pub fn conntrack_payload(attrs: &[Vec<u8>]) -> Vec<u8> {
    let mut payload = vec![libc::AF_INET as u8, 0, 0, 0];
    payload.extend(attrs.concat());
    payload
}

pub fn connection_payload(flow: &FlowKey, tcp_state: Option<u8>, id: Option<u32>) -> Vec<u8> {
    let mut attrs = vec![tuple(flow)];
    if let Some(state) = tcp_state {
        attrs.push(tcp_protoinfo(state));
    }
    if let Some(id) = id {
        attrs.push(nla(CTA_ID, &id.to_be_bytes()));
    }
    conntrack_payload(&attrs)
}

pub fn message(message_type: u16, flags: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&((16 + payload.len()) as u32).to_ne_bytes());
    buf.extend_from_slice(&message_type.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&1u32.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(payload);
    pad(&mut buf);
    buf
}

pub fn new_message(flow: &FlowKey, tcp_state: Option<u8>) -> Vec<u8> {
    message(CT_NEW, NLM_F_CREATE, &connection_payload(flow, tcp_state, None))
}

pub fn update_message(flow: &FlowKey, tcp_state: Option<u8>) -> Vec<u8> {
    message(CT_NEW, 0, &connection_payload(flow, tcp_state, None))
}

pub fn destroy_message(flow: &FlowKey, tcp_state: Option<u8>) -> Vec<u8> {
    message(CT_DELETE, 0, &connection_payload(flow, tcp_state, None))
}

pub fn tcp_flow(dst: &str, dst_port: u16) -> FlowKey {
    FlowKey::new(
        "10.244.0.5".parse().unwrap(),
        40000,
        dst.parse().unwrap(),
        dst_port,
        conntrack::flow::IPPROTO_TCP,
    )
}

pub fn udp_flow(dst: &str, dst_port: u16) -> FlowKey {
    FlowKey::new(
        "10.244.0.5".parse().unwrap(),
        40001,
        dst.parse().unwrap(),
        dst_port,
        conntrack::flow::IPPROTO_UDP,
    )
}

/// Feeds datagrams written by the test into the monitor.
pub struct ChannelSubscriber {
    rx: Mutex<Option<UnboundedReceiver<Vec<u8>>>>,
}

impl ChannelSubscriber {
    pub fn new() -> (Self, UnboundedSender<Vec<u8>>) {
        let (tx, rx) = unbounded_channel();
        (
            ChannelSubscriber {
                rx: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

pub struct ChannelSource {
    rx: UnboundedReceiver<Vec<u8>>,
}

impl Subscribe for ChannelSubscriber {
    type Source = ChannelSource;

    fn subscribe(&self) -> io::Result<ChannelSource> {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "already subscribed"))?;
        Ok(ChannelSource { rx })
    }
}

#[async_trait]
impl ConntrackSource for ChannelSource {
    async fn recv(&mut self) -> io::Result<Vec<u8>> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "test sender dropped"))
    }
}

pub struct RefusingSubscriber;

impl Subscribe for RefusingSubscriber {
    type Source = ChannelSource;

    fn subscribe(&self) -> io::Result<ChannelSource> {
        Err(io::Error::from_raw_os_error(libc::EPERM))
    }
}

/// An in-memory stand-in for the pinned connection table.
///
/// Clones share their entries, so a test keeps one handle while the GC owns
/// another.
#[derive(Clone, Default)]
pub struct MemTable {
    pub entries: Arc<Mutex<BTreeMap<ConnKey, ConnRecord>>>,
}

impl MemTable {
    pub fn insert(&self, key: ConnKey, record: ConnRecord) {
        self.entries.lock().unwrap().insert(key, record);
    }

    pub fn contains(&self, key: &ConnKey) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl ConnTable for MemTable {
    fn for_each_entry(
        &self,
        visit: &mut dyn FnMut(ConnKey, ConnRecord),
    ) -> Result<(), MapError> {
        let snapshot: Vec<_> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .map(|(key, record)| (*key, *record))
            .collect();
        for (key, record) in snapshot {
            visit(key, record);
        }
        Ok(())
    }

    fn get(&self, key: &ConnKey) -> Result<Option<ConnRecord>, MapError> {
        Ok(self.entries.lock().unwrap().get(key).copied())
    }

    fn remove(&mut self, key: &ConnKey) -> Result<(), MapError> {
        self.entries
            .lock()
            .unwrap()
            .remove(key)
            .map(|_| ())
            .ok_or(MapError::KeyNotFound)
    }
}

pub struct FixedClock(pub u32);

impl MonotonicClock for FixedClock {
    fn now_secs(&self) -> u32 {
        self.0
    }
}

pub fn key(last_octet: u8, dst_port: u16) -> ConnKey {
    ConnKey::new(
        u32::from_be_bytes([10, 244, 0, last_octet]).to_be(),
        u32::from_be_bytes([93, 184, 216, 34]).to_be(),
        40000u16.to_be(),
        dst_port.to_be(),
        conntrack::flow::IPPROTO_TCP,
    )
}

pub fn record(lifetime: u32, is_closing: u8) -> ConnRecord {
    ConnRecord {
        lifetime,
        is_closing,
        ..Default::default()
    }
}
