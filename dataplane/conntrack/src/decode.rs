/*
Copyright 2023 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

//! Decoding of ctnetlink notifications into [`ConntrackEvent`]s.
//!
//! A datagram read from the netfilter socket carries one or more netlink
//! messages. Each message starts with a `nfgenmsg` header followed by the
//! conntrack attributes; only the original tuple, the TCP state and the
//! conntrack id are extracted.

use std::net::IpAddr;

use netlink_packet_core::{NetlinkBuffer, NLM_F_CREATE};
use netlink_packet_utils::nla::NlasIterator;
use netlink_packet_utils::parsers::{parse_ip, parse_u16_be, parse_u32_be, parse_u8};
use thiserror::Error;

use crate::events::{Connection, ConntrackEvent};
use crate::flow::FlowKey;

pub const NETLINK_HEADER_LEN: usize = 16;
pub const NFGENMSG_LEN: usize = 4;

// Message types below this value are netlink control messages.
const NLMSG_MIN_TYPE: u16 = 0x10;
const NLA_TYPE_MASK: u16 = 0x3fff;

pub const NFNL_SUBSYS_CTNETLINK: u8 = 1;
pub const NFNL_SUBSYS_CTNETLINK_EXP: u8 = 2;

pub const IPCTNL_MSG_CT_NEW: u8 = 0;
pub const IPCTNL_MSG_CT_DELETE: u8 = 2;
pub const IPCTNL_MSG_EXP_NEW: u8 = 0;
pub const IPCTNL_MSG_EXP_DELETE: u8 = 2;

pub const CTA_TUPLE_ORIG: u16 = 1;
pub const CTA_PROTOINFO: u16 = 4;
pub const CTA_ID: u16 = 12;

pub const CTA_TUPLE_IP: u16 = 1;
pub const CTA_TUPLE_PROTO: u16 = 2;

pub const CTA_IP_V4_SRC: u16 = 1;
pub const CTA_IP_V4_DST: u16 = 2;
pub const CTA_IP_V6_SRC: u16 = 3;
pub const CTA_IP_V6_DST: u16 = 4;

pub const CTA_PROTO_NUM: u16 = 1;
pub const CTA_PROTO_SRC_PORT: u16 = 2;
pub const CTA_PROTO_DST_PORT: u16 = 3;

pub const CTA_PROTOINFO_TCP: u16 = 1;
pub const CTA_PROTOINFO_TCP_STATE: u16 = 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed netlink header: {0}")]
    Header(String),
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("missing attribute {0}")]
    MissingAttribute(&'static str),
    #[error("malformed attribute {attr}: {reason}")]
    Attribute { attr: &'static str, reason: String },
}

fn malformed(attr: &'static str) -> impl Fn(netlink_packet_utils::DecodeError) -> DecodeError {
    move |err| DecodeError::Attribute {
        attr,
        reason: err.to_string(),
    }
}

/// Decodes every netlink message of a datagram.
///
/// Control messages produce nothing. A malformed header ends the datagram
/// since the next message offset cannot be trusted.
pub fn decode_datagram(buf: &[u8]) -> Vec<Result<ConntrackEvent, DecodeError>> {
    let mut decoded = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        let message = match NetlinkBuffer::new_checked(&buf[offset..]) {
            Ok(message) => message,
            Err(err) => {
                decoded.push(Err(DecodeError::Header(err.to_string())));
                break;
            }
        };

        let length = message.length() as usize;
        if length < NETLINK_HEADER_LEN {
            decoded.push(Err(DecodeError::Header(format!(
                "message length {} shorter than header",
                length
            ))));
            break;
        }

        if let Some(event) = decode_message(message.message_type(), message.flags(), message.payload()) {
            decoded.push(event);
        }

        offset += align(length);
    }

    decoded
}

/// Decodes a single netfilter message given its netlink type, flags and payload.
pub fn decode_message(
    message_type: u16,
    flags: u16,
    payload: &[u8],
) -> Option<Result<ConntrackEvent, DecodeError>> {
    if message_type < NLMSG_MIN_TYPE {
        return None;
    }

    let subsys = (message_type >> 8) as u8;
    let msg = (message_type & 0xff) as u8;

    let event = match (subsys, msg) {
        (NFNL_SUBSYS_CTNETLINK, IPCTNL_MSG_CT_NEW) => parse_connection(payload).map(|conn| {
            if flags & NLM_F_CREATE != 0 {
                ConntrackEvent::New(conn)
            } else {
                ConntrackEvent::Update(conn)
            }
        }),
        (NFNL_SUBSYS_CTNETLINK, IPCTNL_MSG_CT_DELETE) => {
            parse_connection(payload).map(ConntrackEvent::Destroy)
        }
        (NFNL_SUBSYS_CTNETLINK_EXP, IPCTNL_MSG_EXP_NEW) => Ok(ConntrackEvent::ExpectNew),
        (NFNL_SUBSYS_CTNETLINK_EXP, IPCTNL_MSG_EXP_DELETE) => Ok(ConntrackEvent::ExpectDestroy),
        _ => Ok(ConntrackEvent::Unknown(message_type)),
    };

    Some(event)
}

fn parse_connection(payload: &[u8]) -> Result<Connection, DecodeError> {
    if payload.len() < NFGENMSG_LEN {
        return Err(DecodeError::Truncated("nfgenmsg"));
    }

    let mut flow = None;
    let mut tcp_state = None;
    let mut id = None;

    for nla in NlasIterator::new(&payload[NFGENMSG_LEN..]) {
        let nla = nla.map_err(malformed("conntrack"))?;
        match nla.kind() & NLA_TYPE_MASK {
            CTA_TUPLE_ORIG => flow = Some(parse_tuple(nla.value())?),
            CTA_PROTOINFO => tcp_state = parse_protoinfo(nla.value())?,
            CTA_ID => id = Some(parse_u32_be(nla.value()).map_err(malformed("CTA_ID"))?),
            _ => {}
        }
    }

    Ok(Connection {
        flow: flow.ok_or(DecodeError::MissingAttribute("CTA_TUPLE_ORIG"))?,
        tcp_state,
        id,
    })
}

fn parse_tuple(buf: &[u8]) -> Result<FlowKey, DecodeError> {
    let mut src_addr: Option<IpAddr> = None;
    let mut dst_addr: Option<IpAddr> = None;
    let mut protocol = None;
    let mut src_port = 0;
    let mut dst_port = 0;

    for nla in NlasIterator::new(buf) {
        let nla = nla.map_err(malformed("CTA_TUPLE_ORIG"))?;
        match nla.kind() & NLA_TYPE_MASK {
            CTA_TUPLE_IP => {
                for ip in NlasIterator::new(nla.value()) {
                    let ip = ip.map_err(malformed("CTA_TUPLE_IP"))?;
                    match ip.kind() & NLA_TYPE_MASK {
                        CTA_IP_V4_SRC | CTA_IP_V6_SRC => {
                            src_addr = Some(parse_ip(ip.value()).map_err(malformed("CTA_IP_SRC"))?)
                        }
                        CTA_IP_V4_DST | CTA_IP_V6_DST => {
                            dst_addr = Some(parse_ip(ip.value()).map_err(malformed("CTA_IP_DST"))?)
                        }
                        _ => {}
                    }
                }
            }
            CTA_TUPLE_PROTO => {
                for proto in NlasIterator::new(nla.value()) {
                    let proto = proto.map_err(malformed("CTA_TUPLE_PROTO"))?;
                    match proto.kind() & NLA_TYPE_MASK {
                        CTA_PROTO_NUM => {
                            protocol = Some(parse_u8(proto.value()).map_err(malformed("CTA_PROTO_NUM"))?)
                        }
                        CTA_PROTO_SRC_PORT => {
                            src_port = parse_u16_be(proto.value()).map_err(malformed("CTA_PROTO_SRC_PORT"))?
                        }
                        CTA_PROTO_DST_PORT => {
                            dst_port = parse_u16_be(proto.value()).map_err(malformed("CTA_PROTO_DST_PORT"))?
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    Ok(FlowKey::new(
        src_addr.ok_or(DecodeError::MissingAttribute("CTA_IP_SRC"))?,
        src_port,
        dst_addr.ok_or(DecodeError::MissingAttribute("CTA_IP_DST"))?,
        dst_port,
        protocol.ok_or(DecodeError::MissingAttribute("CTA_PROTO_NUM"))?,
    ))
}

fn parse_protoinfo(buf: &[u8]) -> Result<Option<u8>, DecodeError> {
    for nla in NlasIterator::new(buf) {
        let nla = nla.map_err(malformed("CTA_PROTOINFO"))?;
        if nla.kind() & NLA_TYPE_MASK != CTA_PROTOINFO_TCP {
            continue;
        }
        for tcp in NlasIterator::new(nla.value()) {
            let tcp = tcp.map_err(malformed("CTA_PROTOINFO_TCP"))?;
            if tcp.kind() & NLA_TYPE_MASK == CTA_PROTOINFO_TCP_STATE {
                return parse_u8(tcp.value())
                    .map(Some)
                    .map_err(malformed("CTA_PROTOINFO_TCP_STATE"));
            }
        }
    }
    Ok(None)
}

fn align(len: usize) -> usize {
    (len + 3) & !3
}
