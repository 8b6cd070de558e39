mod support;

use std::net::IpAddr;

use conntrack::decode::{decode_datagram, decode_message, DecodeError, CTA_TUPLE_ORIG};
use conntrack::events::{Connection, ConntrackEvent};
use conntrack::flow::{FlowKey, IPPROTO_TCP};
use support::*;

#[test]
fn test_decode_new_with_create_flag() {
    let flow = tcp_flow("93.184.216.34", 443);
    let datagram = message(CT_NEW, NLM_F_CREATE, &connection_payload(&flow, Some(4), Some(77)));

    let decoded = decode_datagram(&datagram);
    assert_eq!(
        decoded,
        vec![Ok(ConntrackEvent::New(Connection {
            flow,
            tcp_state: Some(4),
            id: Some(77),
        }))]
    );
}

#[test]
fn test_decode_new_without_create_flag_is_update() {
    let flow = udp_flow("1.1.1.1", 53);
    let decoded = decode_datagram(&update_message(&flow, None));
    assert_eq!(
        decoded,
        vec![Ok(ConntrackEvent::Update(Connection {
            flow,
            tcp_state: None,
            id: None,
        }))]
    );
}

#[test]
fn test_decode_destroy_keeps_final_state() {
    let flow = tcp_flow("93.184.216.34", 443);
    let decoded = decode_datagram(&destroy_message(&flow, Some(10)));
    match decoded.as_slice() {
        [Ok(ConntrackEvent::Destroy(conn))] => {
            assert_eq!(conn.flow, flow);
            assert_eq!(conn.tcp_state, Some(10));
        }
        other => panic!("unexpected decode result: {:?}", other),
    }
}

#[test]
fn test_decode_ipv6_tuple() {
    let flow = FlowKey::new(
        "fd00::5".parse::<IpAddr>().unwrap(),
        51000,
        "2001:db8::1".parse::<IpAddr>().unwrap(),
        8443,
        IPPROTO_TCP,
    );
    let decoded = decode_datagram(&new_message(&flow, Some(1)));
    match decoded.as_slice() {
        [Ok(ConntrackEvent::New(conn))] => assert_eq!(conn.flow, flow),
        other => panic!("unexpected decode result: {:?}", other),
    }
}

#[test]
fn test_decode_expectations() {
    let payload = conntrack_payload(&[]);
    assert_eq!(
        decode_message(EXP_NEW, NLM_F_CREATE, &payload),
        Some(Ok(ConntrackEvent::ExpectNew))
    );
    assert_eq!(
        decode_message(EXP_DELETE, 0, &payload),
        Some(Ok(ConntrackEvent::ExpectDestroy))
    );
}

#[test]
fn test_decode_unknown_and_control_messages() {
    // IPCTNL_MSG_CT_GET
    assert_eq!(
        decode_message(0x0101, 0, &[]),
        Some(Ok(ConntrackEvent::Unknown(0x0101)))
    );
    // NLMSG_DONE
    assert_eq!(decode_message(3, 0, &[]), None);
}

#[test]
fn test_decode_multiple_messages_per_datagram() {
    let first = tcp_flow("93.184.216.34", 443);
    let second = udp_flow("8.8.8.8", 53);
    let mut datagram = new_message(&first, Some(3));
    datagram.extend(message(3, 0, &[0; 4]));
    datagram.extend(destroy_message(&second, None));

    let decoded = decode_datagram(&datagram);
    assert_eq!(decoded.len(), 2);
    assert!(matches!(&decoded[0], Ok(ConntrackEvent::New(conn)) if conn.flow == first));
    assert!(matches!(&decoded[1], Ok(ConntrackEvent::Destroy(conn)) if conn.flow == second));
}

#[test]
fn test_decode_missing_tuple() {
    let datagram = message(CT_NEW, NLM_F_CREATE, &conntrack_payload(&[tcp_protoinfo(4)]));
    assert_eq!(
        decode_datagram(&datagram),
        vec![Err(DecodeError::MissingAttribute("CTA_TUPLE_ORIG"))]
    );
}

#[test]
fn test_decode_truncated_payload() {
    let datagram = message(CT_DELETE, 0, &[2, 0]);
    assert_eq!(
        decode_datagram(&datagram),
        vec![Err(DecodeError::Truncated("nfgenmsg"))]
    );
}

#[test]
fn test_decode_malformed_attribute() {
    // A source port attribute one byte short.
    let tuple = nested(
        CTA_TUPLE_ORIG,
        &[
            nested(
                conntrack::decode::CTA_TUPLE_IP,
                &[
                    nla(conntrack::decode::CTA_IP_V4_SRC, &[10, 244, 0, 5]),
                    nla(conntrack::decode::CTA_IP_V4_DST, &[1, 1, 1, 1]),
                ],
            ),
            nested(
                conntrack::decode::CTA_TUPLE_PROTO,
                &[
                    nla(conntrack::decode::CTA_PROTO_NUM, &[IPPROTO_TCP]),
                    nla(conntrack::decode::CTA_PROTO_SRC_PORT, &[1]),
                ],
            ),
        ],
    );
    let decoded = decode_datagram(&message(CT_NEW, NLM_F_CREATE, &conntrack_payload(&[tuple])));
    assert!(matches!(
        decoded.as_slice(),
        [Err(DecodeError::Attribute {
            attr: "CTA_PROTO_SRC_PORT",
            ..
        })]
    ));
}

#[test]
fn test_decode_bad_header_stops_datagram() {
    let flow = tcp_flow("93.184.216.34", 443);
    let mut datagram = new_message(&flow, Some(4));
    // A trailing header claiming more bytes than the datagram holds.
    datagram.extend_from_slice(&200u32.to_ne_bytes());
    datagram.extend_from_slice(&[0; 12]);

    let decoded = decode_datagram(&datagram);
    assert_eq!(decoded.len(), 2);
    assert!(decoded[0].is_ok());
    assert!(matches!(decoded[1], Err(DecodeError::Header(_))));
}
