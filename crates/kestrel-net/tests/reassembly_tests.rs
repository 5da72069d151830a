//! Fragmentation round-trip and receive-path filtering tests driven by
//! the scripted NIC.

use std::net::Ipv4Addr;
use std::time::Duration;

use kestrel_net::testing::{
    RecordingIgmp, ScriptedNic, SentFrame, SharedIgmp, SharedNic, StaticArp, peer_mac,
    raw_ipv4_frame,
};
use kestrel_net::{IpFilter, NetError, PROTO_UDP, RecvSpec, RxFrame, SendSpec, Stack, StackConfig};

const STATION: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);
const PEER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
const MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

fn stack_for(station: Ipv4Addr) -> (Stack, SharedNic) {
    let nic = SharedNic::new(ScriptedNic::new());
    let stack = Stack::new(
        Box::new(nic.clone()),
        Box::new(StaticArp::new()),
        Box::new(RecordingIgmp::default()),
        StackConfig::new(station, MASK),
    );
    (stack, nic)
}

fn sent_to_rx(frame: &SentFrame) -> RxFrame {
    RxFrame {
        dest: frame.dest,
        src: peer_mac(),
        ethertype: frame.ethertype,
        payload: frame.payload.clone(),
    }
}

fn wildcard_udp() -> RecvSpec {
    RecvSpec {
        protocol: PROTO_UDP,
        src: None,
        dest: None,
    }
}

/// Fragment a large datagram through one stack, replay the frames into a
/// second stack in the given order, and expect the original bytes back.
fn roundtrip(payload_len: usize, order: impl Fn(&mut Vec<RxFrame>)) {
    let l4: Vec<u8> = (0..8u8).collect();
    let body: Vec<u8> = (0..payload_len).map(|i| (i * 7 % 251) as u8).collect();

    let (mut tx, tx_nic) = stack_for(PEER);
    tx.send_fragmented(&SendSpec::new(STATION, PROTO_UDP), &l4, &body)
        .unwrap();

    let frames = tx_nic.sent();
    assert!(frames.len() > 1, "payload should have fragmented");

    let mut replay: Vec<RxFrame> = frames.iter().map(sent_to_rx).collect();
    order(&mut replay);

    let (mut rx, rx_nic) = stack_for(STATION);
    for frame in replay {
        rx_nic.push_frame(frame);
    }

    let mut l4_out = [0u8; 8];
    let mut body_out = vec![0u8; payload_len + 64];
    let info = rx
        .ip_receive(
            &wildcard_udp(),
            &mut l4_out,
            &mut body_out,
            Some(Duration::from_millis(500)),
        )
        .unwrap();

    assert_eq!(info.l4_header_len, 8);
    assert_eq!(info.payload_len, payload_len);
    assert_eq!(&l4_out[..], &l4[..]);
    assert_eq!(&body_out[..payload_len], &body[..]);
}

#[test]
fn fragmentation_roundtrip_in_order() {
    roundtrip(4000, |_| {});
}

#[test]
fn fragmentation_roundtrip_reversed() {
    roundtrip(4000, |frames| frames.reverse());
}

#[test]
fn fragmentation_roundtrip_rotated() {
    roundtrip(6000, |frames| frames.rotate_left(1));
}

#[test]
fn fragment_offsets_are_8_byte_aligned() {
    let (mut tx, tx_nic) = stack_for(PEER);
    let body = vec![0x5au8; 5000];
    tx.send_fragmented(&SendSpec::new(STATION, PROTO_UDP), &[], &body)
        .unwrap();

    let frames = tx_nic.sent();
    assert!(frames.len() > 1);
    for (i, frame) in frames.iter().enumerate() {
        let (hdr, _) = kestrel_net::Ipv4Header::parse(&frame.payload).unwrap();
        assert_eq!(hdr.fragment_offset % 8, 0);
        assert_eq!(hdr.more_fragments, i != frames.len() - 1);
    }
}

#[test]
fn foreign_identification_fragments_are_ignored() {
    let l4: Vec<u8> = (0..8u8).collect();
    let body: Vec<u8> = (0..3000usize).map(|i| (i % 256) as u8).collect();

    let (mut tx, tx_nic) = stack_for(PEER);
    tx.send_fragmented(&SendSpec::new(STATION, PROTO_UDP), &l4, &body)
        .unwrap();
    let frames = tx_nic.sent();

    let (mut rx, rx_nic) = stack_for(STATION);
    let mut iter = frames.iter();
    // First real fragment locks the reassembly onto its identification.
    rx_nic.push_frame(sent_to_rx(iter.next().unwrap()));
    // A fragment of some other datagram: same source, different ident.
    rx_nic.push_frame(raw_ipv4_frame(
        PEER,
        STATION,
        PROTO_UDP,
        0x7777,
        1480,
        true,
        &[0xeeu8; 64],
    ));
    for frame in iter {
        rx_nic.push_frame(sent_to_rx(frame));
    }

    let mut l4_out = [0u8; 8];
    let mut body_out = vec![0u8; 4096];
    let info = rx
        .ip_receive(
            &wildcard_udp(),
            &mut l4_out,
            &mut body_out,
            Some(Duration::from_millis(500)),
        )
        .unwrap();
    assert_eq!(info.payload_len, 3000);
    assert_eq!(&body_out[..3000], &body[..]);
}

#[test]
fn reassembly_overflow_is_fatal() {
    let l4 = [0u8; 8];
    let body = vec![0xabu8; 3000];

    let (mut tx, tx_nic) = stack_for(PEER);
    tx.send_fragmented(&SendSpec::new(STATION, PROTO_UDP), &l4, &body)
        .unwrap();

    let (mut rx, rx_nic) = stack_for(STATION);
    for frame in tx_nic.sent().iter() {
        rx_nic.push_frame(sent_to_rx(frame));
    }

    let mut l4_out = [0u8; 8];
    let mut small = vec![0u8; 512];
    let err = rx
        .ip_receive(
            &wildcard_udp(),
            &mut l4_out,
            &mut small,
            Some(Duration::from_millis(200)),
        )
        .unwrap_err();
    assert!(matches!(err, NetError::BufferTooSmall { .. }));
}

#[test]
fn dont_fragment_oversize_is_rejected() {
    let (mut tx, _) = stack_for(PEER);
    let mut spec = SendSpec::new(STATION, PROTO_UDP);
    spec.dont_fragment = true;
    let body = vec![0u8; 4000];
    let err = tx.send_fragmented(&spec, &[], &body).unwrap_err();
    assert!(matches!(err, NetError::FragmentForbidden));
}

#[test]
fn icmp_errors_surface_and_other_icmp_is_dropped() {
    let (mut rx, rx_nic) = stack_for(STATION);

    // Echo reply (type 0): silently dropped.
    rx_nic.push_frame(raw_ipv4_frame(
        PEER,
        STATION,
        1,
        0x0100,
        0,
        false,
        &[0, 0, 0, 0, 0, 0, 0, 0],
    ));
    // Destination unreachable (type 3, code 3): surfaces.
    rx_nic.push_frame(raw_ipv4_frame(
        PEER,
        STATION,
        1,
        0x0101,
        0,
        false,
        &[3, 3, 0, 0, 0, 0, 0, 0],
    ));

    let mut l4_out = [0u8; 8];
    let mut body_out = vec![0u8; 256];
    let err = rx
        .ip_receive(
            &wildcard_udp(),
            &mut l4_out,
            &mut body_out,
            Some(Duration::from_millis(200)),
        )
        .unwrap_err();
    match err {
        NetError::Icmp { icmp_type, code, .. } => {
            assert_eq!(icmp_type, 3);
            assert_eq!(code, 3);
        }
        other => panic!("expected ICMP error, got {other:?}"),
    }
}

#[test]
fn destination_filter_rejects_foreign_unicast() {
    let (mut rx, rx_nic) = stack_for(STATION);
    // Addressed to someone else entirely.
    rx_nic.push_frame(raw_ipv4_frame(
        PEER,
        Ipv4Addr::new(192, 168, 1, 77),
        PROTO_UDP,
        0x0200,
        0,
        false,
        &[0u8; 16],
    ));

    let mut l4_out = [0u8; 8];
    let mut body_out = vec![0u8; 64];
    let err = rx
        .ip_receive(
            &wildcard_udp(),
            &mut l4_out,
            &mut body_out,
            Some(Duration::from_millis(100)),
        )
        .unwrap_err();
    assert!(matches!(err, NetError::Timeout));
}

#[test]
fn filter_change_joins_and_leaves_groups() {
    let group = Ipv4Addr::new(224, 0, 1, 1);
    let nic = SharedNic::new(ScriptedNic::new());
    let igmp = SharedIgmp::default();
    let mut stack = Stack::new(
        Box::new(nic.clone()),
        Box::new(StaticArp::new()),
        Box::new(igmp.clone()),
        StackConfig::new(STATION, MASK),
    );

    stack
        .set_filter(IpFilter {
            groups: vec![group],
            ..IpFilter::default()
        })
        .unwrap();
    assert_eq!(igmp.joined(), vec![group]);
    // The link-layer filter carries the mapped multicast MAC.
    let filters = nic.filters().unwrap();
    assert_eq!(filters.multicast.len(), 1);

    stack.set_filter(IpFilter::default()).unwrap();
    assert_eq!(igmp.left(), vec![group]);
}
