use std::time::Duration;

use super::http::parse_announce_body_for_tests as parse_announce;
use super::response::{parse_compact_peers, parse_compact_peers6, TrackerEvent};
use super::TrackerError;

#[test]
fn compact_peer_parsing() {
    let peers = parse_compact_peers(&[127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0x00, 80]);
    assert_eq!(peers.len(), 2);
    assert_eq!(peers[0], "127.0.0.1:6881".parse().unwrap());
    assert_eq!(peers[1], "10.0.0.2:80".parse().unwrap());

    // trailing partial entries are ignored
    let peers = parse_compact_peers(&[1, 2, 3]);
    assert!(peers.is_empty());
}

#[test]
fn compact_peer6_parsing() {
    let mut data = [0u8; 18];
    data[15] = 1; // ::1
    data[16] = 0x1a;
    data[17] = 0xe1;
    let peers = parse_compact_peers6(&data);
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0], "[::1]:6881".parse().unwrap());
}

#[test]
fn announce_response_compact() {
    let body = b"d8:completei5e10:incompletei3e8:intervali1800e5:peers6:\x7f\x00\x00\x01\x1a\xe1e";
    let response = parse_announce(body).unwrap();
    assert_eq!(response.interval, Duration::from_secs(1800));
    assert_eq!(response.complete, Some(5));
    assert_eq!(response.incomplete, Some(3));
    assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
}

#[test]
fn announce_response_dict_peers() {
    let body =
        b"d8:intervali900e5:peersld2:ip9:127.0.0.14:porti6881eeee";
    let response = parse_announce(body).unwrap();
    assert_eq!(response.interval, Duration::from_secs(900));
    assert_eq!(response.peers, vec!["127.0.0.1:6881".parse().unwrap()]);
}

#[test]
fn announce_failure_reason() {
    let body = b"d14:failure reason12:unregisterede";
    match parse_announce(body) {
        Err(TrackerError::Failure(reason)) => assert_eq!(reason, "unregistered"),
        other => panic!("expected failure, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn announce_missing_interval_rejected() {
    let body = b"d5:peers0:e";
    assert!(matches!(
        parse_announce(body),
        Err(TrackerError::InvalidResponse(_))
    ));
}

#[test]
fn min_interval_honored_in_parse() {
    let body = b"d8:intervali1800e12:min intervali60e5:peers0:e";
    let response = parse_announce(body).unwrap();
    assert_eq!(response.min_interval, Some(Duration::from_secs(60)));
}

#[test]
fn event_wire_forms() {
    assert_eq!(TrackerEvent::Empty.as_str(), "");
    assert_eq!(TrackerEvent::Started.as_str(), "started");
    assert_eq!(TrackerEvent::Stopped.as_udp_id(), 3);
    assert_eq!(TrackerEvent::Completed.as_udp_id(), 1);
    assert_eq!(TrackerEvent::Empty.as_udp_id(), 0);
}

#[tokio::test]
async fn udp_router_matches_transaction() {
    let router = super::TrackerRouter::new();
    let addr: std::net::SocketAddr = "127.0.0.1:9999".parse().unwrap();

    // nothing pending: not consumed
    assert!(!router.dispatch(addr, &[0, 0, 0, 1, 0, 0, 0, 42, 9, 9]));
}
