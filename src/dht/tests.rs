use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::message::{KrpcMessage, Query, Reply};
use super::node::{encode_compact_nodes, parse_compact_nodes, NodeId, NodeInfo};
use super::rpc::{IncomingOutcome, ObserverKind, RpcManager, TimeoutEvent};
use super::traversal::TraversalId;
use super::*;
use crate::constants::{DHT_HARD_TIMEOUT, DHT_SHORT_TIMEOUT};
use crate::meta::InfoHash;

fn addr(n: u8) -> SocketAddr {
    format!("10.0.0.{}:6881", n).parse().unwrap()
}

fn reply_to(packet: &[u8], from_id: NodeId) -> KrpcMessage {
    let msg = KrpcMessage::decode(packet).unwrap();
    KrpcMessage::Reply {
        tid: msg.tid().clone(),
        reply: Reply {
            id: Some(from_id),
            ..Reply::default()
        },
    }
}

// ----------------------------------------------------------------------
// KRPC codec
// ----------------------------------------------------------------------

#[test]
fn krpc_query_round_trip() {
    let query = KrpcMessage::Query {
        tid: Bytes::from_static(&[0x00, 0x2a]),
        id: NodeId([3; 20]),
        query: Query::GetPeers {
            info_hash: InfoHash([9; 20]),
        },
    };
    let encoded = query.encode();
    assert_eq!(KrpcMessage::decode(&encoded).unwrap(), query);
}

#[test]
fn krpc_announce_round_trip() {
    let query = KrpcMessage::Query {
        tid: Bytes::from_static(&[0x01, 0x02]),
        id: NodeId([3; 20]),
        query: Query::AnnouncePeer {
            info_hash: InfoHash([9; 20]),
            port: 6881,
            implied_port: true,
            token: Bytes::from_static(b"secret"),
        },
    };
    let encoded = query.encode();
    assert_eq!(KrpcMessage::decode(&encoded).unwrap(), query);
}

#[test]
fn krpc_error_round_trip() {
    let error = KrpcMessage::Error {
        tid: Bytes::from_static(&[0x00, 0x01]),
        code: 203,
        message: "invalid transaction id".to_string(),
    };
    let encoded = error.encode();
    assert_eq!(KrpcMessage::decode(&encoded).unwrap(), error);
}

#[test]
fn krpc_rejects_malformed() {
    assert!(KrpcMessage::decode(b"i42e").is_err());
    assert!(KrpcMessage::decode(b"d1:y1:re").is_err()); // no tid
    assert!(KrpcMessage::decode(b"garbage").is_err());
}

#[test]
fn compact_nodes_round_trip() {
    let nodes = vec![
        NodeInfo {
            id: NodeId([1; 20]),
            addr: addr(1),
        },
        NodeInfo {
            id: NodeId([2; 20]),
            addr: addr(2),
        },
    ];
    let encoded = encode_compact_nodes(&nodes);
    assert_eq!(encoded.len(), 52);
    assert_eq!(parse_compact_nodes(&encoded), nodes);
}

// ----------------------------------------------------------------------
// RPC manager
// ----------------------------------------------------------------------

#[test]
fn transaction_ids_are_unique_among_outstanding() {
    let mut rpc = RpcManager::new(NodeId([1; 20]));
    let now = Instant::now();
    for i in 0..64u8 {
        rpc.invoke(
            Query::Ping,
            addr(i),
            ObserverKind::Null,
            TraversalId(0),
            now,
        )
        .unwrap();
    }
    assert_eq!(rpc.num_outstanding(), 64);
    rpc.check_invariants();
}

#[test]
fn reply_matches_by_tid_and_source() {
    let mut rpc = RpcManager::new(NodeId([1; 20]));
    let now = Instant::now();
    let packet = rpc
        .invoke(
            Query::Ping,
            addr(5),
            ObserverKind::Null,
            TraversalId(7),
            now,
        )
        .unwrap();

    let reply = reply_to(&packet, NodeId([5; 20]));
    match rpc.incoming(reply, addr(5)) {
        IncomingOutcome::Matched { observer, reply } => {
            assert_eq!(observer.traversal, TraversalId(7));
            assert_eq!(observer.target, addr(5));
            assert!(observer.is_done());
            assert_eq!(reply.id, Some(NodeId([5; 20])));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(rpc.num_outstanding(), 0);
}

#[test]
fn reply_from_wrong_address_is_dropped() {
    let mut rpc = RpcManager::new(NodeId([1; 20]));
    let now = Instant::now();
    let packet = rpc
        .invoke(
            Query::Ping,
            addr(5),
            ObserverKind::Null,
            TraversalId(0),
            now,
        )
        .unwrap();

    // the tid is valid, but the reply comes from somewhere else
    let reply = reply_to(&packet, NodeId([6; 20]));
    assert!(matches!(
        rpc.incoming(reply, addr(6)),
        IncomingOutcome::Dropped
    ));
    // the observer is still outstanding
    assert_eq!(rpc.num_outstanding(), 1);
}

#[test]
fn unknown_transaction_draws_error_reply() {
    let mut rpc = RpcManager::new(NodeId([1; 20]));
    let bogus = KrpcMessage::Reply {
        tid: Bytes::from_static(&[0x7f, 0x7f]),
        reply: Reply {
            id: Some(NodeId([2; 20])),
            ..Reply::default()
        },
    };
    match rpc.incoming(bogus, addr(9)) {
        IncomingOutcome::UnknownTransaction { error } => {
            match KrpcMessage::decode(&error).unwrap() {
                KrpcMessage::Error { code, message, .. } => {
                    assert_eq!(code, 203);
                    assert_eq!(message, "invalid transaction id");
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn timeout_escalation_short_then_hard() {
    let mut rpc = RpcManager::new(NodeId([1; 20]));
    let start = Instant::now();
    rpc.invoke(
        Query::Ping,
        addr(5),
        ObserverKind::FindData,
        TraversalId(3),
        start,
    )
    .unwrap();

    // before the short timeout: nothing fires
    let (events, _) = rpc.tick(start + Duration::from_secs(1));
    assert!(events.is_empty());

    // at the short timeout: a slow signal, observer stays queued
    let (events, _) = rpc.tick(start + DHT_SHORT_TIMEOUT + Duration::from_millis(1));
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], TimeoutEvent::Short { .. }));
    assert_eq!(rpc.num_outstanding(), 1);

    // the short signal is never repeated
    let (events, _) = rpc.tick(start + Duration::from_secs(10));
    assert!(events.is_empty());

    // at the hard timeout: failure, observer removed, no retries
    let (events, _) = rpc.tick(start + DHT_HARD_TIMEOUT + Duration::from_millis(1));
    assert_eq!(events.len(), 1);
    match &events[0] {
        TimeoutEvent::Hard { observer } => {
            assert_eq!(observer.traversal, TraversalId(3));
            assert!(observer.has_short_timeout());
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(rpc.num_outstanding(), 0);
}

#[test]
fn port_unreachable_times_out_first_matching_observer() {
    let mut rpc = RpcManager::new(NodeId([1; 20]));
    let now = Instant::now();
    rpc.invoke(Query::Ping, addr(5), ObserverKind::Null, TraversalId(1), now)
        .unwrap();
    rpc.invoke(Query::Ping, addr(5), ObserverKind::Null, TraversalId(2), now)
        .unwrap();
    rpc.invoke(Query::Ping, addr(6), ObserverKind::Null, TraversalId(3), now)
        .unwrap();

    let failed = rpc.unreachable(addr(5)).unwrap();
    assert_eq!(failed.traversal, TraversalId(1));
    assert_eq!(rpc.num_outstanding(), 2);

    assert!(rpc.unreachable(addr(99)).is_none());
}

#[test]
fn abort_fails_everything_and_refuses_new_work() {
    let mut rpc = RpcManager::new(NodeId([1; 20]));
    let now = Instant::now();
    rpc.invoke(Query::Ping, addr(1), ObserverKind::Null, TraversalId(1), now)
        .unwrap();
    rpc.invoke(Query::Ping, addr(2), ObserverKind::Null, TraversalId(2), now)
        .unwrap();

    let aborted = rpc.abort();
    assert_eq!(aborted.len(), 2);
    assert_eq!(rpc.num_outstanding(), 0);
    assert!(rpc
        .invoke(Query::Ping, addr(3), ObserverKind::Null, TraversalId(3), now)
        .is_none());
}

// ----------------------------------------------------------------------
// node-level behavior
// ----------------------------------------------------------------------

#[test]
fn node_answers_ping() {
    let now = Instant::now();
    let mut node = DhtNode::new(NodeId([1; 20]), now);
    let ping = KrpcMessage::Query {
        tid: Bytes::from_static(&[0x00, 0x09]),
        id: NodeId([2; 20]),
        query: Query::Ping,
    }
    .encode();

    node.incoming_packet(&ping, addr(2), now);
    let outgoing = node.take_outgoing();
    assert_eq!(outgoing.len(), 1);
    assert_eq!(outgoing[0].1, addr(2));
    match KrpcMessage::decode(&outgoing[0].0).unwrap() {
        KrpcMessage::Reply { tid, reply } => {
            assert_eq!(tid.as_ref(), &[0x00, 0x09]);
            assert_eq!(reply.id, Some(NodeId([1; 20])));
        }
        other => panic!("unexpected {:?}", other),
    }
    // the pinging node landed in the table
    assert_eq!(node.num_nodes(), 1);
}

#[test]
fn announce_needs_valid_token() {
    let now = Instant::now();
    let mut node = DhtNode::new(NodeId([1; 20]), now);

    // get_peers hands out a token
    let get_peers = KrpcMessage::Query {
        tid: Bytes::from_static(&[0x00, 0x01]),
        id: NodeId([2; 20]),
        query: Query::GetPeers {
            info_hash: InfoHash([9; 20]),
        },
    }
    .encode();
    node.incoming_packet(&get_peers, addr(2), now);
    let outgoing = node.take_outgoing();
    let token = match KrpcMessage::decode(&outgoing[0].0).unwrap() {
        KrpcMessage::Reply { reply, .. } => reply.token.unwrap(),
        other => panic!("unexpected {:?}", other),
    };

    // announcing with a wrong token is refused
    let bad = KrpcMessage::Query {
        tid: Bytes::from_static(&[0x00, 0x02]),
        id: NodeId([2; 20]),
        query: Query::AnnouncePeer {
            info_hash: InfoHash([9; 20]),
            port: 7000,
            implied_port: false,
            token: Bytes::from_static(b"wrong"),
        },
    }
    .encode();
    node.incoming_packet(&bad, addr(2), now);
    let outgoing = node.take_outgoing();
    assert!(matches!(
        KrpcMessage::decode(&outgoing[0].0).unwrap(),
        KrpcMessage::Error { code: 203, .. }
    ));

    // with the real token the peer is stored and returned
    let good = KrpcMessage::Query {
        tid: Bytes::from_static(&[0x00, 0x03]),
        id: NodeId([2; 20]),
        query: Query::AnnouncePeer {
            info_hash: InfoHash([9; 20]),
            port: 7000,
            implied_port: false,
            token,
        },
    }
    .encode();
    node.incoming_packet(&good, addr(2), now);
    node.take_outgoing();

    node.incoming_packet(&get_peers, addr(3), now);
    let outgoing = node.take_outgoing();
    match KrpcMessage::decode(&outgoing[0].0).unwrap() {
        KrpcMessage::Reply { reply, .. } => {
            assert_eq!(reply.peers, vec!["10.0.0.2:7000".parse().unwrap()]);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn get_peers_traversal_fans_out_and_finishes() {
    let start = Instant::now();
    let mut node = DhtNode::new(NodeId([1; 20]), start);

    // seed the table via an incoming ping
    let ping = KrpcMessage::Query {
        tid: Bytes::from_static(&[0x00, 0x01]),
        id: NodeId([2; 20]),
        query: Query::Ping,
    }
    .encode();
    node.incoming_packet(&ping, addr(2), start);
    node.take_outgoing();

    node.announce(InfoHash([9; 20]), Some(6881), start);
    let outgoing = node.take_outgoing();
    assert_eq!(outgoing.len(), 1, "one seed node to query");
    let (packet, target) = &outgoing[0];
    assert_eq!(*target, addr(2));

    // the node replies with a peer
    let msg = KrpcMessage::decode(packet).unwrap();
    let reply = KrpcMessage::Reply {
        tid: msg.tid().clone(),
        reply: Reply {
            id: Some(NodeId([2; 20])),
            peers: vec!["10.9.9.9:6881".parse().unwrap()],
            token: Some(Bytes::from_static(b"tok")),
            ..Reply::default()
        },
    }
    .encode();

    let events = node.incoming_packet(&reply, addr(2), start);
    let peers = events
        .iter()
        .find_map(|e| match e {
            DhtEvent::PeersFound { peers, .. } => Some(peers.clone()),
            _ => None,
        })
        .expect("traversal finished with peers");
    assert_eq!(peers, vec!["10.9.9.9:6881".parse().unwrap()]);

    // the finish ran the announce phase against the token holder
    let outgoing = node.take_outgoing();
    assert_eq!(outgoing.len(), 1);
    match KrpcMessage::decode(&outgoing[0].0).unwrap() {
        KrpcMessage::Query {
            query: Query::AnnouncePeer { port, token, .. },
            ..
        } => {
            assert_eq!(port, 6881);
            assert_eq!(token.as_ref(), b"tok");
        }
        other => panic!("unexpected {:?}", other),
    }
}
