use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::connection::{Incoming, PeerConnection, PeerState, TickAction};
use super::*;
use crate::classes::SocketKind;
use crate::constants::{INITIAL_REQUEST_WINDOW, KEEPALIVE_INTERVAL};
use crate::meta::InfoHash;
use crate::torrent::picker::BlockRef;

#[test]
fn handshake_round_trip() {
    let hs = Handshake::new([1; 20], [2; 20]);
    let encoded = hs.encode();
    assert_eq!(encoded.len(), 68);

    let decoded = Handshake::decode(&encoded).unwrap();
    assert_eq!(decoded, hs);
    assert!(decoded.supports_extensions());
    assert!(decoded.supports_fast());
    assert!(decoded.supports_dht());
}

#[test]
fn handshake_rejects_garbage() {
    assert!(Handshake::decode(&[0u8; 68]).is_err());
    assert!(Handshake::decode(&[0u8; 67]).is_err());
    let mut wrong_pstr = Handshake::new([1; 20], [2; 20]).encode().to_vec();
    wrong_pstr[1] = b'X';
    assert!(Handshake::decode(&wrong_pstr).is_err());
}

#[test]
fn message_codec_round_trip() {
    let messages = vec![
        Message::KeepAlive,
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have { piece: 42 },
        Message::Bitfield(Bytes::from_static(&[0xf0])),
        Message::Request {
            index: 1,
            begin: 16384,
            length: 16384,
        },
        Message::Piece {
            index: 1,
            begin: 0,
            data: Bytes::from_static(b"data"),
        },
        Message::Cancel {
            index: 1,
            begin: 0,
            length: 16384,
        },
        Message::DhtPort(6881),
        Message::Suggest { piece: 7 },
        Message::HaveAll,
        Message::HaveNone,
        Message::Reject {
            index: 2,
            begin: 0,
            length: 16384,
        },
        Message::AllowedFast { piece: 3 },
        Message::Extended {
            id: 0,
            payload: Bytes::from_static(b"de"),
        },
    ];
    for msg in messages {
        let encoded = msg.encode();
        let frame = encoded.slice(4..);
        assert_eq!(Message::decode(frame).unwrap(), msg, "{:?}", msg);
    }
}

#[test]
fn message_decode_rejects_wrong_lengths() {
    // have must carry exactly 4 payload bytes
    let frame = Bytes::from_static(&[4, 0, 0]);
    assert!(Message::decode(frame).is_err());
    // unknown message id
    let frame = Bytes::from_static(&[99]);
    assert!(matches!(
        Message::decode(frame),
        Err(PeerError::UnknownMessageId(99))
    ));
    // choke with a payload
    let frame = Bytes::from_static(&[0, 1]);
    assert!(Message::decode(frame).is_err());
}

#[test]
fn bitfield_wire_round_trip() {
    let mut bf = Bitfield::new(10);
    bf.set(0);
    bf.set(9);
    let wire = bf.to_wire();
    let back = Bitfield::from_wire(&wire, 10).unwrap();
    assert_eq!(back, bf);
    assert_eq!(back.count(), 2);

    // wrong length
    assert!(Bitfield::from_wire(&wire, 20).is_none());
    // spare bits set
    let dirty = Bytes::from_static(&[0xff, 0xff]);
    assert!(Bitfield::from_wire(&dirty, 10).is_none());
}

#[test]
fn peer_id_fingerprint() {
    let id = PeerId::generate();
    assert_eq!(id.fingerprint(), Some("EB0001"));
    let other = PeerId::generate();
    assert_ne!(id.0, other.0);
}

#[test]
fn extension_handshake_round_trip() {
    let mut hs = ExtensionHandshake::ours(6881, "10.0.0.9".parse().unwrap(), 250);
    hs.extensions.insert("ut_metadata".to_string(), 3);

    let encoded = hs.encode();
    let decoded = ExtensionHandshake::decode(&encoded).unwrap();
    assert_eq!(decoded.port, Some(6881));
    assert_eq!(decoded.reqq, Some(250));
    assert_eq!(decoded.extension_id("ut_metadata"), Some(3));
    assert_eq!(decoded.extension_id("ut_pex"), None);
    assert_eq!(
        decoded.yourip,
        Some("10.0.0.9".parse::<std::net::IpAddr>().unwrap())
    );
}

// ----------------------------------------------------------------------
// connection state machine
// ----------------------------------------------------------------------

fn test_conn(outgoing: bool) -> PeerConnection {
    let addr: SocketAddr = "10.1.1.1:6881".parse().unwrap();
    let (pump, _cmd_rx) = super::test_pump();
    PeerConnection::new(
        ConnId(1),
        addr,
        SocketKind::Tcp,
        outgoing,
        outgoing.then_some(InfoHash([9; 20])),
        Vec::new(),
        250,
        64,
        500,
        pump,
        Instant::now(),
    )
}

fn block(piece: u32, offset: u32) -> BlockRef {
    BlockRef {
        piece,
        offset,
        length: 16384,
    }
}

#[tokio::test]
async fn handshake_transitions_to_active() {
    let mut conn = test_conn(true);
    assert_eq!(conn.state, PeerState::Connecting);
    conn.on_transport_connected(Instant::now());
    assert_eq!(conn.state, PeerState::Handshaking);

    let hs = Handshake::new([9; 20], [7; 20]);
    conn.on_handshake(&hs, Some(InfoHash([9; 20])), Instant::now())
        .unwrap();
    assert_eq!(conn.state, PeerState::Active);
    assert!(conn.peer_id.is_some());
}

#[tokio::test]
async fn handshake_info_hash_mismatch_is_protocol_violation() {
    let mut conn = test_conn(true);
    conn.on_transport_connected(Instant::now());
    let hs = Handshake::new([8; 20], [7; 20]);
    let err = conn
        .on_handshake(&hs, Some(InfoHash([9; 20])), Instant::now())
        .unwrap_err();
    assert!(err.is_protocol_violation());
}

#[tokio::test]
async fn choke_from_peer_drops_requests() {
    let mut conn = test_conn(true);
    let now = Instant::now();
    conn.on_handshake(&Handshake::new([9; 20], [7; 20]), Some(InfoHash([9; 20])), now)
        .unwrap();
    conn.peer_choking = false;
    conn.am_interested = true;
    conn.push_request(block(0, 0), now);
    conn.push_request(block(0, 16384), now);
    assert_eq!(conn.requests.len(), 2);

    // no fast extension in this handshake state: requests are lost
    conn.supports_fast = false;
    match conn.handle_message(Message::Choke, now).unwrap() {
        Incoming::ChokedUs { lost } => assert_eq!(lost.len(), 2),
        other => panic!("unexpected {:?}", other),
    }
    assert!(conn.requests.is_empty());
    assert!(conn.peer_choking);
}

#[tokio::test]
async fn request_window_grows_per_block_and_halves_on_timeout() {
    let mut conn = test_conn(true);
    let now = Instant::now();
    conn.on_handshake(&Handshake::new([9; 20], [7; 20]), Some(InfoHash([9; 20])), now)
        .unwrap();
    conn.peer_choking = false;
    conn.am_interested = true;

    let initial = conn.request_slots();
    assert_eq!(initial, INITIAL_REQUEST_WINDOW);

    // deliver a requested block: window grows additively
    conn.push_request(block(0, 0), now);
    let msg = Message::Piece {
        index: 0,
        begin: 0,
        data: Bytes::from(vec![0u8; 16384]),
    };
    match conn.handle_message(msg, now).unwrap() {
        Incoming::Block { .. } => {}
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(conn.request_slots(), INITIAL_REQUEST_WINDOW + 1);

    // a timed-out request halves the window (floor at the initial)
    conn.push_request(block(1, 0), now);
    let lost = conn.sweep_request_timeouts(now + Duration::from_secs(120));
    assert_eq!(lost, vec![block(1, 0)]);
    assert!(conn.snubbed);
    assert_eq!(conn.request_slots(), INITIAL_REQUEST_WINDOW);
}

#[tokio::test]
async fn unsolicited_block_is_ignored() {
    let mut conn = test_conn(true);
    let now = Instant::now();
    conn.on_handshake(&Handshake::new([9; 20], [7; 20]), Some(InfoHash([9; 20])), now)
        .unwrap();
    let msg = Message::Piece {
        index: 5,
        begin: 0,
        data: Bytes::from(vec![0u8; 16384]),
    };
    match conn.handle_message(msg, now).unwrap() {
        Incoming::None => {}
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(conn.stats.downloaded, 0);
}

#[tokio::test]
async fn excessive_requests_disconnect() {
    let mut conn = test_conn(false);
    let now = Instant::now();
    conn.on_handshake(&Handshake::new([9; 20], [7; 20]), Some(InfoHash([9; 20])), now)
        .unwrap();
    conn.am_choking = false;

    let mut last = None;
    for i in 0..=64u32 {
        last = Some(conn.handle_message(
            Message::Request {
                index: 0,
                begin: i * 16384,
                length: 16384,
            },
            now,
        ));
    }
    match last.unwrap() {
        Err(PeerError::ExcessiveRequests) => {}
        other => panic!("unexpected {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn requests_while_choked_are_ignored() {
    let mut conn = test_conn(false);
    let now = Instant::now();
    conn.on_handshake(&Handshake::new([9; 20], [7; 20]), Some(InfoHash([9; 20])), now)
        .unwrap();
    assert!(conn.am_choking);
    let outcome = conn
        .handle_message(
            Message::Request {
                index: 0,
                begin: 0,
                length: 16384,
            },
            now,
        )
        .unwrap();
    assert!(matches!(outcome, Incoming::None));
    assert!(conn.upload_queue.is_empty());
}

#[tokio::test]
async fn choking_a_peer_clears_its_upload_queue() {
    let mut conn = test_conn(false);
    let now = Instant::now();
    conn.on_handshake(&Handshake::new([9; 20], [7; 20]), Some(InfoHash([9; 20])), now)
        .unwrap();
    conn.am_choking = false;
    conn.handle_message(
        Message::Request {
            index: 0,
            begin: 0,
            length: 16384,
        },
        now,
    )
    .unwrap();
    assert_eq!(conn.upload_queue.len(), 1);

    assert!(conn.choke(now));
    assert!(conn.upload_queue.is_empty());
    // idempotent
    assert!(!conn.choke(now));
}

#[tokio::test]
async fn keepalive_and_inactivity_timers() {
    let mut conn = test_conn(true);
    let now = Instant::now();
    conn.on_handshake(&Handshake::new([9; 20], [7; 20]), Some(InfoHash([9; 20])), now)
        .unwrap();

    assert_eq!(conn.tick(now), TickAction::None);
    assert_eq!(
        conn.tick(now + KEEPALIVE_INTERVAL + Duration::from_secs(1)),
        TickAction::SendKeepAlive
    );
    assert_eq!(
        conn.tick(now + Duration::from_secs(600)),
        TickAction::Timeout
    );
}

#[tokio::test]
async fn disconnect_is_idempotent_and_terminal() {
    let mut conn = test_conn(true);
    conn.start_disconnect(PeerError::Timeout, DisconnectOp::Tick);
    assert!(conn.is_disconnecting());
    let first = conn.disconnect_reason.as_ref().map(|(e, _)| e.to_string());

    conn.start_disconnect(PeerError::ConnectionClosed, DisconnectOp::Read);
    let second = conn.disconnect_reason.as_ref().map(|(e, _)| e.to_string());
    assert_eq!(first, second);
}

#[tokio::test]
async fn fast_messages_require_fast_extension() {
    let mut conn = test_conn(true);
    let now = Instant::now();
    let mut hs = Handshake::new([9; 20], [7; 20]);
    hs.reserved = [0; 8]; // peer advertises nothing
    conn.on_handshake(&hs, Some(InfoHash([9; 20])), now).unwrap();
    assert!(!conn.supports_fast);

    assert!(conn.handle_message(Message::HaveAll, now).is_err());
}

// ----------------------------------------------------------------------
// transport over real sockets (P1 at the wire level)
// ----------------------------------------------------------------------

#[tokio::test]
async fn pump_exchanges_handshakes_over_tcp() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let ours = Handshake::new([3; 20], [4; 20]);
    let theirs = Handshake::new([3; 20], [5; 20]);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let _handle = spawn_outgoing(
        ConnId(1),
        addr,
        ours.encode(),
        PumpLimits::default(),
        events_tx,
        None,
    );

    // the "remote" peer accepts, reads 68 bytes, replies
    let (mut remote, _) = listener.accept().await.unwrap();
    let mut buf = [0u8; 68];
    remote.read_exact(&mut buf).await.unwrap();
    assert_eq!(Handshake::decode(&buf).unwrap(), ours);
    remote.write_all(&theirs.encode()).await.unwrap();

    // pump reports Connected then the remote handshake
    let (_, first) = events_rx.recv().await.unwrap();
    assert!(matches!(first, PumpEvent::Connected));
    let (_, second) = events_rx.recv().await.unwrap();
    match second {
        PumpEvent::Handshake(hs) => assert_eq!(hs, theirs),
        other => panic!("unexpected {:?}", other),
    }
}
