use std::time::{Duration, Instant};

use bytes::Bytes;
use sha1::{Digest, Sha1};

use super::picker::{BlockOutcome, BlockRef, PiecePicker};
use super::resume::ResumeData;
use super::trackers::TrackerTiers;
use super::*;
use crate::meta::{InfoHash, TorrentMeta};
use crate::peer::{Bitfield, ConnId};

fn sha1_of(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn meta_with_pieces(num_pieces: u32, piece_len: u32) -> TorrentMeta {
    let piece = vec![0u8; piece_len as usize];
    TorrentMeta::single_file(
        InfoHash([7; 20]),
        "test",
        piece_len,
        vec![sha1_of(&piece); num_pieces as usize],
        num_pieces as u64 * piece_len as u64,
    )
}

fn block(piece: u32, offset: u32) -> BlockRef {
    BlockRef {
        piece,
        offset,
        length: 16384,
    }
}

// ----------------------------------------------------------------------
// picker
// ----------------------------------------------------------------------

#[test]
fn picker_prefers_rare_pieces() {
    let meta = meta_with_pieces(4, 16384);
    let mut picker = PiecePicker::new(&meta);

    // piece 2 is held by one peer, the rest by three
    let mut common = Bitfield::new(4);
    common.set(0);
    common.set(1);
    common.set(3);
    let mut rare = Bitfield::new(4);
    rare.set(2);
    for _ in 0..3 {
        picker.peer_joined(&common);
    }
    picker.peer_joined(&rare);

    let everything = Bitfield::full(4);
    let picked = picker.pick(&everything, 1, ConnId(1));
    assert_eq!(picked.len(), 1);
    assert_eq!(picked[0].piece, 2, "rarest piece picked first");
}

#[test]
fn picker_respects_peer_bitfield_and_priority() {
    let meta = meta_with_pieces(3, 16384);
    let mut picker = PiecePicker::new(&meta);
    picker.set_priority(1, 0); // skip piece 1

    let mut peer_has = Bitfield::new(3);
    peer_has.set(1);
    assert!(!picker.is_interesting(&peer_has));
    assert!(picker.pick(&peer_has, 4, ConnId(1)).is_empty());

    peer_has.set(2);
    assert!(picker.is_interesting(&peer_has));
    let picked = picker.pick(&peer_has, 4, ConnId(1));
    assert_eq!(picked, vec![block(2, 0)]);
}

#[test]
fn picker_accepts_each_block_at_most_once() {
    let meta = meta_with_pieces(1, 32768);
    let mut picker = PiecePicker::new(&meta);
    let everything = Bitfield::full(1);
    picker.pick(&everything, 2, ConnId(1));

    let data = Bytes::from(vec![0u8; 16384]);
    match picker.on_block(block(0, 0), data.clone(), ConnId(1)) {
        BlockOutcome::Accepted { piece_complete, .. } => assert!(piece_complete.is_none()),
        other => panic!("unexpected {:?}", other),
    }
    // the same block again, from another peer: discarded
    assert!(matches!(
        picker.on_block(block(0, 0), data.clone(), ConnId(2)),
        BlockOutcome::Duplicate
    ));
    // completing the second block assembles the piece
    match picker.on_block(block(0, 16384), data, ConnId(1)) {
        BlockOutcome::Accepted {
            piece_complete: Some(assembled),
            ..
        } => assert_eq!(assembled.len(), 32768),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn picker_rejects_misaligned_blocks() {
    let meta = meta_with_pieces(1, 32768);
    let mut picker = PiecePicker::new(&meta);
    let odd = BlockRef {
        piece: 0,
        offset: 100,
        length: 16384,
    };
    assert!(matches!(
        picker.on_block(odd, Bytes::from(vec![0u8; 16384]), ConnId(1)),
        BlockOutcome::Unknown
    ));
}

#[test]
fn endgame_duplicates_and_cancel_set() {
    let meta = meta_with_pieces(1, 16384);
    let mut picker = PiecePicker::new(&meta);
    let everything = Bitfield::full(1);

    // peer 1 requests the only block; the picker is now in end-game
    let picked = picker.pick(&everything, 4, ConnId(1));
    assert_eq!(picked.len(), 1);

    // peer 2 gets a duplicate of the in-flight block
    let dup = picker.pick(&everything, 4, ConnId(2));
    assert_eq!(dup, picked);
    assert!(picker.in_endgame());

    // peer 2 never gets the same block twice
    assert!(picker.pick(&everything, 4, ConnId(2)).is_empty());

    // first completion names the other holder for cancelling
    match picker.on_block(picked[0], Bytes::from(vec![0u8; 16384]), ConnId(1)) {
        BlockOutcome::Accepted { duplicates, .. } => assert_eq!(duplicates, vec![ConnId(2)]),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn picker_requeues_lost_requests() {
    let meta = meta_with_pieces(1, 16384);
    let mut picker = PiecePicker::new(&meta);
    let everything = Bitfield::full(1);

    let picked = picker.pick(&everything, 1, ConnId(1));
    assert_eq!(picked.len(), 1);
    // while requested, nobody else gets it (not yet end-game checked
    // for the same conn)
    picker.request_lost(picked[0], ConnId(1));
    let again = picker.pick(&everything, 1, ConnId(3));
    assert_eq!(again, picked);
}

#[test]
fn connection_lost_releases_all_claims() {
    let meta = meta_with_pieces(2, 16384);
    let mut picker = PiecePicker::new(&meta);
    let everything = Bitfield::full(2);
    let picked = picker.pick(&everything, 2, ConnId(1));
    assert_eq!(picked.len(), 2);

    picker.connection_lost(ConnId(1));
    let again = picker.pick(&everything, 2, ConnId(2));
    assert_eq!(again.len(), 2);
}

// ----------------------------------------------------------------------
// torrent block flow
// ----------------------------------------------------------------------

#[test]
fn verified_piece_completes_torrent() {
    let meta = meta_with_pieces(1, 16384);
    let hash = meta.info_hash;
    let mut torrent = Torrent::new(hash, Some(meta), 50);
    if let Some(picker) = &mut torrent.picker {
        picker.pick(&Bitfield::full(1), 1, ConnId(1));
    }

    let data = Bytes::from(vec![0u8; 16384]);
    match torrent.on_block(block(0, 0), data, ConnId(1)) {
        BlockResult::PieceComplete {
            piece,
            torrent_finished,
            ..
        } => {
            assert_eq!(piece, 0);
            assert!(torrent_finished);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(torrent.state, TorrentState::Seeding);
}

#[test]
fn corrupt_piece_fails_hash_and_is_repicked() {
    let meta = meta_with_pieces(1, 16384);
    let hash = meta.info_hash;
    let mut torrent = Torrent::new(hash, Some(meta), 50);
    if let Some(picker) = &mut torrent.picker {
        picker.pick(&Bitfield::full(1), 1, ConnId(1));
    }

    let bad = Bytes::from(vec![1u8; 16384]);
    match torrent.on_block(block(0, 0), bad, ConnId(1)) {
        BlockResult::HashFailed { piece } => assert_eq!(piece, 0),
        other => panic!("unexpected {:?}", other),
    }
    // the piece is pickable again
    let picked = torrent
        .picker
        .as_mut()
        .unwrap()
        .pick(&Bitfield::full(1), 1, ConnId(2));
    assert_eq!(picked.len(), 1);
}

#[tokio::test]
async fn graceful_pause_cancels_requests_keeps_peers() {
    use crate::classes::SocketKind;
    use crate::peer::PeerConnection;

    let meta = meta_with_pieces(2, 16384);
    let hash = meta.info_hash;
    let mut torrent = Torrent::new(hash, Some(meta), 50);

    let now = Instant::now();
    let (pump, _cmd) = crate::peer::test_pump();
    let mut conn = PeerConnection::new(
        ConnId(1),
        "10.0.0.1:6881".parse().unwrap(),
        SocketKind::Tcp,
        true,
        Some(hash),
        Vec::new(),
        250,
        64,
        500,
        pump,
        now,
    );
    conn.on_handshake(
        &crate::peer::Handshake::new(hash.0, [5; 20]),
        Some(hash),
        now,
    )
    .unwrap();
    conn.peer_choking = false;
    conn.am_interested = true;

    // put a request in flight through the picker
    let picked = torrent
        .picker
        .as_mut()
        .unwrap()
        .pick(&Bitfield::full(2), 1, ConnId(1));
    conn.push_request(picked[0], now);
    torrent.peers.insert(ConnId(1), conn);

    torrent.pause(true, now);

    let peer = torrent.peers.get(&ConnId(1)).unwrap();
    assert!(peer.requests.is_empty(), "outstanding requests cancelled");
    assert!(peer.is_active(), "peer stays connected");
    assert!(torrent.paused && torrent.graceful_pause);
    // the block went back to the picker
    let again = torrent
        .picker
        .as_mut()
        .unwrap()
        .pick(&Bitfield::full(2), 2, ConnId(2));
    assert_eq!(again.len(), 2);
}

// ----------------------------------------------------------------------
// tracker tiers
// ----------------------------------------------------------------------

#[test]
fn tiers_walk_in_order_and_promote_responders() {
    let now = Instant::now();
    let mut tiers = TrackerTiers::from_urls([
        ("http://a/announce".to_string(), 0),
        ("http://b/announce".to_string(), 0),
        ("http://c/announce".to_string(), 1),
    ]);

    assert_eq!(tiers.next_due(now).unwrap().url, "http://a/announce");

    // b answers: it moves to the front of tier 0
    tiers.on_announce_ok("http://b/announce", Duration::from_secs(1800), None, now);
    assert_eq!(tiers.entries()[0].url, "http://b/announce");
    // and is not due again until its interval passes
    assert_eq!(tiers.next_due(now).unwrap().url, "http://a/announce");
    assert_eq!(
        tiers
            .next_due(now + Duration::from_secs(1801))
            .unwrap()
            .url,
        "http://b/announce"
    );
}

#[test]
fn tier_backoff_grows_exponentially() {
    let now = Instant::now();
    let mut tiers = TrackerTiers::from_urls([("http://a/announce".to_string(), 0)]);

    tiers.on_announce_failed("http://a/announce", now);
    assert!(tiers.next_due(now).is_none());
    assert!(tiers.next_due(now + Duration::from_secs(61)).is_some());

    tiers.on_announce_failed("http://a/announce", now);
    // two failures: 120s backoff
    assert!(tiers.next_due(now + Duration::from_secs(61)).is_none());
    assert!(tiers.next_due(now + Duration::from_secs(121)).is_some());
}

#[test]
fn min_interval_is_honored() {
    let now = Instant::now();
    let mut tiers = TrackerTiers::from_urls([("http://a/announce".to_string(), 0)]);
    tiers.on_announce_ok(
        "http://a/announce",
        Duration::from_secs(10),
        Some(Duration::from_secs(300)),
        now,
    );
    assert!(tiers.next_due(now + Duration::from_secs(60)).is_none());
    assert!(tiers.next_due(now + Duration::from_secs(301)).is_some());
}

// ----------------------------------------------------------------------
// resume data
// ----------------------------------------------------------------------

#[test]
fn resume_data_round_trip() {
    let resume = ResumeData {
        info_hash: InfoHash([7; 20]),
        pieces: Bytes::from_static(&[0b1010_0000]),
        trackers: vec![("http://a/announce".to_string(), 0)],
        save_path: "/downloads/test".to_string(),
        peers: vec!["10.0.0.1:6881".parse().unwrap()],
        piece_priority: vec![4, 4, 0],
        file_priority: vec![4],
        allocation: "sparse".to_string(),
        blocks_per_piece: 16,
    };
    let encoded = resume.encode();
    let decoded = ResumeData::decode(&encoded).unwrap();
    assert_eq!(decoded, resume);
}

#[test]
fn resume_rejects_other_formats() {
    assert!(ResumeData::decode(b"d3:foo3:bare").is_err());
    assert!(ResumeData::decode(b"garbage").is_err());
}

// ----------------------------------------------------------------------
// ranking and activity
// ----------------------------------------------------------------------

#[test]
fn fresh_seeds_rank_above_served_ones() {
    let meta = meta_with_pieces(1, 16384);
    let mut fresh = Torrent::new(InfoHash([1; 20]), Some(meta.clone()), 50);
    fresh.seeding_since = Some(100);
    let mut served = Torrent::new(InfoHash([2; 20]), Some(meta), 50);
    served.seeding_since = Some(0);
    served.total_downloaded = 1000;
    served.total_uploaded = 5000;

    let session_time = 200;
    assert!(fresh.seed_rank(session_time) > served.seed_rank(session_time));
}

#[test]
fn activity_classification() {
    let meta = meta_with_pieces(1, 16384);
    let mut torrent = Torrent::new(InfoHash([1; 20]), Some(meta), 50);
    torrent.started_at = 100;

    // within grace, no payload: starting
    assert_eq!(torrent.activity(130, 60), Activity::Starting);
    // grace expired, no payload: inactive
    assert_eq!(torrent.activity(161, 60), Activity::Inactive);
    // payload seen: active
    torrent.payload_since_start = 1;
    assert_eq!(torrent.activity(161, 60), Activity::Active);
}

#[test]
fn unload_keeps_identity_drops_metadata() {
    let meta = meta_with_pieces(4, 16384);
    let hash = meta.info_hash;
    let mut torrent = Torrent::new(hash, Some(meta.clone()), 50);
    torrent.trackers.add("http://a/announce".to_string(), 0);
    torrent.queue_pos = 3;

    torrent.unload();
    assert!(!torrent.is_loaded());
    assert!(torrent.picker.is_none());
    assert_eq!(torrent.queue_pos, 3);
    assert!(!torrent.trackers.is_empty());

    // reload with the verified bitfield restored
    let mut have = Bitfield::new(4);
    have.set(0);
    torrent.load(meta, Some(&have));
    assert!(torrent.is_loaded());
    assert_eq!(torrent.picker.as_ref().unwrap().num_have(), 1);
}
