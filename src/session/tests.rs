use std::time::Duration;

use bytes::Bytes;
use sha1::{Digest, Sha1};

use super::auto_manage::{recalculate_auto_managed_torrents, AutoManageEntry};
use super::connect::{AttemptOutcome, ConnectPump, PumpContext};
use super::settings::ChokerMode;
use super::state::{load_state, save_state, SavedSettings, SavedState};
use super::unchoke::{
    recalculate_optimistic_unchoke_slots, recalculate_unchoke_slots, UnchokeCandidate,
};
use super::*;
use crate::meta::{InfoHash, TorrentMeta};
use crate::peer::ConnId;
use crate::storage::MemoryDisk;
use crate::torrent::resume::ResumeData;
use crate::torrent::Activity;
use super::alert::Alert;

fn hash(n: u8) -> InfoHash {
    InfoHash([n; 20])
}

fn candidate(conn: u64, interested: bool, choked: bool) -> UnchokeCandidate {
    UnchokeCandidate {
        conn: ConnId(conn),
        interested,
        choked,
        connecting: false,
        disconnecting: false,
        torrent_paused: false,
        ignore_unchoke_slots: false,
        optimistically_unchoked: false,
        last_optimistic_unchoke: 0,
        rank_rate: 0,
        uploaded_in_round: 0,
        est_reciprocation_rate: 0,
    }
}

// ----------------------------------------------------------------------
// unchoke scheduler
// ----------------------------------------------------------------------

#[test]
fn unchoked_count_matches_choking_invariant() {
    // P4: unchoked == min(interested, allowed_upload_slots)
    let mut settings = SessionSettings::default();
    settings.unchoke_slots = 4;
    settings.choker = ChokerMode::FixedSlots;

    let mut candidates: Vec<UnchokeCandidate> =
        (0..5).map(|i| candidate(i, true, true)).collect();
    candidates.push(candidate(99, false, true)); // not interested

    let decisions = recalculate_unchoke_slots(&candidates, &settings, 0, 15_000);
    assert_eq!(decisions.allowed_upload_slots, 4);
    // the regular set leaves room for one optimistic slot
    assert_eq!(decisions.unchoke.len(), 3);

    // apply, then run the optimistic pass over the updated state
    for candidate in &mut candidates {
        if decisions.unchoke.contains(&candidate.conn) {
            candidate.choked = false;
        }
    }
    let optimistic = recalculate_optimistic_unchoke_slots(&candidates, &settings);
    assert_eq!(optimistic.grant.len(), 1);

    let unchoked = candidates.iter().filter(|c| !c.choked).count() + optimistic.grant.len();
    let interested = candidates.iter().filter(|c| c.interested).count();
    assert_eq!(
        unchoked,
        interested.min(decisions.allowed_upload_slots),
        "choking invariant"
    );
}

#[test]
fn uninterested_unchoked_peers_get_choked() {
    let settings = SessionSettings::default();
    let mut lost_interest = candidate(1, false, false);
    lost_interest.optimistically_unchoked = true;
    let decisions = recalculate_unchoke_slots(&[lost_interest], &settings, 0, 15_000);
    assert_eq!(decisions.choke, vec![ConnId(1)]);
    assert_eq!(decisions.clear_optimistic, vec![ConnId(1)]);
}

#[test]
fn rate_based_choker_grows_slots_with_fast_peers() {
    let mut settings = SessionSettings::default();
    settings.choker = ChokerMode::RateBased;

    // two peers uploading well over the 1 KiB/s and 2 KiB/s steps
    let mut fast = candidate(1, true, true);
    fast.uploaded_in_round = 10 * 1024 * 15; // 10 KiB/s over a 15 s round
    let mut faster = candidate(2, true, true);
    faster.uploaded_in_round = 20 * 1024 * 15;
    let slow = candidate(3, true, true);

    let decisions =
        recalculate_unchoke_slots(&[fast, faster, slow], &settings, 0, 15_000);
    // two rate-qualified slots plus the reserved optimistic one
    assert_eq!(decisions.allowed_upload_slots, 3);
}

#[test]
fn bittyrant_fills_capacity_budget() {
    let mut settings = SessionSettings::default();
    settings.choker = ChokerMode::Bittyrant;

    let mut cheap = candidate(1, true, true);
    cheap.est_reciprocation_rate = 5_000;
    cheap.rank_rate = 50_000;
    let mut pricey = candidate(2, true, true);
    pricey.est_reciprocation_rate = 18_000;
    pricey.rank_rate = 1_000;

    // 20 kB/s budget: the cheap reciprocator fits, the pricey one not
    let decisions = recalculate_unchoke_slots(&[cheap, pricey], &settings, 20_000, 15_000);
    assert_eq!(decisions.unchoke, vec![ConnId(1)]);
}

#[test]
fn optimistic_slot_rotates_fairly() {
    // S2: 4 interested peers, 2 slots, 1 optimistic, three rotations
    // reach at least 3 distinct peers
    let mut settings = SessionSettings::default();
    settings.unchoke_slots = 2;
    settings.optimistic_unchoke_slots = 1;

    struct Sim {
        optimistic: bool,
        last: u64,
    }
    let mut sims: Vec<Sim> = (0..4)
        .map(|_| Sim {
            optimistic: false,
            last: 0,
        })
        .collect();
    let mut holders = std::collections::HashSet::new();

    for round in 1..=3u64 {
        let session_time = round * 30;
        let candidates: Vec<UnchokeCandidate> = sims
            .iter()
            .enumerate()
            .map(|(i, sim)| {
                let mut c = candidate(i as u64, true, !sim.optimistic);
                c.optimistically_unchoked = sim.optimistic;
                c.last_optimistic_unchoke = sim.last;
                c
            })
            .collect();
        let decisions = recalculate_optimistic_unchoke_slots(&candidates, &settings);
        for conn in &decisions.revoke {
            sims[conn.0 as usize].optimistic = false;
        }
        for conn in &decisions.grant {
            sims[conn.0 as usize].optimistic = true;
            sims[conn.0 as usize].last = session_time;
            holders.insert(conn.0);
        }
        assert_eq!(sims.iter().filter(|s| s.optimistic).count(), 1);
    }

    assert!(holders.len() >= 3, "optimistic slot rotated: {:?}", holders);
}

// ----------------------------------------------------------------------
// auto-manage
// ----------------------------------------------------------------------

fn auto_entry(n: u8, queue_pos: i64, finished: bool) -> AutoManageEntry {
    AutoManageEntry {
        hash: hash(n),
        auto_managed: true,
        paused: true,
        checking: false,
        finished,
        has_error: false,
        queue_pos,
        seed_rank: 0,
        activity: Activity::Starting,
    }
}

#[test]
fn auto_manage_grants_by_queue_position() {
    let mut settings = SessionSettings::default();
    settings.active_downloads = 2;
    settings.active_limit = 10;

    let entries = vec![
        auto_entry(3, 2, false),
        auto_entry(1, 0, false),
        auto_entry(2, 1, false),
    ];
    let decisions = recalculate_auto_managed_torrents(&entries, &settings);
    assert_eq!(decisions.resume, vec![hash(1), hash(2)]);
    assert_eq!(decisions.pause, vec![hash(3)]);
}

#[test]
fn auto_manage_respects_hard_limit_across_categories() {
    let mut settings = SessionSettings::default();
    settings.active_downloads = 5;
    settings.active_seeds = 5;
    settings.active_limit = 2;

    let entries = vec![
        auto_entry(1, 0, false),
        auto_entry(2, 1, false),
        auto_entry(3, -1, true),
    ];
    let decisions = recalculate_auto_managed_torrents(&entries, &settings);
    assert_eq!(decisions.resume.len(), 2, "hard limit caps activity");
    assert!(decisions.pause.contains(&hash(3)));
}

#[test]
fn auto_manage_announce_limits_walk_down() {
    let mut settings = SessionSettings::default();
    settings.active_dht_limit = 1;
    settings.active_tracker_limit = 2;
    settings.active_lsd_limit = 0;

    let entries = vec![auto_entry(1, 0, false), auto_entry(2, 1, false)];
    let decisions = recalculate_auto_managed_torrents(&entries, &settings);
    assert_eq!(
        decisions.announce,
        vec![
            (hash(1), true, true, false),
            (hash(2), false, true, false),
        ]
    );
}

#[test]
fn manual_torrents_consume_the_hard_limit() {
    let mut settings = SessionSettings::default();
    settings.active_downloads = 5;
    settings.active_limit = 1;

    let manual = AutoManageEntry {
        auto_managed: false,
        paused: false,
        ..auto_entry(9, -1, false)
    };
    let entries = vec![manual, auto_entry(1, 0, false)];
    let decisions = recalculate_auto_managed_torrents(&entries, &settings);
    // the manual torrent used the only hard slot
    assert_eq!(decisions.pause, vec![hash(1)]);
}

// ----------------------------------------------------------------------
// connection pump
// ----------------------------------------------------------------------

#[test]
fn pump_respects_budget_and_gate() {
    // P7: attempts bounded by speed, free slots and the global limit
    let mut pump = ConnectPump::new();
    let want = vec![hash(1), hash(2), hash(3)];
    let ctx = PumpContext {
        want_download: &want,
        want_finished: &[],
        connection_speed: 10,
        connections_limit: 100,
        num_connections: 0,
        free_slots: 2,
        connect_seed_every_n: 10,
    };
    let outcome = pump.run(&ctx, |_| AttemptOutcome::Connected);
    assert_eq!(outcome.attempts, 2, "half-open gate caps attempts");

    let ctx = PumpContext {
        want_download: &want,
        want_finished: &[],
        connection_speed: 3,
        connections_limit: 100,
        num_connections: 0,
        free_slots: 50,
        connect_seed_every_n: 10,
    };
    let outcome = pump.run(&ctx, |_| AttemptOutcome::Connected);
    assert_eq!(outcome.attempts, 3, "connection speed caps attempts");

    let ctx = PumpContext {
        want_download: &want,
        want_finished: &[],
        connection_speed: 10,
        connections_limit: 4,
        num_connections: 3,
        free_slots: 50,
        connect_seed_every_n: 10,
    };
    let outcome = pump.run(&ctx, |_| AttemptOutcome::Connected);
    assert_eq!(outcome.attempts, 1, "global limit caps attempts");
}

#[test]
fn pump_round_robins_across_torrents() {
    let mut pump = ConnectPump::new();
    let want = vec![hash(1), hash(2)];
    let ctx = PumpContext {
        want_download: &want,
        want_finished: &[],
        connection_speed: 4,
        connections_limit: 100,
        num_connections: 0,
        free_slots: 50,
        connect_seed_every_n: 10,
    };
    let mut attempts = Vec::new();
    pump.run(&ctx, |h| {
        attempts.push(h);
        AttemptOutcome::Connected
    });
    assert_eq!(attempts, vec![hash(1), hash(2), hash(1), hash(2)]);
}

#[test]
fn pump_prioritizes_boosted_torrents() {
    let mut pump = ConnectPump::new();
    pump.prioritize(hash(9), 2);
    let want = vec![hash(1)];
    let ctx = PumpContext {
        want_download: &want,
        want_finished: &[],
        connection_speed: 3,
        connections_limit: 100,
        num_connections: 0,
        free_slots: 50,
        connect_seed_every_n: 10,
    };
    let mut attempts = Vec::new();
    pump.run(&ctx, |h| {
        attempts.push(h);
        AttemptOutcome::Connected
    });
    assert_eq!(attempts, vec![hash(9), hash(9), hash(1)]);
}

#[test]
fn pump_stops_after_a_dry_lap_and_reports_exhaustion() {
    let mut pump = ConnectPump::new();
    let want = vec![hash(1), hash(2)];
    let ctx = PumpContext {
        want_download: &want,
        want_finished: &[],
        connection_speed: 100,
        connections_limit: 100,
        num_connections: 0,
        free_slots: 50,
        connect_seed_every_n: 10,
    };
    let mut calls = 0;
    let outcome = pump.run(&ctx, |_| {
        calls += 1;
        AttemptOutcome::NoCandidate
    });
    assert_eq!(outcome.attempts, 0);
    assert!(calls <= 5, "a dry lap terminates the pump");

    let outcome = pump.run(&ctx, |_| AttemptOutcome::OutOfResources);
    assert!(outcome.clamp_connections_limit);
}

// ----------------------------------------------------------------------
// persisted state
// ----------------------------------------------------------------------

#[test]
fn session_state_round_trip_ignores_unknown_sections() {
    let mut settings = SessionSettings::default();
    settings.connections_limit = 77;
    settings.active_downloads = 9;

    let state = SavedState {
        settings: Some(SavedSettings::from_settings(&settings)),
        dht_state: None,
        tracker_key: Some(0xdead_beef),
    };
    let encoded = save_state(&state);
    let decoded = load_state(&encoded).unwrap();
    assert_eq!(decoded.settings, state.settings);
    assert_eq!(decoded.tracker_key, Some(0xdead_beef));

    // unknown sections and keys are ignored
    let with_extras =
        b"d10:extensionsli1ee3:keyi7e5:proxyd4:host9:localhoste8:settingsd17:connections_limiti50eee";
    let decoded = load_state(with_extras).unwrap();
    assert_eq!(decoded.tracker_key, Some(7));
    assert_eq!(decoded.settings.unwrap().connections_limit, 50);
}

// ----------------------------------------------------------------------
// listen-port bind retry (P8)
// ----------------------------------------------------------------------

#[tokio::test]
async fn bind_retry_increments_past_occupied_ports() {
    use super::alert::AlertQueue;
    use super::listen::open_listen_sockets;
    use tokio::sync::mpsc;

    // occupy a port
    let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken = blocker.local_addr().unwrap().port();

    let mut settings = SessionSettings::default();
    settings.listen_interfaces = vec![("127.0.0.1".to_string(), taken)];
    settings.max_retry_port_bind = 5;

    let alerts = AlertQueue::new(100);
    let (accept_tx, _accept_rx) = mpsc::unbounded_channel();
    let (udp_tx, _udp_rx) = mpsc::unbounded_channel();
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    let sockets =
        open_listen_sockets(&settings, &alerts, accept_tx, udp_tx, shutdown_rx).await;

    assert_eq!(sockets.len(), 1);
    assert_eq!(sockets[0].local_port, taken + 1, "bound to the next port");

    let posted = alerts.pop_all();
    assert!(posted.iter().any(|a| matches!(
        a,
        Alert::ListenSucceeded { addr } if addr.port() == taken + 1
    )));
}

// ----------------------------------------------------------------------
// port mapping propagation (S4)
// ----------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn port_map_success_surfaces_external_port() {
    use crate::portmap::{MapProtocol, MapResult, MappingId, PortMapUpdate, PortMapper};

    struct GrantAll;
    impl PortMapper for GrantAll {
        fn name(&self) -> &'static str {
            "fake"
        }
        fn add_mapping(
            &mut self,
            _protocol: MapProtocol,
            external_port: u16,
            _local_port: u16,
        ) -> (MappingId, MapResult) {
            (MappingId(1), MapResult::Mapped { external_port })
        }
        fn delete_mapping(&mut self, _id: MappingId) {}
    }

    let session = Session::new(test_settings(), MemoryDisk::new());
    let listen = wait_for(&session, Duration::from_secs(10), |a| {
        matches!(a, Alert::ListenSucceeded { .. })
    })
    .await
    .expect("listening");
    let port = match listen {
        Alert::ListenSucceeded { addr } => addr.port(),
        _ => unreachable!(),
    };

    session.add_port_mapper(Box::new(GrantAll));
    let mapped = wait_for(&session, Duration::from_secs(10), |a| {
        matches!(
            a,
            Alert::PortMap(PortMapUpdate::Succeeded {
                protocol: MapProtocol::Tcp,
                ..
            })
        )
    })
    .await
    .expect("mapping succeeded");
    match mapped {
        Alert::PortMap(PortMapUpdate::Succeeded { external_port, .. }) => {
            assert_eq!(external_port, port);
        }
        _ => unreachable!(),
    }

    session.shutdown();
}

// ----------------------------------------------------------------------
// end-to-end: minimal download (S1)
// ----------------------------------------------------------------------

fn zero_piece_meta() -> (TorrentMeta, Bytes) {
    let piece = Bytes::from(vec![0u8; 16384]);
    let mut hasher = Sha1::new();
    hasher.update(&piece);
    let digest: [u8; 20] = hasher.finalize().into();
    let meta = TorrentMeta::single_file(InfoHash([0x5e; 20]), "zero", 16384, vec![digest], 16384);
    (meta, piece)
}

fn test_settings() -> SessionSettings {
    let mut settings = SessionSettings::default();
    settings.listen_interfaces = vec![("127.0.0.1".to_string(), 0)];
    settings.enable_dht = false;
    settings.enable_lsd = false;
    settings.unchoke_interval = 1;
    settings.optimistic_unchoke_interval = 1;
    settings.auto_manage_interval = 3600;
    settings
}

async fn wait_for<F: Fn(&Alert) -> bool>(
    session: &Session,
    deadline: Duration,
    pred: F,
) -> Option<Alert> {
    let alerts = session.alerts();
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        for alert in alerts.wait(Duration::from_millis(250)).await {
            if pred(&alert) {
                return Some(alert);
            }
        }
    }
    None
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn minimal_download_between_two_engines() {
    let (meta, piece) = zero_piece_meta();
    let info_hash = meta.info_hash;

    // seeder: piece on disk, resume data marking it verified
    let seeder_disk = MemoryDisk::new();
    seeder_disk.insert_piece(info_hash, 0, piece);
    let seeder = Session::new(test_settings(), seeder_disk);
    seeder.add_torrent(AddTorrentParams {
        meta: Some(meta.clone()),
        auto_managed: false,
        resume: Some(ResumeData {
            info_hash,
            pieces: Bytes::from_static(&[0x80]),
            trackers: Vec::new(),
            save_path: String::new(),
            peers: Vec::new(),
            piece_priority: Vec::new(),
            file_priority: Vec::new(),
            allocation: "sparse".to_string(),
            blocks_per_piece: 1,
        }),
        ..Default::default()
    });

    let listen = wait_for(&seeder, Duration::from_secs(10), |a| {
        matches!(a, Alert::ListenSucceeded { .. })
    })
    .await
    .expect("seeder listening");
    let seeder_addr = match listen {
        Alert::ListenSucceeded { addr } => addr,
        _ => unreachable!(),
    };

    // leecher: empty disk
    let leecher_disk = MemoryDisk::new();
    let leecher = Session::new(test_settings(), leecher_disk.clone());
    leecher.add_torrent(AddTorrentParams {
        meta: Some(meta),
        auto_managed: false,
        ..Default::default()
    });
    assert!(wait_for(&leecher, Duration::from_secs(10), |a| {
        matches!(a, Alert::TorrentAdded { .. })
    })
    .await
    .is_some());

    leecher.add_peer(info_hash, seeder_addr);

    assert!(
        wait_for(&leecher, Duration::from_secs(30), |a| {
            matches!(a, Alert::PeerConnected { .. })
        })
        .await
        .is_some(),
        "leecher connected to seeder"
    );
    assert!(
        wait_for(&leecher, Duration::from_secs(30), |a| {
            matches!(a, Alert::PieceFinished { piece: 0, .. })
        })
        .await
        .is_some(),
        "piece 0 downloaded and verified"
    );
    assert!(
        wait_for(&leecher, Duration::from_secs(10), |a| {
            matches!(a, Alert::TorrentFinished { .. })
        })
        .await
        .is_some(),
        "torrent finished"
    );

    // the piece landed on the leecher's disk
    let stored = leecher_disk.piece(info_hash, 0).expect("piece written");
    assert_eq!(stored.len(), 16384);
    assert!(stored.iter().all(|b| *b == 0));

    seeder.shutdown();
    leecher.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handshake_info_hash_mismatch_disconnects() {
    // the leecher asks for a torrent the seeder does not have
    let (meta, piece) = zero_piece_meta();
    let seeder_disk = MemoryDisk::new();
    seeder_disk.insert_piece(meta.info_hash, 0, piece);
    let seeder = Session::new(test_settings(), seeder_disk);
    seeder.add_torrent(AddTorrentParams {
        meta: Some(meta.clone()),
        auto_managed: false,
        ..Default::default()
    });
    let listen = wait_for(&seeder, Duration::from_secs(10), |a| {
        matches!(a, Alert::ListenSucceeded { .. })
    })
    .await
    .expect("seeder listening");
    let seeder_addr = match listen {
        Alert::ListenSucceeded { addr } => addr,
        _ => unreachable!(),
    };

    let other = TorrentMeta::single_file(
        InfoHash([0x77; 20]),
        "other",
        16384,
        vec![[0u8; 20]],
        16384,
    );
    let leecher = Session::new(test_settings(), MemoryDisk::new());
    leecher.add_torrent(AddTorrentParams {
        meta: Some(other),
        auto_managed: false,
        ..Default::default()
    });
    leecher.add_peer(InfoHash([0x77; 20]), seeder_addr);

    let disconnect = wait_for(&seeder, Duration::from_secs(30), |a| {
        matches!(
            a,
            Alert::PeerDisconnected {
                protocol_violation: true,
                ..
            }
        )
    })
    .await;
    assert!(disconnect.is_some(), "mismatch rejected as BAD_PROTOCOL");

    seeder.shutdown();
    leecher.shutdown();
}
