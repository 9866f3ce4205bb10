//! Two runtimes exchanging a swarm over loopback UDP.
//!
//! Run with: cargo test --test channel_test -- --nocapture

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tswift::runtime::{LiveOptions, OpenOptions, Runtime};
use tswift::{KeyPair, SwarmId};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("tswift_net_{tag}_{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn reference_content() -> Vec<u8> {
    (0..4100u32).map(|i| (i.wrapping_mul(31) >> 2) as u8).collect()
}

async fn drive(a: &mut Runtime, b: &mut Runtime, rounds: usize, done: impl Fn(&Runtime) -> bool) {
    for _ in 0..rounds {
        a.step(Duration::from_millis(2)).await.unwrap();
        b.step(Duration::from_millis(2)).await.unwrap();
        if done(b) {
            return;
        }
    }
}

#[tokio::test]
async fn test_file_round_trip_over_loopback() {
    init_logging();
    let dir = temp_dir("file");
    let content = reference_content();
    let seed_path = dir.join("seed.dat");
    fs::write(&seed_path, &content).unwrap();

    // Seeder
    let mut seeder = Runtime::new();
    seeder.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let seed_td = seeder
        .open(
            &seed_path,
            None,
            OpenOptions {
                chunk_size: Some(1024),
                ..OpenOptions::default()
            },
        )
        .unwrap();
    assert!(seeder.is_complete(seed_td).unwrap());
    let swarm = seeder.get_swarm_id(seed_td).unwrap();
    let seeder_addr = seeder.bound_addr().unwrap();

    // Leecher
    let mut leecher = Runtime::new();
    leecher.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let leech_path = dir.join("leech.dat");
    let leech_td = leecher
        .open(
            &leech_path,
            Some(swarm.clone()),
            OpenOptions {
                chunk_size: Some(1024),
                ..OpenOptions::default()
            },
        )
        .unwrap();
    assert_eq!(leecher.size(leech_td).unwrap(), 0);
    leecher.add_peer(leech_td, seeder_addr).unwrap();

    drive(&mut seeder, &mut leecher, 4000, |l| {
        l.is_complete(leech_td).unwrap_or(false)
    })
    .await;

    assert!(leecher.is_complete(leech_td).unwrap(), "leech did not finish");
    assert_eq!(leecher.size(leech_td).unwrap(), 4100);
    assert_eq!(leecher.complete(leech_td).unwrap(), 4100);
    assert_eq!(leecher.seq_complete(leech_td, 0).unwrap(), 4100);

    // Bytes land on disk identical to the seeder's.
    let leeched = fs::read(&leech_path).unwrap();
    assert_eq!(&leeched[..4100], &content[..]);

    // And the read API serves them back.
    let mut buf = vec![0u8; 4100];
    let n = leecher.read(leech_td, &mut buf, 0).unwrap();
    assert_eq!(n, 4100);
    assert_eq!(buf, content);

    // The leecher can checkpoint and a restart resumes complete.
    leecher.checkpoint(leech_td).unwrap();
    leecher.close(leech_td, false, false).unwrap();
    let td2 = leecher
        .open(
            &leech_path,
            Some(swarm),
            OpenOptions {
                chunk_size: Some(1024),
                ..OpenOptions::default()
            },
        )
        .unwrap();
    assert!(leecher.is_complete(td2).unwrap());
}

#[tokio::test]
async fn test_live_stream_over_loopback() {
    init_logging();
    let dir = temp_dir("live");

    // Source: 64-byte chunks, 4 chunks per signed munro.
    let mut source = Runtime::new();
    source.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let src_td = source
        .live_create(
            &dir.join("stream.dat"),
            KeyPair::generate(),
            LiveOptions {
                chunk_size: 64,
                chunks_per_sign: 4,
                checkpoint_file: Some(dir.join("stream.checkpoint")),
                ..LiveOptions::default()
            },
        )
        .unwrap();
    let swarm = source.get_swarm_id(src_td).unwrap();
    assert!(matches!(swarm, SwarmId::Live(_)));
    let source_addr = source.bound_addr().unwrap();

    // Client, pointed straight at the source.
    let mut client = Runtime::new();
    client.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let cli_td = client
        .live_open(
            &dir.join("client.dat"),
            swarm,
            LiveOptions {
                chunk_size: 64,
                chunks_per_sign: 4,
                source_addr: Some(source_addr),
                ..LiveOptions::default()
            },
        )
        .unwrap();

    // Let the handshake settle before feeding the stream.
    drive(&mut source, &mut client, 50, |_| false).await;

    // Two whole epochs of content.
    let payload: Vec<u8> = (0..8 * 64u32).map(|i| (i % 251) as u8).collect();
    source.live_write(src_td, &payload).unwrap();

    drive(&mut source, &mut client, 4000, |c| {
        c.complete(cli_td).map(|b| b >= 8 * 64).unwrap_or(false)
    })
    .await;

    assert!(
        client.complete(cli_td).unwrap() >= 8 * 64,
        "client received {} bytes",
        client.complete(cli_td).unwrap()
    );
    // The client's bytes equal the source's stream.
    let got = fs::read(dir.join("client.dat")).unwrap();
    assert_eq!(&got[..payload.len()], &payload[..]);
    // The source checkpointed its last munro.
    assert!(dir.join("stream.checkpoint").exists());
}

#[tokio::test]
async fn test_unknown_swarm_gets_no_reply() {
    init_logging();
    let dir = temp_dir("unknown");

    let mut server = Runtime::new();
    server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let server_addr = server.bound_addr().unwrap();

    let mut client = Runtime::new();
    client.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let bogus = SwarmId::File(tswift::Sha1Hash::from_bytes_digest(b"no such swarm"));
    let td = client
        .open(
            &dir.join("nothing.dat"),
            Some(bogus),
            OpenOptions::default(),
        )
        .unwrap();
    client.add_peer(td, server_addr).unwrap();

    drive(&mut server, &mut client, 50, |_| false).await;
    // Knocking for an unknown swarm never establishes anything.
    assert_eq!(client.complete(td).unwrap(), 0);
    assert_eq!(client.num_seeders(td).unwrap() + client.num_leechers(td).unwrap(), 1);
}
