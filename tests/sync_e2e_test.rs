//! End-to-end push/pull over real TCP connections

mod common;

use std::collections::BTreeSet;
use std::fs;
use std::time::Duration;

use common::{client, start_server, start_server_with, SECRET};
use hashsync::{ClientConfig, ContentHash, FrameCodec, Request, Response, SyncClient, SyncError};
use tempfile::TempDir;

#[tokio::test]
async fn test_push_then_pull_to_second_client() -> anyhow::Result<()> {
    let server_root = TempDir::new()?;
    let alice_root = TempDir::new()?;
    let bob_root = TempDir::new()?;
    let server = start_server(server_root.path()).await;

    // Alice pushes a.txt
    fs::write(alice_root.path().join("a.txt"), "hello")?;
    let alice = client(server.addr, alice_root.path());
    let pushed = alice.push_file(&alice_root.path().join("a.txt")).await?;
    assert_eq!(pushed, alice_root.path().join("a.txt"));
    assert_eq!(fs::read_to_string(server_root.path().join("a.txt"))?, "hello");

    // Bob starts empty and pulls it
    let bob = client(server.addr, bob_root.path());
    let report = bob.pull_sync().await?;
    assert_eq!(report.saved.len(), 1);
    assert_eq!(report.saved[0].relative_path, "a.txt");
    assert_eq!(fs::read_to_string(bob_root.path().join("a.txt"))?, "hello");

    // Nothing changed on the server: nothing to download
    let again = bob.pull_sync().await?;
    assert!(again.saved.is_empty());
    assert_eq!(again.needed, 0);

    Ok(())
}

#[tokio::test]
async fn test_nested_paths_survive_the_round_trip() -> anyhow::Result<()> {
    let server_root = TempDir::new()?;
    let alice_root = TempDir::new()?;
    let bob_root = TempDir::new()?;
    let server = start_server(server_root.path()).await;

    fs::create_dir_all(alice_root.path().join("docs/2026"))?;
    fs::write(alice_root.path().join("docs/2026/plan.md"), "# plan")?;
    let alice = client(server.addr, alice_root.path());
    alice.push_file("docs/2026/plan.md".as_ref()).await?;

    let report = client(server.addr, bob_root.path()).pull_sync().await?;
    assert_eq!(report.saved[0].relative_path, "docs/2026/plan.md");
    assert_eq!(
        fs::read_to_string(bob_root.path().join("docs/2026/plan.md"))?,
        "# plan"
    );

    Ok(())
}

#[tokio::test]
async fn test_pushing_same_content_twice_is_idempotent() -> anyhow::Result<()> {
    let server_root = TempDir::new()?;
    let local = TempDir::new()?;
    let server = start_server(server_root.path()).await;

    fs::write(local.path().join("same.bin"), [7u8; 4096])?;
    let c = client(server.addr, local.path());
    c.push_file("same.bin".as_ref()).await?;
    c.push_file("same.bin".as_ref()).await?;

    assert_eq!(fs::read(server_root.path().join("same.bin"))?, vec![7u8; 4096]);
    Ok(())
}

#[tokio::test]
async fn test_pull_with_nothing_missing_saves_nothing() -> anyhow::Result<()> {
    let server_root = TempDir::new()?;
    let local = TempDir::new()?;
    fs::write(server_root.path().join("shared.txt"), "both sides")?;
    fs::write(local.path().join("shared.txt"), "both sides")?;
    let server = start_server(server_root.path()).await;

    let report = client(server.addr, local.path()).pull_sync().await?;
    assert_eq!(report.announced, 1);
    assert_eq!(report.needed, 0);
    assert!(report.saved.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_check_is_not_repeated_until_requested() -> anyhow::Result<()> {
    let server_root = TempDir::new()?;
    let local = TempDir::new()?;
    fs::write(server_root.path().join("h.txt"), "H")?;
    let server = start_server(server_root.path()).await;
    let c = client(server.addr, local.path());
    let h = ContentHash::from_bytes(b"H");

    assert_eq!(
        c.call(&Request::SyncCheck).await?,
        Response::Announce(BTreeSet::from([h]))
    );
    assert_eq!(
        c.call(&Request::SyncCheck).await?,
        Response::Announce(BTreeSet::new())
    );
    assert!(server.server.announced().contains(&h));

    match c.call(&Request::SyncRequest(BTreeSet::from([h]))).await? {
        Response::Files(files) => assert_eq!(files.len(), 1),
        other => panic!("Expected Files, got {:?}", other),
    }
    assert!(!server.server.announced().contains(&h));

    assert_eq!(
        c.call(&Request::SyncCheck).await?,
        Response::Announce(BTreeSet::from([h]))
    );
    Ok(())
}

#[tokio::test]
async fn test_make_directories_over_the_wire() -> anyhow::Result<()> {
    let server_root = TempDir::new()?;
    let local = TempDir::new()?;
    let server = start_server(server_root.path()).await;
    let c = client(server.addr, local.path());

    c.make_directories(vec!["inbox".into(), "archive/2026/10".into()])
        .await?;
    c.make_directories(vec!["inbox".into()]).await?;
    assert!(server_root.path().join("archive/2026/10").is_dir());

    let err = c
        .make_directories(vec!["../outside".into()])
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Remote(_)));
    Ok(())
}

#[tokio::test]
async fn test_wrong_secret_fails_without_touching_server() -> anyhow::Result<()> {
    let server_root = TempDir::new()?;
    let local = TempDir::new()?;
    fs::write(local.path().join("a.txt"), "hello")?;
    let server = start_server(server_root.path()).await;

    let intruder = SyncClient::new(
        ClientConfig {
            server: server.addr.to_string(),
            root: local.path().to_path_buf(),
            io_timeout: Duration::from_secs(5),
        },
        FrameCodec::new(&b"not the secret"[..]),
    );

    assert!(intruder.push_file("a.txt".as_ref()).await.is_err());
    assert!(!server_root.path().join("a.txt").exists());
    Ok(())
}

#[tokio::test]
async fn test_server_keeps_serving_after_bad_connection() -> anyhow::Result<()> {
    use tokio::io::AsyncWriteExt;

    let server_root = TempDir::new()?;
    let local = TempDir::new()?;
    let server = start_server(server_root.path()).await;

    let mut raw = tokio::net::TcpStream::connect(server.addr).await?;
    raw.write_all(&[0xAB, 0, 0, 0, 0]).await?;
    drop(raw);

    fs::write(local.path().join("after.txt"), "still up")?;
    client(server.addr, local.path())
        .push_file("after.txt".as_ref())
        .await?;
    assert_eq!(
        fs::read_to_string(server_root.path().join("after.txt"))?,
        "still up"
    );
    Ok(())
}

#[tokio::test]
async fn test_pull_larger_than_one_frame_arrives_in_one_cycle() -> anyhow::Result<()> {
    let server_root = TempDir::new()?;
    let local = TempDir::new()?;
    for i in 0..5u8 {
        fs::write(
            server_root.path().join(format!("chunk{}.bin", i)),
            vec![i; 40 * 1024],
        )?;
    }
    let codec = FrameCodec::new(SECRET).with_max_frame(64 * 1024);
    let server = start_server_with(server_root.path(), codec).await;

    let c = client(server.addr, local.path());
    let report = c.pull_sync().await?;
    assert_eq!(report.needed, 5);
    assert_eq!(report.saved.len(), 5);
    for i in 0..5u8 {
        assert_eq!(
            fs::read(local.path().join(format!("chunk{}.bin", i)))?,
            vec![i; 40 * 1024]
        );
    }
    assert!(server.server.announced().is_empty());

    let again = c.pull_sync().await?;
    assert!(again.saved.is_empty());
    Ok(())
}
