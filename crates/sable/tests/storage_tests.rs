use std::time::Duration;

use sable_storage::rocksdb_store::RocksLog;
use sable_storage::*;

fn test_path() -> anyhow::Result<String> {
    std::fs::create_dir_all("test_data")?;
    Ok(format!("test_data/{}", fastrand::u64(..)))
}

fn make_test_log() -> anyhow::Result<RocksLog> {
    Ok(make_rocksdb_log(&test_path()?, false)?)
}

#[tokio::test]
async fn append_and_read() -> anyhow::Result<()> {
    let log = make_test_log()?;

    let p1 = log.append("t1", b"hello").await?;
    let p2 = log.append("t1", b"world").await?;
    log.append("t2", b"other").await?;

    assert_eq!(p1.segment, log.segment());
    assert_eq!(p2, p1.next());

    let entries = log.read_from("t1", Position::EARLIEST, 10).await?;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].position, p1);
    assert_eq!(entries[0].payload.as_ref(), b"hello");
    assert_eq!(entries[1].payload.as_ref(), b"world");

    let tail = log.read_from("t1", p2, 10).await?;
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].position, p2);

    assert_eq!(log.read_from("t1", Position::EARLIEST, 1).await?.len(), 1);
    assert!(log.read_from("missing", Position::EARLIEST, 10).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn count_from_is_inclusive() -> anyhow::Result<()> {
    let log = make_test_log()?;
    let mut positions = Vec::new();
    for i in 0..5u8 {
        positions.push(log.append("t", &[i]).await?);
    }

    assert_eq!(log.count_from("t", Position::EARLIEST).await?, 5);
    assert_eq!(log.count_from("t", positions[2]).await?, 3);
    assert_eq!(log.count_from("t", positions[4].next()).await?, 0);
    assert_eq!(log.count_from("other", Position::EARLIEST).await?, 0);
    Ok(())
}

#[tokio::test]
async fn mark_delete_only_moves_forward() -> anyhow::Result<()> {
    let log = make_test_log()?;
    let p0 = log.append("t", b"a").await?;
    let p1 = log.append("t", b"b").await?;
    log.register_subscription("t", "s").await?;

    assert_eq!(log.mark_delete_position("t", "s").await?, None);

    log.mark_delete("t", "s", p1).await?;
    assert_eq!(log.mark_delete_position("t", "s").await?, Some(p1));

    // same position again is a no-op
    log.mark_delete("t", "s", p1).await?;

    let err = log.mark_delete("t", "s", p0).await.unwrap_err();
    assert!(matches!(err, StorageError::CursorMovedBackwards { .. }));
    assert_eq!(log.mark_delete_position("t", "s").await?, Some(p1));
    Ok(())
}

#[tokio::test]
async fn reopen_allocates_later_segment_and_keeps_cursors() -> anyhow::Result<()> {
    let path = test_path()?;

    let (first_segment, written) = {
        let log = make_rocksdb_log(&path, false)?;
        let p = log.append("t", b"before").await?;
        log.register_subscription("t", "s").await?;
        log.mark_delete("t", "s", p).await?;
        log.flush().await?;
        (log.segment(), p)
    };
    std::thread::sleep(Duration::from_millis(500));

    let log = make_rocksdb_log(&path, false)?;
    assert!(log.segment() > first_segment);
    assert_eq!(log.mark_delete_position("t", "s").await?, Some(written));

    let after = log.append("t", b"after").await?;
    assert_eq!(after.offset, 0);
    assert!(after > written);

    let unread = log.read_from("t", written.next(), 10).await?;
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0].position, after);
    assert_eq!(unread[0].payload.as_ref(), b"after");
    Ok(())
}

#[tokio::test]
async fn cleanup_respects_slowest_cursor() -> anyhow::Result<()> {
    let log = make_test_log()?;
    let mut positions = Vec::new();
    for i in 0..6u8 {
        positions.push(log.append("t", &[i]).await?);
    }

    // nobody subscribed: nothing is known to be consumed
    assert_eq!(log.cleanup_topic("t").await?, 0);

    log.register_subscription("t", "fast").await?;
    log.register_subscription("t", "slow").await?;
    log.mark_delete("t", "fast", positions[4]).await?;
    assert_eq!(log.cleanup_topic("t").await?, 0);

    log.mark_delete("t", "slow", positions[1]).await?;
    assert_eq!(log.cleanup_topic("t").await?, 2);
    assert_eq!(log.count_from("t", Position::EARLIEST).await?, 4);

    let first = log.read_from("t", Position::EARLIEST, 1).await?;
    assert_eq!(first[0].position, positions[2]);

    log.mark_delete("t", "slow", positions[5]).await?;
    assert_eq!(log.cleanup_topic("t").await?, 3);
    assert_eq!(log.count_from("t", Position::EARLIEST).await?, 1);
    Ok(())
}

#[tokio::test]
async fn subscriptions_are_listed_once() -> anyhow::Result<()> {
    let log = make_test_log()?;
    log.register_subscription("a", "s1").await?;
    log.register_subscription("a", "s2").await?;
    log.register_subscription("b", "s1").await?;
    log.register_subscription("a", "s1").await?;

    let mut subs = log.list_subscriptions().await?;
    subs.sort();
    assert_eq!(
        subs,
        vec![
            ("a".to_string(), "s1".to_string()),
            ("a".to_string(), "s2".to_string()),
            ("b".to_string(), "s1".to_string()),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn topics_with_shared_prefix_do_not_mix() -> anyhow::Result<()> {
    let log = make_test_log()?;
    log.append("orders", b"o").await?;
    log.append("orders-eu", b"e1").await?;
    log.append("orders-eu", b"e2").await?;

    assert_eq!(log.count_from("orders", Position::EARLIEST).await?, 1);
    assert_eq!(log.count_from("orders-eu", Position::EARLIEST).await?, 2);
    let entries = log.read_from("orders", Position::EARLIEST, 10).await?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].payload.as_ref(), b"o");
    Ok(())
}

#[tokio::test]
async fn individual_acks_survive_reopen() -> anyhow::Result<()> {
    let path = test_path()?;

    let acked = {
        let log = make_rocksdb_log(&path, false)?;
        let p0 = log.append("t", b"a").await?;
        let p1 = log.append("t", b"b").await?;
        let p2 = log.append("t", b"c").await?;
        log.register_subscription("t", "s").await?;

        assert!(log.individual_acks("t", "s").await?.is_empty());
        log.save_individual_acks("t", "s", &[p0, p1, p2]).await?;
        // later saves replace the set
        log.save_individual_acks("t", "s", &[p1, p2]).await?;
        log.flush().await?;
        vec![p1, p2]
    };
    std::thread::sleep(Duration::from_millis(500));

    let log = make_rocksdb_log(&path, false)?;
    assert_eq!(log.individual_acks("t", "s").await?, acked);
    assert!(log.individual_acks("t", "other").await?.is_empty());

    log.save_individual_acks("t", "s", &[]).await?;
    assert!(log.individual_acks("t", "s").await?.is_empty());
    Ok(())
}
