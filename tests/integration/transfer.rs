use crate::*;

use std::collections::BTreeSet;

use tether_ingest::CacheReader;

// ══════════════════════════════════════════════════════════════════════════════
//  Downloads
// ══════════════════════════════════════════════════════════════════════════════

/// The server ignores the request and streams every topic over the full
/// span. Only `/imu` points before 5 s may reach the store.
#[tokio::test]
async fn test_run1_topic_and_window_filter() -> Result<()> {
    let server = ScriptedServer::start(|mut conn| async move {
        conn.serve_file_list(run1_files()).await?;
        let filename = conn.serve_statistics(&run1_statistics()).await?;
        assert_eq!(filename, RUN1);

        let frames = chunk_frames(&run1_messages(), 4);
        let request = conn.start_transfer(frames.len() as i64).await?;
        assert_eq!(request.topics, BTreeSet::from(["/imu".to_string()]));
        assert_eq!((request.start_time, request.end_time), (0, 5 * SECOND));

        for frame in frames {
            conn.send_binary(frame).await?;
        }
        conn.reply(Reply::TransferCompleted).await?;
        conn.drain_until_closed().await
    })
    .await?;

    let mut client = spawn_client(server.port);
    let files = client.connect().await?;
    assert_eq!(files, run1_files());

    let statistics = client.load_statistics(RUN1).await?;
    assert_eq!(statistics.channels.len(), 2);

    let request = DataRequest::new(RUN1, ["/imu"], 0, 5 * SECOND)?;
    client.handle.download(request, None).await?;
    let (outcome, report) = client.finished().await?;
    assert_eq!(outcome, TransferOutcome::Completed);

    let report = report.context("transfer produced no report")?;
    assert_eq!(report.decoded, 10);
    assert_eq!(report.discarded, run1_messages().len() as u64 - 10);
    assert!(!report.has_warnings());

    let sink = client.stop().await?;
    let snapshot = sink.store().snapshot();
    assert_eq!(snapshot.series_count(), 1);
    let imu = &snapshot.numeric["/imu"];
    assert_eq!(imu.len(), 10);
    assert!(imu.iter().all(|p| p.timestamp < 5 * SECOND));
    assert_eq!(imu.last().map(|p| p.value), Some(9.0));

    server.finish().await
}

/// A cache written during a download replays into identical series.
#[tokio::test]
async fn test_cache_replay_matches_live_store() -> Result<()> {
    let server = ScriptedServer::start(|mut conn| async move {
        conn.serve_file_list(run1_files()).await?;
        conn.serve_statistics(&run1_statistics()).await?;
        let frames = chunk_frames(&run1_messages(), 7);
        conn.start_transfer(frames.len() as i64).await?;
        for frame in frames {
            conn.send_binary(frame).await?;
        }
        conn.reply(Reply::TransferCompleted).await?;
        conn.drain_until_closed().await
    })
    .await?;

    let cache = temp_path("run1.tether");
    let mut client = spawn_client(server.port);
    client.connect().await?;
    client.load_statistics(RUN1).await?;
    client
        .handle
        .download(DataRequest::everything(RUN1), Some(cache.clone()))
        .await?;
    let (outcome, _) = client.finished().await?;
    assert_eq!(outcome, TransferOutcome::Completed);
    let sink = client.stop().await?;
    server.finish().await?;

    let contents = CacheReader::open(&cache)?.read_all()?;
    assert_eq!(contents.messages.len(), run1_messages().len());
    assert_eq!(contents.statistics.channels.len(), 2);

    let mut replayed = new_pipeline();
    let report = contents.replay_into(&mut replayed);
    assert_eq!(report.decoded, run1_messages().len() as u64);
    assert_eq!(replayed.store().snapshot(), sink.store().snapshot());

    if let Some(dir) = cache.parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
    Ok(())
}

/// Completion is decided by `transferCompleted`, not by the advertised
/// chunk count. Afterwards the session accepts new commands.
#[tokio::test]
async fn test_completion_ignores_advertised_count() -> Result<()> {
    let server = ScriptedServer::start(|mut conn| async move {
        conn.serve_file_list(run1_files()).await?;
        conn.serve_statistics(&run1_statistics()).await?;
        conn.start_transfer(10).await?;
        for frame in chunk_frames(&run1_messages()[..4], 2) {
            conn.send_binary(frame).await?;
        }
        conn.reply(Reply::TransferCompleted).await?;
        conn.serve_file_list(run1_files()).await?;
        conn.drain_until_closed().await
    })
    .await?;

    let mut client = spawn_client(server.port);
    client.connect().await?;
    client.load_statistics(RUN1).await?;
    client
        .handle
        .download(DataRequest::everything(RUN1), None)
        .await?;

    let expected = client
        .wait_for(|e| match e {
            SessionEvent::Progress {
                expected_chunks, ..
            } => Some(*expected_chunks),
            _ => None,
        })
        .await?;
    assert_eq!(expected, Some(10));

    let (outcome, report) = client.finished().await?;
    assert_eq!(outcome, TransferOutcome::Completed);
    assert_eq!(report.map(|r| r.decoded), Some(4));

    client.handle.list_files().await?;
    let files = client
        .wait_for(|e| match e {
            SessionEvent::FileList(files) => Some(files.len()),
            _ => None,
        })
        .await?;
    assert_eq!(files, 1);

    client.stop().await?;
    server.finish().await
}

/// Progress counts every forwarded chunk, in order.
#[tokio::test]
async fn test_progress_follows_chunks() -> Result<()> {
    let server = ScriptedServer::start(|mut conn| async move {
        conn.serve_file_list(run1_files()).await?;
        conn.serve_statistics(&run1_statistics()).await?;
        let frames = chunk_frames(&run1_messages(), 10);
        conn.start_transfer(frames.len() as i64).await?;
        for frame in frames {
            conn.send_binary(frame).await?;
        }
        conn.reply(Reply::TransferCompleted).await?;
        conn.drain_until_closed().await
    })
    .await?;

    let mut client = spawn_client(server.port);
    client.connect().await?;
    client.load_statistics(RUN1).await?;
    client
        .handle
        .download(DataRequest::everything(RUN1), None)
        .await?;

    let mut seen = Vec::new();
    loop {
        let event = client
            .wait_for(|e| match e {
                SessionEvent::Progress {
                    chunk_index,
                    chunks_received,
                    ..
                } => Some(Some((*chunk_index, *chunks_received))),
                SessionEvent::TransferFinished { .. } => Some(None),
                _ => None,
            })
            .await?;
        match event {
            Some(progress) => seen.push(progress),
            None => break,
        }
    }
    assert_eq!(seen, vec![(0, 1), (1, 2), (2, 3)]);

    client.stop().await?;
    server.finish().await
}
