use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Cancellation
// ══════════════════════════════════════════════════════════════════════════════

async fn wait_for_chunks(client: &mut TestClient, count: u64) -> Result<()> {
    client
        .wait_for(|e| match e {
            SessionEvent::Progress {
                chunks_received, ..
            } if *chunks_received == count => Some(()),
            _ => None,
        })
        .await
}

/// The server keeps streaming after the cancel request. None of those
/// chunks may reach the sink.
#[tokio::test]
async fn test_nothing_after_cancel_is_forwarded() -> Result<()> {
    let server = ScriptedServer::start(|mut conn| async move {
        conn.serve_file_list(run1_files()).await?;
        conn.serve_statistics(&run1_statistics()).await?;

        let frames = chunk_frames(
            &(0..4).map(|i| Recorded::imu(i * SECOND, i as u32)).collect::<Vec<_>>(),
            1,
        );
        conn.start_transfer(frames.len() as i64).await?;
        let mut frames = frames.into_iter();
        for frame in frames.by_ref().take(2) {
            conn.send_binary(frame).await?;
        }

        conn.expect(Request::CancelDownload).await?;
        for frame in frames {
            conn.send_binary(frame).await?;
        }
        conn.reply(Reply::CancelAcknowledged).await?;
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

    wait_for_chunks(&mut client, 2).await?;
    client.handle.cancel().await?;

    let (outcome, report) = client.finished().await?;
    assert_eq!(outcome, TransferOutcome::Cancelled);
    assert_eq!(report.map(|r| r.decoded), Some(2));

    let sink = client.stop().await?;
    let values: Vec<f64> = sink
        .store()
        .points("/imu")
        .unwrap_or_default()
        .iter()
        .map(|p| p.value)
        .collect();
    assert_eq!(values, vec![0.0, 1.0]);

    server.finish().await
}

/// Without an acknowledgement the cancel completes locally after the
/// configured timeout.
#[tokio::test]
async fn test_unacknowledged_cancel_times_out() -> Result<()> {
    let server = ScriptedServer::start(|mut conn| async move {
        conn.serve_file_list(run1_files()).await?;
        conn.serve_statistics(&run1_statistics()).await?;
        conn.start_transfer(100).await?;
        conn.send_binary(chunk_frames(&[Recorded::imu(0, 7)], 1).remove(0))
            .await?;
        conn.expect(Request::CancelDownload).await?;
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
    wait_for_chunks(&mut client, 1).await?;

    let started = std::time::Instant::now();
    client.handle.cancel().await?;
    let (outcome, _) = client.finished().await?;
    assert_eq!(outcome, TransferOutcome::Cancelled);
    assert!(started.elapsed() >= Duration::from_millis(250));

    // A second cancel has nothing to act on.
    assert!(client.handle.cancel().await.is_err());

    client.stop().await?;
    server.finish().await
}

/// Cancel outside a download is rejected and changes nothing.
#[tokio::test]
async fn test_cancel_when_idle_is_rejected() -> Result<()> {
    let server = ScriptedServer::start(|mut conn| async move {
        conn.serve_file_list(run1_files()).await?;
        conn.drain_until_closed().await
    })
    .await?;

    let mut client = spawn_client(server.port);
    client.connect().await?;
    let err = client.handle.cancel().await.unwrap_err();
    assert!(err.to_string().contains("cannot cancel while idle"), "{err}");

    client.stop().await?;
    server.finish().await
}
