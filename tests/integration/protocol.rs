use crate::*;

use tether_client::ClientError;

// ══════════════════════════════════════════════════════════════════════════════
//  Control channel robustness
// ══════════════════════════════════════════════════════════════════════════════

/// Unknown message types, malformed JSON and stray chunks are dropped
/// without disturbing the session.
#[tokio::test]
async fn test_unknown_and_malformed_messages_are_ignored() -> Result<()> {
    let server = ScriptedServer::start(|mut conn| async move {
        conn.expect(Request::GetFileList).await?;
        conn.send_text(serde_json::json!({"header": {"type": "heartbeat"}, "body": {}}).to_string())
            .await?;
        conn.send_text("{not json").await?;
        conn.send_binary(chunk_frames(&[Recorded::imu(0, 1)], 1).remove(0))
            .await?;
        conn.reply(Reply::FileList(run1_files())).await?;
        conn.drain_until_closed().await
    })
    .await?;

    let mut client = spawn_client(server.port);
    let files = client.connect().await?;
    assert_eq!(files.len(), 1);

    let sink = client.stop().await?;
    assert!(sink.store().is_empty());
    server.finish().await
}

/// A corrupt chunk frame is discarded; the rest of the transfer goes on.
#[tokio::test]
async fn test_corrupt_chunk_is_discarded() -> Result<()> {
    let server = ScriptedServer::start(|mut conn| async move {
        conn.serve_file_list(run1_files()).await?;
        conn.serve_statistics(&run1_statistics()).await?;
        conn.start_transfer(2).await?;

        let mut corrupt = chunk_frames(&[Recorded::imu(0, 1)], 1).remove(0);
        corrupt.truncate(corrupt.len() - 2);
        conn.send_binary(corrupt).await?;
        conn.send_binary(chunk_frames(&[Recorded::imu(SECOND, 2)], 1).remove(0))
            .await?;
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
    let (outcome, report) = client.finished().await?;
    assert_eq!(outcome, TransferOutcome::Completed);
    assert_eq!(report.map(|r| r.decoded), Some(1));

    let sink = client.stop().await?;
    let points = sink.store().points("/imu").unwrap_or_default();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].timestamp, SECOND);
    server.finish().await
}

/// `errorMessage` during a download fails the transfer.
#[tokio::test]
async fn test_server_error_fails_download() -> Result<()> {
    let server = ScriptedServer::start(|mut conn| async move {
        conn.serve_file_list(run1_files()).await?;
        conn.serve_statistics(&run1_statistics()).await?;
        conn.expect_download().await?;
        conn.reply(Reply::Error("disk read failed".to_string())).await?;
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

    let message = client
        .wait_for(|e| match e {
            SessionEvent::ServerError(m) => Some(m.clone()),
            _ => None,
        })
        .await?;
    assert_eq!(message, "disk read failed");
    let (outcome, _) = client.finished().await?;
    assert_eq!(outcome, TransferOutcome::Failed);

    client.stop().await?;
    server.finish().await
}

/// `errorMessage` in reply to a statistics request returns to idle.
#[tokio::test]
async fn test_server_error_on_statistics() -> Result<()> {
    let server = ScriptedServer::start(|mut conn| async move {
        conn.serve_file_list(run1_files()).await?;
        conn.expect(Request::GetStatistics {
            filename: "missing.log".to_string(),
        })
        .await?;
        conn.reply(Reply::Error("no such file".to_string())).await?;
        conn.serve_file_list(run1_files()).await?;
        conn.drain_until_closed().await
    })
    .await?;

    let mut client = spawn_client(server.port);
    client.connect().await?;
    client.handle.request_statistics("missing.log").await?;
    client
        .wait_for(|e| matches!(e, SessionEvent::ServerError(_)).then_some(()))
        .await?;

    // Downloading needs statistics for the file.
    let err = client
        .handle
        .download(DataRequest::everything("missing.log"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Session(_)), "{err}");

    client.handle.list_files().await?;
    client
        .wait_for(|e| matches!(e, SessionEvent::FileList(_)).then_some(()))
        .await?;

    client.stop().await?;
    server.finish().await
}

/// A server hanging up mid-download fails the transfer and disconnects.
#[tokio::test]
async fn test_server_hangup_fails_transfer() -> Result<()> {
    let server = ScriptedServer::start(|mut conn| async move {
        conn.serve_file_list(run1_files()).await?;
        conn.serve_statistics(&run1_statistics()).await?;
        conn.start_transfer(3).await?;
        conn.send_binary(chunk_frames(&[Recorded::imu(0, 1)], 1).remove(0))
            .await?;
        Ok(())
    })
    .await?;

    let mut client = spawn_client(server.port);
    client.connect().await?;
    client.load_statistics(RUN1).await?;
    client
        .handle
        .download(DataRequest::everything(RUN1), None)
        .await?;

    let (outcome, report) = client.finished().await?;
    assert_eq!(outcome, TransferOutcome::Failed);
    assert_eq!(report.map(|r| r.decoded), Some(1));
    client
        .wait_for(|e| matches!(e, SessionEvent::Disconnected { .. }).then_some(()))
        .await?;

    // Back to square one: commands that need a connection are rejected.
    assert!(client.handle.list_files().await.is_err());

    client.stop().await?;
    server.finish().await
}

/// A refused connection reports an error and leaves the client able to
/// connect again.
#[tokio::test]
async fn test_connection_refused() -> Result<()> {
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr()?.port()
    };

    let mut client = spawn_client(port);
    client.handle.connect("127.0.0.1", port).await?;
    let message = client
        .wait_for(|e| match e {
            SessionEvent::Error(m) => Some(m.clone()),
            _ => None,
        })
        .await?;
    assert!(message.starts_with("connect failed"), "{message}");

    let server = ScriptedServer::start(|mut conn| async move {
        conn.serve_file_list(run1_files()).await?;
        conn.drain_until_closed().await
    })
    .await?;
    client.port = server.port;
    client.connect().await?;

    client.stop().await?;
    server.finish().await
}

/// Commands invalid for the current state never reach the server.
#[tokio::test]
async fn test_commands_before_connect_are_rejected() -> Result<()> {
    let client = spawn_client(1);
    let err = client.handle.list_files().await.unwrap_err();
    assert_eq!(err.to_string(), "cannot list files while disconnected");
    assert!(client.handle.disconnect().await.is_err());
    client.stop().await?;
    Ok(())
}
