// tests/integration/resumption_test.rs

//! Session resumption: queued messages survive a dropped connection and are
//! delivered exactly once, in order, on the next connection of the same session.

use super::fixtures::{EVENTUALLY, Fixture};
use super::test_helpers::{
    ClientApp, Identity, Push, TestClient, TestServer, ToClient, ToServer, server_config,
    wait_until,
};
use craftlink::client::ClientExit;
use craftlink::core::RpcError;
use craftlink::core::handshake::HandshakeOutcome;
use craftlink::core::handshake::client::{self as client_handshake, EstablishedHandshake};
use craftlink::core::messages;
use craftlink::core::protocol::{AuthToken, Frame, FrameCodec};
use craftlink::server::SessionState;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;
use uuid::Uuid;

type RawFrames = FramedRead<TcpStream, FrameCodec>;

/// Handshakes by hand and hands back the raw frame stream.
async fn raw_connect(
    addr: SocketAddr,
    identity: &Identity,
    session_guid: Uuid,
) -> Result<(EstablishedHandshake, RawFrames), RpcError> {
    let mut stream = TcpStream::connect(addr).await?;
    let token = AuthToken {
        client_guid: identity.guid,
        secret: identity.secret.clone(),
    };
    let established = client_handshake::perform::<_, ToClient, ToServer>(
        &mut stream,
        &token,
        session_guid,
        &ClientApp::default(),
    )
    .await?;
    Ok((established, FramedRead::new(stream, FrameCodec)))
}

/// Reads the next frame, which must be a `Push` message. Returns (id, seq).
async fn next_push(frames: &mut RawFrames) -> (u32, u32) {
    let frame = tokio::time::timeout(EVENTUALLY, frames.next())
        .await
        .expect("a frame should arrive")
        .expect("stream should stay open")
        .expect("frame should decode");
    match frame {
        Frame::Message {
            message_id,
            type_code,
            payload,
        } => {
            assert_eq!(type_code, 0, "Push is the first to-client kind");
            let push: Push = messages::decode(&payload).unwrap();
            (message_id, push.seq)
        }
        other => panic!("expected a message, got {other:?}"),
    }
}

#[tokio::test]
async fn test_messages_queued_while_disconnected_are_replayed_in_order() {
    let identity = Identity::random();
    let server = TestServer::start(std::slice::from_ref(&identity)).await;
    let mut connections = server.app.watch_connections();
    let session_guid = Uuid::new_v4();

    let (established, mut frames) = raw_connect(server.addr, &identity, session_guid)
        .await
        .unwrap();
    assert_eq!(established.outcome, HandshakeOutcome::NewSession);
    let (_, to_client) = tokio::time::timeout(EVENTUALLY, connections.recv())
        .await
        .unwrap()
        .unwrap();

    for seq in 1..=3 {
        to_client.send(Push { seq }).await.unwrap();
    }
    for expected in 1..=3 {
        assert_eq!(next_push(&mut frames).await, (expected, expected));
    }

    // Drop the connection without acknowledging anything.
    drop(frames);
    let sessions = server.sessions.clone();
    let guid = identity.guid;
    assert!(
        wait_until(EVENTUALLY, || {
            sessions
                .get(&guid)
                .is_some_and(|s| s.state() == SessionState::Disconnected)
        })
        .await
    );
    to_client.send(Push { seq: 4 }).await.unwrap();

    let (established, mut frames) = raw_connect(server.addr, &identity, session_guid)
        .await
        .unwrap();
    assert_eq!(established.outcome, HandshakeOutcome::ReusedSession);
    for expected in 1..=4 {
        assert_eq!(next_push(&mut frames).await, (expected, expected));
    }
    assert!(
        tokio::time::timeout(Duration::from_millis(200), frames.next())
            .await
            .is_err(),
        "nothing should be delivered twice"
    );

    drop(frames);
    server.stop().await;
}

#[tokio::test]
async fn test_disconnected_session_expires() {
    let mut config = server_config();
    config.disconnect_session_timeout = Duration::from_millis(200);
    let identity = Identity::random();
    let server = TestServer::with_config(config, std::slice::from_ref(&identity)).await;
    let session_guid = Uuid::new_v4();

    let (_, frames) = raw_connect(server.addr, &identity, session_guid)
        .await
        .unwrap();
    drop(frames);

    let sessions = server.sessions.clone();
    assert!(wait_until(EVENTUALLY, || sessions.is_closed(&session_guid)).await);
    assert!(sessions.is_empty());

    let err = raw_connect(server.addr, &identity, session_guid)
        .await
        .err()
        .unwrap();
    assert_eq!(err, RpcError::SessionAlreadyClosed);

    server.stop().await;
}

#[tokio::test]
async fn test_reconnect_keeps_session_and_deduplicates() {
    let identity = Identity::random();
    let server = TestServer::start(std::slice::from_ref(&identity)).await;
    let mut connections = server.app.watch_connections();
    let client = TestClient::start(server.addr, &identity).await;
    let (_, to_client) = tokio::time::timeout(EVENTUALLY, connections.recv())
        .await
        .unwrap()
        .unwrap();

    for seq in 1..=3 {
        to_client.send(Push { seq }).await.unwrap();
    }
    let pushes = client.app.pushes.clone();
    assert!(wait_until(EVENTUALLY, || pushes.lock().len() == 3).await);

    // Cut the connection from the server side. Nothing tells the client the
    // session ended, so it reconnects to the same one.
    let session = server.sessions.get(&identity.guid).unwrap();
    session
        .channel()
        .frames()
        .current_connection()
        .expect("a connection is attached")
        .close();
    to_client.send(Push { seq: 4 }).await.unwrap();
    to_client.send(Push { seq: 5 }).await.unwrap();

    let (outcome, _) = tokio::time::timeout(EVENTUALLY, connections.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, HandshakeOutcome::ReusedSession);
    assert!(wait_until(EVENTUALLY, || pushes.lock().len() >= 5).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut seen = pushes.lock().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    assert_eq!(
        client.app.outcomes.lock().clone(),
        vec![HandshakeOutcome::NewSession, HandshakeOutcome::ReusedSession]
    );
    assert_eq!(client.app.restarts.load(Ordering::SeqCst), 0);
    assert!(Fixture::same_session(&server, &identity, client.client.session_guid()));

    client.stop().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_server_restart_starts_new_session() {
    let identity = Identity::random();
    let first = TestServer::start(std::slice::from_ref(&identity)).await;
    let addr = first.addr;
    let client = TestClient::start(addr, &identity).await;
    let sessions = first.sessions.clone();
    assert!(wait_until(EVENTUALLY, || sessions.len() == 1).await);

    // A crash: no SessionTermination, every socket just goes away.
    first.handle.abort();
    let _ = first.handle.await;

    let mut config = server_config();
    config.port = addr.port();
    let second = TestServer::with_config(config, std::slice::from_ref(&identity)).await;

    let app = client.app.clone();
    assert!(wait_until(EVENTUALLY, || app.restarts.load(Ordering::SeqCst) == 1).await);
    assert_eq!(
        app.outcomes.lock().clone(),
        vec![HandshakeOutcome::NewSession, HandshakeOutcome::NewSession]
    );
    // The session guid stays; only the server-side state is new.
    assert!(Fixture::same_session(&second, &identity, client.client.session_guid()));

    assert_eq!(client.stop().await.unwrap(), ClientExit::Cancelled);
    second.stop().await;
}

#[tokio::test]
async fn test_session_closed_without_notice_is_fatal_for_client() {
    let fixture = Fixture::connected().await;
    let sessions = fixture.server.sessions.clone();
    let guid = fixture.identity.guid;
    assert!(
        wait_until(EVENTUALLY, || {
            sessions.get(&guid).is_some_and(|s| s.state() == SessionState::Active)
        })
        .await
    );

    // Closed as if by the disconnect timer: the client is not told and its
    // next handshake is refused.
    let session = sessions.get(&guid).unwrap();
    sessions.close(&session, false).await;

    let exit = tokio::time::timeout(EVENTUALLY, fixture.client.handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exit.unwrap_err(), RpcError::SessionAlreadyClosed);

    fixture.server.stop().await;
}
