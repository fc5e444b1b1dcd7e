// tests/integration/auth_test.rs

//! Authentication and connection failures as seen by `RpcClient`.

use super::fixtures::EVENTUALLY;
use super::test_helpers::{
    AppRef, ClientApp, Identity, ServerApp, TestServer, ToClient, ToServer, client_config,
    init_tracing, server_config, wait_until,
};
use craftlink::client::{ClientExit, RpcClient};
use craftlink::config::{ClientCredentials, RpcClientConfig};
use craftlink::core::RpcError;
use craftlink::core::handshake::{AuthResult, HandshakeOutcome};
use craftlink::core::protocol::primitives::{self, AuthToken};
use craftlink::core::protocol::AuthSecret;
use craftlink::server::RpcServer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

type Client = RpcClient<ToClient, ToServer, ClientApp>;

fn client(config: RpcClientConfig) -> Client {
    RpcClient::new(config, Arc::new(ClientApp::default())).unwrap()
}

/// An address nothing listens on.
async fn dead_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

#[tokio::test]
async fn test_unknown_client_is_rejected() {
    let server = TestServer::start(&[]).await;
    let client = client(client_config(server.addr, &Identity::random()));

    let err = client.connect_with_retry(3).await.unwrap_err();
    assert_eq!(err, RpcError::AuthRejected(AuthResult::UnknownClient));
    assert!(server.sessions.is_empty());
    assert!(server.app.agents.lock().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_wrong_secret_ends_run() {
    let identity = Identity::random();
    let server = TestServer::start(std::slice::from_ref(&identity)).await;
    let impostor = Identity {
        guid: identity.guid,
        secret: AuthSecret::random(),
    };
    let client = client(client_config(server.addr, &impostor));

    let result = tokio::time::timeout(EVENTUALLY, client.run(CancellationToken::new()))
        .await
        .unwrap();
    assert_eq!(
        result.unwrap_err(),
        RpcError::AuthRejected(AuthResult::InvalidSecret)
    );
    assert!(client.sender().is_closed());
    assert!(server.sessions.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_clients_from_config_table() {
    init_tracing();
    let identity = Identity::random();
    let mut config = server_config();
    config.clients.push(ClientCredentials {
        guid: identity.guid,
        secret: identity.secret.to_hex(),
    });
    let auth = config.auth_provider().unwrap();
    let app: &'static ServerApp = Box::leak(Box::new(ServerApp::default()));
    let server = RpcServer::bind(config, Arc::new(AppRef(app)), Arc::new(auth))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(server.run(shutdown.clone()));

    let client = client(client_config(addr, &identity));
    assert_eq!(
        client.connect_with_retry(3).await.unwrap(),
        HandshakeOutcome::NewSession
    );

    shutdown.cancel();
    tokio::time::timeout(EVENTUALLY, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_connection_refused_gives_up_after_max_attempts() {
    init_tracing();
    let client = client(client_config(dead_address().await, &Identity::random()));
    let err = client.connect_with_retry(2).await.unwrap_err();
    assert!(matches!(err, RpcError::Io(_)), "unexpected error {err:?}");
}

#[tokio::test]
async fn test_configured_attempt_limit() {
    init_tracing();
    let mut config = client_config(dead_address().await, &Identity::random());
    config.backoff.max_attempts = Some(1);
    let client = client(config);
    assert!(client.connect().await.is_err());
}

#[tokio::test]
async fn test_silent_server_hits_client_handshake_timeout() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let mut config = client_config(addr, &Identity::random());
    config.handshake_timeout = Duration::from_millis(100);
    let client = client(config);
    let err = client.connect_with_retry(1).await.unwrap_err();
    assert_eq!(err, RpcError::HandshakeTimeout);
}

#[tokio::test]
async fn test_silent_client_hits_server_handshake_timeout() {
    let mut config = server_config();
    config.handshake_timeout = Duration::from_millis(200);
    let server = TestServer::with_config(config, &[]).await;

    let mut socket = TcpStream::connect(server.addr).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(EVENTUALLY, socket.read(&mut buf))
        .await
        .expect("server should drop the socket");
    assert!(matches!(read, Ok(0) | Err(_)));

    server.stop().await;
}

#[tokio::test]
async fn test_client_stalling_in_hook_leaves_no_session() {
    let identity = Identity::random();
    let mut config = server_config();
    config.handshake_timeout = Duration::from_millis(200);
    config.disconnect_session_timeout = Duration::from_secs(60);
    let server = TestServer::with_config(config, std::slice::from_ref(&identity)).await;

    // Authenticate and bind a session, then never send the registration.
    let mut socket = TcpStream::connect(server.addr).await.unwrap();
    let token = AuthToken {
        client_guid: identity.guid,
        secret: identity.secret.clone(),
    };
    primitives::write_auth_token(&mut socket, &token).await.unwrap();
    assert_eq!(
        primitives::read_byte(&mut socket).await.unwrap(),
        AuthResult::Success.as_u8()
    );
    primitives::write_guid(&mut socket, &uuid::Uuid::new_v4()).await.unwrap();

    let mut buf = Vec::new();
    tokio::time::timeout(EVENTUALLY, socket.read_to_end(&mut buf))
        .await
        .expect("server should drop the socket")
        .ok();
    let sessions = server.sessions.clone();
    assert!(wait_until(EVENTUALLY, || sessions.is_empty()).await);

    // The client can still connect normally and gets a fresh session.
    let client = client(client_config(server.addr, &identity));
    assert_eq!(client.connect().await.unwrap(), HandshakeOutcome::NewSession);

    server.stop().await;
}

#[tokio::test]
async fn test_cancel_while_reconnecting() {
    init_tracing();
    let client = Arc::new(client(client_config(dead_address().await, &Identity::random())));
    let cancel = CancellationToken::new();
    let runner = client.clone();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { runner.run(token).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    let exit = tokio::time::timeout(EVENTUALLY, handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(exit.unwrap(), ClientExit::Cancelled);
    assert!(client.sender().is_closed());
}
