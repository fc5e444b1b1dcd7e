// tests/integration/handshake_test.rs

//! Handshake tests over an in-memory duplex stream, against the real session registry.

use super::test_helpers::{AppRef, ClientApp, Identity, ServerApp, ToClient, ToServer, init_tracing};
use async_trait::async_trait;
use craftlink::core::RpcError;
use craftlink::core::handshake::client::{self as client_handshake, EstablishedHandshake};
use craftlink::core::handshake::server::{self as server_handshake, ServerHandshakeParams};
use craftlink::core::handshake::{
    AuthResult, ClientHandshakeHook, HandshakeIo, HandshakeOutcome, NoHandshakeHook,
    StaticAuthProvider,
};
use craftlink::core::protocol::{AuthSecret, AuthToken, primitives};
use craftlink::core::rpc::FrameSenderConfig;
use craftlink::server::{Session, SessionRegistry, SessionSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

struct Harness {
    identity: Identity,
    auth: StaticAuthProvider,
    registry: SessionRegistry,
    app: AppRef,
    params: ServerHandshakeParams<ToClient, ToServer>,
}

impl Harness {
    fn new() -> Self {
        init_tracing();
        let identity = Identity::random();
        let auth = StaticAuthProvider::new().with_client(identity.guid, identity.secret.clone());
        let registry = SessionRegistry::new(SessionSettings {
            frame_sender: FrameSenderConfig::default(),
            disconnect_timeout: Duration::from_secs(60),
            grace_period: Duration::from_millis(100),
        });
        let app = AppRef(Box::leak(Box::new(ServerApp::default())));
        Self {
            identity,
            auth,
            registry,
            app,
            params: ServerHandshakeParams::new(Duration::from_secs(10)),
        }
    }

    fn token(&self) -> AuthToken {
        AuthToken {
            client_guid: self.identity.guid,
            secret: self.identity.secret.clone(),
        }
    }

    async fn run(
        &self,
        token: AuthToken,
        session_guid: Uuid,
        hook: &dyn ClientHandshakeHook,
    ) -> (
        Result<EstablishedHandshake, RpcError>,
        Result<server_handshake::AcceptedHandshake<Arc<Session>>, RpcError>,
    ) {
        let (mut client_end, mut server_end) = tokio::io::duplex(64 * 1024);
        let client = async {
            let res = client_handshake::perform::<_, ToClient, ToServer>(
                &mut client_end,
                &token,
                session_guid,
                hook,
            )
            .await;
            // Unblock the server if the client gave up early.
            let _ = client_end.shutdown().await;
            res
        };
        let server = server_handshake::perform(
            &mut server_end,
            &self.params,
            &self.auth,
            &self.registry,
            &self.app,
        );
        tokio::join!(client, server)
    }
}

#[tokio::test]
async fn test_new_then_reused_session() {
    let harness = Harness::new();
    let session_guid = Uuid::new_v4();
    let hook = ClientApp::default();

    let (client, server) = harness.run(harness.token(), session_guid, &hook).await;
    let client = client.unwrap();
    let server = server.unwrap();
    assert_eq!(client.outcome, HandshakeOutcome::NewSession);
    assert_eq!(server.outcome, HandshakeOutcome::NewSession);
    assert_eq!(client.ping_interval, Duration::from_secs(10));
    assert_eq!(server.session.session_guid(), session_guid);
    assert_eq!(server.client_guid, harness.identity.guid);
    assert_eq!(
        harness.app.0.agents.lock().clone(),
        vec![format!("agent-{}", harness.identity.guid)]
    );

    // Both ends agree on codes in each direction.
    assert_eq!(client.mappings.outbound.code_of("Echo"), Some(1));
    assert_eq!(server.mappings.inbound.code_of("Echo"), Some(1));
    assert_eq!(client.mappings.inbound.code_of("Query"), Some(1));
    assert_eq!(server.mappings.outbound.code_of("Query"), Some(1));

    let (client, server) = harness.run(harness.token(), session_guid, &hook).await;
    assert_eq!(client.unwrap().outcome, HandshakeOutcome::ReusedSession);
    assert_eq!(server.unwrap().outcome, HandshakeOutcome::ReusedSession);
    assert_eq!(harness.registry.len(), 1);
}

#[tokio::test]
async fn test_unknown_client_is_rejected_before_session_creation() {
    let harness = Harness::new();
    let token = AuthToken {
        client_guid: Uuid::new_v4(),
        secret: harness.identity.secret.clone(),
    };
    let (client, server) = harness
        .run(token, Uuid::new_v4(), &ClientApp::default())
        .await;
    assert_eq!(
        client.unwrap_err(),
        RpcError::AuthRejected(AuthResult::UnknownClient)
    );
    assert_eq!(
        server.unwrap_err(),
        RpcError::AuthRejected(AuthResult::UnknownClient)
    );
    assert!(harness.registry.is_empty());
}

#[tokio::test]
async fn test_wrong_secret_is_rejected() {
    let harness = Harness::new();
    let token = AuthToken {
        client_guid: harness.identity.guid,
        secret: AuthSecret::random(),
    };
    let (client, server) = harness
        .run(token, Uuid::new_v4(), &ClientApp::default())
        .await;
    assert_eq!(
        client.unwrap_err(),
        RpcError::AuthRejected(AuthResult::InvalidSecret)
    );
    assert!(server.is_err());
    assert!(harness.registry.is_empty());
}

#[tokio::test]
async fn test_closed_session_cannot_be_resumed() {
    let harness = Harness::new();
    let session_guid = Uuid::new_v4();
    let hook = ClientApp::default();
    let (_, server) = harness.run(harness.token(), session_guid, &hook).await;
    let session = server.unwrap().session;
    harness.registry.close(&session, true).await;
    assert!(harness.registry.is_closed(&session_guid));

    let (client, server) = harness.run(harness.token(), session_guid, &hook).await;
    assert_eq!(client.unwrap_err(), RpcError::SessionAlreadyClosed);
    assert_eq!(server.unwrap_err(), RpcError::SessionAlreadyClosed);

    // A fresh session guid is fine.
    let (client, _) = harness.run(harness.token(), Uuid::new_v4(), &hook).await;
    assert_eq!(client.unwrap().outcome, HandshakeOutcome::NewSession);
}

#[tokio::test]
async fn test_new_session_guid_replaces_previous_session() {
    let harness = Harness::new();
    let hook = ClientApp::default();
    let first = Uuid::new_v4();
    let (_, server) = harness.run(harness.token(), first, &hook).await;
    let old = server.unwrap().session;

    let (client, _) = harness.run(harness.token(), Uuid::new_v4(), &hook).await;
    assert_eq!(client.unwrap().outcome, HandshakeOutcome::NewSession);
    assert_eq!(harness.registry.len(), 1);
    // The old session is closed in the background.
    let registry = harness.registry.clone();
    assert!(
        super::test_helpers::wait_until(Duration::from_secs(2), || registry.is_closed(&first))
            .await
    );
    assert!(old.is_closed());
}

#[tokio::test]
async fn test_abandoned_handshake_discards_created_session() {
    let harness = Harness::new();
    let session_guid = Uuid::new_v4();
    let (mut client_end, mut server_end) = tokio::io::duplex(64 * 1024);

    // The client binds a session and then goes quiet inside the hook.
    primitives::write_auth_token(&mut client_end, &harness.token())
        .await
        .unwrap();
    primitives::write_guid(&mut client_end, &session_guid)
        .await
        .unwrap();
    let server = server_handshake::perform(
        &mut server_end,
        &harness.params,
        &harness.auth,
        &harness.registry,
        &harness.app,
    );
    let res = tokio::time::timeout(Duration::from_millis(100), server).await;
    assert!(res.is_err());
    assert!(harness.registry.is_empty());
    assert!(!harness.registry.is_closed(&session_guid));

    // The same session guid starts over as a new session.
    let (client, server) = harness
        .run(harness.token(), session_guid, &ClientApp::default())
        .await;
    assert_eq!(client.unwrap().outcome, HandshakeOutcome::NewSession);
    assert_eq!(server.unwrap().outcome, HandshakeOutcome::NewSession);
}

struct GarbageRegistration;

#[async_trait]
impl ClientHandshakeHook for GarbageRegistration {
    async fn on_handshake(&self, io: &mut HandshakeIo<'_>) -> Result<(), RpcError> {
        // An empty payload cannot decode as `Hello`.
        io.stream().write_all(&[0, 0, 0, 0]).await?;
        io.flush().await
    }
}

#[tokio::test]
async fn test_hook_failure_reports_error_and_discards_session() {
    let harness = Harness::new();
    let (client, server) = harness
        .run(harness.token(), Uuid::new_v4(), &GarbageRegistration)
        .await;
    assert!(matches!(client.unwrap_err(), RpcError::HandshakeFailed(_)));
    assert!(matches!(server.unwrap_err(), RpcError::HandshakeFailed(_)));
    assert!(harness.registry.is_empty());
}

#[tokio::test]
async fn test_registration_helper_rejects_other_kinds() {
    struct WrongKind;

    #[async_trait]
    impl ClientHandshakeHook for WrongKind {
        async fn on_handshake(&self, io: &mut HandshakeIo<'_>) -> Result<(), RpcError> {
            io.send_registration(&ToServer::Notice(super::test_helpers::Notice { seq: 1 }))
                .await
        }
    }

    let harness = Harness::new();
    let (client, _) = harness
        .run(harness.token(), Uuid::new_v4(), &WrongKind)
        .await;
    assert_eq!(
        client.unwrap_err(),
        RpcError::HandshakeFailed(RpcError::UnsupportedMessageType("Notice").to_string())
    );
}

#[tokio::test]
async fn test_no_hook_on_both_sides() {
    init_tracing();
    let identity = Identity::random();
    let auth = StaticAuthProvider::new().with_client(identity.guid, identity.secret.clone());
    let registry = SessionRegistry::new(SessionSettings {
        frame_sender: FrameSenderConfig::default(),
        disconnect_timeout: Duration::from_secs(60),
        grace_period: Duration::ZERO,
    });
    let params = ServerHandshakeParams::<ToClient, ToServer>::new(Duration::ZERO);
    let token = AuthToken {
        client_guid: identity.guid,
        secret: identity.secret.clone(),
    };
    let (mut a, mut b) = tokio::io::duplex(4096);
    let (client, server) = tokio::join!(
        client_handshake::perform::<_, ToClient, ToServer>(
            &mut a,
            &token,
            Uuid::new_v4(),
            &NoHandshakeHook
        ),
        server_handshake::perform(&mut b, &params, &auth, &registry, &NoHandshakeHook),
    );
    // A zero interval is announced as one second.
    assert_eq!(client.unwrap().ping_interval, Duration::from_secs(1));
    assert!(server.is_ok());
}
