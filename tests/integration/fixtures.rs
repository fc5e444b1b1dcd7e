// tests/integration/fixtures.rs

//! A running server with one connected client, the starting point of most
//! end-to-end tests.

use super::test_helpers::{Identity, TestClient, TestServer, client_config, server_config};
use craftlink::config::{RpcClientConfig, RpcServerConfig};
use std::time::Duration;

/// Generous bound for anything that should happen "promptly".
pub const EVENTUALLY: Duration = Duration::from_secs(5);

/// Request timeout used by tests that expect a reply.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Fixture {
    pub identity: Identity,
    pub server: TestServer,
    pub client: TestClient,
}

impl Fixture {
    pub async fn connected() -> Self {
        Self::with_configs(server_config(), |config| config).await
    }

    pub async fn with_server_config(config: RpcServerConfig) -> Self {
        Self::with_configs(config, |config| config).await
    }

    /// Starts the server, then a client whose config `adjust` may change.
    pub async fn with_configs(
        server: RpcServerConfig,
        adjust: impl FnOnce(RpcClientConfig) -> RpcClientConfig,
    ) -> Self {
        let identity = Identity::random();
        let server = TestServer::with_config(server, std::slice::from_ref(&identity)).await;
        let client = TestClient::with_config(adjust(client_config(server.addr, &identity))).await;
        Self {
            identity,
            server,
            client,
        }
    }
}

impl Fixture {
    /// True if the server holds `session_guid` as the live session of `identity`.
    pub fn same_session(server: &TestServer, identity: &Identity, session_guid: uuid::Uuid) -> bool {
        server
            .sessions
            .get(&identity.guid)
            .is_some_and(|s| s.session_guid() == session_guid)
    }
}
