//! ControlClient against a live control endpoint

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use bm_core::config::{PortRange, SessionConfig};
use bm_core::{RelayTarget, Role, SessionId, SessionState};
use bm_relay::{CloseTarget, ControlServer, SessionRegistry};
use bridgeme::control::ControlClient;

async fn setup() -> (Arc<SessionRegistry>, String, CancellationToken) {
    let registry = Arc::new(SessionRegistry::new(
        SessionConfig::default(),
        PortRange::default(),
    ));
    let server = ControlServer::bind("127.0.0.1:0", Arc::clone(&registry))
        .await
        .expect("Failed to bind control server");
    let address = server.local_addr().expect("No local address").to_string();
    let cancel = CancellationToken::new();
    tokio::spawn(server.run(cancel.clone()));
    (registry, address, cancel)
}

#[tokio::test]
async fn test_ping_and_list() {
    let (registry, address, cancel) = setup().await;
    let info = registry
        .create(Role::Host, RelayTarget::new("relay.test", 22), None, None)
        .await
        .unwrap();

    let mut client = ControlClient::connect(&address).await.unwrap();
    assert_eq!(client.address(), address);
    assert!(client.ping().await.unwrap());

    let sessions = client.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, info.id);

    cancel.cancel();
}

#[tokio::test]
async fn test_close_unknown_session_is_error() {
    let (_registry, address, cancel) = setup().await;

    let mut client = ControlClient::connect(&address).await.unwrap();
    let err = client
        .close_session(SessionId::from("0badcafe"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
    // The connection stays usable
    assert_eq!(client.close_all().await.unwrap(), 0);

    cancel.cancel();
}

#[tokio::test]
async fn test_watch_reports_changes() {
    let (registry, address, cancel) = setup().await;

    let mut client = ControlClient::connect(&address).await.unwrap();
    assert!(client.watch().await.unwrap().is_empty());

    let info = registry
        .create(Role::Host, RelayTarget::new("relay.test", 22), None, None)
        .await
        .unwrap();
    let created = timeout(Duration::from_secs(5), client.next_event())
        .await
        .expect("No event within 5s")
        .unwrap()
        .expect("Endpoint closed");
    assert_eq!(created.session_id, info.id);
    assert_eq!(created.from, None);
    assert_eq!(created.to, Some(SessionState::Pending));

    registry.close(CloseTarget::One(info.id.clone())).await.unwrap();
    let closing = timeout(Duration::from_secs(5), client.next_event())
        .await
        .expect("No event within 5s")
        .unwrap()
        .expect("Endpoint closed");
    assert_eq!(closing.to, Some(SessionState::Closing));
    assert_eq!(closing.reason.as_deref(), Some("closed by request"));

    cancel.cancel();
}

#[tokio::test]
async fn test_connect_without_endpoint() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let result = ControlClient::connect(&format!("127.0.0.1:{}", port)).await;
    let err = result.err().expect("connect should fail");
    assert!(err.to_string().contains("No bridgeme host is running"));
}
