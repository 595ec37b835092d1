//! Shared test fixtures

use portway_connection::{Session, SessionEvent};
use portway_proto::Side;
use portway_transport::{dial, DialOptions, WsListener, WsListenerConfig};
use tokio::sync::mpsc;

/// A real session pair over a loopback websocket: (server session, server
/// events, agent session, agent events).
pub async fn ws_session_pair() -> (
    Session,
    mpsc::Receiver<SessionEvent>,
    Session,
    mpsc::Receiver<SessionEvent>,
) {
    let listener = WsListener::bind("127.0.0.1:0".parse().unwrap(), WsListenerConfig::default())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
    let agent_transport = dial(&DialOptions {
        url: format!("ws://{addr}"),
        ..Default::default()
    })
    .await
    .unwrap();
    let (server_transport, _peer) = accept.await.unwrap();

    let (server_session, server_events) = Session::start(server_transport, Side::Server);
    let (agent_session, agent_events) = Session::start(agent_transport, Side::Agent);

    (server_session, server_events, agent_session, agent_events)
}
