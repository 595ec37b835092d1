//! Agent connection handling
//!
//! One task per inbound transport: host-key proof, credential check,
//! connection-request validation with the duplicate-id policy, then the
//! request serving loop until the link drops. Session teardown funnels
//! through [`PortwayServer::handle_disconnect`] so tunnels always close
//! before the registry records the disconnect.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use portway_connection::{handshake, IncomingRequest, Session, SessionEvent};
use portway_proto::{requests, ConnectionRequest, ControlMessage, Side, UpdatesStatus};
use portway_transport::Transport;

use crate::clients::Client;
use crate::error::Error;
use crate::server::PortwayServer;

/// Per-message handshake deadline.
const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum client id length.
const MAX_CLIENT_ID_LEN: usize = 64;

pub(crate) async fn serve_connection(
    server: Arc<PortwayServer>,
    mut transport: Box<dyn Transport>,
    peer: SocketAddr,
) {
    debug!(peer = %peer, "incoming control connection");

    // Host-key proof: the agent sends a nonce, we sign it.
    let nonce = match handshake::recv(transport.as_mut(), HANDSHAKE_STEP_TIMEOUT).await {
        Ok(ControlMessage::Hello { nonce }) => nonce,
        Ok(other) => {
            debug!(peer = %peer, message = ?other, "expected hello");
            return;
        }
        Err(e) => {
            debug!(peer = %peer, error = %e, "handshake failed before hello");
            return;
        }
    };

    let server_hello = ControlMessage::ServerHello {
        public_key: server.identity.public_key(),
        signature: server.identity.sign(&nonce),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    if let Err(e) = handshake::send(transport.as_mut(), &server_hello).await {
        debug!(peer = %peer, error = %e, "failed to send server hello");
        return;
    }

    // Credential check.
    let (auth_id, password) =
        match handshake::recv(transport.as_mut(), HANDSHAKE_STEP_TIMEOUT).await {
            Ok(ControlMessage::AuthRequest { auth_id, password }) => (auth_id, password),
            Ok(other) => {
                debug!(peer = %peer, message = ?other, "expected auth request");
                return;
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "handshake failed before auth");
                return;
            }
        };

    let authenticated = match server.auth.get(&auth_id).await {
        Ok(Some(auth)) => auth.verify(&password),
        Ok(None) => false,
        Err(e) => {
            warn!(peer = %peer, error = %e, "auth store lookup failed");
            false
        }
    };
    if !authenticated {
        info!(peer = %peer, auth_id = %auth_id, "authentication rejected");
        let _ = handshake::send(
            transport.as_mut(),
            &ControlMessage::AuthFailure {
                reason: "invalid credentials".to_string(),
            },
        )
        .await;
        return;
    }
    if let Err(e) = handshake::send(transport.as_mut(), &ControlMessage::AuthOk).await {
        debug!(peer = %peer, error = %e, "failed to confirm auth");
        return;
    }

    // The mux takes over; the connection request arrives as the first
    // global request.
    let (session, mut events) = Session::start(transport, Side::Server);

    let first = match tokio::time::timeout(HANDSHAKE_STEP_TIMEOUT, events.recv()).await {
        Ok(Some(SessionEvent::Request(req))) if req.name == requests::CONNECTION_REQUEST => req,
        Ok(_) | Err(_) => {
            debug!(peer = %peer, "no connection request after auth");
            session.close();
            return;
        }
    };

    let (client_id, token) =
        match establish(&server, &session, &auth_id, peer, first).await {
            Ok(established) => established,
            Err(()) => {
                session.close();
                return;
            }
        };

    // Serve requests until the link drops.
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Request(request) => {
                handle_request(&server, &session, &client_id, request).await;
            }
            SessionEvent::Channel(incoming) => {
                // Tunnels are server-initiated; agents never open channels.
                let _ = session
                    .reject_channel(&incoming, "server does not accept channels")
                    .await;
            }
            SessionEvent::Closed => break,
        }
    }

    server.handle_disconnect(&client_id, token).await;
}

/// Validate the connection request, apply the duplicate-id policy, register
/// the client and bind its remotes. Replies to the request either way.
async fn establish(
    server: &Arc<PortwayServer>,
    session: &Session,
    auth_id: &str,
    peer: SocketAddr,
    request: IncomingRequest,
) -> Result<(String, u64), ()> {
    if request.payload.len() > server.config.max_request_bytes {
        warn!(peer = %peer, bytes = request.payload.len(), "connection request too large");
        let _ = session
            .reply(request.id, Err("connection request too large".to_string()))
            .await;
        return Err(());
    }

    let conn_req: ConnectionRequest = match serde_json::from_slice(&request.payload) {
        Ok(req) => req,
        Err(e) => {
            let _ = session
                .reply(request.id, Err(format!("invalid connection request: {e}")))
                .await;
            return Err(());
        }
    };

    // Resolve the client id.
    let client_id = if conn_req.id.is_empty() {
        if server.config.equate_clientauthid_clientid {
            auth_id.to_string()
        } else {
            Uuid::new_v4().to_string()
        }
    } else {
        conn_req.id.clone()
    };
    if client_id.len() > MAX_CLIENT_ID_LEN {
        let _ = session
            .reply(
                request.id,
                Err(format!("client id exceeds {MAX_CLIENT_ID_LEN} characters")),
            )
            .await;
        return Err(());
    }

    for remote in &conn_req.remotes {
        if let Err(e) = remote.validate() {
            let _ = session.reply(request.id, Err(e.to_string())).await;
            return Err(());
        }
    }

    // Claim the slot; the duplicate-id policy lives here.
    let (token, displaced) = match server.claim_client_slot(&client_id, session.clone()) {
        Ok(claimed) => claimed,
        Err(e) => {
            info!(client_id = %client_id, error = %e, "connection rejected");
            let _ = session.reply(request.id, Err(e.to_string())).await;
            return Err(());
        }
    };
    if let Some(old) = displaced {
        info!(client_id = %client_id, "displacing previous connection");
        server.teardown_conn(&client_id, old).await;
    }

    // Reuse the non-obsolete record for its operator-managed fields.
    let previous = server.registry.get_by_id(&client_id);
    let mut client = Client::from_connection_request(
        &conn_req,
        client_id.clone(),
        auth_id.to_string(),
        peer.to_string(),
    );
    if let Some(previous) = previous {
        client.allowed_user_groups = previous.allowed_user_groups;
        client.updates_status = previous.updates_status;
    }

    if let Err(e) = server.registry.save(&client).await {
        warn!(client_id = %client_id, error = %e, "failed to persist client");
        let _ = session.reply(request.id, Err(e.to_string())).await;
        server.handle_disconnect(&client_id, token).await;
        return Err(());
    }

    // Bind the requested tunnels and answer with the accepted remotes.
    let accepted = match server
        .bind_remotes(&client_id, token, conn_req.remotes.clone())
        .await
    {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!(client_id = %client_id, error = %e, "failed to bind remotes");
            let _ = session.reply(request.id, Err(e.to_string())).await;
            server.handle_disconnect(&client_id, token).await;
            return Err(());
        }
    };

    let body = match serde_json::to_vec(&accepted) {
        Ok(body) => body,
        Err(e) => {
            let _ = session.reply(request.id, Err(e.to_string())).await;
            server.handle_disconnect(&client_id, token).await;
            return Err(());
        }
    };
    if session.reply(request.id, Ok(body)).await.is_err() {
        server.handle_disconnect(&client_id, token).await;
        return Err(());
    }

    info!(
        client_id = %client_id,
        peer = %peer,
        tunnels = accepted.len(),
        "client connected"
    );
    Ok((client_id, token))
}

async fn handle_request(
    server: &Arc<PortwayServer>,
    session: &Session,
    client_id: &str,
    request: IncomingRequest,
) {
    if request.payload.len() > server.config.max_request_bytes {
        let _ = session
            .reply(request.id, Err("request too large".to_string()))
            .await;
        return;
    }

    let outcome: Result<Vec<u8>, Error> = match request.name.as_str() {
        requests::PING => Ok(Vec::new()),

        requests::CMD_RESULT => match serde_json::from_slice(&request.payload) {
            Ok(result) => server
                .jobs
                .finalize(client_id, &result)
                .await
                .map(|()| Vec::new()),
            Err(e) => Err(Error::Validation(format!("invalid cmd_result: {e}"))),
        },

        requests::UPDATES_STATUS => match serde_json::from_slice::<UpdatesStatus>(&request.payload)
        {
            Ok(status) => {
                let updated = match server.registry.get_by_id(client_id) {
                    Some(mut client) => {
                        client.updates_status = Some(status);
                        server.registry.save(&client).await.map(|()| Vec::new())
                    }
                    None => Err(Error::NotFound(format!("client {client_id:?}"))),
                };
                updated
            }
            Err(e) => Err(Error::Validation(format!("invalid updates_status: {e}"))),
        },

        requests::CONNECTION_REQUEST => Err(Error::Conflict(
            "connection request already processed".to_string(),
        )),

        other => Err(Error::Validation(format!("unknown request: {other}"))),
    };

    let reply = match outcome {
        Ok(body) => Ok(body),
        Err(e) => {
            debug!(client_id = %client_id, request = %request.name, error = %e, "request failed");
            Err(e.to_string())
        }
    };
    if session.reply(request.id, reply).await.is_err() {
        debug!(client_id = %client_id, "failed to reply; session gone");
    }
}
