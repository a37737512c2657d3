//! Agent stream endpoint
//!
//! Metadata travels as HTTP headers on the upgrade request. Authentication and identity
//! binding happen before the upgrade so failures surface as plain HTTP statuses; once
//! upgraded, every text frame carries one JSON message.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt, future};
use nexus_api::StreamRequest;
use nexus_api::StreamResponse;
use nexus_api::proto::{HEADER_AGENT_ID, HEADER_AUTHORIZATION, HEADER_HOSTNAME};
use nexus_core::{AgentMetadata, Machine, ProtocolServer};
use tracing::{debug, info, warn};

use crate::api::error::AppError;
use crate::state::AppState;

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

pub(crate) fn metadata(headers: &HeaderMap, peer: SocketAddr) -> AgentMetadata {
    AgentMetadata {
        authorization: header(headers, HEADER_AUTHORIZATION),
        agent_id: header(headers, HEADER_AGENT_ID),
        hostname: header(headers, HEADER_HOSTNAME),
        remote_addr: peer.ip().to_canonical().to_string(),
    }
}

/// Authenticate, bind the machine identity, then hand the socket to the protocol server
///
/// # Errors
/// 401 for a bad token, 400 for missing metadata, 409 for an identity conflict
pub async fn agent_stream(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let meta = metadata(&headers, peer);
    let identity = state.protocol.authenticate(&meta).map_err(|e| {
        warn!(peer = %peer, error = %e, "agent rejected");
        e
    })?;
    let machine = state.protocol.bind_identity(&identity).await.map_err(|e| {
        warn!(peer = %peer, error = %e, "agent rejected");
        e
    })?;
    info!(machine = %machine.id, peer = %peer, "agent stream accepted");

    let protocol = state.protocol.clone();
    let failed_store = state.store().clone();
    let failed_id = machine.id.clone();
    Ok(ws
        .on_failed_upgrade(move |e| {
            warn!(machine = %failed_id, error = %e, "websocket upgrade failed");
            tokio::spawn(async move {
                let _ = failed_store
                    .modify_machine(&failed_id, Box::new(|m| m.connected = false))
                    .await;
            });
        })
        .on_upgrade(move |socket| serve(protocol, machine, socket)))
}

async fn serve(protocol: ProtocolServer, machine: Machine, socket: WebSocket) {
    let (sink, stream) = socket.split();

    let outgoing = sink.with(|response: StreamResponse| future::ready(encode(&response)));
    let incoming = stream
        .take_while(|frame| future::ready(!matches!(frame, Ok(Message::Close(_)))))
        .filter_map(|frame| future::ready(decode(frame)));

    let id = machine.id.clone();
    if let Err(e) = protocol
        .run_session(machine, Box::pin(incoming), Box::pin(outgoing))
        .await
    {
        warn!(machine = %id, error = %e, "agent session ended with error");
    }
}

fn encode(response: &StreamResponse) -> Result<Message, axum::Error> {
    serde_json::to_string(response)
        .map(|json| Message::Text(json.into()))
        .map_err(axum::Error::new)
}

fn decode(frame: Result<Message, axum::Error>) -> Option<Result<StreamRequest, String>> {
    match frame {
        Ok(Message::Text(text)) => match serde_json::from_str(text.as_str()) {
            Ok(request) => Some(Ok(request)),
            Err(e) => {
                warn!(error = %e, "dropping malformed agent frame");
                None
            }
        },
        Ok(other) => {
            debug!(frame = ?other, "ignoring non-text frame");
            None
        }
        Err(e) => Some(Err(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_metadata_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        headers.insert(HEADER_AGENT_ID, HeaderValue::from_static("agent-1"));
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 51234);

        let meta = metadata(&headers, peer);
        assert_eq!(meta.authorization.as_deref(), Some("Bearer abc"));
        assert_eq!(meta.agent_id.as_deref(), Some("agent-1"));
        assert_eq!(meta.hostname, None);
        assert_eq!(meta.remote_addr, "10.0.0.7");
    }

    #[test]
    fn test_decode_skips_malformed_and_control_frames() {
        assert!(decode(Ok(Message::Text("not json".into()))).is_none());
        assert!(decode(Ok(Message::Ping(Vec::new().into()))).is_none());

        let request = decode(Ok(Message::Text(r#"{"publicHostKey":"ssh-ed25519 AAAA"}"#.into())))
            .unwrap()
            .unwrap();
        assert_eq!(request.public_host_key.as_deref(), Some("ssh-ed25519 AAAA"));
    }

    #[test]
    fn test_encode_uses_text_frames() {
        let message = encode(&StreamResponse::restore()).unwrap();
        assert!(matches!(message, Message::Text(text) if text.as_str() == r#"{"restore":true}"#));
    }
}
