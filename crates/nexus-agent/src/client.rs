//! Agent side of the control-plane stream
//!
//! Each connect attempt fetches the control-plane root certificate, pins it for the
//! WebSocket handshake, sends one request carrying the host key, and then applies pushes
//! until the stream ends. Attempts repeat with a fixed delay.

use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use nexus_api::proto::{
    CA_CERT_PATH, HEADER_AGENT_ID, HEADER_AUTHORIZATION, HEADER_HOSTNAME, STREAM_PATH,
};
use nexus_api::{StreamRequest, StreamResponse};
use rustls::{ClientConfig, RootCertStore};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{Connector, connect_async_tls_with_config};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::apply::{Applied, Applier};
use crate::error::{AgentError, Result};
use crate::identity;
use crate::paths::AgentPaths;
use crate::renew::{CHECK_INTERVAL, renewal_monitor};

pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server: String,
    pub port: u16,
}

impl AgentConfig {
    fn base_url(&self) -> Result<Url> {
        Ok(Url::parse(&format!("https://{}:{}", self.server, self.port))?)
    }
}

/// How one connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Closed,
    Terminate,
}

pub struct Agent {
    config: AgentConfig,
    paths: AgentPaths,
    applier: Applier,
}

impl Agent {
    pub fn new(config: AgentConfig, paths: AgentPaths) -> Self {
        let applier = Applier::new(paths.clone());
        Self {
            config,
            paths,
            applier,
        }
    }

    /// Connect forever, until `shutdown` fires, a restore arrives, or a fatal error occurs
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let agent_id = identity::machine_id(&self.paths).await?;
        let hostname = identity::hostname().await;
        let host_key = identity::ensure_host_key(&self.paths).await?;
        info!(%agent_id, %hostname, server = %self.config.server, "agent starting");

        loop {
            match self.connect_once(&agent_id, &hostname, &host_key, &shutdown).await {
                Ok(Exit::Terminate) => {
                    info!("restore complete, exiting");
                    return Ok(());
                }
                Ok(Exit::Closed) => info!("stream closed"),
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "fatal agent error");
                    return Err(e);
                }
                Err(e) => warn!(
                    error = %e,
                    delay = ?RECONNECT_DELAY,
                    "connection failed, retrying"
                ),
            }

            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                () = sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    async fn connect_once(
        &self,
        agent_id: &str,
        hostname: &str,
        host_key: &str,
        shutdown: &CancellationToken,
    ) -> Result<Exit> {
        let token = identity::token(&self.paths).await?;
        let base = self.config.base_url()?;
        let root_pem = fetch_root_certificate(&base).await?;
        let tls = pinned_client_config(&root_pem)?;

        let mut url = base.join(STREAM_PATH)?;
        url.set_scheme("wss")
            .map_err(|()| AgentError::WebSocket("cannot use wss scheme".to_string()))?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| AgentError::WebSocket(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(HEADER_AUTHORIZATION, header(&format!("Bearer {token}"))?);
        headers.insert(HEADER_AGENT_ID, header(agent_id)?);
        headers.insert(HEADER_HOSTNAME, header(hostname)?);

        let connector = Some(Connector::Rustls(tls));
        let (ws_stream, _) = connect_async_tls_with_config(request, None, false, connector)
            .await
            .map_err(|e| AgentError::WebSocket(e.to_string()))?;
        info!(url = %url, "connected to control plane");

        let (mut write, mut read) = ws_stream.split();
        let (requests, mut outgoing) = mpsc::unbounded_channel::<StreamRequest>();
        let _ = requests.send(StreamRequest {
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            public_host_key: Some(host_key.to_string()),
        });

        // Everything scoped to this connection stops when it ends
        let scope = shutdown.child_token();
        let _scope_guard = scope.clone().drop_guard();
        tokio::spawn(renewal_monitor(
            self.paths.host_certificate(),
            host_key.to_string(),
            requests,
            scope.clone(),
            CHECK_INTERVAL,
        ));

        loop {
            tokio::select! {
                () = scope.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(Exit::Closed);
                }
                Some(request) = outgoing.recv() => {
                    let text = serde_json::to_string(&request)?;
                    write
                        .send(Message::text(text))
                        .await
                        .map_err(|e| AgentError::WebSocket(e.to_string()))?;
                    debug!("sent stream request");
                }
                msg = read.next() => {
                    let Some(msg) = msg else {
                        return Err(AgentError::ConnectionClosed("stream ended".into()));
                    };
                    match msg.map_err(|e| AgentError::WebSocket(e.to_string()))? {
                        Message::Text(text) => {
                            if self.handle_push(&text).await == Applied::Terminate {
                                let _ = write.send(Message::Close(None)).await;
                                return Ok(Exit::Terminate);
                            }
                        }
                        Message::Close(_) => return Ok(Exit::Closed),
                        Message::Ping(_)
                        | Message::Pong(_)
                        | Message::Binary(_)
                        | Message::Frame(_) => {}
                    }
                }
            }
        }
    }

    /// Apply one pushed frame; failures are logged and the stream stays up
    async fn handle_push(&self, text: &str) -> Applied {
        let response: StreamResponse = match serde_json::from_str(text) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "unparsable push");
                return Applied::Continue;
            }
        };
        match self.applier.apply(&response).await {
            Ok(applied) => applied,
            Err(e) => {
                error!(error = %e, "failed to apply push");
                Applied::Continue
            }
        }
    }
}

fn header(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| AgentError::WebSocket(format!("invalid header value: {e}")))
}

/// Download the control-plane root; the bootstrap request alone skips verification
async fn fetch_root_certificate(base: &Url) -> Result<String> {
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(BOOTSTRAP_TIMEOUT)
        .build()?;
    let response = client.get(base.join(CA_CERT_PATH)?).send().await?.error_for_status()?;
    Ok(response.text().await?)
}

/// Client config trusting the fetched root and the public web PKI
pub fn pinned_client_config(root_pem: &str) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let mut added = 0;
    for cert in rustls_pemfile::certs(&mut BufReader::new(root_pem.as_bytes())) {
        let cert = cert.map_err(|e| AgentError::Tls(e.to_string()))?;
        roots.add(cert).map_err(|e| AgentError::Tls(e.to_string()))?;
        added += 1;
    }
    if added == 0 {
        return Err(AgentError::Tls("no certificate in root bundle".to_string()));
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| AgentError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        let config = AgentConfig {
            server: "10.0.0.1".to_string(),
            port: 8091,
        };
        let url = config.base_url().unwrap().join(STREAM_PATH).unwrap();
        assert_eq!(url.as_str(), "https://10.0.0.1:8091/agent/stream");
    }

    #[tokio::test]
    async fn test_apply_failure_keeps_stream_open() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AgentPaths::new(Some(dir.path().to_path_buf()));
        let blocked = paths.ssh_config().parent().unwrap().to_path_buf();
        std::fs::create_dir_all(blocked.parent().unwrap()).unwrap();
        std::fs::write(&blocked, b"").unwrap();
        let agent = Agent::new(
            AgentConfig {
                server: "127.0.0.1".to_string(),
                port: 8091,
            },
            paths.clone(),
        );

        let push = serde_json::to_string(&StreamResponse {
            ssh_config: Some(b"X\n".to_vec()),
            principals: vec![nexus_api::Principal {
                key: "deploy".to_string(),
                values: vec!["abc-123".to_string()],
            }],
            ..StreamResponse::default()
        })
        .unwrap();
        assert_eq!(agent.handle_push(&push).await, Applied::Continue);
        assert!(paths.principals_dir().join("deploy").exists());

        assert_eq!(agent.handle_push("not json").await, Applied::Continue);
        let restore = serde_json::to_string(&StreamResponse::restore()).unwrap();
        assert_eq!(agent.handle_push(&restore).await, Applied::Terminate);
    }

    #[test]
    fn test_empty_root_bundle_is_rejected() {
        assert!(matches!(pinned_client_config(""), Err(AgentError::Tls(_))));
    }

    #[test]
    fn test_pinned_config_accepts_generated_root() {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::default();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let root = params.self_signed(&key).unwrap();
        assert!(pinned_client_config(&root.pem()).is_ok());
    }
}
