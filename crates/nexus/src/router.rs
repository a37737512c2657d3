//! HTTP router configuration

use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post, put},
};
use nexus_api::proto::{CA_CERT_PATH, STREAM_PATH};
use nexus_ca::ChallengeMap;

use crate::api::{acme, auth, client, records, rpc, ssh, stream, sync, system};
use crate::state::AppState;

/// Router for the agent port (served over TLS)
pub fn agent_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/version", get(system::version))
        .route(CA_CERT_PATH, get(client::ca_cert))
        .route("/client/{id}", get(client::client))
        .route("/client/{id}/health", get(client::client_health))
        .route(STREAM_PATH, get(stream::agent_stream))
        .with_state(state)
}

/// Router for the operator API
pub fn admin_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        // Certificate authority
        .route("/ssh/user/sign", post(ssh::sign_user))
        .route("/ssh/host/sign", post(ssh::sign_host))
        .route("/ssh/user/public", get(ssh::user_public_key))
        .route("/ssh/host/public", get(ssh::host_public_key))
        .route("/ssh/rotate", post(ssh::rotate))
        .route("/ssh/user/set", post(ssh::set_user_ca))
        // Agent token
        .route("/rpc/token", get(rpc::token))
        .route("/rpc/token/rotate", post(rpc::rotate_token))
        // Sweeps
        .route("/sync/machines", post(sync::sync_machines))
        .route("/sync/machines/{id}", post(sync::sync_machine))
        .route("/sync/agents", post(sync::sync_agents))
        .route("/sync/token", post(sync::sync_token))
        // Records
        .route(
            "/machines/{id}",
            put(records::put_machine).delete(records::delete_machine),
        )
        .route("/users/{id}", put(records::put_user).delete(records::delete_user))
        .route("/groups/{id}", put(records::put_group).delete(records::delete_group))
        .route("/settings", put(records::put_settings))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_admin));

    Router::new()
        .route("/health", get(system::api_health))
        .route("/version", get(system::api_version))
        .nest("/api", api)
        .with_state(state)
}

/// Plain-HTTP responder for ACME HTTP-01 challenges
pub fn acme_router(challenges: ChallengeMap) -> Router {
    Router::new()
        .route("/.well-known/acme-challenge/{token}", get(acme::challenge))
        .with_state(challenges)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt};
    use nexus_api::{StreamRequest, StreamResponse};
    use nexus_ca::{CaPaths, CertificateAuthority, TokenStore};
    use nexus_core::{
        CoreError, Machine, MemoryStore, ProtocolServer, Records, RegistryHandle, ReconcilerArgs,
        RemoteConverger, Store, Sweeper, spawn_reconciler,
    };
    use reqwest::StatusCode;
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use tokio::sync::RwLock;
    use tokio_tungstenite::tungstenite::{
        self, Message, client::IntoClientRequest, http::HeaderValue,
    };

    use super::*;
    use crate::config::Config;
    use crate::tls::{AcmeOptions, TlsManager};

    const ADMIN_TOKEN: &str = "admin-secret";

    #[derive(Default)]
    struct NoopConverger {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteConverger for NoopConverger {
        async fn manual_update(&self, machine_id: &str) -> Result<(), CoreError> {
            self.calls.lock().unwrap().push(format!("manual_update:{machine_id}"));
            Ok(())
        }

        async fn install_agent(&self, machine_id: &str) -> Result<(), CoreError> {
            self.calls.lock().unwrap().push(format!("install_agent:{machine_id}"));
            Ok(())
        }

        async fn restore(&self, machine: &Machine) -> Result<(), CoreError> {
            self.calls.lock().unwrap().push(format!("restore:{}", machine.id));
            Ok(())
        }

        async fn sync_agent_token(&self, machine_id: &str) -> Result<(), CoreError> {
            self.calls.lock().unwrap().push(format!("sync_agent_token:{machine_id}"));
            Ok(())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        state: Arc<AppState>,
    }

    async fn harness() -> Harness {
        harness_with(Some(ADMIN_TOKEN)).await
    }

    async fn harness_with(admin_token: Option<&str>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let paths = CaPaths::new(dir.path());

        let ca = Arc::new(CertificateAuthority::new(paths.clone()));
        ca.ensure_signing_keys().unwrap();
        let tokens = Arc::new(TokenStore::new(&paths));
        tokens.ensure().unwrap();

        let store: Arc<dyn Store> = Arc::new(MemoryStore::default());
        let records = Records::new(store.clone(), 64);
        let registry = RegistryHandle::spawn();
        let converger: Arc<dyn RemoteConverger> = Arc::new(NoopConverger::default());

        let reconciler = spawn_reconciler(
            ReconcilerArgs {
                store: store.clone(),
                registry: registry.clone(),
                converger: converger.clone(),
            },
            records.subscribe(),
        );
        let challenges = Arc::new(RwLock::new(HashMap::new()));
        let tls = TlsManager::start(paths, challenges, AcmeOptions::default(), Some("127.0.0.1"))
            .await
            .unwrap();

        let mut config = Config::default();
        config.daemon.admin_token = admin_token.map(str::to_string);

        let state = Arc::new(AppState {
            config: Arc::new(config),
            records,
            ca: ca.clone(),
            tokens: tokens.clone(),
            protocol: ProtocolServer::new(store.clone(), registry, ca, tokens.clone()),
            sweeper: Arc::new(Sweeper::new(store, converger, tokens)),
            reconciler,
            tls: Arc::new(tls),
        });
        Harness { _dir: dir, state }
    }

    async fn serve(router: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
                .await
                .unwrap();
        });
        addr
    }

    fn public_key() -> String {
        ssh_key::PrivateKey::random(&mut ssh_key::rand_core::OsRng, ssh_key::Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .to_openssh()
            .unwrap()
    }

    #[tokio::test]
    async fn test_admin_api_requires_token() {
        let h = harness().await;
        let addr = serve(admin_router(h.state.clone())).await;
        let http = reqwest::Client::new();

        let health = http.get(format!("http://{addr}/health")).send().await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let anonymous = http
            .get(format!("http://{addr}/api/ssh/user/public"))
            .send()
            .await
            .unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

        let body: Value = http
            .get(format!("http://{addr}/api/ssh/user/public"))
            .bearer_auth(ADMIN_TOKEN)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(body["key"].as_str().unwrap().starts_with("ssh-ed25519 "));
    }

    #[tokio::test]
    async fn test_admin_api_without_token_rejects_everything() {
        let h = harness_with(None).await;
        let addr = serve(admin_router(h.state.clone())).await;
        let http = reqwest::Client::new();

        let sign = http
            .post(format!("http://{addr}/api/ssh/user/sign"))
            .json(&json!({ "public_key": public_key() }))
            .send()
            .await
            .unwrap();
        assert_eq!(sign.status(), StatusCode::UNAUTHORIZED);

        let token = http
            .get(format!("http://{addr}/api/rpc/token"))
            .bearer_auth("guess")
            .send()
            .await
            .unwrap();
        assert_eq!(token.status(), StatusCode::UNAUTHORIZED);

        let health = http.get(format!("http://{addr}/health")).send().await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_wrong_admin_token_is_rejected() {
        let h = harness().await;
        let addr = serve(admin_router(h.state.clone())).await;
        let response = reqwest::Client::new()
            .get(format!("http://{addr}/api/rpc/token"))
            .bearer_auth("admin-secreT")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_sign_user_for_known_and_unknown_user() {
        let h = harness().await;
        let alice = h
            .state
            .records
            .put_user(nexus_core::User::new("u-1", "alice"))
            .await
            .unwrap();
        let addr = serve(admin_router(h.state.clone())).await;
        let http = reqwest::Client::new();

        let response = http
            .post(format!("http://{addr}/api/ssh/user/sign"))
            .bearer_auth(ADMIN_TOKEN)
            .json(&json!({ "public_key": public_key(), "user_id": "u-1", "ttl": 600 }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        let cert =
            ssh_key::Certificate::from_openssh(body["certificate"].as_str().unwrap()).unwrap();
        assert_eq!(cert.valid_principals(), &[alice.principal]);
        assert_eq!(cert.valid_before() - cert.valid_after(), 600);

        let missing = http
            .post(format!("http://{addr}/api/ssh/user/sign"))
            .bearer_auth(ADMIN_TOKEN)
            .json(&json!({ "public_key": public_key(), "user_id": "u-404" }))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let garbage = http
            .post(format!("http://{addr}/api/ssh/user/sign"))
            .bearer_auth(ADMIN_TOKEN)
            .json(&json!({ "public_key": "not a key" }))
            .send()
            .await
            .unwrap();
        assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_record_api_round_trip() {
        let h = harness().await;
        let addr = serve(admin_router(h.state.clone())).await;
        let http = reqwest::Client::new();

        let bad_group = http
            .put(format!("http://{addr}/api/groups/g-1"))
            .bearer_auth(ADMIN_TOKEN)
            .json(&json!({ "name": "ops", "linux_username": "../root" }))
            .send()
            .await
            .unwrap();
        assert_eq!(bad_group.status(), StatusCode::BAD_REQUEST);

        let machine: Value = http
            .put(format!("http://{addr}/api/machines/m-1"))
            .bearer_auth(ADMIN_TOKEN)
            .json(&json!({ "name": "web", "host": "10.0.0.5" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(machine["port"], 22);
        assert_eq!(machine["connected"], false);
        assert!(h.state.store().machine("m-1").await.unwrap().is_some());

        let deleted = http
            .delete(format!("http://{addr}/api/machines/m-1"))
            .bearer_auth(ADMIN_TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::OK);

        let again = http
            .delete(format!("http://{addr}/api/machines/m-1"))
            .bearer_auth(ADMIN_TOKEN)
            .send()
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_token_rotation_keeps_previous_valid() {
        let h = harness().await;
        let addr = serve(admin_router(h.state.clone())).await;
        let http = reqwest::Client::new();

        let before = h.state.tokens.current().unwrap();
        let body: Value = http
            .post(format!("http://{addr}/api/rpc/token/rotate"))
            .bearer_auth(ADMIN_TOKEN)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let after = body["token"].as_str().unwrap();
        assert_ne!(after, before);
        assert!(h.state.tokens.validate(&before).unwrap());
        assert!(h.state.tokens.validate(after).unwrap());
    }

    #[tokio::test]
    async fn test_agent_port_bootstrap_endpoints() {
        let h = harness().await;
        let addr = serve(agent_router(h.state.clone())).await;
        let http = reqwest::Client::new();

        let pem = http
            .get(format!("http://{addr}{CA_CERT_PATH}"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE"));

        let version = http.get(format!("http://{addr}/version")).send().await.unwrap();
        assert_eq!(version.text().await.unwrap(), env!("CARGO_PKG_VERSION"));

        let absent = http
            .get(format!("http://{addr}/client/m-9/health"))
            .send()
            .await
            .unwrap();
        assert_eq!(absent.status(), StatusCode::NOT_FOUND);
    }

    fn stream_request(addr: SocketAddr, token: &str) -> tungstenite::handshake::client::Request {
        let mut request = format!("ws://{addr}{STREAM_PATH}").into_client_request().unwrap();
        let headers = request.headers_mut();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers.insert("agentid", HeaderValue::from_static("agent-under-test"));
        headers.insert("hostname", HeaderValue::from_static("web-1"));
        request
    }

    async fn next_response<S>(socket: &mut S) -> StreamResponse
    where
        S: futures::Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        loop {
            match socket.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_stream_rejects_bad_token() {
        let h = harness().await;
        let addr = serve(agent_router(h.state.clone())).await;

        let err = tokio_tungstenite::connect_async(stream_request(addr, "wrong"))
            .await
            .unwrap_err();
        match err {
            tungstenite::Error::Http(response) => assert_eq!(response.status(), 401),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_stream_session_issues_host_certificate() {
        let h = harness().await;
        let addr = serve(agent_router(h.state.clone())).await;
        let token = h.state.tokens.current().unwrap();

        let (mut socket, _) = tokio_tungstenite::connect_async(stream_request(addr, &token))
            .await
            .unwrap();

        let init = next_response(&mut socket).await;
        assert!(init.ssh_config.is_some());
        assert!(init.user_certificate_authority_public_key.is_some());

        let request = StreamRequest {
            version: Some("test".to_string()),
            public_host_key: Some(public_key()),
        };
        socket
            .send(Message::Text(serde_json::to_string(&request).unwrap().into()))
            .await
            .unwrap();
        let reply = next_response(&mut socket).await;
        let cert = String::from_utf8(reply.host_certificate_public_key.unwrap()).unwrap();
        assert!(cert.ends_with('\n'));
        assert!(ssh_key::Certificate::from_openssh(cert.trim()).is_ok());

        let machines = h.state.store().machines().await.unwrap();
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].uuid.as_deref(), Some("agent-under-test"));
        assert_eq!(machines[0].name, "web-1");
        assert!(h.state.registry().is_connected(&machines[0].id).await.unwrap());

        socket.close(None).await.unwrap();
    }
}
