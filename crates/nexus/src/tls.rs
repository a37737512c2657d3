//! TLS for the agent port
//!
//! [`TlsListener`] plugs a rustls acceptor into `axum::serve`. Every handshake reads the
//! current serving configuration from a watch channel, so a regenerated leaf or a renewed
//! ACME certificate applies to the next connection without a restart. [`TlsManager`] owns
//! that channel and keeps the certificate current.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use nexus_ca::{AcmeProvisioner, CaError, CaPaths, ChallengeMap, TlsIdentity, TlsMode};
use nexus_core::{ChangeEvent, Records, Store};
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Semaphore, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const ACCEPT_BACKLOG: usize = 64;
/// Handshakes in flight before the accept loop stops taking new connections
const MAX_PENDING_HANDSHAKES: usize = 256;

/// Certificate check interval for the maintenance task
pub const RENEWAL_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Accepts TCP connections and yields them once the TLS handshake completed
pub struct TlsListener {
    incoming: mpsc::Receiver<(TlsStream<TcpStream>, SocketAddr)>,
    local_addr: SocketAddr,
}

impl TlsListener {
    /// Start accepting on `listener`; handshakes run concurrently in their own tasks
    ///
    /// # Errors
    /// Returns error if the listener has no local address
    pub fn new(
        listener: TcpListener,
        config: watch::Receiver<Arc<ServerConfig>>,
    ) -> io::Result<Self> {
        Self::with_handshake_limit(listener, config, MAX_PENDING_HANDSHAKES)
    }

    fn with_handshake_limit(
        listener: TcpListener,
        config: watch::Receiver<Arc<ServerConfig>>,
        max_pending: usize,
    ) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (tx, incoming) = mpsc::channel(ACCEPT_BACKLOG);
        let pending = Arc::new(Semaphore::new(max_pending));
        tokio::spawn(accept_loop(listener, config, tx, pending));
        Ok(Self {
            incoming,
            local_addr,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: watch::Receiver<Arc<ServerConfig>>,
    tx: mpsc::Sender<(TlsStream<TcpStream>, SocketAddr)>,
    pending: Arc<Semaphore>,
) {
    while !tx.is_closed() {
        let Ok(permit) = pending.clone().acquire_owned().await else {
            break;
        };
        let (tcp, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "failed to accept connection");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let acceptor = TlsAcceptor::from(config.borrow().clone());
        let tx = tx.clone();
        tokio::spawn(async move {
            let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await;
            drop(permit);
            match handshake {
                Ok(Ok(stream)) => {
                    let _ = tx.send((stream, peer)).await;
                }
                Ok(Err(e)) => debug!(peer = %peer, error = %e, "TLS handshake failed"),
                Err(_) => debug!(peer = %peer, "TLS handshake timed out"),
            }
        });
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.incoming.recv().await {
            Some(conn) => conn,
            // Accept loop gone; park like a listener with no more clients.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

/// ACME account settings
#[derive(Debug, Clone, Default)]
pub struct AcmeOptions {
    pub email: Option<String>,
    pub staging: bool,
}

/// Keeps the agent port's serving certificate current
pub struct TlsManager {
    identity: TlsIdentity,
    paths: CaPaths,
    challenges: ChallengeMap,
    options: AcmeOptions,
    acme: Mutex<Option<AcmeProvisioner>>,
    mode: watch::Sender<TlsMode>,
    config: watch::Sender<Arc<ServerConfig>>,
}

impl TlsManager {
    /// Provision the certificate for `endpoint` and build the initial configuration
    ///
    /// In ACME mode the HTTP-01 responder serving `challenges` must already be listening.
    ///
    /// # Errors
    /// Returns error if the endpoint is invalid or the certificate cannot be provisioned
    pub async fn start(
        paths: CaPaths,
        challenges: ChallengeMap,
        options: AcmeOptions,
        endpoint: Option<&str>,
    ) -> Result<Self, CaError> {
        let identity = TlsIdentity::new(paths.clone());
        let acme = Mutex::new(None);
        let (mode, config) =
            provision(&identity, &paths, &challenges, &options, &acme, endpoint).await?;
        info!(mode = ?mode, "TLS identity ready");

        Ok(Self {
            identity,
            paths,
            challenges,
            options,
            acme,
            mode: watch::Sender::new(mode),
            config: watch::Sender::new(config),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ServerConfig>> {
        self.config.subscribe()
    }

    pub fn mode(&self) -> TlsMode {
        self.mode.borrow().clone()
    }

    /// PEM agents pin for the current mode
    ///
    /// # Errors
    /// Returns error if the certificate file cannot be read
    pub fn trust_bundle(&self) -> Result<String, CaError> {
        self.identity.trust_bundle_pem(&self.mode.borrow())
    }

    /// Re-check the certificate for `endpoint` and publish the resulting configuration
    ///
    /// # Errors
    /// Returns error if provisioning fails; the previous configuration stays in use
    pub async fn refresh(&self, endpoint: Option<&str>) -> Result<(), CaError> {
        let (mode, config) = provision(
            &self.identity,
            &self.paths,
            &self.challenges,
            &self.options,
            &self.acme,
            endpoint,
        )
        .await?;

        let previous = self.mode.send_replace(mode.clone());
        if previous != mode {
            info!(from = ?previous, to = ?mode, "TLS mode changed");
        }
        self.config.send_replace(config);
        Ok(())
    }

    async fn refresh_from(&self, store: &dyn Store) {
        let endpoint = match store.settings().await {
            Ok(settings) => settings.external_url,
            Err(e) => {
                warn!(error = %e, "could not read settings for TLS refresh");
                return;
            }
        };
        if let Err(e) = self.refresh(endpoint.as_deref()).await {
            error!(error = %e, "TLS refresh failed");
        }
    }

    /// Refresh on a fixed interval and whenever the external endpoint changes
    pub fn spawn_maintenance(
        self: Arc<Self>,
        records: &Records,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let mut events = records.subscribe();
        let store = records.store().clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => self.refresh_from(store.as_ref()).await,
                    event = events.recv() => match event {
                        Ok(ChangeEvent::SettingsChanged { before, after })
                            if endpoint_host(before.external_url.as_deref())
                                != endpoint_host(after.external_url.as_deref()) =>
                        {
                            info!(endpoint = ?after.external_url, "external endpoint changed");
                            if let Err(e) = self.refresh(after.external_url.as_deref()).await {
                                error!(error = %e, "TLS refresh failed");
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            self.refresh_from(store.as_ref()).await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }
}

fn endpoint_host(endpoint: Option<&str>) -> String {
    endpoint.map(nexus_ca::net::host_of).unwrap_or_default()
}

async fn provision(
    identity: &TlsIdentity,
    paths: &CaPaths,
    challenges: &ChallengeMap,
    options: &AcmeOptions,
    acme: &Mutex<Option<AcmeProvisioner>>,
    endpoint: Option<&str>,
) -> Result<(TlsMode, Arc<ServerConfig>), CaError> {
    let mode = identity.ensure(endpoint)?;
    if let TlsMode::Acme { domain } = &mode {
        let mut slot = acme.lock().await;
        let provisioner = match slot.take() {
            Some(provisioner) => provisioner,
            None => {
                let email = options.email.as_deref();
                AcmeProvisioner::new(paths, email, options.staging, challenges.clone()).await?
            }
        };
        let renewed = provisioner.ensure_certificate(domain).await;
        *slot = Some(provisioner);
        if renewed? {
            info!(domain = %domain, "ACME certificate renewed");
        }
    }
    let config = identity.server_config(&mode)?;
    Ok((mode, config))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::sync::RwLock;

    use super::*;

    fn challenges() -> ChallengeMap {
        Arc::new(RwLock::new(HashMap::new()))
    }

    #[test]
    fn test_endpoint_host_ignores_scheme_and_port() {
        assert_eq!(endpoint_host(Some("https://10.0.0.1:8091")), "10.0.0.1");
        assert_eq!(endpoint_host(None), "");
    }

    #[tokio::test]
    async fn test_self_signed_start_and_refresh() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let dir = tempfile::tempdir().unwrap();
        let paths = CaPaths::new(dir.path());

        let manager =
            TlsManager::start(paths, challenges(), AcmeOptions::default(), Some("10.1.2.3"))
                .await
                .unwrap();
        assert_eq!(
            manager.mode(),
            TlsMode::SelfSigned {
                hostname: "10.1.2.3".to_string()
            }
        );
        assert!(manager.trust_bundle().unwrap().contains("BEGIN CERTIFICATE"));

        let mut rx = manager.subscribe();
        rx.mark_unchanged();
        manager.refresh(Some("10.1.2.4")).await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(
            manager.mode(),
            TlsMode::SelfSigned {
                hostname: "10.1.2.4".to_string()
            }
        );
    }

    async fn serve_health(max_pending: usize) -> (tempfile::TempDir, SocketAddr) {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let dir = tempfile::tempdir().unwrap();
        let manager = TlsManager::start(
            CaPaths::new(dir.path()),
            challenges(),
            AcmeOptions::default(),
            Some("127.0.0.1"),
        )
        .await
        .unwrap();
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener = TlsListener::with_handshake_limit(tcp, manager.subscribe(), max_pending)
            .unwrap();
        let addr = axum::serve::Listener::local_addr(&listener).unwrap();
        let router = axum::Router::new().route("/health", axum::routing::get(|| async { "OK" }));
        tokio::spawn(async move { axum::serve(listener, router).await });
        (dir, addr)
    }

    fn insecure_client() -> reqwest::Client {
        reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(1))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_listener_serves_tls() {
        let (_dir, addr) = serve_health(4).await;
        let body = insecure_client()
            .get(format!("https://{addr}/health"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn test_stalled_handshakes_hold_back_new_connections() {
        let (_dir, addr) = serve_health(1).await;

        // Connects but never sends a ClientHello
        let stalled = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let blocked = insecure_client().get(format!("https://{addr}/health")).send().await;
        assert!(blocked.is_err(), "handshake ran past the limit");

        drop(stalled);
        let body = insecure_client()
            .get(format!("https://{addr}/health"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "OK");
    }

    #[tokio::test]
    async fn test_invalid_endpoint_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = TlsManager::start(
            CaPaths::new(dir.path()),
            challenges(),
            AcmeOptions::default(),
            Some("not a host!"),
        )
        .await;
        assert!(matches!(result, Err(CaError::InvalidHost(_))));
    }
}
