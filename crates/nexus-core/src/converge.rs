//! Remote convergence over SSH for machines without a live agent
//!
//! Every operation opens its own session, runs idempotent commands through the retrying
//! runner and records the outcome on the machine's `last_error`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use nexus_api::paths;
use nexus_ca::{CertificateAuthority, TokenStore, net};
use nexus_exec::{ExecError, RemoteSession, RetryPolicy, SessionFactory, run, shell_quote, upload};
use tracing::{info, instrument, warn};

use crate::error::CoreError;
use crate::model::Machine;
use crate::principals::PrincipalSet;
use crate::registry::RegistryHandle;
use crate::settings::Settings;
use crate::store::{Store, desired_principals, record_error};

/// Pull-side delivery of desired state
#[async_trait]
pub trait RemoteConverger: Send + Sync {
    /// Push ssh config, user CA key and principals unless an agent is connected
    async fn manual_update(&self, machine_id: &str) -> Result<(), CoreError>;

    /// Install and start the agent unless the machine is already agent-managed
    async fn install_agent(&self, machine_id: &str) -> Result<(), CoreError>;

    /// Best-effort removal of every managed file; the record is already gone
    async fn restore(&self, machine: &Machine) -> Result<(), CoreError>;

    /// Deliver the current bearer token to an agent-managed machine
    async fn sync_agent_token(&self, machine_id: &str) -> Result<(), CoreError>;
}

/// Write one file per login name, then delete every file not in `desired`
///
/// Removals run only after all writes succeeded.
#[instrument(skip(session, desired, policy), fields(session = session.session_type()))]
pub async fn set_principals(
    session: &dyn RemoteSession,
    desired: &PrincipalSet,
    policy: &RetryPolicy,
) -> Result<(), ExecError> {
    let dir = shell_quote(paths::PRINCIPALS_DIR);
    run(session, &format!("mkdir -p {dir}"), policy).await?;

    for (login, values) in desired.iter() {
        let contents = PrincipalSet::file_contents(values);
        upload(session, &paths::principal_file(login), contents.as_bytes(), 0o644, policy).await?;
    }

    let listing = run(session, &format!("ls -1 {dir}"), policy).await?;
    let stale: Vec<String> = listing
        .stdout_lines()
        .filter(|name| desired.get(name).is_none())
        .map(|name| shell_quote(&paths::principal_file(name)))
        .collect();
    if !stale.is_empty() {
        info!(count = stale.len(), "removing stale principal files");
        run(session, &format!("rm -f {}", stale.join(" ")), policy).await?;
    }
    Ok(())
}

/// systemd unit running the agent against `server`
pub fn agent_unit(server: &str) -> String {
    format!(
        "[Unit]
Description=Nexus Agent
After=network.target

[Service]
Type=simple
User=root
Group=root
ExecStart={binary} --server {server}
Restart=always
RestartSec=5

[Install]
WantedBy=multi-user.target
",
        binary = paths::AGENT_BINARY,
    )
}

/// Control endpoint host as agents should dial it
pub fn agent_server(settings: &Settings) -> String {
    settings
        .external_url
        .as_deref()
        .map(net::host_of)
        .filter(|host| !host.is_empty())
        .or_else(|| net::outbound_ip().map(|ip| ip.to_string()))
        .unwrap_or_else(|| "127.0.0.1".to_string())
}

/// Files removed by a restore
const MANAGED_PATHS: &[&str] = &[
    paths::PRINCIPALS_DIR,
    paths::SSH_CONFIG,
    paths::USER_CA_PUBLIC_KEY,
    paths::HOST_CERTIFICATE,
    paths::AGENT_BINARY,
    paths::AGENT_SERVICE_UNIT,
    paths::AGENT_TOKEN,
];

/// [`RemoteConverger`] over sessions from a [`SessionFactory`]
pub struct SshConverger {
    sessions: Arc<dyn SessionFactory>,
    store: Arc<dyn Store>,
    registry: RegistryHandle,
    ca: Arc<CertificateAuthority>,
    tokens: Arc<TokenStore>,
    policy: RetryPolicy,
    agent_binary: Option<PathBuf>,
}

impl SshConverger {
    pub fn new(
        sessions: Arc<dyn SessionFactory>,
        store: Arc<dyn Store>,
        registry: RegistryHandle,
        ca: Arc<CertificateAuthority>,
        tokens: Arc<TokenStore>,
    ) -> Self {
        Self {
            sessions,
            store,
            registry,
            ca,
            tokens,
            policy: RetryPolicy::default(),
            agent_binary: None,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Local agent binary uploaded by [`RemoteConverger::install_agent`]
    #[must_use]
    pub fn with_agent_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.agent_binary = Some(path.into());
        self
    }

    async fn load(&self, machine_id: &str) -> Result<Machine, CoreError> {
        self.store
            .machine(machine_id)
            .await?
            .ok_or_else(|| CoreError::MachineNotFound(machine_id.to_string()))
    }

    async fn open(&self, machine: &Machine) -> Result<Box<dyn RemoteSession>, CoreError> {
        Ok(self.sessions.open(&machine.ssh_target()).await?)
    }

    /// Record the outcome of a convergence step on the machine
    async fn outcome(
        &self,
        machine_id: &str,
        result: Result<(), CoreError>,
    ) -> Result<(), CoreError> {
        let error = result.as_ref().err().map(ToString::to_string);
        if let Some(e) = &error {
            warn!(machine = %machine_id, error = %e, "convergence failed");
        }
        record_error(self.store.as_ref(), machine_id, error).await?;
        result
    }
}

async fn push_state(
    session: &dyn RemoteSession,
    ssh_config: &str,
    user_ca: &str,
    desired: &PrincipalSet,
    policy: &RetryPolicy,
) -> Result<(), ExecError> {
    run(session, &format!("mkdir -p {}", shell_quote(paths::PRINCIPALS_DIR)), policy).await?;
    upload(session, paths::USER_CA_PUBLIC_KEY, user_ca.as_bytes(), 0o644, policy).await?;
    upload(session, paths::SSH_CONFIG, ssh_config.as_bytes(), 0o644, policy).await?;
    set_principals(session, desired, policy).await
}

async fn write_token(
    session: &dyn RemoteSession,
    token: &str,
    policy: &RetryPolicy,
) -> Result<(), ExecError> {
    run(session, &format!("mkdir -p {}", shell_quote(paths::AGENT_STATE_DIR)), policy).await?;
    upload(session, paths::AGENT_TOKEN, token.as_bytes(), 0o600, policy).await
}

async fn install(
    session: &dyn RemoteSession,
    binary: &[u8],
    unit: &str,
    token: &str,
    policy: &RetryPolicy,
) -> Result<(), ExecError> {
    upload(session, paths::AGENT_BINARY, binary, 0o755, policy).await?;
    upload(session, paths::AGENT_SERVICE_UNIT, unit.as_bytes(), 0o644, policy).await?;
    write_token(session, token, policy).await?;
    let service = paths::AGENT_SERVICE_NAME;
    run(session, "systemctl daemon-reload", policy).await?;
    run(session, &format!("systemctl enable {service}"), policy).await?;
    run(session, &format!("systemctl start {service}"), policy).await?;
    Ok(())
}

async fn teardown(session: &dyn RemoteSession, policy: &RetryPolicy) -> Result<(), ExecError> {
    let targets: Vec<String> = MANAGED_PATHS.iter().map(|p| shell_quote(p)).collect();
    run(session, &format!("rm -rf {}", targets.join(" ")), policy).await?;
    let service = paths::AGENT_SERVICE_NAME;
    let stop = format!(
        "systemctl disable {service} || true; systemctl stop {service} || true; \
         systemctl daemon-reload"
    );
    run(session, &stop, policy).await?;
    Ok(())
}

#[async_trait]
impl RemoteConverger for SshConverger {
    #[instrument(skip(self))]
    async fn manual_update(&self, machine_id: &str) -> Result<(), CoreError> {
        if self.registry.is_connected(machine_id).await? {
            return Ok(());
        }
        let machine = self.load(machine_id).await?;
        let settings = self.store.settings().await?;
        let user_ca = self.ca.user_ca_public_key()?;
        let desired = desired_principals(self.store.as_ref(), &machine).await?;

        let result = match self.open(&machine).await {
            Ok(session) => {
                let pushed = push_state(
                    session.as_ref(),
                    &settings.ssh_config,
                    &user_ca,
                    &desired,
                    &self.policy,
                )
                .await;
                session.close().await;
                pushed.map_err(CoreError::from)
            }
            Err(e) => Err(e),
        };
        self.outcome(machine_id, result).await?;
        info!(machine = %machine_id, "machine converged over ssh");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn install_agent(&self, machine_id: &str) -> Result<(), CoreError> {
        let machine = self.load(machine_id).await?;
        if machine.agent {
            return Ok(());
        }
        let Some(binary_path) = &self.agent_binary else {
            return Err(CoreError::ConfigError("agent binary not configured".to_string()));
        };
        let binary = tokio::fs::read(binary_path)
            .await
            .map_err(|e| CoreError::ConfigError(format!("{}: {e}", binary_path.display())))?;
        let unit = agent_unit(&agent_server(&self.store.settings().await?));
        let token = self.tokens.current()?;

        let result = match self.open(&machine).await {
            Ok(session) => {
                let installed =
                    install(session.as_ref(), &binary, &unit, &token, &self.policy).await;
                session.close().await;
                installed.map_err(CoreError::from)
            }
            Err(e) => Err(e),
        };
        self.outcome(machine_id, result).await?;
        info!(machine = %machine_id, "agent installed");
        Ok(())
    }

    #[instrument(skip(self, machine), fields(machine = %machine.id))]
    async fn restore(&self, machine: &Machine) -> Result<(), CoreError> {
        let session = self.open(machine).await?;
        let result = teardown(session.as_ref(), &self.policy).await;
        session.close().await;
        result?;
        info!("machine restored");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn sync_agent_token(&self, machine_id: &str) -> Result<(), CoreError> {
        let machine = self.load(machine_id).await?;
        if !machine.agent {
            return Ok(());
        }
        let token = self.tokens.current()?;
        let result = match self.open(&machine).await {
            Ok(session) => {
                let written = write_token(session.as_ref(), &token, &self.policy).await;
                session.close().await;
                written.map_err(CoreError::from)
            }
            Err(e) => Err(e),
        };
        self.outcome(machine_id, result).await
    }
}
