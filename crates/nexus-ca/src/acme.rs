//! ACME (HTTP-01) provisioning for domain endpoints
//!
//! Certificates are stored at `<data>/certs/acme/{domain}/` as `fullchain.pem` and
//! `privkey.pem`. The daemon serves pending challenge responses from [`ChallengeMap`] on
//! `/.well-known/acme-challenge/{token}`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use instant_acme::{
    Account, AccountCredentials, ChallengeType, Identifier, LetsEncrypt, NewAccount, NewOrder,
    OrderStatus, RetryPolicy,
};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::error::CaError;
use crate::paths::{CaPaths, write_private, write_public};
use crate::tls::certificate_expiry;

const ACCOUNT_FILE: &str = "acme_account.json";

/// Renew when fewer than this many days remain
const RENEWAL_THRESHOLD_DAYS: i64 = 30;

/// HTTP-01 challenge responses (token → key authorization)
pub type ChallengeMap = Arc<RwLock<HashMap<String, String>>>;

pub struct AcmeProvisioner {
    account: Account,
    dir: PathBuf,
    challenges: ChallengeMap,
}

impl AcmeProvisioner {
    /// Load the ACME account from disk or register a new one
    pub async fn new(
        paths: &CaPaths,
        email: Option<&str>,
        staging: bool,
        challenges: ChallengeMap,
    ) -> Result<Self, CaError> {
        let dir = paths.acme_dir();
        let account_path = dir.join(ACCOUNT_FILE);

        let account = if account_path.exists() {
            debug!(path = %account_path.display(), "loading ACME account");
            let json = std::fs::read_to_string(&account_path)?;
            let credentials: AccountCredentials =
                serde_json::from_str(&json).map_err(|e| CaError::Acme(e.to_string()))?;
            Account::builder()
                .map_err(acme)?
                .from_credentials(credentials)
                .await
                .map_err(acme)?
        } else {
            let server_url = if staging {
                LetsEncrypt::Staging.url()
            } else {
                LetsEncrypt::Production.url()
            };
            let contact: Vec<String> = email.map(|e| format!("mailto:{e}")).into_iter().collect();
            let contact: Vec<&str> = contact.iter().map(String::as_str).collect();

            let (account, credentials) = Account::builder()
                .map_err(acme)?
                .create(
                    &NewAccount {
                        contact: &contact,
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    server_url.to_string(),
                    None,
                )
                .await
                .map_err(acme)?;

            let json = serde_json::to_string_pretty(&credentials)
                .map_err(|e| CaError::Acme(e.to_string()))?;
            write_private(&account_path, json.as_bytes())?;
            info!(path = %account_path.display(), "registered ACME account");
            account
        };

        Ok(Self {
            account,
            dir,
            challenges,
        })
    }

    /// Provision a certificate for `domain` unless a fresh one is already stored
    ///
    /// Returns whether a new certificate was written.
    pub async fn ensure_certificate(&self, domain: &str) -> Result<bool, CaError> {
        if !needs_renewal(&self.dir.join(domain).join("fullchain.pem"))? {
            debug!(domain, "ACME certificate still fresh");
            return Ok(false);
        }
        self.provision_http01(domain).await?;
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn provision_http01(&self, domain: &str) -> Result<(), CaError> {
        info!("provisioning certificate via HTTP-01");

        let identifiers = vec![Identifier::Dns(domain.to_string())];
        let mut order = self
            .account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(acme)?;

        let token = {
            let mut authorizations = order.authorizations();
            let mut auth = authorizations
                .next()
                .await
                .ok_or_else(|| CaError::Acme("no authorizations in order".to_string()))?
                .map_err(acme)?;
            let mut challenge = auth
                .challenge(ChallengeType::Http01)
                .ok_or_else(|| CaError::Acme("no HTTP-01 challenge offered".to_string()))?;

            let key_auth = challenge.key_authorization().as_str().to_string();
            let token = challenge.token.clone();
            self.challenges.write().await.insert(token.clone(), key_auth);

            challenge.set_ready().await.map_err(acme)?;
            token
        };

        let retries = RetryPolicy::new().timeout(Duration::from_secs(120));
        let status = order.poll_ready(&retries).await;
        self.challenges.write().await.remove(&token);

        let status = status.map_err(acme)?;
        if status != OrderStatus::Ready {
            return Err(CaError::Acme(format!("order not ready: {status:?}")));
        }

        let private_key_pem = order.finalize().await.map_err(acme)?;
        let cert_pem = order.poll_certificate(&retries).await.map_err(acme)?;

        let domain_dir = self.dir.join(domain);
        write_public(&domain_dir.join("fullchain.pem"), cert_pem.as_bytes())?;
        write_private(&domain_dir.join("privkey.pem"), private_key_pem.as_bytes())?;
        info!("certificate stored");
        Ok(())
    }
}

fn acme(e: instant_acme::Error) -> CaError {
    CaError::Acme(e.to_string())
}

fn needs_renewal(fullchain: &Path) -> Result<bool, CaError> {
    let Some(not_after) = certificate_expiry(fullchain)? else {
        return Ok(true);
    };
    let days_left = (not_after - chrono::Utc::now().timestamp()) / 86_400;
    Ok(days_left < RENEWAL_THRESHOLD_DAYS)
}
