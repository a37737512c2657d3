//! SSH certificate issuance
//!
//! Two ed25519 signing keys live under the data directory: the host CA signs host
//! certificates, the user CA signs user certificates and doubles as the control plane's
//! SSH client identity. Keys are read from disk on every signing call so that a rotation
//! or an imported key takes effect immediately.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ssh_key::certificate::{Builder, CertType};
use ssh_key::rand_core::{OsRng, RngCore};
use ssh_key::{Algorithm, LineEnding, PrivateKey, PublicKey};
use tracing::{debug, info, instrument};

use crate::error::CaError;
use crate::paths::{CaPaths, remove_if_exists, write_private, write_public};

/// Suffix appended to the subject to form a certificate key id
pub const KEY_ID_SUFFIX: &str = "@ssh-nexus";

/// Principal embedded when a user certificate is requested without a user
pub const DEFAULT_PRINCIPAL: &str = "root";

/// Extensions granted to every user certificate
pub const USER_EXTENSIONS: [&str; 5] = [
    "permit-X11-forwarding",
    "permit-agent-forwarding",
    "permit-port-forwarding",
    "permit-pty",
    "permit-user-rc",
];

/// Signed certificate in authorized-keys format plus its expiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCertificate {
    pub certificate: String,
    /// `valid_before`, Unix seconds
    pub expiry: u64,
}

/// Issues host and user certificates from the on-disk CA keys
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    paths: CaPaths,
}

impl CertificateAuthority {
    pub fn new(paths: CaPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &CaPaths {
        &self.paths
    }

    /// Create any missing signing key; existing keys are left untouched
    #[instrument(skip(self))]
    pub fn ensure_signing_keys(&self) -> Result<(), CaError> {
        for (path, comment) in self.key_files() {
            if path.exists() {
                debug!(path = %path.display(), "signing key present");
                continue;
            }
            generate_key(&path, comment)?;
            info!(path = %path.display(), "generated signing key");
        }
        Ok(())
    }

    /// Replace both signing keys with fresh ones
    #[instrument(skip(self))]
    pub fn rotate_signing_keys(&self) -> Result<(), CaError> {
        for (path, _) in self.key_files() {
            remove_if_exists(&path)?;
            remove_if_exists(&path.with_extension("key.pub"))?;
        }
        self.ensure_signing_keys()?;
        info!("rotated signing keys");
        Ok(())
    }

    /// Replace the user CA with an operator supplied OpenSSH private key
    #[instrument(skip(self, pem))]
    pub fn import_user_ca(&self, pem: &str) -> Result<(), CaError> {
        let key = PrivateKey::from_openssh(pem.trim())
            .map_err(|e| CaError::InvalidPrivateKey(e.to_string()))?;
        store_key(&self.paths.user_ca_key(), &key)?;
        info!(algorithm = %key.algorithm(), "imported user CA key");
        Ok(())
    }

    /// User CA public key in authorized-keys format
    pub fn user_ca_public_key(&self) -> Result<String, CaError> {
        public_key_of(&self.paths.user_ca_key())
    }

    /// Host CA public key in authorized-keys format
    pub fn host_ca_public_key(&self) -> Result<String, CaError> {
        public_key_of(&self.paths.host_ca_key())
    }

    /// Sign a host public key; the certificate is valid for any hostname
    #[instrument(skip(self, public_key))]
    pub fn sign_host(
        &self,
        public_key: &str,
        hostname: &str,
        ttl: Duration,
    ) -> Result<SignedCertificate, CaError> {
        let signer = load_key(&self.paths.host_ca_key())?;
        let mut builder = self.builder(public_key, ttl, hostname)?;
        builder.cert_type(CertType::Host).map_err(signing)?;
        builder.all_principals_valid().map_err(signing)?;
        finish(builder, &signer)
    }

    /// Sign a user public key for `principal` with the standard user extensions
    #[instrument(skip(self, public_key))]
    pub fn sign_user(
        &self,
        public_key: &str,
        principal: &str,
        ttl: Duration,
    ) -> Result<SignedCertificate, CaError> {
        let signer = load_key(&self.paths.user_ca_key())?;
        let mut builder = self.builder(public_key, ttl, principal)?;
        builder.cert_type(CertType::User).map_err(signing)?;
        builder.valid_principal(principal).map_err(signing)?;
        for extension in USER_EXTENSIONS {
            builder.extension(extension, "").map_err(signing)?;
        }
        finish(builder, &signer)
    }

    fn builder(&self, public_key: &str, ttl: Duration, subject: &str) -> Result<Builder, CaError> {
        if ttl.as_secs() == 0 {
            return Err(CaError::InvalidTtl);
        }
        let subject_key = PublicKey::from_openssh(public_key.trim())
            .map_err(|e| CaError::InvalidPublicKey(e.to_string()))?;

        let valid_after = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| CaError::Signing(e.to_string()))?
            .as_secs();
        let valid_before = valid_after + ttl.as_secs();

        let mut builder =
            Builder::new_with_random_nonce(&mut OsRng, &subject_key, valid_after, valid_before)
                .map_err(signing)?;
        builder.serial(OsRng.next_u64()).map_err(signing)?;
        builder
            .key_id(format!("{subject}{KEY_ID_SUFFIX}"))
            .map_err(signing)?;
        Ok(builder)
    }

    fn key_files(&self) -> [(std::path::PathBuf, &'static str); 2] {
        [
            (self.paths.host_ca_key(), "nexus host CA"),
            (self.paths.user_ca_key(), "nexus user CA"),
        ]
    }
}

fn finish(builder: Builder, signer: &PrivateKey) -> Result<SignedCertificate, CaError> {
    let cert = builder.sign(signer).map_err(signing)?;
    let expiry = cert.valid_before();
    debug!(key_id = %cert.key_id(), serial = cert.serial(), expiry, "signed certificate");
    Ok(SignedCertificate {
        certificate: cert.to_openssh().map_err(signing)?,
        expiry,
    })
}

fn signing(e: ssh_key::Error) -> CaError {
    CaError::Signing(e.to_string())
}

fn generate_key(path: &Path, comment: &str) -> Result<(), CaError> {
    let mut key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).map_err(signing)?;
    key.set_comment(comment);
    store_key(path, &key)
}

fn store_key(path: &Path, key: &PrivateKey) -> Result<(), CaError> {
    let pem = key.to_openssh(LineEnding::LF).map_err(signing)?;
    write_private(path, pem.as_bytes())?;
    let public = key.public_key().to_openssh().map_err(signing)?;
    write_public(&path.with_extension("key.pub"), format!("{public}\n").as_bytes())?;
    Ok(())
}

fn load_key(path: &Path) -> Result<PrivateKey, CaError> {
    let pem = std::fs::read_to_string(path).map_err(|e| CaError::key_material(path, e))?;
    PrivateKey::from_openssh(pem.trim()).map_err(|e| CaError::key_material(path, e))
}

fn public_key_of(path: &Path) -> Result<String, CaError> {
    load_key(path)?
        .public_key()
        .to_openssh()
        .map_err(|e| CaError::key_material(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssh_key::Certificate;

    fn authority() -> (tempfile::TempDir, CertificateAuthority) {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::new(CaPaths::new(dir.path()));
        ca.ensure_signing_keys().unwrap();
        (dir, ca)
    }

    fn subject_key() -> String {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .to_openssh()
            .unwrap()
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let (_dir, ca) = authority();
        let before = ca.user_ca_public_key().unwrap();
        ca.ensure_signing_keys().unwrap();
        assert_eq!(ca.user_ca_public_key().unwrap(), before);
    }

    #[test]
    fn test_rotate_replaces_keys() {
        let (_dir, ca) = authority();
        let user_before = ca.user_ca_public_key().unwrap();
        let host_before = ca.host_ca_public_key().unwrap();
        ca.rotate_signing_keys().unwrap();
        assert_ne!(ca.user_ca_public_key().unwrap(), user_before);
        assert_ne!(ca.host_ca_public_key().unwrap(), host_before);
    }

    #[test]
    fn test_user_certificate_fields() {
        let (_dir, ca) = authority();
        let signed = ca
            .sign_user(&subject_key(), "deploy", Duration::from_secs(3600))
            .unwrap();
        let cert = Certificate::from_openssh(&signed.certificate).unwrap();

        assert_eq!(cert.cert_type(), CertType::User);
        assert_eq!(cert.key_id(), "deploy@ssh-nexus");
        assert_eq!(cert.valid_principals(), ["deploy".to_string()]);
        assert_eq!(cert.valid_before() - cert.valid_after(), 3600);
        assert_eq!(signed.expiry, cert.valid_before());
        for ext in USER_EXTENSIONS {
            assert!(cert.extensions().contains_key(ext), "missing {ext}");
        }
    }

    #[test]
    fn test_host_certificate_is_signed_by_host_ca() {
        let (_dir, ca) = authority();
        let signed = ca
            .sign_host(&subject_key(), "web-1", Duration::from_secs(7200))
            .unwrap();
        let cert = Certificate::from_openssh(&signed.certificate).unwrap();

        assert_eq!(cert.cert_type(), CertType::Host);
        assert_eq!(cert.key_id(), "web-1@ssh-nexus");
        assert!(cert.valid_principals().is_empty());
        assert_eq!(cert.valid_before() - cert.valid_after(), 7200);

        let host_ca = PublicKey::from_openssh(&ca.host_ca_public_key().unwrap()).unwrap();
        assert_eq!(cert.signature_key(), host_ca.key_data());
    }

    #[test]
    fn test_zero_ttl_is_rejected() {
        let (_dir, ca) = authority();
        let err = ca.sign_user(&subject_key(), "root", Duration::ZERO).unwrap_err();
        assert!(matches!(err, CaError::InvalidTtl));
        assert!(err.is_request_error());
    }

    #[test]
    fn test_malformed_public_key_is_rejected() {
        let (_dir, ca) = authority();
        let err = ca
            .sign_host("not a key", "web-1", Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, CaError::InvalidPublicKey(_)));
    }

    #[test]
    fn test_missing_ca_key_is_key_material_error() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::new(CaPaths::new(dir.path()));
        let err = ca
            .sign_user(&subject_key(), "root", Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, CaError::KeyMaterial { .. }));
    }

    #[test]
    fn test_import_user_ca() {
        let (_dir, ca) = authority();
        let replacement = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let pem = replacement.to_openssh(LineEnding::LF).unwrap();
        ca.import_user_ca(&pem).unwrap();

        assert_eq!(
            ca.user_ca_public_key().unwrap(),
            replacement.public_key().to_openssh().unwrap()
        );
        assert!(matches!(
            ca.import_user_ca("garbage").unwrap_err(),
            CaError::InvalidPrivateKey(_)
        ));
    }
}
