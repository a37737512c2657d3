//! TLS identity of the control plane
//!
//! When the control endpoint is an IP address (or unset) the daemon runs its own root CA and
//! issues itself a leaf certificate; agents fetch the root from `/ca.crt` and pin it. When
//! it is a domain name the certificate comes from ACME instead.

use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::Arc;

use chrono::{Datelike, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{debug, info, instrument};

use crate::error::CaError;
use crate::net;
use crate::paths::{CaPaths, write_private, write_public};

const ROOT_COMMON_NAME: &str = "ssh-nexus root CA";
const ROOT_VALIDITY_YEARS: i32 = 10;
const LEAF_VALIDITY_YEARS: i32 = 1;

/// How the daemon obtains its serving certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMode {
    /// Leaf issued by the local root CA
    SelfSigned { hostname: String },
    /// Certificate provisioned by ACME for `domain`
    Acme { domain: String },
}

#[derive(Debug, Clone)]
pub struct TlsIdentity {
    paths: CaPaths,
}

impl TlsIdentity {
    pub fn new(paths: CaPaths) -> Self {
        Self { paths }
    }

    /// Decide the TLS mode for `endpoint` and make sure self-signed material is current
    ///
    /// The root is regenerated when missing or expired. The leaf is regenerated when
    /// missing, expired, issued for a different hostname, or after a new root.
    #[instrument(skip(self))]
    pub fn ensure(&self, endpoint: Option<&str>) -> Result<TlsMode, CaError> {
        let host = endpoint.map(net::host_of).unwrap_or_default();
        if !host.is_empty() && !net::is_ip(&host) {
            if net::is_valid_domain(&host) {
                return Ok(TlsMode::Acme { domain: host });
            }
            return Err(CaError::InvalidHost(host));
        }

        let hostname = if host.is_empty() {
            net::outbound_ip().map_or_else(|| "127.0.0.1".to_string(), |ip| ip.to_string())
        } else {
            host
        };

        let mut renew_leaf = false;
        if !self.root_valid()? {
            self.generate_root()?;
            renew_leaf = true;
        }
        if renew_leaf || !self.leaf_valid_for(&hostname)? {
            self.generate_leaf(&hostname)?;
        }
        Ok(TlsMode::SelfSigned { hostname })
    }

    /// Root certificate PEM served to agents for pinning
    pub fn root_certificate_pem(&self) -> Result<String, CaError> {
        Ok(std::fs::read_to_string(self.paths.server_ca_cert())?)
    }

    /// Certificates agents should pin for `mode`
    pub fn trust_bundle_pem(&self, mode: &TlsMode) -> Result<String, CaError> {
        match mode {
            TlsMode::SelfSigned { .. } => self.root_certificate_pem(),
            TlsMode::Acme { domain } => Ok(std::fs::read_to_string(
                self.paths.acme_dir().join(domain).join("fullchain.pem"),
            )?),
        }
    }

    /// Serving configuration for `mode`
    pub fn server_config(&self, mode: &TlsMode) -> Result<Arc<ServerConfig>, CaError> {
        let (cert_path, key_path) = match mode {
            TlsMode::SelfSigned { .. } => (self.paths.server_cert(), self.paths.server_key()),
            TlsMode::Acme { domain } => {
                let dir = self.paths.acme_dir().join(domain);
                (dir.join("fullchain.pem"), dir.join("privkey.pem"))
            }
        };
        server_config_from_files(&cert_path, &key_path)
    }

    fn root_valid(&self) -> Result<bool, CaError> {
        if !self.paths.server_ca_key().exists() {
            return Ok(false);
        }
        let expiry = certificate_expiry(&self.paths.server_ca_cert())?;
        Ok(expiry.is_some_and(|t| t > Utc::now().timestamp()))
    }

    fn leaf_valid_for(&self, hostname: &str) -> Result<bool, CaError> {
        let marker = std::fs::read_to_string(self.paths.server_host_marker()).unwrap_or_default();
        if marker.trim() != hostname || !self.paths.server_key().exists() {
            return Ok(false);
        }
        let expiry = certificate_expiry(&self.paths.server_cert())?;
        Ok(expiry.is_some_and(|t| t > Utc::now().timestamp()))
    }

    fn generate_root(&self) -> Result<(), CaError> {
        let key = KeyPair::generate()?;
        let cert = root_params(ROOT_VALIDITY_YEARS).self_signed(&key)?;
        write_public(&self.paths.server_ca_cert(), cert.pem().as_bytes())?;
        write_private(&self.paths.server_ca_key(), key.serialize_pem().as_bytes())?;
        info!(path = %self.paths.server_ca_cert().display(), "generated TLS root CA");
        Ok(())
    }

    fn generate_leaf(&self, hostname: &str) -> Result<(), CaError> {
        let root_pem = std::fs::read_to_string(self.paths.server_ca_key())?;
        let root_key = KeyPair::from_pem(&root_pem)?;
        let root = root_params(ROOT_VALIDITY_YEARS);
        let issuer = Issuer::from_params(&root, root_key);

        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, hostname);
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        set_validity(&mut params, LEAF_VALIDITY_YEARS);
        params.subject_alt_names = leaf_sans(hostname)?;

        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &issuer)?;

        // Leaf first, root appended so clients receive the full chain.
        let root_cert = self.root_certificate_pem()?;
        let chain = format!("{}{}", cert.pem(), root_cert);
        write_public(&self.paths.server_cert(), chain.as_bytes())?;
        write_private(&self.paths.server_key(), key.serialize_pem().as_bytes())?;
        write_public(&self.paths.server_host_marker(), hostname.as_bytes())?;
        info!(hostname, "generated TLS leaf certificate");
        Ok(())
    }
}

fn root_params(years: i32) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, ROOT_COMMON_NAME);
    params.distinguished_name.push(DnType::OrganizationName, "ssh-nexus");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    set_validity(&mut params, years);
    params
}

fn set_validity(params: &mut CertificateParams, years: i32) {
    let today = Utc::now().date_naive();
    // Day clamped so that Feb 29 maps to a date valid in every year.
    let day = today.day().min(28) as u8;
    let month = today.month() as u8;
    params.not_before = rcgen::date_time_ymd(today.year(), month, day);
    params.not_after = rcgen::date_time_ymd(today.year() + years, month, day);
}

fn leaf_sans(hostname: &str) -> Result<Vec<SanType>, CaError> {
    let mut ips: Vec<IpAddr> = vec![
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(Ipv6Addr::LOCALHOST),
    ];
    if let Some(ip) = net::outbound_ip() {
        ips.push(ip);
    }

    let mut sans = Vec::new();
    match hostname.parse::<IpAddr>() {
        Ok(ip) => ips.push(ip),
        Err(_) => sans.push(SanType::DnsName(hostname.try_into()?)),
    }
    ips.sort();
    ips.dedup();
    sans.extend(ips.into_iter().map(SanType::IpAddress));
    debug!(count = sans.len(), "leaf subject alternative names");
    Ok(sans)
}

/// `not_after` of the first certificate in a PEM file, Unix seconds; `None` if absent
pub fn certificate_expiry(path: &Path) -> Result<Option<i64>, CaError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    let Some(der) = rustls_pemfile::certs(&mut reader).next().transpose()? else {
        return Ok(None);
    };
    let (_, cert) = x509_parser::parse_x509_certificate(&der)
        .map_err(|e| CaError::Tls(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(cert.validity().not_after.timestamp()))
}

fn server_config_from_files(
    cert_path: &Path,
    key_path: &Path,
) -> Result<Arc<ServerConfig>, CaError> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(CaError::Tls(format!("no certificate in {}", cert_path.display())));
    }
    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| CaError::Tls(format!("no private key in {}", key_path.display())))?;

    let mut config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
