//! nexus-ca: Certificate authority for the SSH fleet
//!
//! Owns the host-CA and user-CA signing keys, issues short-lived SSH certificates under a
//! lease policy, manages the control plane's own TLS identity and the shared agent token.

pub mod acme;
pub mod error;
pub mod lease;
pub mod net;
pub mod paths;
pub mod sign;
pub mod tls;
pub mod token;

pub use acme::{AcmeProvisioner, ChallengeMap};
pub use error::CaError;
pub use lease::{LeasePolicy, lease_duration};
pub use paths::CaPaths;
pub use sign::CertificateAuthority;
pub use tls::{TlsIdentity, TlsMode};
pub use token::{TokenStore, ensure_admin_token, tokens_match};
