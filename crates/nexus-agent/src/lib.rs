//! nexus-agent: keeps this machine's SSH trust material in sync with the control plane
//!
//! Holds one authenticated stream to the control plane, applies the ssh config, user CA
//! key, host certificate and principal files it pushes, and renews the host certificate
//! before it expires.

pub mod apply;
pub mod client;
pub mod error;
pub mod identity;
pub mod paths;
pub mod renew;

pub use apply::{Applied, Applier};
pub use client::{Agent, AgentConfig};
pub use error::{AgentError, Result};
pub use paths::AgentPaths;
