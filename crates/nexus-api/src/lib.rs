//! nexus-api: Shared wire and API types
//!
//! Contains the agent stream messages, the connection metadata header names, and the
//! request/response bodies used by the control-plane daemon and the agent.

pub mod paths;
pub mod proto;
pub mod requests;
pub mod responses;

pub use proto::{Principal, StreamRequest, StreamResponse};
