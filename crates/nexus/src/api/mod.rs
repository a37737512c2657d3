//! API route handlers

pub mod acme;
pub mod auth;
pub mod client;
pub mod error;
pub mod records;
pub mod rpc;
pub mod ssh;
pub mod stream;
pub mod sync;
pub mod system;

pub use error::{ApiError, AppError};
