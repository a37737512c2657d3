//! Session traits

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ExecError;
use crate::result::{CommandResult, SshTarget};

/// One open session on a remote machine
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run `cmd`, failing with [`ExecError::Timeout`] after `timeout`
    async fn exec(&self, cmd: &str, timeout: Duration) -> Result<CommandResult, ExecError>;

    /// Write `contents` to the absolute `path` and set its permission bits
    async fn upload(&self, path: &str, contents: &[u8], mode: u32) -> Result<(), ExecError>;

    /// Close the session; errors are logged and swallowed
    async fn close(&self);

    fn session_type(&self) -> &'static str;
}

/// Opens a fresh session per call
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, target: &SshTarget) -> Result<Box<dyn RemoteSession>, ExecError>;
}
