//! nexus-exec: Remote session abstraction
//!
//! Opens short-lived sessions on managed machines to run commands and upload files, with a
//! bounded retry policy around each operation.

pub mod error;
pub mod local;
pub mod result;
pub mod retry;
pub mod ssh;
pub mod traits;

pub use error::ExecError;
pub use local::{LocalSession, LocalSessionFactory};
pub use result::{CommandResult, SshTarget};
pub use retry::{RetryPolicy, run, upload};
pub use ssh::{SshSession, SshSessionFactory};
pub use traits::{RemoteSession, SessionFactory};

/// Quote `value` for a POSIX shell
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
