//! Shared agent token
//!
//! A single bearer credential authenticates every agent stream. After a rotation the
//! previous token stays accepted until the fleet has been handed the new one.

use std::path::{Path, PathBuf};

use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::{info, instrument};

use crate::error::CaError;
use crate::paths::{CaPaths, remove_if_exists, write_private};

const TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct TokenStore {
    current: PathBuf,
    previous: PathBuf,
}

impl TokenStore {
    pub fn new(paths: &CaPaths) -> Self {
        Self {
            current: paths.token(),
            previous: paths.previous_token(),
        }
    }

    /// Generate a token if none exists yet
    pub fn ensure(&self) -> Result<(), CaError> {
        if read_token(&self.current)?.is_none() {
            write_private(&self.current, generate().as_bytes())?;
            info!(path = %self.current.display(), "generated agent token");
        }
        Ok(())
    }

    pub fn current(&self) -> Result<String, CaError> {
        read_token(&self.current)?.ok_or(CaError::TokenNotFound)
    }

    /// Issue a new token; the old one stays valid until
    /// [`retire_previous`](Self::retire_previous)
    #[instrument(skip(self))]
    pub fn rotate(&self) -> Result<String, CaError> {
        if let Some(old) = read_token(&self.current)? {
            write_private(&self.previous, old.as_bytes())?;
        }
        let token = generate();
        write_private(&self.current, token.as_bytes())?;
        info!("rotated agent token");
        Ok(token)
    }

    pub fn retire_previous(&self) -> Result<(), CaError> {
        remove_if_exists(&self.previous)?;
        Ok(())
    }

    /// Whether `presented` matches the current or the not-yet-retired previous token
    pub fn validate(&self, presented: &str) -> Result<bool, CaError> {
        let presented = presented.trim();
        if presented.is_empty() {
            return Ok(false);
        }
        for path in [&self.current, &self.previous] {
            if let Some(token) = read_token(path)?
                && tokens_match(&token, presented)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Read the admin token at `paths.admin_token()`, generating it on first use
pub fn ensure_admin_token(paths: &CaPaths) -> Result<String, CaError> {
    let path = paths.admin_token();
    if let Some(token) = read_token(&path)? {
        return Ok(token);
    }
    let token = generate();
    write_private(&path, token.as_bytes())?;
    info!(path = %path.display(), "generated admin token");
    Ok(token)
}

/// Compare a presented secret against the expected one in constant time
pub fn tokens_match(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

fn generate() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn read_token(path: &Path) -> Result<Option<String>, CaError> {
    match std::fs::read_to_string(path) {
        Ok(s) if !s.trim().is_empty() => Ok(Some(s.trim().to_string())),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn store() -> (tempfile::TempDir, TokenStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(&CaPaths::new(dir.path()));
        (dir, store)
    }

    #[test]
    fn test_ensure_generates_hex_token_once() {
        let (dir, store) = store();
        store.ensure().unwrap();
        let token = store.current().unwrap();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

        store.ensure().unwrap();
        assert_eq!(store.current().unwrap(), token);

        let mode = std::fs::metadata(dir.path().join("token"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_missing_token_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(store.current(), Err(CaError::TokenNotFound)));
        assert!(!store.validate("anything").unwrap());
    }

    #[test]
    fn test_rotation_keeps_previous_until_retired() {
        let (_dir, store) = store();
        store.ensure().unwrap();
        let old = store.current().unwrap();
        let new = store.rotate().unwrap();

        assert_ne!(old, new);
        assert!(store.validate(&new).unwrap());
        assert!(store.validate(&old).unwrap());

        store.retire_previous().unwrap();
        assert!(!store.validate(&old).unwrap());
        assert!(store.validate(&new).unwrap());
    }

    #[test]
    fn test_admin_token_is_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let paths = CaPaths::new(dir.path());
        let token = ensure_admin_token(&paths).unwrap();
        assert_eq!(token.len(), 64);
        assert_eq!(ensure_admin_token(&paths).unwrap(), token);

        let mode = std::fs::metadata(paths.admin_token()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("abc", "abc"));
        assert!(!tokens_match("abc", "abd"));
        assert!(!tokens_match("abc", "ab"));
        assert!(!tokens_match("abc", ""));
    }

    #[test]
    fn test_empty_presented_token_is_rejected() {
        let (_dir, store) = store();
        store.ensure().unwrap();
        assert!(!store.validate("").unwrap());
    }
}
