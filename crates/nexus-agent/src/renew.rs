//! Host certificate renewal
//!
//! A monitor scoped to one connection wakes periodically and asks for a fresh host
//! certificate when the local one is missing or about to expire.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nexus_api::StreamRequest;
use ssh_key::Certificate;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CHECK_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
pub const RENEWAL_WINDOW: Duration = Duration::from_secs(10 * 24 * 60 * 60);

/// Whether the certificate at `path` is absent, unreadable, or expires within `window` of `now`
pub fn needs_renewal(path: &Path, now: u64, window: Duration) -> bool {
    let Ok(text) = std::fs::read_to_string(path) else {
        return true;
    };
    match Certificate::from_openssh(text.trim()) {
        Ok(cert) => cert.valid_before() <= now.saturating_add(window.as_secs()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable host certificate");
            true
        }
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Renewal loop for one connection; ends when `cancel` fires or the stream is gone
pub async fn renewal_monitor(
    certificate: std::path::PathBuf,
    public_host_key: String,
    requests: mpsc::UnboundedSender<StreamRequest>,
    cancel: CancellationToken,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    // The connect request already covers the first tick
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("renewal monitor stopped");
                return;
            }
            _ = ticker.tick() => {
                if !needs_renewal(&certificate, unix_now(), RENEWAL_WINDOW) {
                    continue;
                }
                info!("host certificate due for renewal");
                let request = StreamRequest {
                    version: Some(env!("CARGO_PKG_VERSION").to_string()),
                    public_host_key: Some(public_host_key.clone()),
                };
                if requests.send(request).is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssh_key::certificate::{Builder, CertType};
    use ssh_key::{Algorithm, PrivateKey};

    const DAY: u64 = 24 * 60 * 60;

    fn write_cert(path: &Path, valid_after: u64, valid_before: u64) {
        let ca = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap();
        let host = PrivateKey::random(&mut rand::rngs::OsRng, Algorithm::Ed25519).unwrap();
        let mut builder = Builder::new_with_random_nonce(
            &mut rand::rngs::OsRng,
            host.public_key(),
            valid_after,
            valid_before,
        )
        .unwrap();
        builder.cert_type(CertType::Host).unwrap();
        builder.all_principals_valid().unwrap();
        let cert = builder.sign(&ca).unwrap();
        std::fs::write(path, cert.to_openssh().unwrap()).unwrap();
    }

    #[test]
    fn test_missing_certificate_needs_renewal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(needs_renewal(&dir.path().join("absent"), unix_now(), RENEWAL_WINDOW));
    }

    #[test]
    fn test_certificate_inside_window_needs_renewal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cert.pub");
        let now = unix_now();
        write_cert(&path, now - DAY, now + 5 * DAY);
        assert!(needs_renewal(&path, now, RENEWAL_WINDOW));
    }

    #[test]
    fn test_fresh_certificate_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cert.pub");
        let now = unix_now();
        write_cert(&path, now - DAY, now + 30 * DAY);
        assert!(!needs_renewal(&path, now, RENEWAL_WINDOW));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_requests_then_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(renewal_monitor(
            dir.path().join("absent"),
            "ssh-ed25519 AAAA".to_string(),
            tx,
            cancel.clone(),
            CHECK_INTERVAL,
        ));

        let request = rx.recv().await.unwrap();
        assert_eq!(request.public_host_key.as_deref(), Some("ssh-ed25519 AAAA"));

        cancel.cancel();
        task.await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
