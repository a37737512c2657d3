//! Periodic fleet sweeps

use std::sync::Arc;
use std::time::Duration;

use nexus_core::Sweeper;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Run the machine and agent sweeps now and then every `interval` until `cancel` fires
pub fn spawn_sweeps(
    sweeper: Arc<Sweeper>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => run_sweeps(&sweeper).await,
            }
        }
    })
}

async fn run_sweeps(sweeper: &Sweeper) {
    match sweeper.sync_machines().await {
        Ok(r) => info!(total = r.total, failed = r.failed, "machine sweep finished"),
        Err(e) => error!(error = %e, "machine sweep failed"),
    }
    match sweeper.sync_agents().await {
        Ok(r) => info!(total = r.total, failed = r.failed, "agent sweep finished"),
        Err(e) => error!(error = %e, "agent sweep failed"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use nexus_ca::{CaPaths, TokenStore};
    use nexus_core::{CoreError, Machine, MemoryStore, RemoteConverger, Store};

    use super::*;

    #[derive(Default)]
    struct CountingConverger {
        updates: AtomicUsize,
    }

    #[async_trait]
    impl RemoteConverger for CountingConverger {
        async fn manual_update(&self, _machine_id: &str) -> Result<(), CoreError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn install_agent(&self, _machine_id: &str) -> Result<(), CoreError> {
            Ok(())
        }

        async fn restore(&self, _machine: &Machine) -> Result<(), CoreError> {
            Ok(())
        }

        async fn sync_agent_token(&self, _machine_id: &str) -> Result<(), CoreError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeps_run_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        store
            .save_machine(Machine::new("m-1", "web", "10.0.0.5"))
            .await
            .unwrap();
        let converger = Arc::new(CountingConverger::default());
        let sweeper = Arc::new(Sweeper::new(
            store,
            converger.clone(),
            Arc::new(TokenStore::new(&CaPaths::new(dir.path()))),
        ));

        let cancel = CancellationToken::new();
        let handle = spawn_sweeps(sweeper, Duration::from_secs(60), cancel.clone());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(converger.updates.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(converger.updates.load(Ordering::SeqCst), 2);

        cancel.cancel();
        handle.await.unwrap();
    }
}
