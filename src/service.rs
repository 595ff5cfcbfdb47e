use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::directory::InMemoryDirectory;
use crate::engine::{Engine, InMemoryStore, ReservationStore};
use crate::model::Event;
use crate::observability::WAL_COMPACTIONS_TOTAL;
use crate::wal::{Journal, JournalError};

pub const WAL_FILE_NAME: &str = "shareit.wal";

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Everything a running server needs: the engine plus the concrete
/// in-memory collaborators behind it, all journaled to one WAL.
pub struct Service {
    pub engine: Arc<Engine>,
    pub directory: Arc<InMemoryDirectory>,
    pub store: Arc<InMemoryStore>,
    journal: Journal,
}

impl Service {
    /// Open (or create) the WAL in `data_dir`, replay it, and start the
    /// compactor. Must be called from within a Tokio runtime.
    pub fn open(data_dir: &Path, compact_threshold: u64) -> std::io::Result<Arc<Self>> {
        std::fs::create_dir_all(data_dir)?;
        let wal_path = data_dir.join(WAL_FILE_NAME);
        let (journal, events) = Journal::open(&wal_path)?;

        let directory = Arc::new(InMemoryDirectory::with_journal(journal.clone()));
        let store = Arc::new(InMemoryStore::with_journal(journal.clone()));
        for event in &events {
            directory.apply_event(event);
            store.apply_event(event);
        }
        info!(
            "replayed {} events from {}: {} items with reservations",
            events.len(),
            wal_path.display(),
            store.item_count()
        );

        let engine = Arc::new(Engine::with_directory(
            store.clone() as Arc<dyn ReservationStore>,
            directory.clone(),
        ));
        let service = Arc::new(Self {
            engine,
            directory,
            store,
            journal,
        });

        let compactor = service.clone();
        tokio::spawn(async move {
            compactor.run_compactor(compact_threshold).await;
        });
        Ok(service)
    }

    /// Rewrite the WAL as the minimal event sequence for the current state.
    pub async fn compact(&self) -> Result<usize, JournalError> {
        let written = self
            .journal
            .compact_with(self.snapshot_events())
            .await?;
        metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
        info!("WAL compacted to {written} events");
        Ok(written)
    }

    async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = self.directory.snapshot_events();
        events.extend(self.store.snapshot_events().await);
        events
    }

    /// Periodically compacts the WAL once enough appends have accumulated.
    async fn run_compactor(&self, threshold: u64) {
        let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
        loop {
            interval.tick().await;
            let appends = self.journal.appends_since_compact().await;
            if appends < threshold {
                continue;
            }
            if let Err(e) = self.compact().await {
                tracing::error!("WAL compaction failed: {e}");
            }
        }
    }
}
