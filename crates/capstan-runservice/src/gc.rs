//! Terminal-run expiry.
//!
//! Runs that finished more than `run_cache_expire_interval` ago are
//! deleted together with their logs and artifacts. The run and its
//! config go through the WAL like any other mutation; the blobs are
//! removed from the object store directly.

use chrono::Utc;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;

use capstan_core::storage::{delete_prefix, StorageBackend};
use capstan_core::{paths, Result, RunId};
use capstan_datamanager::{id_group, Action, DataManager, DataType, ReadDb};

use crate::metrics_names;
use crate::types::Run;

/// Collector for expired terminal runs.
pub struct RunCollector {
    dm: Arc<DataManager>,
    readdb: ReadDb,
    storage: Arc<dyn StorageBackend>,
    expire_after: Duration,
}

impl RunCollector {
    /// Creates a collector expiring runs `expire_after` their end.
    #[must_use]
    pub fn new(
        dm: Arc<DataManager>,
        readdb: ReadDb,
        storage: Arc<dyn StorageBackend>,
        expire_after: Duration,
    ) -> Self {
        Self {
            dm,
            readdb,
            storage,
            expire_after,
        }
    }

    /// Deletes every expired run. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns the first storage or WAL error encountered.
    #[tracing::instrument(skip(self))]
    pub async fn collect(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.expire_after)
                .unwrap_or_else(|_| chrono::Duration::days(7));

        let expired: Vec<RunId> = self.readdb.do_read(|tx| {
            Ok(tx
                .all_as::<Run>(DataType::Run)?
                .into_iter()
                .filter(|run| {
                    run.phase.is_finished() && run.end_time.is_some_and(|end| end < cutoff)
                })
                .map(|run| run.id)
                .collect())
        })?;

        let mut removed = 0;
        for run_id in expired {
            self.collect_run(run_id).await?;
            removed += 1;
        }
        if removed > 0 {
            counter!(metrics_names::RUNS_EXPIRED_TOTAL).increment(removed as u64);
            tracing::info!(removed, "expired runs collected");
        }
        Ok(removed)
    }

    async fn collect_run(&self, run_id: RunId) -> Result<()> {
        let id = run_id.to_string();
        delete_prefix(self.storage.as_ref(), &paths::run_logs_prefix(&id)).await?;
        delete_prefix(self.storage.as_ref(), &paths::run_artifacts_prefix(&id)).await?;

        let cgt = self
            .readdb
            .do_read(|tx| Ok(tx.change_group_tokens(&[id_group(DataType::Run, &id)])))?;
        self.dm
            .write_wal(
                vec![
                    Action::delete(DataType::Run, id.clone()),
                    Action::delete(DataType::RunConfig, id.clone()),
                ],
                Some(&cgt),
            )
            .await?;
        tracing::debug!(run_id = %run_id, "run expired");
        Ok(())
    }
}
