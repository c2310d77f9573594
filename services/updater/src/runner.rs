//! Per-table pipeline orchestration.

use sb_db::{Db, TableMeta};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::UpdaterConfig;
use crate::error::UpdateError;
use crate::{disqualify, filter, post_update, stages};

/// Owns the two database pools and the pipeline sizing.
#[derive(Clone)]
pub struct Runner {
    /// Destination (internal) database.
    pub internal: Db,
    /// Read-only source database.
    pub external: Db,
    pub config: UpdaterConfig,
}

impl Runner {
    pub fn new(internal: Db, external: Db, config: UpdaterConfig) -> Runner {
        Runner {
            internal,
            external,
            config,
        }
    }

    /// Reconcile one table end to end: pipeline, disqualification sync
    /// (player only), per-table post actions.
    pub async fn extract(&self, table: &TableMeta) -> Result<(), UpdateError> {
        if table.is_empty {
            info!(table = %table.name, "table is empty, using the fetch-update pipeline");
            self.extract_cold(table).await?;
        } else {
            info!(table = %table.name, "table has old data, updating modified rows only");
            self.extract_warm(table).await?;
        }

        if table.name == "player" {
            // Reliability flags ride on the player pass; a failure here is
            // logged but never aborts the mirror itself.
            if let Err(err) =
                disqualify::sync(&self.internal, &self.external, self.config.batch_size).await
            {
                error!(error = %err, "disqualification sync failed");
            }
        }

        post_update::post_table(&self.internal, table).await?;
        info!(table = %table.name, "done updating");
        Ok(())
    }

    /// Cold path: the destination is empty, nothing to diff.
    ///
    /// grab → split → (update, hash)
    async fn extract_cold(&self, table: &TableMeta) -> Result<(), UpdateError> {
        let pipe = self.config.pipe_size;
        let (rows_tx, rows_rx) = mpsc::channel(pipe);
        let (update_tx, update_rx) = mpsc::channel(pipe);
        let (hash_tx, hash_rx) = mpsc::channel(pipe);

        let mut set = JoinSet::new();
        set.spawn(stages::grab_all(
            self.external.clone(),
            table.clone(),
            self.config.batch_size,
            rows_tx,
        ));
        set.spawn(stages::split(table.clone(), rows_rx, update_tx, hash_tx));
        set.spawn(stages::update(
            self.internal.clone(),
            table.clone(),
            update_rx,
        ));
        set.spawn(stages::hash(self.internal.clone(), table.clone(), hash_rx));
        drive(set, &table.name).await
    }

    /// Warm path: diff the hash caches and refetch only divergent rows.
    ///
    /// (load, grab) → filter → fetch → (update, hash)
    async fn extract_warm(&self, table: &TableMeta) -> Result<(), UpdateError> {
        let pipe = self.config.pipe_size;
        let (internal_tx, internal_rx) = mpsc::channel(pipe);
        let (external_tx, external_rx) = mpsc::channel(pipe);
        let (refetch_tx, refetch_rx) = mpsc::channel(pipe);
        let (update_tx, update_rx) = mpsc::channel(pipe);
        let (hash_tx, hash_rx) = mpsc::channel(pipe);

        let mut set = JoinSet::new();
        set.spawn(stages::load_hashes(
            self.internal.clone(),
            table.clone(),
            self.config.batch_size,
            internal_tx,
        ));
        set.spawn(stages::grab_hashes(
            self.external.clone(),
            table.clone(),
            self.config.batch_size,
            external_tx,
        ));
        set.spawn(filter::filter_stage(
            self.internal.clone(),
            table.clone(),
            self.config.batch_size,
            internal_rx,
            external_rx,
            refetch_tx,
        ));
        set.spawn(stages::fetch(
            self.external.clone(),
            table.clone(),
            self.config.batch_size,
            refetch_rx,
            update_tx,
            hash_tx,
        ));
        set.spawn(stages::update(
            self.internal.clone(),
            table.clone(),
            update_rx,
        ));
        set.spawn(stages::hash(self.internal.clone(), table.clone(), hash_rx));
        drive(set, &table.name).await
    }
}

/// Await every stage; the first failure cancels the rest and aborts the
/// table's run.
async fn drive(
    mut set: JoinSet<Result<(), UpdateError>>,
    table: &str,
) -> Result<(), UpdateError> {
    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(table, error = %err, "pipeline stage failed");
                if first_error.is_none() {
                    first_error = Some(err);
                    set.shutdown().await;
                }
            }
            Err(join_error) => {
                if join_error.is_cancelled() {
                    continue;
                }
                error!(table, error = %join_error, "pipeline stage crashed");
                if first_error.is_none() {
                    first_error = Some(UpdateError::Join(join_error.to_string()));
                    set.shutdown().await;
                }
            }
        }
    }
    match first_error {
        None => Ok(()),
        Some(err) => Err(err),
    }
}
