//! Disqualification sync.
//!
//! `disqualified(id, cfm, tfm)` carries two independent flags: `tfm` for
//! source-side reliability verdicts, `cfm` for site moderation sanctions.
//! Rows with both flags clear are dropped.

use futures_util::TryStreamExt;
use sb_db::Db;
use sqlx::{QueryBuilder, Row};
use tracing::debug;

use crate::error::UpdateError;

pub async fn sync(internal: &Db, external: &Db, batch_size: usize) -> Result<(), UpdateError> {
    debug!("updating disqualifications");
    sqlx::query("UPDATE `disqualified` SET `tfm` = 0")
        .execute(internal.pool())
        .await?;

    debug!("marking unreliable source players");
    let mut rows = sqlx::query("SELECT `id` FROM `player` WHERE `stats_reliability` = 2")
        .fetch(external.pool());
    let mut batch: Vec<i64> = Vec::with_capacity(batch_size);
    while let Some(row) = rows.try_next().await? {
        batch.push(row.try_get(0)?);
        if batch.len() == batch_size {
            upsert_tfm(internal, &batch).await?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        upsert_tfm(internal, &batch).await?;
    }
    drop(rows);

    debug!("clearing lifted cfm disqualifications");
    sqlx::query(
        "UPDATE \
             `disqualified` as `d` \
             LEFT JOIN `sanctions` as `s` ON `s`.`player` = `d`.`id` \
         SET `d`.`cfm` = 0 \
         WHERE \
             `s`.`player` IS NULL AND \
             `d`.`cfm` = 1",
    )
    .execute(internal.pool())
    .await?;

    debug!("inserting new cfm disqualifications");
    sqlx::query(
        "INSERT INTO `disqualified` (`id`, `cfm`) \
         SELECT `player` as `id`, 1 as `cfm` FROM `sanctions` \
         ON DUPLICATE KEY UPDATE `cfm` = 1",
    )
    .execute(internal.pool())
    .await?;

    debug!("deleting cleared rows");
    sqlx::query("DELETE FROM `disqualified` WHERE `cfm` = 0 AND `tfm` = 0")
        .execute(internal.pool())
        .await?;

    debug!("disqualification sync done");
    Ok(())
}

async fn upsert_tfm(internal: &Db, ids: &[i64]) -> Result<(), UpdateError> {
    let mut builder = QueryBuilder::new("INSERT INTO `disqualified` (`id`, `tfm`) ");
    builder.push_values(ids.iter(), |mut values, id| {
        values.push_bind(*id);
        values.push_bind(1_i64);
    });
    builder.push(" ON DUPLICATE KEY UPDATE `tfm` = 1");
    builder.build().execute(internal.pool()).await?;
    Ok(())
}
