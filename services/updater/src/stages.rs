//! Pipeline stage loops.
//!
//! Every stage consumes a bounded input channel and/or produces to one,
//! suspending only on channel operations and SQL round-trips.  A stage
//! returns on `Eof` or fails on its first error; the runner cancels the
//! siblings of a failed stage.

use futures_util::TryStreamExt;
use sb_db::{Db, SqlValue, TableMeta};
use sqlx::QueryBuilder;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::UpdateError;
use crate::pipe::{HashPair, Pipe};

/// Rows flowing to the update stage: one `Vec<SqlValue>` per row, in
/// write-column order.
pub type Row = Vec<SqlValue>;

/// Show progress roughly every 5% of the source scan.
const PROGRESS_STEPS: i64 = 20;

// ---------------------------------------------------------------------------
// Source scans
// ---------------------------------------------------------------------------

/// Cold-path scan: full rows (crc first) out of the source table.
pub async fn grab_all(
    db: Db,
    table: TableMeta,
    batch_size: usize,
    out: mpsc::Sender<Pipe<Row>>,
) -> Result<(), UpdateError> {
    debug!(table = %table.name, "start grab loop");
    let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM `{}`", table.name))
        .fetch_one(db.pool())
        .await?;
    info!(table = %table.name, rows = total, "source rows");
    let mut progress = Progress::new(&table.name, total, batch_size);

    let sql = format!(
        "SELECT {}, {} FROM `{}`",
        table.crc_expr(),
        table.select_list(),
        table.name,
    );
    let mut rows = sqlx::query(&sql).fetch(db.pool());
    let mut batch = Vec::with_capacity(batch_size);
    while let Some(row) = rows.try_next().await? {
        batch.push(SqlValue::decode_row(&row)?);
        if batch.len() == batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            send(&out, Pipe::Batch(full)).await?;
            progress.tick();
        }
    }
    if !batch.is_empty() {
        send(&out, Pipe::Batch(batch)).await?;
    }
    send(&out, Pipe::Eof).await?;
    debug!(table = %table.name, "grab loop done");
    Ok(())
}

/// Warm-path scan: `(id, crc)` pairs out of the source table.
pub async fn grab_hashes(
    db: Db,
    table: TableMeta,
    batch_size: usize,
    out: mpsc::Sender<Pipe<HashPair>>,
) -> Result<(), UpdateError> {
    debug!(table = %table.name, "start grab loop");
    let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM `{}`", table.name))
        .fetch_one(db.pool())
        .await?;
    info!(table = %table.name, rows = total, "source rows");
    let mut progress = Progress::new(&table.name, total, batch_size);

    let sql = format!(
        "SELECT `{}`, {} FROM `{}`",
        table.primary,
        table.crc_expr(),
        table.name,
    );
    let mut rows = sqlx::query(&sql).fetch(db.pool());
    let mut batch = Vec::with_capacity(batch_size);
    while let Some(row) = rows.try_next().await? {
        batch.push(decode_hash_pair(&row, &table)?);
        if batch.len() == batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            send(&out, Pipe::Batch(full)).await?;
            progress.tick();
        }
    }
    if !batch.is_empty() {
        send(&out, Pipe::Batch(batch)).await?;
    }
    send(&out, Pipe::Eof).await?;
    debug!(table = %table.name, "grab loop done");
    Ok(())
}

/// Warm-path cache scan: `(id, crc)` pairs out of the read hash cache.
pub async fn load_hashes(
    db: Db,
    table: TableMeta,
    batch_size: usize,
    out: mpsc::Sender<Pipe<HashPair>>,
) -> Result<(), UpdateError> {
    debug!(table = %table.name, "start load loop");
    let sql = format!("SELECT `id`, `hashed` FROM `{}`", table.read_hash);
    let mut rows = sqlx::query(&sql).fetch(db.pool());
    let mut batch = Vec::with_capacity(batch_size);
    while let Some(row) = rows.try_next().await? {
        batch.push(decode_hash_pair(&row, &table)?);
        if batch.len() == batch_size {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
            send(&out, Pipe::Batch(full)).await?;
        }
    }
    if !batch.is_empty() {
        send(&out, Pipe::Batch(batch)).await?;
    }
    send(&out, Pipe::Eof).await?;
    debug!(table = %table.name, "load loop done");
    Ok(())
}

// ---------------------------------------------------------------------------
// Cold-path split
// ---------------------------------------------------------------------------

/// Peel the leading crc off each cold-path row: hashes go to the hash
/// stage, the remaining write-ordered columns to the update stage.
pub async fn split(
    table: TableMeta,
    mut inp: mpsc::Receiver<Pipe<Row>>,
    out_rows: mpsc::Sender<Pipe<Row>>,
    out_hashes: mpsc::Sender<Pipe<HashPair>>,
) -> Result<(), UpdateError> {
    let primary_idx = table
        .read_columns
        .iter()
        .position(|column| *column == table.primary)
        .unwrap_or(0);

    while let Some(item) = inp.recv().await {
        match item {
            Pipe::Batch(rows) => {
                let mut hashes = Vec::with_capacity(rows.len());
                let mut data = Vec::with_capacity(rows.len());
                for mut row in rows {
                    let crc = row.remove(0);
                    let id = row
                        .get(primary_idx)
                        .and_then(SqlValue::as_i64)
                        .ok_or_else(|| UpdateError::BadRow(table.name.clone()))?;
                    let crc = crc
                        .as_i64()
                        .ok_or_else(|| UpdateError::BadRow(table.name.clone()))?;
                    hashes.push(HashPair {
                        id,
                        crc: crc as u32,
                    });
                    data.push(row);
                }
                send(&out_hashes, Pipe::Batch(hashes)).await?;
                send(&out_rows, Pipe::Batch(data)).await?;
            }
            Pipe::ShortNext => {}
            Pipe::Eof => {
                send(&out_hashes, Pipe::Eof).await?;
                send(&out_rows, Pipe::Eof).await?;
                break;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Warm-path fetch
// ---------------------------------------------------------------------------

/// Refetch full rows for filtered ids.
///
/// The `IN (…)` placeholder list is sized for a full batch; a batch behind
/// a [`Pipe::ShortNext`] marker pads its ids with the reserved sentinel 0.
pub async fn fetch(
    db: Db,
    table: TableMeta,
    batch_size: usize,
    mut inp: mpsc::Receiver<Pipe<HashPair>>,
    out_rows: mpsc::Sender<Pipe<Row>>,
    out_hashes: mpsc::Sender<Pipe<HashPair>>,
) -> Result<(), UpdateError> {
    debug!(table = %table.name, "start fetch loop");
    let placeholders = vec!["?"; batch_size].join(",");
    let sql = format!(
        "SELECT {} FROM `{}` WHERE `{}` IN ({placeholders})",
        table.select_list(),
        table.name,
        table.primary,
    );

    let mut short_next = false;
    while let Some(item) = inp.recv().await {
        match item {
            Pipe::ShortNext => short_next = true,
            Pipe::Batch(pairs) => {
                let mut ids: Vec<i64> = pairs.iter().map(|pair| pair.id).collect();
                if short_next {
                    short_next = false;
                    ids.resize(batch_size, 0);
                }

                let mut query = sqlx::query(&sql);
                for id in &ids {
                    query = query.bind(*id);
                }
                let fetched = query.fetch_all(db.pool()).await?;
                let mut data = Vec::with_capacity(fetched.len());
                for row in &fetched {
                    data.push(SqlValue::decode_row(row)?);
                }

                send(&out_hashes, Pipe::Batch(pairs)).await?;
                send(&out_rows, Pipe::Batch(data)).await?;
            }
            Pipe::Eof => {
                send(&out_hashes, Pipe::Eof).await?;
                send(&out_rows, Pipe::Eof).await?;
                break;
            }
        }
    }
    debug!(table = %table.name, "fetch loop done");
    Ok(())
}

// ---------------------------------------------------------------------------
// Destination writes
// ---------------------------------------------------------------------------

/// Batched `REPLACE INTO` the write target (the table itself when cold,
/// the staging table when warm; staging is truncated up front).
pub async fn update(
    db: Db,
    table: TableMeta,
    mut inp: mpsc::Receiver<Pipe<Row>>,
) -> Result<(), UpdateError> {
    debug!(table = %table.name, "start update loop");
    if !table.is_empty {
        sqlx::query(&format!("TRUNCATE `{}`", table.staging()))
            .execute(db.pool())
            .await?;
    }

    let prefix = format!(
        "REPLACE INTO `{}` (`{}`) ",
        table.write_target(),
        table.write_columns.join("`,`"),
    );
    while let Some(item) = inp.recv().await {
        match item {
            Pipe::Batch(rows) if !rows.is_empty() => {
                let mut builder = QueryBuilder::new(&prefix);
                builder.push_values(rows.iter(), |mut values, row| {
                    for cell in row {
                        cell.push_bind(&mut values);
                    }
                });
                builder.build().execute(db.pool()).await?;
            }
            Pipe::Batch(_) | Pipe::ShortNext => {}
            Pipe::Eof => break,
        }
    }
    debug!(table = %table.name, "update loop done");
    Ok(())
}

/// Batched insert into the hash target (read cache when cold, write cache
/// when warm).
pub async fn hash(
    db: Db,
    table: TableMeta,
    mut inp: mpsc::Receiver<Pipe<HashPair>>,
) -> Result<(), UpdateError> {
    debug!(table = %table.name, "start hash loop");
    let prefix = format!("INSERT INTO `{}` (`id`, `hashed`) ", table.hash_target());
    while let Some(item) = inp.recv().await {
        match item {
            Pipe::Batch(pairs) if !pairs.is_empty() => {
                let mut builder = QueryBuilder::new(&prefix);
                builder.push_values(pairs.iter(), |mut values, pair| {
                    values.push_bind(pair.id);
                    values.push_bind(pair.crc);
                });
                builder.build().execute(db.pool()).await?;
            }
            Pipe::Batch(_) | Pipe::ShortNext => {}
            Pipe::Eof => break,
        }
    }
    debug!(table = %table.name, "hash loop done");
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn send<T>(tx: &mpsc::Sender<Pipe<T>>, item: Pipe<T>) -> Result<(), UpdateError> {
    tx.send(item).await.map_err(|_| UpdateError::PipeClosed)
}

fn decode_hash_pair(row: &sqlx::mysql::MySqlRow, table: &TableMeta) -> Result<HashPair, UpdateError> {
    let id = SqlValue::decode(row, 0)?
        .as_i64()
        .ok_or_else(|| UpdateError::BadRow(table.name.clone()))?;
    let crc = SqlValue::decode(row, 1)?
        .as_i64()
        .ok_or_else(|| UpdateError::BadRow(table.name.clone()))?;
    Ok(HashPair {
        id,
        crc: crc as u32,
    })
}

struct Progress {
    table: String,
    every: i64,
    total_batches: i64,
    count: i64,
}

impl Progress {
    fn new(table: &str, total_rows: i64, batch_size: usize) -> Progress {
        let total_batches = (total_rows + batch_size as i64 - 1) / batch_size as i64;
        Progress {
            table: table.to_owned(),
            every: (total_batches / PROGRESS_STEPS).max(1),
            total_batches: total_batches.max(1),
            count: 0,
        }
    }

    fn tick(&mut self) {
        self.count += 1;
        if self.count % self.every == 0 {
            info!(
                table = %self.table,
                batches = self.count,
                total = self.total_batches,
                percent = self.count * 100 / self.total_batches,
                "scan progress"
            );
        }
    }
}
