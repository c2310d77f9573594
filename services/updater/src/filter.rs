//! The two-map diff filter.
//!
//! Consumes the destination hash-cache stream and the source hash stream
//! concurrently, pairing entries by id.  Diverging pairs become refetch
//! targets (carrying the source crc); matching pairs are dropped.  At EOF,
//! leftover source entries are new rows (refetched) and leftover
//! destination ids are deletions, unless the deletion set is so large the
//! source looks like it is being rebuilt.

use sb_db::{Db, TableMeta};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::UpdateError;
use crate::pipe::{BatchEmitter, HashPair, Pipe};

/// Pause the faster input at 3× imbalance; resume below 1.5× (hysteresis,
/// so the gate does not oscillate).
const PAUSE_RATIO: f64 = 3.0;
const RESUME_RATIO: f64 = 1.5;

/// Deletion sets at least this large are skipped entirely.
const DELETE_GATE: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Internal,
    External,
}

/// What remains after both inputs reach EOF.
#[derive(Debug, Default)]
pub struct FilterResidue {
    /// Destination ids absent from the source.
    pub deletions: Vec<i64>,
}

/// The filter stage: runs the diff, then applies (or gates) deletions.
pub async fn filter_stage(
    db: Db,
    table: TableMeta,
    batch_size: usize,
    internal_rx: mpsc::Receiver<Pipe<HashPair>>,
    external_rx: mpsc::Receiver<Pipe<HashPair>>,
    out: mpsc::Sender<Pipe<HashPair>>,
) -> Result<(), UpdateError> {
    let emitter = BatchEmitter::new(out, batch_size);
    let residue = run_filter(internal_rx, external_rx, emitter).await?;

    if residue.deletions.len() >= DELETE_GATE {
        warn!(
            table = %table.name,
            rows = residue.deletions.len(),
            "too many rows to delete; assuming the source is rebuilding"
        );
        return Ok(());
    }
    if !residue.deletions.is_empty() {
        delete_rows(&db, &table, &residue.deletions, batch_size).await?;
    }
    Ok(())
}

/// The diff core, free of database access.
pub async fn run_filter(
    mut internal_rx: mpsc::Receiver<Pipe<HashPair>>,
    mut external_rx: mpsc::Receiver<Pipe<HashPair>>,
    mut emitter: BatchEmitter<HashPair>,
) -> Result<FilterResidue, UpdateError> {
    let mut internal: HashMap<i64, u32> = HashMap::new();
    let mut external: HashMap<i64, u32> = HashMap::new();
    let mut internal_done = false;
    let mut external_done = false;
    let mut paused: Option<Side> = None;

    while !(internal_done && external_done) {
        paused = next_pause(
            paused,
            internal.len(),
            external.len(),
            internal_done,
            external_done,
        );

        tokio::select! {
            item = internal_rx.recv(), if !internal_done && paused != Some(Side::Internal) => {
                match item {
                    Some(Pipe::Batch(pairs)) => {
                        for pair in pairs {
                            match external.remove(&pair.id) {
                                // Seen by the source already: refetch only on divergence,
                                // always carrying the source crc.
                                Some(source_crc) => {
                                    if source_crc != pair.crc {
                                        emitter.push(HashPair { id: pair.id, crc: source_crc }).await?;
                                    }
                                }
                                None => {
                                    internal.insert(pair.id, pair.crc);
                                }
                            }
                        }
                    }
                    Some(Pipe::ShortNext) => {}
                    Some(Pipe::Eof) | None => internal_done = true,
                }
            }
            item = external_rx.recv(), if !external_done && paused != Some(Side::External) => {
                match item {
                    Some(Pipe::Batch(pairs)) => {
                        for pair in pairs {
                            match internal.remove(&pair.id) {
                                Some(cached_crc) => {
                                    if cached_crc != pair.crc {
                                        emitter.push(pair).await?;
                                    }
                                }
                                None => {
                                    external.insert(pair.id, pair.crc);
                                }
                            }
                        }
                    }
                    Some(Pipe::ShortNext) => {}
                    Some(Pipe::Eof) | None => external_done = true,
                }
            }
        }
    }

    debug!(
        external = external.len(),
        internal = internal.len(),
        "unpaired hashes at filter EOF"
    );

    // Source leftovers are rows the destination has never seen (or whose
    // cache entry vanished): all refetched.
    for (id, crc) in external {
        emitter.push(HashPair { id, crc }).await?;
    }
    emitter.finish().await?;

    Ok(FilterResidue {
        deletions: internal.into_keys().collect(),
    })
}

/// Hysteretic pause decision on the stored-entry imbalance.
fn next_pause(
    paused: Option<Side>,
    internal_len: usize,
    external_len: usize,
    internal_done: bool,
    external_done: bool,
) -> Option<Side> {
    // A finished side can no longer grow its map; never block the other.
    if internal_done || external_done {
        return None;
    }

    let larger = internal_len.max(external_len) as f64;
    let smaller = internal_len.min(external_len).max(1) as f64;
    let ratio = larger / smaller;

    match paused {
        None if ratio >= PAUSE_RATIO => Some(if internal_len >= external_len {
            Side::Internal
        } else {
            Side::External
        }),
        Some(_) if ratio < RESUME_RATIO => None,
        other => other,
    }
}

async fn delete_rows(
    db: &Db,
    table: &TableMeta,
    ids: &[i64],
    batch_size: usize,
) -> Result<(), UpdateError> {
    info!(table = %table.name, rows = ids.len(), "deleting rows absent from the source");
    for chunk in ids.chunks(batch_size) {
        let list = chunk
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        sqlx::query(&format!(
            "DELETE FROM `{}` WHERE `{}` IN ({list})",
            table.name, table.primary
        ))
        .execute(db.pool())
        .await?;
        sqlx::query(&format!(
            "DELETE FROM `{}` WHERE `id` IN ({list})",
            table.read_hash
        ))
        .execute(db.pool())
        .await?;
    }
    debug!(table = %table.name, "delete done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BATCH: usize = 4;

    struct Harness {
        internal_tx: mpsc::Sender<Pipe<HashPair>>,
        external_tx: mpsc::Sender<Pipe<HashPair>>,
        out_rx: mpsc::Receiver<Pipe<HashPair>>,
        task: tokio::task::JoinHandle<Result<FilterResidue, UpdateError>>,
    }

    fn start() -> Harness {
        let (internal_tx, internal_rx) = mpsc::channel(64);
        let (external_tx, external_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(64);
        let emitter = BatchEmitter::new(out_tx, BATCH);
        let task = tokio::spawn(run_filter(internal_rx, external_rx, emitter));
        Harness {
            internal_tx,
            external_tx,
            out_rx,
            task,
        }
    }

    fn pair(id: i64, crc: u32) -> HashPair {
        HashPair { id, crc }
    }

    async fn collect(mut rx: mpsc::Receiver<Pipe<HashPair>>) -> Vec<Pipe<HashPair>> {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    fn emitted_pairs(items: &[Pipe<HashPair>]) -> Vec<HashPair> {
        items
            .iter()
            .filter_map(|item| match item {
                Pipe::Batch(pairs) => Some(pairs.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[tokio::test]
    async fn identical_sides_emit_nothing_and_delete_nothing() {
        let h = start();
        let pairs = vec![pair(1, 10), pair(2, 20), pair(3, 30)];
        h.internal_tx.send(Pipe::Batch(pairs.clone())).await.unwrap();
        h.internal_tx.send(Pipe::Eof).await.unwrap();
        h.external_tx.send(Pipe::Batch(pairs)).await.unwrap();
        h.external_tx.send(Pipe::Eof).await.unwrap();

        let residue = h.task.await.unwrap().unwrap();
        let out = collect(h.out_rx).await;
        assert_eq!(out, vec![Pipe::Eof]);
        assert!(residue.deletions.is_empty());
    }

    #[tokio::test]
    async fn single_divergence_is_one_refetch_with_the_source_crc() {
        let h = start();
        h.internal_tx
            .send(Pipe::Batch(vec![pair(1, 10), pair(2, 20), pair(3, 30)]))
            .await
            .unwrap();
        h.internal_tx.send(Pipe::Eof).await.unwrap();
        h.external_tx
            .send(Pipe::Batch(vec![pair(1, 10), pair(2, 99), pair(3, 30)]))
            .await
            .unwrap();
        h.external_tx.send(Pipe::Eof).await.unwrap();

        let residue = h.task.await.unwrap().unwrap();
        let out = collect(h.out_rx).await;
        assert_eq!(emitted_pairs(&out), vec![pair(2, 99)]);
        // The short batch is announced before it ships.
        assert_eq!(out[0], Pipe::ShortNext);
        assert!(residue.deletions.is_empty());
    }

    #[tokio::test]
    async fn eof_leftovers_are_set_differences() {
        let h = start();
        // Destination knows 1..=3; source knows 2..=4.
        h.internal_tx
            .send(Pipe::Batch(vec![pair(1, 1), pair(2, 2), pair(3, 3)]))
            .await
            .unwrap();
        h.internal_tx.send(Pipe::Eof).await.unwrap();
        h.external_tx
            .send(Pipe::Batch(vec![pair(2, 2), pair(3, 3), pair(4, 4)]))
            .await
            .unwrap();
        h.external_tx.send(Pipe::Eof).await.unwrap();

        let residue = h.task.await.unwrap().unwrap();
        let out = collect(h.out_rx).await;
        assert_eq!(emitted_pairs(&out), vec![pair(4, 4)], "new source row refetched");
        assert_eq!(residue.deletions, vec![1], "vanished destination row deleted");
    }

    #[tokio::test]
    async fn matching_hashes_across_interleaved_batches_pair_off() {
        let h = start();
        // Interleave so each side stores then drains.
        h.internal_tx.send(Pipe::Batch(vec![pair(1, 1)])).await.unwrap();
        h.external_tx.send(Pipe::Batch(vec![pair(2, 2)])).await.unwrap();
        h.internal_tx.send(Pipe::Batch(vec![pair(2, 2)])).await.unwrap();
        h.external_tx.send(Pipe::Batch(vec![pair(1, 5)])).await.unwrap();
        h.internal_tx.send(Pipe::Eof).await.unwrap();
        h.external_tx.send(Pipe::Eof).await.unwrap();

        let residue = h.task.await.unwrap().unwrap();
        let out = collect(h.out_rx).await;
        // Row 1 diverged (1 vs 5): refetched with the source crc 5.
        assert_eq!(emitted_pairs(&out), vec![pair(1, 5)]);
        assert!(residue.deletions.is_empty());
    }

    #[tokio::test]
    async fn exact_batch_boundary_has_no_short_marker() {
        let h = start();
        // Four divergent rows: exactly one full output batch.
        let old: Vec<HashPair> = (1..=4).map(|id| pair(id, 1)).collect();
        let new: Vec<HashPair> = (1..=4).map(|id| pair(id, 2)).collect();
        h.internal_tx.send(Pipe::Batch(old)).await.unwrap();
        h.internal_tx.send(Pipe::Eof).await.unwrap();
        h.external_tx.send(Pipe::Batch(new.clone())).await.unwrap();
        h.external_tx.send(Pipe::Eof).await.unwrap();

        h.task.await.unwrap().unwrap();
        let out = collect(h.out_rx).await;
        assert_eq!(out, vec![Pipe::Batch(new), Pipe::Eof]);
    }

    #[test]
    fn pause_engages_at_three_to_one_and_releases_below_half_that() {
        // Balanced: no pause.
        assert_eq!(next_pause(None, 100, 100, false, false), None);
        // 3x imbalance pauses the bigger side.
        assert_eq!(
            next_pause(None, 300, 100, false, false),
            Some(Side::Internal)
        );
        assert_eq!(
            next_pause(None, 100, 300, false, false),
            Some(Side::External)
        );
        // Still above the resume threshold: stays paused.
        assert_eq!(
            next_pause(Some(Side::Internal), 200, 100, false, false),
            Some(Side::Internal)
        );
        // Below 1.5x: resumes.
        assert_eq!(next_pause(Some(Side::Internal), 140, 100, false, false), None);
        // A finished side never blocks the other.
        assert_eq!(next_pause(Some(Side::External), 0, 900, true, false), None);
    }

    #[tokio::test]
    async fn imbalance_stays_bounded_with_a_fast_source() {
        // The source floods 10x more entries than the destination has
        // produced; the pause gate must keep the stored imbalance at the
        // pause threshold, so everything still pairs off and drains.
        let h = start();
        let n = 200_i64;

        let external_tx = h.external_tx.clone();
        let feed_external = tokio::spawn(async move {
            for id in 0..n {
                external_tx
                    .send(Pipe::Batch(vec![pair(id, id as u32)]))
                    .await
                    .unwrap();
            }
            external_tx.send(Pipe::Eof).await.unwrap();
        });
        let internal_tx = h.internal_tx.clone();
        let feed_internal = tokio::spawn(async move {
            for id in 0..n {
                // Slow side: one entry per yield.
                tokio::task::yield_now().await;
                internal_tx
                    .send(Pipe::Batch(vec![pair(id, id as u32)]))
                    .await
                    .unwrap();
            }
            internal_tx.send(Pipe::Eof).await.unwrap();
        });
        drop(h.internal_tx);
        drop(h.external_tx);

        let residue = h.task.await.unwrap().unwrap();
        feed_external.await.unwrap();
        feed_internal.await.unwrap();
        let out = collect(h.out_rx).await;
        // Identical data: nothing refetched, nothing deleted.
        assert_eq!(emitted_pairs(&out), Vec::<HashPair>::new());
        assert!(residue.deletions.is_empty());
    }
}
