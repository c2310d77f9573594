//! Post-run aggregation: per-table commit actions, tribe rollups and the
//! periodic leaderboards.

use chrono::{Duration, Local};
use sb_db::{composite_formulas, overall_formula, Db, Period, TableMeta};
use tracing::{debug, info};

use crate::error::UpdateError;

/// Stats tracked by the periodic snapshots, in snapshot column order.
pub const STAT_COLUMNS: &[&str] = &[
    "shaman_cheese",
    "saved_mice",
    "saved_mice_hard",
    "saved_mice_divine",
    "round_played",
    "cheese_gathered",
    "first",
    "bootcamp",
    "survivor_round_played",
    "survivor_mouse_killed",
    "survivor_shaman_count",
    "survivor_survivor_count",
    "racing_round_played",
    "racing_finished_map",
    "racing_first",
    "racing_podium",
    "defilante_round_played",
    "defilante_finished_map",
    "defilante_points",
];

// ---------------------------------------------------------------------------
// Per-table post actions
// ---------------------------------------------------------------------------

/// Actions after a table's pipeline succeeds.
///
/// Player gets its overall score and legacy-name fix first.  A warm run
/// then commits: merge the write hash cache into the read cache, append
/// the staged rows to the changelog, and replace them into the live table.
/// The cache merge is the commit point; a crash before it makes the next
/// run behave as if this one never happened.
pub async fn post_table(db: &Db, table: &TableMeta) -> Result<(), UpdateError> {
    if table.name == "player" {
        debug!("calculating overall player score");
        sqlx::query(&format!(
            "UPDATE `{}` SET `score_overall` = {}",
            table.write_target(),
            overall_formula(Period::Alltime),
        ))
        .execute(db.pool())
        .await?;

        debug!("renaming players without a discriminator");
        sqlx::query(&format!(
            "UPDATE `{}` SET `name` = CONCAT(`name`, '#0000') WHERE `name` NOT LIKE '%#%'",
            table.write_target(),
        ))
        .execute(db.pool())
        .await?;
    }

    if table.is_empty {
        return Ok(());
    }

    let hashes: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM `{}`", table.write_hash))
        .fetch_one(db.pool())
        .await?;
    debug!(table = %table.name, hashes, "transferring hash cache");
    sqlx::query(&format!(
        "REPLACE INTO `{}` SELECT `w`.* FROM `{}` as `w`",
        table.read_hash, table.write_hash,
    ))
    .execute(db.pool())
    .await?;
    sqlx::query(&format!("TRUNCATE `{}`", table.write_hash))
        .execute(db.pool())
        .await?;

    debug!(table = %table.name, "saving changelogs");
    sqlx::query(&format!(
        "INSERT INTO `{}` (`{}`) SELECT `n`.* FROM `{}` as `n`",
        table.changelog(),
        table.write_columns.join("`,`"),
        table.staging(),
    ))
    .execute(db.pool())
    .await?;

    debug!(table = %table.name, "transferring staged rows");
    sqlx::query(&format!(
        "REPLACE INTO `{0}` SELECT `n`.* FROM `{1}` as `n`",
        table.name,
        table.staging(),
    ))
    .execute(db.pool())
    .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Post-update aggregation
// ---------------------------------------------------------------------------

/// After all three tables are done: tribe rollup, then the six periodic
/// snapshots concurrently.
pub async fn run(db: &Db, player: &TableMeta, tribe: &TableMeta) -> Result<(), UpdateError> {
    let mut stats = TableMeta::introspect(db, "tribe_stats", false).await?;
    tribe_rollup(db, tribe, &mut stats).await?;

    futures_util::future::try_join_all([
        periodic_rank(db, player, Period::Daily),
        periodic_rank(db, player, Period::Weekly),
        periodic_rank(db, player, Period::Monthly),
        periodic_rank(db, &stats, Period::Daily),
        periodic_rank(db, &stats, Period::Weekly),
        periodic_rank(db, &stats, Period::Monthly),
    ])
    .await?;
    Ok(())
}

/// Which tribe_stats columns get summed from member stats.
fn summed_columns(stats: &TableMeta) -> Vec<&str> {
    stats
        .read_columns
        .iter()
        .map(String::as_str)
        .filter(|column| {
            !matches!(*column, "id" | "members" | "active") && !column.starts_with("score_")
        })
        .collect()
}

/// Recompute `tribe_active` and `tribe_stats` from the member and player
/// tables, then refresh the tribe scores.
///
/// Disqualified members keep their tribe membership (they still count for
/// `members`/`active`) but their stats are summed as zero.
async fn tribe_rollup(
    db: &Db,
    tribe: &TableMeta,
    stats: &mut TableMeta,
) -> Result<(), UpdateError> {
    if !tribe.is_empty {
        // tribe_stats is populated below even if it was empty before.
        stats.is_empty = false;

        debug!("calculating active tribes");
        sqlx::query("TRUNCATE `tribe_active`")
            .execute(db.pool())
            .await?;
        sqlx::query(
            "INSERT INTO `tribe_active` (`id`, `members`, `active`, `members_sqrt`) \
             SELECT \
                 `t`.`id`, \
                 COUNT(`m`.`id_member`) as `members`, \
                 COUNT(`p`.`id`) as `active`, \
                 POWER(COUNT(`m`.`id_member`), 0.5) as `members_sqrt` \
             FROM \
                 `tribe` as `t` \
                 INNER JOIN `member` as `m` ON `t`.`id` = `m`.`id_tribe` \
                 LEFT JOIN `player_new` as `p` ON `m`.`id_member` = `p`.`id` \
             GROUP BY `t`.`id` \
             HAVING `active` > 0",
        )
        .execute(db.pool())
        .await?;

        debug!("writing tribe stats changelogs");
        sqlx::query(&format!(
            "INSERT INTO `tribe_stats_changelog` (`{}`) \
             SELECT `o`.* \
             FROM `tribe_active` as `n` \
             INNER JOIN `tribe_stats` as `o` ON `n`.`id` = `o`.`id`",
            stats.write_columns.join("`,`"),
        ))
        .execute(db.pool())
        .await?;
    }

    debug!("calculating tribe stats");
    let summed = summed_columns(stats);
    let (counts, divisor, from_clause) = if tribe.is_empty {
        (
            "COUNT(`m`.`id_member`) as `members`, COUNT(`p_n`.`id`) as `active`".to_owned(),
            "POWER(COUNT(`m`.`id_member`), 0.5)".to_owned(),
            "`tribe` as `t` \
             INNER JOIN `member` as `m` ON `t`.`id` = `m`.`id_tribe` \
             INNER JOIN `player` as `p` ON `p`.`id` = `m`.`id_member` \
             LEFT JOIN `player_new` as `p_n` ON `p_n`.`id` = `p`.`id` \
             LEFT JOIN `disqualified` as `dq` ON `dq`.`id` = `p`.`id`"
                .to_owned(),
        )
    } else {
        (
            "`t`.`members`, `t`.`active`".to_owned(),
            "`t`.`members_sqrt`".to_owned(),
            "`tribe_active` as `t` \
             INNER JOIN `member` as `m` ON `t`.`id` = `m`.`id_tribe` \
             INNER JOIN `player` as `p` ON `p`.`id` = `m`.`id_member` \
             LEFT JOIN `disqualified` as `dq` ON `dq`.`id` = `p`.`id`"
                .to_owned(),
        )
    };
    let sums: Vec<String> = summed
        .iter()
        .map(|column| {
            format!("SUM(IF(`dq`.`id` IS NULL, `p`.`{column}`, 0)) / {divisor} as `{column}`")
        })
        .collect();

    sqlx::query(&format!(
        "REPLACE INTO `tribe_stats` (`id`,`members`,`active`,`{}`) \
         SELECT `t`.`id`, {counts}, {} \
         FROM {from_clause} \
         GROUP BY `t`.`id`",
        summed.join("`,`"),
        sums.join(","),
    ))
    .execute(db.pool())
    .await?;

    refresh_scores(db, "tribe_stats", Period::Alltime).await?;
    info!("tribe rollup done");
    Ok(())
}

/// Rebuild one periodic snapshot: refresh the changelog pointers for the
/// window, then repopulate the snapshot with per-stat deltas and refreshed
/// scores.
async fn periodic_rank(db: &Db, table: &TableMeta, period: Period) -> Result<(), UpdateError> {
    if table.is_empty {
        return Ok(());
    }
    let Some(days) = period.days() else {
        return Ok(());
    };

    // Window start: (today − (days−1)) truncated to midnight.
    let start = (Local::now().date_naive() - Duration::days(days - 1))
        .format("%Y%m%d")
        .to_string();

    let (label, target, source, tribe_flag) = if table.name == "tribe_stats" {
        (
            format!("tribe@{}", period.suffix()),
            format!("tribe_{}", period.suffix()),
            "tribe_stats".to_owned(),
            1,
        )
    } else {
        (
            format!("{}@{}", table.name, period.suffix()),
            format!("{}_{}", table.name, period.suffix()),
            table.staging(),
            0,
        )
    };
    let log = table.changelog();
    let pointer = match period {
        Period::Daily => "day",
        Period::Weekly => "week",
        Period::Monthly => "month",
        Period::Alltime => return Ok(()),
    };

    debug!(rank = %label, "refreshing period pointers");
    sqlx::query(&format!(
        "INSERT INTO `last_log` (`tribe`, `id`, `{pointer}`) \
         SELECT {tribe_flag}, `id`, MIN(`log_id`) \
         FROM `{log}` \
         WHERE `log_date` >= {start} \
         GROUP BY `id` \
         ON DUPLICATE KEY UPDATE `{pointer}` = VALUES(`{pointer}`)",
    ))
    .execute(db.pool())
    .await?;

    debug!(rank = %label, "calculating period deltas");
    let deltas: Vec<String> = STAT_COLUMNS
        .iter()
        .map(|column| format!("`n`.`{column}` - `o`.`{column}`"))
        .collect();
    sqlx::query(&format!("TRUNCATE `{target}`"))
        .execute(db.pool())
        .await?;
    sqlx::query(&format!(
        "INSERT INTO `{target}` (`id`, `{}`) \
         SELECT `n`.`id`, {} \
         FROM `{source}` as `n` \
         INNER JOIN `last_log` as `b` \
             ON `b`.`id` = `n`.`id` AND `b`.`tribe` = {tribe_flag} \
         INNER JOIN `{log}` as `o` \
             ON `o`.`id` = `n`.`id` AND `o`.`log_id` = `b`.`{pointer}`",
        STAT_COLUMNS.join("`,`"),
        deltas.join(","),
    ))
    .execute(db.pool())
    .await?;

    debug!(rank = %label, "calculating scores");
    refresh_scores(db, &target, period).await?;
    debug!(rank = %label, "done");
    Ok(())
}

/// Recompute the five composite scores, then the period-weighted overall.
async fn refresh_scores(db: &Db, target: &str, period: Period) -> Result<(), UpdateError> {
    let assignments: Vec<String> = composite_formulas()
        .iter()
        .map(|(column, formula)| format!("`{column}` = {formula}"))
        .collect();
    sqlx::query(&format!(
        "UPDATE `{target}` SET {}",
        assignments.join(","),
    ))
    .execute(db.pool())
    .await?;
    sqlx::query(&format!(
        "UPDATE `{target}` SET `score_overall` = {}",
        overall_formula(period),
    ))
    .execute(db.pool())
    .await?;
    Ok(())
}
