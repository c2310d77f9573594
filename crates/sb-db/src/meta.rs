//! Table metadata bootstrap for the mirror pipeline.

use sqlx::Row;
use tracing::debug;

use crate::error::DbError;
use crate::formulas::composite_formulas;
use crate::pool::Db;

/// Everything a pipeline run needs to know about one mirrored table.
///
/// Built per run from `information_schema`; the hash caches persist across
/// runs with their read/write roles swapped at the end of a successful one.
#[derive(Debug, Clone)]
pub struct TableMeta {
    pub name: String,
    /// `id`, except the member table which keys on `id_member`.
    pub primary: String,
    /// Columns physically present in the source (destination-only derived
    /// `score_*` columns excluded).
    pub read_columns: Vec<String>,
    /// All destination columns, in the order batched writes bind them:
    /// the read columns followed by the derived scores.
    pub write_columns: Vec<String>,
    /// `,expr AS \`score_x\`` fragments appended to streaming SELECTs;
    /// empty for tables without derived scores.
    pub composite_select: String,
    /// Destination table had no rows at bootstrap (cold path).
    pub is_empty: bool,
    /// Hash cache read side (`<name>_hashes_0`).
    pub read_hash: String,
    /// Hash cache write side (`<name>_hashes_1`).
    pub write_hash: String,
}

impl TableMeta {
    /// Introspect `table` on the destination database.
    ///
    /// With `hashes`, also resolves the hash-cache pair and truncates the
    /// write side so a stale previous run cannot leak into this one.
    pub async fn introspect(db: &Db, table: &str, hashes: bool) -> Result<TableMeta, DbError> {
        let primary = if table == "member" { "id_member" } else { "id" };

        let rows = sqlx::query(
            "SELECT `column_name` FROM `information_schema`.`columns` \
             WHERE `table_schema` = ? AND `table_name` = ? \
             ORDER BY `ordinal_position`",
        )
        .bind(db.database())
        .bind(table)
        .fetch_all(db.pool())
        .await?;

        let mut read_columns = Vec::new();
        let mut score_columns = Vec::new();
        let mut composite_select = String::new();
        for row in &rows {
            let column: String = row.try_get(0)?;
            if table == "player" && column.starts_with("score_") {
                if column == "score_overall" {
                    // Recomputed post-run; stream a placeholder.
                    composite_select.push_str(",1 as `score_overall`");
                } else if let Some((_, formula)) = composite_formulas()
                    .iter()
                    .find(|(name, _)| *name == column)
                {
                    composite_select.push_str(&format!(",{formula} as `{column}`"));
                }
                score_columns.push(column);
            } else {
                read_columns.push(column);
            }
        }
        let mut write_columns = read_columns.clone();
        write_columns.extend(score_columns);

        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM `{table}`"))
            .fetch_one(db.pool())
            .await?;
        let is_empty = count == 0;
        debug!(table, rows = count, "table introspected");

        let read_hash = format!("{table}_hashes_0");
        let write_hash = format!("{table}_hashes_1");
        if hashes {
            sqlx::query(&format!("TRUNCATE `{write_hash}`"))
                .execute(db.pool())
                .await?;
        }

        Ok(TableMeta {
            name: table.to_owned(),
            primary: primary.to_owned(),
            read_columns,
            write_columns,
            composite_select,
            is_empty,
            read_hash,
            write_hash,
        })
    }

    /// Read columns that feed the CRC32 hash (`registration_date` excluded:
    /// its streamed form is derived, not the stored value).
    pub fn crc_columns(&self) -> Vec<&str> {
        self.read_columns
            .iter()
            .filter(|column| column.as_str() != "registration_date")
            .map(String::as_str)
            .collect()
    }

    /// `CRC32(CONCAT_WS('', …))` over the hash columns.
    pub fn crc_expr(&self) -> String {
        format!("CRC32(CONCAT_WS('', `{}`))", self.crc_columns().join("`,`"))
    }

    /// The streamed SELECT list: transformed read columns plus the
    /// composite score expressions.
    pub fn select_list(&self) -> String {
        let columns: Vec<String> = self
            .read_columns
            .iter()
            .map(|column| fetch_column(column))
            .collect();
        format!("{}{}", columns.join(","), self.composite_select)
    }

    /// Staging table for warm runs.
    pub fn staging(&self) -> String {
        format!("{}_new", self.name)
    }

    /// Target of batched writes: the table itself when cold, the staging
    /// table when warm.
    pub fn write_target(&self) -> String {
        if self.is_empty {
            self.name.clone()
        } else {
            self.staging()
        }
    }

    /// Hash cache the pipeline writes: the read side when cold (there is
    /// nothing to diff against), the write side when warm.
    pub fn hash_target(&self) -> &str {
        if self.is_empty {
            &self.read_hash
        } else {
            &self.write_hash
        }
    }

    pub fn changelog(&self) -> String {
        format!("{}_changelog", self.name)
    }
}

/// How one read column appears in the streaming SELECT.
///
/// `registration_date` is shipped as a millisecond timestamp, one day
/// ahead, matching what the site stores.
pub fn fetch_column(column: &str) -> String {
    if column == "registration_date" {
        "(unix_timestamp(`registration_date`)+3600*24)*1000".to_owned()
    } else {
        format!("`{column}`")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> TableMeta {
        TableMeta {
            name: "player".to_owned(),
            primary: "id".to_owned(),
            read_columns: vec![
                "id".to_owned(),
                "name".to_owned(),
                "registration_date".to_owned(),
                "cheese_gathered".to_owned(),
            ],
            write_columns: vec![
                "id".to_owned(),
                "name".to_owned(),
                "registration_date".to_owned(),
                "cheese_gathered".to_owned(),
                "score_stats".to_owned(),
            ],
            composite_select: ",x as `score_stats`".to_owned(),
            is_empty: false,
            read_hash: "player_hashes_0".to_owned(),
            write_hash: "player_hashes_1".to_owned(),
        }
    }

    #[test]
    fn registration_date_never_feeds_the_crc() {
        let meta = meta();
        assert!(!meta.crc_columns().contains(&"registration_date"));
        assert_eq!(
            meta.crc_expr(),
            "CRC32(CONCAT_WS('', `id`,`name`,`cheese_gathered`))"
        );
    }

    #[test]
    fn registration_date_is_transformed_in_selects() {
        let meta = meta();
        let select = meta.select_list();
        assert!(select.contains("(unix_timestamp(`registration_date`)+3600*24)*1000"));
        assert!(select.ends_with(",x as `score_stats`"));
    }

    #[test]
    fn warm_tables_write_to_staging_and_the_write_hash() {
        let mut meta = meta();
        assert_eq!(meta.write_target(), "player_new");
        assert_eq!(meta.hash_target(), "player_hashes_1");

        meta.is_empty = true;
        assert_eq!(meta.write_target(), "player");
        assert_eq!(meta.hash_target(), "player_hashes_0");
    }
}
