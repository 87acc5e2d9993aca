use chrono::{DateTime, FixedOffset, SecondsFormat};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{series_name, CandleStore};
use crate::error::StoreError;
use crate::model::candle::Candle;
use crate::model::duration::{CandleDuration, DurationSet};

/// SQLite-backed store: one table per series named `{product}_{duration}`,
/// keyed by the RFC3339 bucket start.
///
/// Every stored time is rendered in the same fixed offset, so lexical order
/// of the `time` column equals chronological order.
pub struct SqliteStore {
    inner: Mutex<Inner>,
    zone: FixedOffset,
}

struct Inner {
    conn: Connection,
    tables: HashSet<String>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and create the tables for
    /// every product/duration pair. Table creation is idempotent.
    pub fn open(
        path: impl AsRef<Path>,
        product_codes: &[String],
        durations: &DurationSet,
        zone: FixedOffset,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn, product_codes, durations, zone)
    }

    pub fn open_in_memory(
        product_codes: &[String],
        durations: &DurationSet,
        zone: FixedOffset,
    ) -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, product_codes, durations, zone)
    }

    fn with_connection(
        conn: Connection,
        product_codes: &[String],
        durations: &DurationSet,
        zone: FixedOffset,
    ) -> Result<Self, StoreError> {
        let mut inner = Inner {
            conn,
            tables: HashSet::new(),
        };
        for product_code in product_codes {
            for duration in durations {
                let table = series_name(product_code, duration)?;
                inner.ensure_table(&table)?;
            }
        }
        tracing::info!(tables = inner.tables.len(), "Candle tables ready");
        Ok(Self {
            inner: Mutex::new(inner),
            zone,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Poisoned)
    }

    fn format_time(&self, time: DateTime<FixedOffset>) -> String {
        time.with_timezone(&self.zone)
            .to_rfc3339_opts(SecondsFormat::AutoSi, false)
    }

    fn row_to_candle(
        &self,
        table: &str,
        product_code: &str,
        duration: &CandleDuration,
        row: CandleRow,
    ) -> Result<Candle, StoreError> {
        let time = DateTime::parse_from_rfc3339(&row.time)
            .map_err(|e| StoreError::CorruptRow {
                table: table.to_string(),
                reason: format!("time '{}': {}", row.time, e),
            })?
            .with_timezone(&self.zone);
        Ok(Candle {
            product_code: product_code.to_string(),
            duration: duration.clone(),
            time,
            open: row.open,
            close: row.close,
            high: row.high,
            low: row.low,
            volume: row.volume,
        })
    }
}

impl Inner {
    fn ensure_table(&mut self, table: &str) -> Result<(), StoreError> {
        if self.tables.contains(table) {
            return Ok(());
        }
        self.conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{table}" (
                time TEXT PRIMARY KEY NOT NULL,
                open REAL NOT NULL,
                close REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                volume REAL NOT NULL
            );
            "#
        ))?;
        self.tables.insert(table.to_string());
        Ok(())
    }

    /// Tables created by another process are picked up lazily.
    fn has_table(&mut self, table: &str) -> Result<bool, StoreError> {
        if self.tables.contains(table) {
            return Ok(true);
        }
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            self.tables.insert(table.to_string());
        }
        Ok(exists)
    }
}

struct CandleRow {
    time: String,
    open: f64,
    close: f64,
    high: f64,
    low: f64,
    volume: f64,
}

impl CandleRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            time: row.get(0)?,
            open: row.get(1)?,
            close: row.get(2)?,
            high: row.get(3)?,
            low: row.get(4)?,
            volume: row.get(5)?,
        })
    }
}

impl CandleStore for SqliteStore {
    fn get(
        &self,
        product_code: &str,
        duration: &CandleDuration,
        time: DateTime<FixedOffset>,
    ) -> Result<Option<Candle>, StoreError> {
        let table = series_name(product_code, duration)?;
        let mut inner = self.lock()?;
        if !inner.has_table(&table)? {
            return Ok(None);
        }
        let row = inner
            .conn
            .query_row(
                &format!(
                    r#"SELECT time, open, close, high, low, volume FROM "{table}" WHERE time = ?1"#
                ),
                [self.format_time(time)],
                CandleRow::from_row,
            )
            .optional()?;
        drop(inner);
        row.map(|r| self.row_to_candle(&table, product_code, duration, r))
            .transpose()
    }

    fn upsert(&self, candle: &Candle) -> Result<(), StoreError> {
        let table = series_name(&candle.product_code, &candle.duration)?;
        let mut inner = self.lock()?;
        inner.ensure_table(&table)?;
        inner.conn.execute(
            &format!(
                r#"
                INSERT INTO "{table}" (time, open, close, high, low, volume)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(time) DO UPDATE SET
                    open = excluded.open,
                    close = excluded.close,
                    high = excluded.high,
                    low = excluded.low,
                    volume = excluded.volume
                "#
            ),
            params![
                self.format_time(candle.time),
                candle.open,
                candle.close,
                candle.high,
                candle.low,
                candle.volume,
            ],
        )?;
        Ok(())
    }

    fn get_range(
        &self,
        product_code: &str,
        duration: &CandleDuration,
        limit: usize,
    ) -> Result<Vec<Candle>, StoreError> {
        let table = series_name(product_code, duration)?;
        let mut inner = self.lock()?;
        if !inner.has_table(&table)? {
            return Ok(Vec::new());
        }
        let mut stmt = inner.conn.prepare(&format!(
            r#"
            SELECT time, open, close, high, low, volume FROM (
                SELECT time, open, close, high, low, volume FROM "{table}"
                ORDER BY time DESC
                LIMIT ?1
            )
            ORDER BY time ASC
            "#
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map([limit], CandleRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(inner);

        rows.into_iter()
            .map(|r| self.row_to_candle(&table, product_code, duration, r))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jst() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    #[test]
    fn stored_time_is_rendered_in_reference_zone() {
        let durations = DurationSet::parse(&["1m"]).unwrap();
        let store = SqliteStore::open_in_memory(&["BTC_JPY".to_string()], &durations, jst())
            .unwrap();
        let utc = DateTime::parse_from_rfc3339("2024-01-01T01:00:00Z").unwrap();
        assert_eq!(store.format_time(utc), "2024-01-01T10:00:00+09:00");
    }

    #[test]
    fn missing_table_reads_as_empty() {
        let durations = DurationSet::parse(&["1m"]).unwrap();
        let store = SqliteStore::open_in_memory(&[], &durations, jst()).unwrap();
        let d = CandleDuration::parse("1m").unwrap();
        let t = DateTime::parse_from_rfc3339("2024-01-01T10:00:00+09:00").unwrap();
        assert!(store.get("ETH_JPY", &d, t).unwrap().is_none());
        assert!(store.get_range("ETH_JPY", &d, 10).unwrap().is_empty());
    }
}
