use chrono::{DateTime, FixedOffset, TimeDelta};

use candle_ingest::error::StoreError;
use candle_ingest::model::candle::Candle;
use candle_ingest::model::duration::{CandleDuration, DurationSet};
use candle_ingest::store::{CandleStore, MemoryStore, SqliteStore};

fn jst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).unwrap()
}

fn minute() -> CandleDuration {
    CandleDuration::parse("1m").unwrap()
}

fn candle(product_code: &str, minutes_after_ten: i64, price: f64) -> Candle {
    let base = DateTime::parse_from_rfc3339("2024-03-01T10:00:00+09:00").unwrap();
    Candle {
        product_code: product_code.to_string(),
        duration: minute(),
        time: base + TimeDelta::minutes(minutes_after_ten),
        open: price,
        close: price,
        high: price,
        low: price,
        volume: 1.0,
    }
}

fn sqlite_store() -> SqliteStore {
    let durations = DurationSet::parse(&["1m", "1h"]).unwrap();
    SqliteStore::open_in_memory(&["BTC_JPY".to_string()], &durations, jst()).unwrap()
}

fn stores() -> Vec<(&'static str, Box<dyn CandleStore>)> {
    vec![
        ("memory", Box::new(MemoryStore::new())),
        ("sqlite", Box::new(sqlite_store())),
    ]
}

/// Range reads return the newest `limit` candles in ascending time order,
/// regardless of insertion order.
#[test]
fn range_returns_newest_candles_oldest_first() {
    for (name, store) in stores() {
        for m in [3, 0, 4, 1, 2] {
            store.upsert(&candle("BTC_JPY", m, 100.0 + m as f64)).unwrap();
        }

        let all = store.get_range("BTC_JPY", &minute(), 10).unwrap();
        let opens: Vec<f64> = all.iter().map(|c| c.open).collect();
        assert_eq!(opens, vec![100.0, 101.0, 102.0, 103.0, 104.0], "{}", name);

        let newest = store.get_range("BTC_JPY", &minute(), 2).unwrap();
        let opens: Vec<f64> = newest.iter().map(|c| c.open).collect();
        assert_eq!(opens, vec![103.0, 104.0], "{}", name);

        assert!(store.get_range("BTC_JPY", &minute(), 0).unwrap().is_empty(), "{}", name);
    }
}

#[test]
fn upsert_overwrites_the_same_bucket() {
    for (name, store) in stores() {
        let mut c = candle("BTC_JPY", 0, 100.0);
        store.upsert(&c).unwrap();
        c.close = 95.0;
        c.low = 95.0;
        c.volume = 4.0;
        store.upsert(&c).unwrap();

        let range = store.get_range("BTC_JPY", &minute(), 10).unwrap();
        assert_eq!(range.len(), 1, "{}", name);
        assert_eq!(range[0], c, "{}", name);
        assert_eq!(store.get("BTC_JPY", &minute(), c.time).unwrap(), Some(c), "{}", name);
    }
}

#[test]
fn series_are_isolated_by_product_and_duration() {
    for (name, store) in stores() {
        store.upsert(&candle("BTC_JPY", 0, 1.0)).unwrap();
        store.upsert(&candle("ETH_JPY", 0, 2.0)).unwrap();

        let btc = store.get_range("BTC_JPY", &minute(), 10).unwrap();
        assert_eq!(btc.len(), 1, "{}", name);
        assert_eq!(btc[0].open, 1.0, "{}", name);

        let hour = CandleDuration::parse("1h").unwrap();
        assert!(store.get_range("BTC_JPY", &hour, 10).unwrap().is_empty(), "{}", name);
        assert!(store.get_range("XRP_JPY", &minute(), 10).unwrap().is_empty(), "{}", name);
    }
}

#[test]
fn lookup_matches_the_instant_not_the_offset() {
    for (name, store) in stores() {
        let c = candle("BTC_JPY", 5, 100.0);
        store.upsert(&c).unwrap();
        let utc = DateTime::parse_from_rfc3339("2024-03-01T01:05:00Z").unwrap();
        let found = store.get("BTC_JPY", &minute(), utc).unwrap();
        assert!(found.is_some(), "{}", name);
    }
}

#[test]
fn invalid_product_code_is_rejected() {
    for (name, store) in stores() {
        let err = store.get_range("BTC-JPY", &minute(), 10).unwrap_err();
        assert!(matches!(err, StoreError::InvalidSeriesName(_)), "{}", name);
        assert!(store.upsert(&candle("BTC-JPY", 0, 1.0)).is_err(), "{}", name);
    }
}

/// Product codes differing only in case address one series in both backends.
#[test]
fn product_code_case_does_not_split_series() {
    for (name, store) in stores() {
        store.upsert(&candle("btc_jpy", 0, 100.0)).unwrap();
        store.upsert(&candle("BTC_JPY", 1, 101.0)).unwrap();
        store.upsert(&candle("Btc_Jpy", 1, 102.0)).unwrap();

        let upper = store.get_range("BTC_JPY", &minute(), 10).unwrap();
        let lower = store.get_range("btc_jpy", &minute(), 10).unwrap();
        let opens: Vec<f64> = upper.iter().map(|c| c.open).collect();
        assert_eq!(opens, vec![100.0, 102.0], "{}", name);
        assert_eq!(lower.len(), upper.len(), "{}", name);

        let t = DateTime::parse_from_rfc3339("2024-03-01T10:00:00+09:00").unwrap();
        assert!(store.get("bTc_JpY", &minute(), t).unwrap().is_some(), "{}", name);
    }
}

/// Reopening an existing database keeps its rows and does not fail on the
/// already-created tables.
#[test]
fn sqlite_reopen_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("candles.sqlite");
    let durations = DurationSet::parse(&["1m"]).unwrap();
    let products = vec!["BTC_JPY".to_string()];

    {
        let store = SqliteStore::open(&path, &products, &durations, jst()).unwrap();
        store.upsert(&candle("BTC_JPY", 0, 100.0)).unwrap();
        store.upsert(&candle("BTC_JPY", 1, 101.0)).unwrap();
    }

    let store = SqliteStore::open(&path, &products, &durations, jst()).unwrap();
    let range = store.get_range("BTC_JPY", &minute(), 10).unwrap();
    assert_eq!(range.len(), 2);
    assert_eq!(range[1].open, 101.0);
    assert_eq!(range[0].time.offset(), &jst());
}
