use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One aggregation granularity, e.g. `1m` or `4h`.
///
/// The label doubles as the series name suffix in storage and the
/// `duration` key accepted by the query API.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CandleDuration {
    secs: i64,
    label: String,
}

impl CandleDuration {
    /// Parse a duration label (e.g. "1s", "1m", "1h", "1d", "1w").
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() < 2 {
            bail!("invalid duration '{}': expected format like '1m'", s);
        }

        let (num_str, suffix) = s.split_at(s.len() - 1);
        let n: i64 = num_str.parse().with_context(|| {
            format!(
                "invalid duration '{}': quantity must be a positive integer",
                s
            )
        })?;
        if n <= 0 {
            bail!("invalid duration '{}': quantity must be > 0", s);
        }

        let unit_secs = match suffix {
            "s" => 1,
            "m" => 60,
            "h" => 3_600,
            "d" => 86_400,
            "w" => 7 * 86_400,
            _ => bail!(
                "invalid duration '{}': unsupported suffix '{}', expected one of s/m/h/d/w",
                s,
                suffix
            ),
        };

        let secs = n
            .checked_mul(unit_secs)
            .with_context(|| format!("invalid duration '{}': value is too large", s))?;
        Ok(Self {
            secs,
            label: s.to_string(),
        })
    }

    pub fn as_secs(&self) -> i64 {
        self.secs
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Display for CandleDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl TryFrom<String> for CandleDuration {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<CandleDuration> for String {
    fn from(value: CandleDuration) -> Self {
        value.label
    }
}

/// The durations maintained for every product, fixed at startup.
///
/// Order follows configuration; duplicates (by length, not label) are
/// collapsed so "60s" and "1m" never produce two series for one bucket size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurationSet {
    durations: Vec<CandleDuration>,
}

impl DurationSet {
    pub fn parse<S: AsRef<str>>(labels: &[S]) -> Result<Self> {
        let mut durations: Vec<CandleDuration> = Vec::new();
        for label in labels {
            let d = CandleDuration::parse(label.as_ref())?;
            if durations.iter().any(|existing| existing.secs == d.secs) {
                tracing::warn!(duration = %d, "Duplicate candle duration ignored");
                continue;
            }
            durations.push(d);
        }
        if durations.is_empty() {
            bail!("at least one candle duration must be configured");
        }
        Ok(Self { durations })
    }

    pub fn iter(&self) -> impl Iterator<Item = &CandleDuration> {
        self.durations.iter()
    }

    pub fn len(&self) -> usize {
        self.durations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.durations.is_empty()
    }

    /// Look up a configured duration by its label.
    pub fn find(&self, label: &str) -> Option<&CandleDuration> {
        let label = label.trim();
        self.durations.iter().find(|d| d.label == label)
    }
}

impl<'a> IntoIterator for &'a DurationSet {
    type Item = &'a CandleDuration;
    type IntoIter = std::slice::Iter<'a, CandleDuration>;

    fn into_iter(self) -> Self::IntoIter {
        self.durations.iter()
    }
}
