use std::fmt;
use std::str::FromStr;

use beacon_core::ids::TimeSeriesId;
use beacon_core::now_millis;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;

/// A persisted time-series point.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesRow {
    pub id: TimeSeriesId,
    pub metric: String,
    pub value: f64,
    pub tags: Option<Map<String, Value>>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// Input for [`TimeSeriesRepo::create`].
#[derive(Clone, Debug, Default)]
pub struct NewTimeSeriesPoint {
    pub metric: String,
    pub value: f64,
    pub tags: Option<Map<String, Value>>,
    /// Defaults to now.
    pub timestamp: Option<i64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    fn sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct TimeSeriesFilter {
    pub metric: String,
    /// Inclusive lower bound (ms).
    pub start: Option<i64>,
    /// Inclusive upper bound (ms).
    pub end: Option<i64>,
}

/// Width of an aggregation bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketWidth(i64);

impl BucketWidth {
    pub fn from_millis(ms: i64) -> Result<Self, StoreError> {
        if ms <= 0 {
            return Err(StoreError::Validation(format!("bucket width must be positive, got {ms}ms")));
        }
        Ok(Self(ms))
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }
}

impl FromStr for BucketWidth {
    type Err = StoreError;

    /// Accepts interval text such as `"5 minutes"`, `"1 hour"`, `"30s"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| StoreError::Validation(format!("interval has no unit: {s:?}")))?;
        let (count, unit) = s.split_at(split);
        let count: i64 = count
            .parse()
            .map_err(|_| StoreError::Validation(format!("invalid interval count: {s:?}")))?;
        let unit_ms = match unit.trim().to_ascii_lowercase().as_str() {
            "ms" | "millisecond" | "milliseconds" => 1,
            "s" | "sec" | "second" | "seconds" => 1_000,
            "m" | "min" | "minute" | "minutes" => 60_000,
            "h" | "hour" | "hours" => 3_600_000,
            "d" | "day" | "days" => 86_400_000,
            "w" | "week" | "weeks" => 604_800_000,
            other => {
                return Err(StoreError::Validation(format!("unknown interval unit: {other:?}")));
            }
        };
        let ms = count
            .checked_mul(unit_ms)
            .ok_or_else(|| StoreError::Validation(format!("interval too large: {s:?}")))?;
        Self::from_millis(ms)
    }
}

impl fmt::Display for BucketWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// One aggregation bucket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    /// Bucket start (ms), aligned to a multiple of the bucket width.
    pub bucket: i64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: i64,
}

pub struct TimeSeriesRepo {
    db: Database,
}

impl TimeSeriesRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, point), fields(metric = %point.metric))]
    pub fn create(&self, point: NewTimeSeriesPoint) -> Result<TimeSeriesRow, StoreError> {
        if point.metric.trim().is_empty() {
            return Err(StoreError::Validation("metric is required".into()));
        }
        if !point.value.is_finite() {
            return Err(StoreError::Validation("value must be a finite number".into()));
        }

        let row = TimeSeriesRow {
            id: TimeSeriesId::new(),
            metric: point.metric,
            value: point.value,
            tags: point.tags,
            timestamp: point.timestamp.unwrap_or_else(now_millis),
        };
        let tags = row.tags.as_ref().map(serde_json::to_string).transpose()?;

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO time_series_data (id, metric, value, tags, timestamp) VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![row.id.as_str(), row.metric, row.value, tags, row.timestamp],
            )?;
            Ok(())
        })?;
        Ok(row)
    }

    pub fn find_many(
        &self,
        filter: &TimeSeriesFilter,
        order: SortOrder,
        limit: Option<u32>,
    ) -> Result<Vec<TimeSeriesRow>, StoreError> {
        let mut sql = String::from(
            "SELECT id, metric, value, tags, timestamp FROM time_series_data WHERE metric = ?1",
        );
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(filter.metric.clone())];

        if let Some(start) = filter.start {
            params.push(Box::new(start));
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len()));
        }
        if let Some(end) = filter.end {
            params.push(Box::new(end));
            sql.push_str(&format!(" AND timestamp <= ?{}", params.len()));
        }
        sql.push_str(&format!(" ORDER BY timestamp {0}, id {0}", order.sql()));
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        self.db.with_conn(|conn| {
            let param_refs: Vec<&dyn rusqlite::types::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            let mut stmt = conn.prepare(&sql)?;
            let raw = stmt
                .query_map(param_refs.as_slice(), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            raw.into_iter()
                .map(|(id, metric, value, tags, timestamp)| {
                    Ok(TimeSeriesRow {
                        id: TimeSeriesId::from_raw(id),
                        metric,
                        value,
                        tags: tags.map(|t| serde_json::from_str(&t)).transpose()?,
                        timestamp,
                    })
                })
                .collect()
        })
    }

    /// Points for a metric within `[start, end]`, oldest first.
    pub fn in_range(&self, metric: &str, start: i64, end: i64) -> Result<Vec<TimeSeriesRow>, StoreError> {
        let filter = TimeSeriesFilter {
            metric: metric.to_string(),
            start: Some(start),
            end: Some(end),
        };
        self.find_many(&filter, SortOrder::Asc, None)
    }

    /// The newest `limit` points for a metric, newest first.
    pub fn latest(&self, metric: &str, limit: u32) -> Result<Vec<TimeSeriesRow>, StoreError> {
        let filter = TimeSeriesFilter {
            metric: metric.to_string(),
            ..Default::default()
        };
        self.find_many(&filter, SortOrder::Desc, Some(limit))
    }

    /// Average/min/max/count per bucket within `[start, end]`, oldest bucket first.
    #[instrument(skip(self), fields(width = %width))]
    pub fn aggregate(
        &self,
        metric: &str,
        width: BucketWidth,
        start: i64,
        end: i64,
    ) -> Result<Vec<Bucket>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT (timestamp / ?2) * ?2 AS bucket, AVG(value), MIN(value), MAX(value), COUNT(*)
                 FROM time_series_data
                 WHERE metric = ?1 AND timestamp >= ?3 AND timestamp <= ?4
                 GROUP BY bucket
                 ORDER BY bucket ASC",
            )?;
            let buckets = stmt
                .query_map(rusqlite::params![metric, width.as_millis(), start, end], |row| {
                    Ok(Bucket {
                        bucket: row.get(0)?,
                        avg: row.get(1)?,
                        min: row.get(2)?,
                        max: row.get(3)?,
                        count: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(buckets)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn repo() -> TimeSeriesRepo {
        TimeSeriesRepo::new(Database::in_memory().unwrap())
    }

    fn point(metric: &str, value: f64, timestamp: i64) -> NewTimeSeriesPoint {
        NewTimeSeriesPoint {
            metric: metric.into(),
            value,
            tags: None,
            timestamp: Some(timestamp),
        }
    }

    #[test]
    fn create_assigns_id_and_timestamp() {
        let repo = repo();
        let row = repo
            .create(NewTimeSeriesPoint {
                metric: "cpu".into(),
                value: 0.42,
                ..Default::default()
            })
            .unwrap();
        assert!(row.id.as_str().starts_with("ts_"));
        assert!(row.timestamp > 0);
        assert_eq!(row.metric, "cpu");
    }

    #[test]
    fn create_rejects_missing_metric() {
        let err = repo().create(point("  ", 1.0, 1)).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn create_rejects_nan() {
        let err = repo().create(point("cpu", f64::NAN, 1)).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn tags_roundtrip() {
        let repo = repo();
        let tags = json!({"host": "a", "core": 3}).as_object().cloned();
        repo.create(NewTimeSeriesPoint {
            metric: "cpu".into(),
            value: 1.0,
            tags: tags.clone(),
            timestamp: Some(10),
        })
        .unwrap();
        let rows = repo.latest("cpu", 10).unwrap();
        assert_eq!(rows[0].tags, tags);
    }

    #[test]
    fn latest_is_newest_first_and_limited() {
        let repo = repo();
        for ts in [100, 300, 200, 400] {
            repo.create(point("mem", ts as f64, ts)).unwrap();
        }
        repo.create(point("cpu", 1.0, 500)).unwrap();

        let rows = repo.latest("mem", 3).unwrap();
        let stamps: Vec<i64> = rows.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![400, 300, 200]);
    }

    #[test]
    fn in_range_is_inclusive_and_ascending() {
        let repo = repo();
        for ts in [100, 200, 300, 400, 500] {
            repo.create(point("mem", 1.0, ts)).unwrap();
        }
        let rows = repo.in_range("mem", 200, 400).unwrap();
        let stamps: Vec<i64> = rows.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![200, 300, 400]);
    }

    #[test]
    fn find_many_unknown_metric_is_empty() {
        let rows = repo().latest("nothing", 10).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn aggregate_groups_by_bucket() {
        let repo = repo();
        // bucket 0: 1, 3 ; bucket 1000: 10 ; bucket 2000: 4, 6, 8
        for (ts, v) in [(0, 1.0), (999, 3.0), (1000, 10.0), (2000, 4.0), (2500, 6.0), (2999, 8.0)] {
            repo.create(point("temp", v, ts)).unwrap();
        }
        let buckets = repo
            .aggregate("temp", BucketWidth::from_millis(1000).unwrap(), 0, 10_000)
            .unwrap();
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].bucket, 0);
        assert_eq!(buckets[0].avg, 2.0);
        assert_eq!(buckets[0].count, 2);
        assert_eq!(buckets[1].bucket, 1000);
        assert_eq!(buckets[1].min, 10.0);
        assert_eq!(buckets[2].bucket, 2000);
        assert_eq!(buckets[2].min, 4.0);
        assert_eq!(buckets[2].max, 8.0);
        assert_eq!(buckets[2].avg, 6.0);
    }

    #[test]
    fn aggregate_respects_time_window() {
        let repo = repo();
        for ts in [0, 5000, 9000] {
            repo.create(point("temp", 1.0, ts)).unwrap();
        }
        let buckets = repo
            .aggregate("temp", BucketWidth::from_millis(1000).unwrap(), 4000, 6000)
            .unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].bucket, 5000);
    }

    #[test]
    fn bucket_width_parsing() {
        assert_eq!("5 minutes".parse::<BucketWidth>().unwrap().as_millis(), 300_000);
        assert_eq!("1 hour".parse::<BucketWidth>().unwrap().as_millis(), 3_600_000);
        assert_eq!("30s".parse::<BucketWidth>().unwrap().as_millis(), 30_000);
        assert_eq!("2 Days".parse::<BucketWidth>().unwrap().as_millis(), 172_800_000);
        assert!("hour".parse::<BucketWidth>().is_err());
        assert!("10".parse::<BucketWidth>().is_err());
        assert!("3 fortnights".parse::<BucketWidth>().is_err());
        assert!("0 seconds".parse::<BucketWidth>().is_err());
    }

    #[test]
    fn row_serializes_camel_case() {
        let row = TimeSeriesRow {
            id: TimeSeriesId::from_raw("ts_1"),
            metric: "cpu".into(),
            value: 1.5,
            tags: None,
            timestamp: 7,
        };
        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["id"], "ts_1");
        assert_eq!(value["timestamp"], 7);
    }
}
