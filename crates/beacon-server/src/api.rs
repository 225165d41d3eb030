//! HTTP ingest and query routes for time-series and sensor data.
//!
//! Every successful create is followed by a broadcast of the matching
//! envelope to all connected peers.

use std::collections::{BTreeMap, HashMap};

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use beacon_core::{now_millis, Envelope, MessageId, SensorUpdate, TimeSeriesUpdate};
use beacon_store::{
    BucketWidth, NewSensorReading, NewTimeSeriesPoint, SensorFilter, SensorReadingRow, SensorRepo,
    StoreError, TimeSeriesRepo, TimeSeriesRow,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, error};

use crate::server::AppState;

const DEFAULT_LIMIT: u32 = 100;
const MAX_LIMIT: u32 = 10_000;
const DEFAULT_INTERVAL: &str = "1 hour";
const DEFAULT_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Validation(msg) => Self::BadRequest(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let Self::Internal(msg) = &self {
            error!(error = %msg, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/timeseries", get(list_timeseries).post(create_timeseries))
        .route("/api/timeseries/aggregate", get(aggregate_timeseries))
        .route("/api/sensors", get(list_sensors).post(create_sensor))
}

// ── Time series ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimeSeriesBody {
    metric: Option<String>,
    value: Option<f64>,
    tags: Option<Value>,
    timestamp: Option<i64>,
}

async fn create_timeseries(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let body: TimeSeriesBody = parse_body(&body)?;
    let metric = body
        .metric
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("metric is required".into()))?;
    let value = body
        .value
        .ok_or_else(|| ApiError::BadRequest("value is required".into()))?;
    let tags = match body.tags {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(map),
        Some(_) => return Err(ApiError::BadRequest("tags must be an object".into())),
    };

    let row = TimeSeriesRepo::new(state.db.clone()).create(NewTimeSeriesPoint {
        metric,
        value,
        tags,
        timestamp: body.timestamp,
    })?;

    let envelope = Envelope::new(timeseries_update(&row)).with_id(MessageId::new());
    let recipients = state.hub.broadcast(&envelope);
    debug!(id = %row.id, metric = %row.metric, recipients, "time-series point stored");

    Ok((StatusCode::CREATED, Json(json!({ "data": row }))))
}

async fn list_timeseries(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let metric = required(&params, "metric")?;
    let start = optional_time(&params, "startTime")?;
    let end = optional_time(&params, "endTime")?;
    let repo = TimeSeriesRepo::new(state.db.clone());

    let rows = match (start, end) {
        (Some(start), Some(end)) => repo.in_range(metric, start, end)?,
        _ => repo.latest(metric, limit(&params)?)?,
    };
    Ok(Json(json!({ "data": rows })))
}

async fn aggregate_timeseries(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let metric = required(&params, "metric")?;
    let width: BucketWidth = params
        .get("interval")
        .map_or(DEFAULT_INTERVAL, String::as_str)
        .parse()?;
    let end = optional_time(&params, "endTime")?.unwrap_or_else(now_millis);
    let start = optional_time(&params, "startTime")?
        .unwrap_or_else(|| end.saturating_sub(DEFAULT_WINDOW_MS));
    if start > end {
        return Err(ApiError::BadRequest("startTime must not be after endTime".into()));
    }

    let buckets = TimeSeriesRepo::new(state.db.clone()).aggregate(metric, width, start, end)?;
    Ok(Json(json!({ "data": buckets })))
}

fn timeseries_update(row: &TimeSeriesRow) -> TimeSeriesUpdate {
    TimeSeriesUpdate {
        metric: row.metric.clone(),
        value: row.value,
        tags: row.tags.as_ref().map(stringify_tags),
        timestamp: DateTime::<Utc>::from_timestamp_millis(row.timestamp),
    }
}

/// Envelope tags are string-valued; non-string JSON values keep their JSON text.
fn stringify_tags(tags: &Map<String, Value>) -> BTreeMap<String, String> {
    tags.iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), v)
        })
        .collect()
}

// ── Sensors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SensorBody {
    sensor_id: Option<String>,
    temperature: Option<f64>,
    humidity: Option<f64>,
    pressure: Option<f64>,
    location: Option<String>,
    timestamp: Option<i64>,
}

async fn create_sensor(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let body: SensorBody = parse_body(&body)?;
    let sensor_id = body
        .sensor_id
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("sensorId is required".into()))?;

    let row = SensorRepo::new(state.db.clone()).create(NewSensorReading {
        sensor_id,
        temperature: body.temperature,
        humidity: body.humidity,
        pressure: body.pressure,
        location: body.location,
        timestamp: body.timestamp,
    })?;

    let envelope = Envelope::new(sensor_update(&row)).with_id(MessageId::new());
    let recipients = state.hub.broadcast(&envelope);
    debug!(id = %row.id, sensor_id = %row.sensor_id, recipients, "sensor reading stored");

    Ok((StatusCode::CREATED, Json(json!({ "data": row }))))
}

async fn list_sensors(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let filter = SensorFilter {
        sensor_id: params.get("sensorId").filter(|s| !s.is_empty()).cloned(),
        limit: Some(limit(&params)?),
    };
    let rows = SensorRepo::new(state.db.clone()).find_many(&filter)?;
    Ok(Json(json!({ "data": rows })))
}

fn sensor_update(row: &SensorReadingRow) -> SensorUpdate {
    SensorUpdate {
        sensor_id: row.sensor_id.clone(),
        temperature: row.temperature,
        humidity: row.humidity,
        pressure: row.pressure,
        location: row.location.clone(),
        timestamp: DateTime::<Utc>::from_timestamp_millis(row.timestamp),
    }
}

// ── Request helpers ─────────────────────────────────────────────────────────

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("request body is required".into()));
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))
}

fn required<'a>(params: &'a HashMap<String, String>, name: &str) -> Result<&'a str, ApiError> {
    params
        .get(name)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("{name} is required")))
}

fn limit(params: &HashMap<String, String>) -> Result<u32, ApiError> {
    match params.get("limit") {
        None => Ok(DEFAULT_LIMIT),
        Some(raw) => raw
            .parse::<u32>()
            .ok()
            .filter(|n| (1..=MAX_LIMIT).contains(n))
            .ok_or_else(|| ApiError::BadRequest(format!("limit must be between 1 and {MAX_LIMIT}"))),
    }
}

/// Milliseconds since the epoch, or an RFC 3339 timestamp. Values outside
/// the range `chrono` can represent are rejected.
fn parse_time(raw: &str) -> Option<i64> {
    raw.parse::<i64>()
        .ok()
        .filter(|ms| DateTime::<Utc>::from_timestamp_millis(*ms).is_some())
        .or_else(|| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.timestamp_millis())
        })
}

fn optional_time(params: &HashMap<String, String>, name: &str) -> Result<Option<i64>, ApiError> {
    params
        .get(name)
        .filter(|v| !v.is_empty())
        .map(|raw| {
            parse_time(raw).ok_or_else(|| {
                ApiError::BadRequest(format!("{name} must be epoch milliseconds or RFC 3339"))
            })
        })
        .transpose()
}
