use beacon_core::ids::SensorReadingId;
use beacon_core::now_millis;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::database::Database;
use crate::error::StoreError;

const DEFAULT_LIMIT: u32 = 100;

/// A persisted sensor reading.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReadingRow {
    pub id: SensorReadingId,
    pub sensor_id: String,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub location: Option<String>,
    pub timestamp: i64,
}

#[derive(Clone, Debug, Default)]
pub struct NewSensorReading {
    pub sensor_id: String,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub location: Option<String>,
    pub timestamp: Option<i64>,
}

#[derive(Clone, Debug, Default)]
pub struct SensorFilter {
    pub sensor_id: Option<String>,
    /// Defaults to 100.
    pub limit: Option<u32>,
}

pub struct SensorRepo {
    db: Database,
}

impl SensorRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, reading), fields(sensor_id = %reading.sensor_id))]
    pub fn create(&self, reading: NewSensorReading) -> Result<SensorReadingRow, StoreError> {
        if reading.sensor_id.trim().is_empty() {
            return Err(StoreError::Validation("sensorId is required".into()));
        }
        for (name, value) in [
            ("temperature", reading.temperature),
            ("humidity", reading.humidity),
            ("pressure", reading.pressure),
        ] {
            if value.is_some_and(|v| !v.is_finite()) {
                return Err(StoreError::Validation(format!("{name} must be a finite number")));
            }
        }

        let row = SensorReadingRow {
            id: SensorReadingId::new(),
            sensor_id: reading.sensor_id,
            temperature: reading.temperature,
            humidity: reading.humidity,
            pressure: reading.pressure,
            location: reading.location,
            timestamp: reading.timestamp.unwrap_or_else(now_millis),
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sensor_data (id, sensor_id, temperature, humidity, pressure, location, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    row.id.as_str(),
                    row.sensor_id,
                    row.temperature,
                    row.humidity,
                    row.pressure,
                    row.location,
                    row.timestamp,
                ],
            )?;
            Ok(())
        })?;
        Ok(row)
    }

    /// Readings newest first, optionally for one sensor.
    pub fn find_many(&self, filter: &SensorFilter) -> Result<Vec<SensorReadingRow>, StoreError> {
        let limit = filter.limit.unwrap_or(DEFAULT_LIMIT);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sensor_id, temperature, humidity, pressure, location, timestamp
                 FROM sensor_data
                 WHERE (?1 IS NULL OR sensor_id = ?1)
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![filter.sensor_id, limit], |row| {
                    Ok(SensorReadingRow {
                        id: SensorReadingId::from_raw(row.get::<_, String>(0)?),
                        sensor_id: row.get(1)?,
                        temperature: row.get(2)?,
                        humidity: row.get(3)?,
                        pressure: row.get(4)?,
                        location: row.get(5)?,
                        timestamp: row.get(6)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}
