/// SQL DDL for the beacon-store database.
/// WAL mode enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS time_series_data (
    id TEXT PRIMARY KEY,
    metric TEXT NOT NULL,
    value REAL NOT NULL,
    tags TEXT,
    timestamp INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sensor_data (
    id TEXT PRIMARY KEY,
    sensor_id TEXT NOT NULL,
    temperature REAL,
    humidity REAL,
    pressure REAL,
    location TEXT,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_time_series_metric_ts ON time_series_data(metric, timestamp);
CREATE INDEX IF NOT EXISTS idx_sensor_data_sensor_ts ON sensor_data(sensor_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_sensor_data_ts ON sensor_data(timestamp);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
