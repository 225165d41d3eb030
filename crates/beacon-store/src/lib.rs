pub mod database;
pub mod error;
pub mod schema;
pub mod sensors;
pub mod timeseries;

pub use database::Database;
pub use error::StoreError;
pub use sensors::{NewSensorReading, SensorFilter, SensorReadingRow, SensorRepo};
pub use timeseries::{
    Bucket, BucketWidth, NewTimeSeriesPoint, SortOrder, TimeSeriesFilter, TimeSeriesRepo,
    TimeSeriesRow,
};
