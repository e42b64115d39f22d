//! Periodic telemetry acquisition and publication

pub mod scheduler;
pub mod sensor;

pub use scheduler::{TelemetryPublisher, TelemetryScheduler};
pub use sensor::{FixedSensor, SensorReading, SensorSource};
