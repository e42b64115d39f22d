//! Sensor acquisition boundary
//!
//! Real hardware drivers live outside this crate; they plug in through
//! [`SensorSource`]. [`FixedSensor`] reports constant values.

use crate::protocol::TelemetrySample;
use chrono::NaiveDateTime;

/// Raw environmental reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub temperature: f64,
    pub humidity: f64,
}

impl SensorReading {
    /// Stamp the reading with the acquisition time
    pub fn into_sample(self, at: NaiveDateTime) -> TelemetrySample {
        TelemetrySample::new(self.temperature, self.humidity, at)
    }
}

/// Source of sensor readings, sampled once per telemetry tick
pub trait SensorSource: Send + Sync {
    fn read(&self) -> SensorReading;
}

/// Sensor stub returning the same reading every time
#[derive(Debug, Clone, Copy)]
pub struct FixedSensor {
    reading: SensorReading,
}

impl FixedSensor {
    pub fn new(temperature: f64, humidity: f64) -> Self {
        Self {
            reading: SensorReading {
                temperature,
                humidity,
            },
        }
    }
}

impl Default for FixedSensor {
    fn default() -> Self {
        Self::new(22.0, 50.0)
    }
}

impl SensorSource for FixedSensor {
    fn read(&self) -> SensorReading {
        self.reading
    }
}
