use crate::engine::Sensor;
use std::time::{SystemTime, UNIX_EPOCH};

/// Fractional part of the current wall-clock second, in `[0, 1)`.
pub fn wall_fraction(now: SystemTime) -> f64 {
    match now.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => f64::from(elapsed.subsec_nanos()) / 1_000_000_000.0,
        Err(_) => 0.0,
    }
}

/// Synthetic reading for `sensor` at `fraction` of the current second.
///
/// The waveform is `sin(fraction * base_range + base_value)`. Readings that
/// cannot be represented as an unsigned value (negative or non-finite) yield
/// `None` and the sensor is skipped for that tick.
pub fn sensor_reading(sensor: &Sensor, fraction: f64) -> Option<u32> {
    let raw = (fraction * f64::from(sensor.base_range) + f64::from(sensor.base_value)).sin();
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    Some(raw.round() as u32)
}
