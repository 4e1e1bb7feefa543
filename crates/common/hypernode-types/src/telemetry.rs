use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Live reading of one GPU device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuReading {
    pub index: u32,
    pub utilization_percent: f32,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub temperature_c: Option<f32>,
    pub power_w: Option<f32>,
}

impl GpuReading {
    pub fn memory_percent(&self) -> f32 {
        if self.memory_total_mb == 0 {
            return 0.0;
        }
        (self.memory_used_mb as f64 / self.memory_total_mb as f64 * 100.0) as f32
    }
}

/// Point-in-time hardware utilization sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub taken_at: DateTime<Utc>,
    pub cpu_percent: f32,
    pub ram_percent: f32,
    pub disk_percent: f32,
    pub gpu: Option<GpuReading>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_percent_handles_zero_total() {
        let mut reading = GpuReading {
            index: 0,
            utilization_percent: 40.0,
            memory_used_mb: 6_000,
            memory_total_mb: 24_000,
            temperature_c: Some(61.0),
            power_w: Some(220.0),
        };
        assert!((reading.memory_percent() - 25.0).abs() < 0.01);
        reading.memory_total_mb = 0;
        assert_eq!(reading.memory_percent(), 0.0);
    }
}
