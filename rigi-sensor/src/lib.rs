use async_trait::async_trait;
use futures::stream::BoxStream;
use minfac::{Registered, ServiceCollection};
use rigi::{prelude::*, GenericConfig, LogTopic, Payload, SystemShutdown};
use std::sync::Arc;

pub mod motion;
mod pump;
mod serial;
mod simulate;
pub mod wit;

pub use pump::run_sample_pump;
pub use serial::SerialSampleSource;
pub use simulate::{MotionPattern, SimulatedSampleSource};

/// One merged IMU observation. Producers fill the standardized numeric
/// fields below; additional keys (magnetometer, quaternion, temperature)
/// travel along when the hardware provides them.
pub type SensorSample = Payload;

pub mod fields {
    pub const ACC_X_G: &str = "accX_g";
    pub const ACC_Y_G: &str = "accY_g";
    pub const ACC_Z_G: &str = "accZ_g";
    pub const GYRO_X_DPS: &str = "gyroX_dps";
    pub const GYRO_Y_DPS: &str = "gyroY_dps";
    pub const GYRO_Z_DPS: &str = "gyroZ_dps";
    pub const ANGLE_X_DEG: &str = "angleX_deg";
    pub const ANGLE_Y_DEG: &str = "angleY_deg";
    pub const ANGLE_Z_DEG: &str = "angleZ_deg";
    pub const TEMPERATURE_C: &str = "temperature_c";
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SampleSourceError {
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Sensor configuration invalid: {0}")]
    Config(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Sample field '{0}' is missing or not numeric")]
pub struct SampleFieldError(pub &'static str);

/// Minimal typed view over a sample, extracted before motion processing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuReading {
    pub acc: [f64; 3],
    pub gyro: [f64; 3],
    pub angle: [f64; 3],
}

impl ImuReading {
    pub fn from_sample(sample: &SensorSample) -> Result<Self, SampleFieldError> {
        fn get(sample: &SensorSample, key: &'static str) -> Result<f64, SampleFieldError> {
            rigi::get_f64(sample, key).ok_or(SampleFieldError(key))
        }
        use fields::*;
        Ok(Self {
            acc: [
                get(sample, ACC_X_G)?,
                get(sample, ACC_Y_G)?,
                get(sample, ACC_Z_G)?,
            ],
            gyro: [
                get(sample, GYRO_X_DPS)?,
                get(sample, GYRO_Y_DPS)?,
                get(sample, GYRO_Z_DPS)?,
            ],
            angle: [
                get(sample, ANGLE_X_DEG)?,
                get(sample, ANGLE_Y_DEG)?,
                get(sample, ANGLE_Z_DEG)?,
            ],
        })
    }
}

/// A lazy, potentially infinite producer of sensor samples. Two
/// implementations ship with this crate: the WIT serial reader and the
/// simulated pattern generator.
#[async_trait]
pub trait SampleSource: Send {
    fn name(&self) -> &str;

    async fn connect(&mut self) -> Result<(), SampleSourceError>;

    fn samples(self: Box<Self>) -> BoxStream<'static, Result<SensorSample, SampleSourceError>>;
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorMode {
    Simulated,
    Serial,
}

/// `sensor` section of the configuration.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub mode: SensorMode,
    pub port: Option<String>,
    pub baud_rate: u32,
    pub pattern: MotionPattern,
    pub interval_s: f64,
    pub noise_level: f64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            mode: SensorMode::Simulated,
            port: None,
            baud_rate: 9600,
            pattern: MotionPattern::Stationary,
            interval_s: 0.1,
            noise_level: 0.01,
        }
    }
}

impl SensorConfig {
    pub fn build_source(&self) -> Box<dyn SampleSource> {
        match self.mode {
            SensorMode::Simulated => Box::new(SimulatedSampleSource::new(
                self.pattern,
                std::time::Duration::from_secs_f64(self.interval_s.max(0.001)),
                self.noise_level.max(0.0),
            )),
            SensorMode::Serial => Box::new(SerialSampleSource::new(
                self.port.clone().unwrap_or_else(default_port),
                self.baud_rate,
            )),
        }
    }
}

fn default_port() -> String {
    if cfg!(windows) {
        "COM3".into()
    } else if cfg!(target_os = "macos") {
        "/dev/tty.usbserial".into()
    } else {
        "/dev/ttyACM0".into()
    }
}

pub extern "C" fn register(c: &mut ServiceCollection) {
    c.register(|| LogTopic::new("mio_serial", tracing::Level::INFO));
    c.with::<Registered<GenericConfig>>()
        .register(|config| config.get_or_default::<SensorConfig>("sensor"));
    c.with::<(
        Registered<SensorConfig>,
        Registered<Arc<rigi::broker::Broker>>,
        Registered<SystemShutdown>,
    )>()
    .register_hosted_service("Sensor Pump", pump::hosted_sample_pump);
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn reading_extraction_requires_all_axes() {
        let sample: SensorSample = serde_json::from_value(json!({
            "accX_g": 0.1, "accY_g": 0.0, "accZ_g": -1.0,
            "gyroX_dps": 0.0, "gyroY_dps": 0.0, "gyroZ_dps": 2.5,
            "angleX_deg": 0.0, "angleY_deg": 0.0, "angleZ_deg": 45.0
        }))
        .unwrap();
        let reading = ImuReading::from_sample(&sample).unwrap();
        assert_eq!(reading.gyro[2], 2.5);
        assert_eq!(reading.angle[2], 45.0);
    }

    #[test]
    fn missing_field_is_reported_by_name() {
        let sample: SensorSample = serde_json::from_value(json!({
            "accX_g": 0.1, "accY_g": 0.0, "accZ_g": -1.0,
            "gyroX_dps": 0.0, "gyroY_dps": 0.0, "gyroZ_dps": 0.0,
            "angleX_deg": 0.0, "angleY_deg": 0.0, "angleZ_deg": "north"
        }))
        .unwrap();
        assert_eq!(
            ImuReading::from_sample(&sample),
            Err(SampleFieldError(fields::ANGLE_Z_DEG))
        );
    }

    #[test]
    fn config_defaults_to_simulated_stationary() {
        let config = SensorConfig::default();
        assert!(matches!(config.mode, SensorMode::Simulated));
        assert_eq!(config.interval_s, 0.1);
        let source = config.build_source();
        assert_eq!(source.name(), "simulated");
    }
}
