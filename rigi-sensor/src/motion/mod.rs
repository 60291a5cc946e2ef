use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error};

use crate::{ImuReading, SensorSample};

mod calculator;

pub use calculator::*;

/// Normalized motion command as published on `direction_result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionKind {
    Forward,
    Backward,
    TurnLeft,
    TurnRight,
    Stationary,
}

impl MotionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MotionKind::Forward => "forward",
            MotionKind::Backward => "backward",
            MotionKind::TurnLeft => "turn_left",
            MotionKind::TurnRight => "turn_right",
            MotionKind::Stationary => "stationary",
        }
    }
}

impl std::fmt::Display for MotionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MotionCommand {
    pub command: MotionKind,
    /// Linear intensity (horizontal acceleration magnitude, g).
    pub intensity: f64,
    /// Rotational intensity (|gyro Z|, °/s).
    pub angular_intensity: f64,
    pub timestamp: DateTime<Utc>,
    pub is_motion_start: bool,
    /// Descriptive direction string as produced by the calculator.
    pub raw_direction: String,
    pub diagnostics: SensorSample,
}

/// Transforms raw samples into motion commands. Holds only the state the
/// underlying velocity integrator needs; sample faults never raise, they
/// yield a stationary command carrying the error note.
#[derive(Debug, Default)]
pub struct MotionProcessor {
    calculator: DirectionCalculator,
}

impl MotionProcessor {
    pub fn new(config: CalculatorConfig) -> Self {
        Self {
            calculator: DirectionCalculator::new(config),
        }
    }

    pub fn process(&mut self, sample: &SensorSample) -> MotionCommand {
        let reading = match ImuReading::from_sample(sample) {
            Ok(reading) => reading,
            Err(e) => {
                error!("Sample field extraction failed: {e}");
                return Self::fault_command(e.to_string());
            }
        };

        let estimate = self.calculator.estimate(reading.acc, reading.gyro);
        let command = Self::map_command(&estimate);
        debug!(
            "Motion command: {command}, intensity {:.4}, angular {:.4}, start {}",
            estimate.intensity, estimate.angular_intensity, estimate.motion_start
        );

        MotionCommand {
            command,
            intensity: estimate.intensity,
            angular_intensity: estimate.angular_intensity,
            timestamp: Utc::now(),
            is_motion_start: estimate.motion_start,
            raw_direction: estimate.direction.to_string(),
            diagnostics: serde_json::from_value(json!({
                "rotation": estimate.rotation.to_string(),
                "velocity": estimate.velocity,
                "is_moving": estimate.is_moving,
            }))
            .expect("Literal is an object"),
        }
    }

    /// Rotation wins over linear motion; the cardinal directions map onto
    /// the vehicle commands.
    fn map_command(estimate: &MotionEstimate) -> MotionKind {
        match estimate.rotation {
            RotationSense::ClockwiseZ => return MotionKind::TurnRight,
            RotationSense::CounterClockwiseZ => return MotionKind::TurnLeft,
            RotationSense::None => {}
        }
        match estimate.direction {
            LinearDirection::East => MotionKind::Forward,
            LinearDirection::West => MotionKind::Backward,
            LinearDirection::South => MotionKind::TurnLeft,
            LinearDirection::North => MotionKind::TurnRight,
            LinearDirection::Faint | LinearDirection::Stationary => MotionKind::Stationary,
        }
    }

    fn fault_command(error: String) -> MotionCommand {
        MotionCommand {
            command: MotionKind::Stationary,
            intensity: 0.0,
            angular_intensity: 0.0,
            timestamp: Utc::now(),
            is_motion_start: false,
            raw_direction: "error".to_owned(),
            diagnostics: serde_json::from_value(json!({ "error": error }))
                .expect("Literal is an object"),
        }
    }

    pub fn reset(&mut self) {
        self.calculator.reset();
    }
}
