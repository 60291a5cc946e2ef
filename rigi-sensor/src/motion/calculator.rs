use std::time::Instant;

/// Thresholds for the motion analysis, in the units of the incoming sample
/// fields (g, °/s) and the integrated velocity (m/s).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalculatorConfig {
    /// Horizontal acceleration above which the device counts as moving.
    pub motion_threshold: f64,
    /// Angular rate above which rotation contributes to the moving state.
    pub angular_threshold: f64,
    /// Acceleration above which faint motion is reported even while the
    /// integrated velocity is still negligible.
    pub direction_threshold: f64,
    /// Z angular rate above which a rotation descriptor is emitted.
    pub rotation_threshold: f64,
    /// Speed above which a cardinal direction is derived.
    pub velocity_threshold: f64,
}

impl Default for CalculatorConfig {
    fn default() -> Self {
        Self {
            motion_threshold: 0.005,
            angular_threshold: 2.0,
            direction_threshold: 0.002,
            rotation_threshold: 5.0,
            velocity_threshold: 0.0005,
        }
    }
}

/// Cardinal motion of the device in its own horizontal plane. +X is east,
/// +Y is north.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearDirection {
    East,
    West,
    North,
    South,
    Faint,
    Stationary,
}

impl std::fmt::Display for LinearDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LinearDirection::East => "east",
            LinearDirection::West => "west",
            LinearDirection::North => "north",
            LinearDirection::South => "south",
            LinearDirection::Faint => "faint motion",
            LinearDirection::Stationary => "stationary",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationSense {
    ClockwiseZ,
    CounterClockwiseZ,
    None,
}

impl std::fmt::Display for RotationSense {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RotationSense::ClockwiseZ => "clockwise Z rotation",
            RotationSense::CounterClockwiseZ => "counter-clockwise Z rotation",
            RotationSense::None => "no rotation",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionEstimate {
    pub direction: LinearDirection,
    pub rotation: RotationSense,
    /// Horizontal acceleration magnitude in g.
    pub intensity: f64,
    /// |gyro Z| in °/s.
    pub angular_intensity: f64,
    pub is_moving: bool,
    /// Edge flag: set on the first estimate of a motion episode.
    pub motion_start: bool,
    /// Integrated horizontal velocity in m/s.
    pub velocity: [f64; 2],
}

const GRAVITY: f64 = 9.80665;
/// Exponential decay applied to the velocity while no acceleration is
/// observed, so integration drift bleeds off between motions.
const VELOCITY_DAMPING: f64 = 0.9;
const DEFAULT_DT: f64 = 0.01;
const MAX_DT: f64 = 0.2;

/// Velocity-integrating motion analyzer. Gravity sits on the Z axis, so
/// the X/Y acceleration components are integrated directly; rotation is
/// taken from the Z gyro.
#[derive(Debug)]
pub struct DirectionCalculator {
    config: CalculatorConfig,
    velocity: [f64; 2],
    last_update: Option<Instant>,
    was_moving: bool,
}

impl DirectionCalculator {
    pub fn new(config: CalculatorConfig) -> Self {
        Self {
            config,
            velocity: [0.0, 0.0],
            last_update: None,
            was_moving: false,
        }
    }

    pub fn estimate(&mut self, acc: [f64; 3], gyro: [f64; 3]) -> MotionEstimate {
        let now = Instant::now();
        let dt = self
            .last_update
            .replace(now)
            .map(|last| now.duration_since(last).as_secs_f64().min(MAX_DT))
            .unwrap_or(DEFAULT_DT);
        self.estimate_with_dt(acc, gyro, dt)
    }

    pub fn estimate_with_dt(&mut self, acc: [f64; 3], gyro: [f64; 3], dt: f64) -> MotionEstimate {
        let config = self.config;
        let horizontal = (acc[0] * acc[0] + acc[1] * acc[1]).sqrt();

        if horizontal > config.motion_threshold {
            self.velocity[0] += acc[0] * GRAVITY * dt;
            self.velocity[1] += acc[1] * GRAVITY * dt;
        } else {
            self.velocity[0] *= VELOCITY_DAMPING;
            self.velocity[1] *= VELOCITY_DAMPING;
            let speed = (self.velocity[0] * self.velocity[0]
                + self.velocity[1] * self.velocity[1])
                .sqrt();
            if speed < config.velocity_threshold {
                self.velocity = [0.0, 0.0];
            }
        }

        let angular_intensity = gyro[2].abs();
        let rotation = if angular_intensity > config.rotation_threshold {
            if gyro[2] > 0.0 {
                RotationSense::ClockwiseZ
            } else {
                RotationSense::CounterClockwiseZ
            }
        } else {
            RotationSense::None
        };

        let speed =
            (self.velocity[0] * self.velocity[0] + self.velocity[1] * self.velocity[1]).sqrt();
        let direction = if speed > config.velocity_threshold {
            if self.velocity[0].abs() >= self.velocity[1].abs() {
                if self.velocity[0] > 0.0 {
                    LinearDirection::East
                } else {
                    LinearDirection::West
                }
            } else if self.velocity[1] > 0.0 {
                LinearDirection::North
            } else {
                LinearDirection::South
            }
        } else if horizontal > config.direction_threshold {
            LinearDirection::Faint
        } else {
            LinearDirection::Stationary
        };

        let is_moving = !matches!(
            direction,
            LinearDirection::Stationary | LinearDirection::Faint
        ) || rotation != RotationSense::None
            || angular_intensity > config.angular_threshold;

        let motion_start = is_moving && !self.was_moving;
        self.was_moving = is_moving;

        MotionEstimate {
            direction,
            rotation,
            intensity: horizontal,
            angular_intensity,
            is_moving,
            motion_start,
            velocity: self.velocity,
        }
    }

    /// Clears the velocity integrator and the motion edge state.
    pub fn reset(&mut self) {
        self.velocity = [0.0, 0.0];
        self.last_update = None;
        self.was_moving = false;
    }
}

impl Default for DirectionCalculator {
    fn default() -> Self {
        Self::new(CalculatorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    const DT: f64 = 0.1;

    fn calculator() -> DirectionCalculator {
        DirectionCalculator::default()
    }

    #[test]
    fn stationary_input_stays_stationary() {
        let mut c = calculator();
        for _ in 0..20 {
            let e = c.estimate_with_dt([0.0, 0.0, -1.0], [0.0, 0.0, 0.0], DT);
            assert_eq!(e.direction, LinearDirection::Stationary);
            assert_eq!(e.rotation, RotationSense::None);
            assert!(!e.is_moving);
            assert!(!e.motion_start);
        }
    }

    #[test]
    fn sustained_forward_acceleration_points_east() {
        let mut c = calculator();
        let mut last = None;
        for _ in 0..5 {
            last = Some(c.estimate_with_dt([0.2, 0.0, -1.0], [0.0, 0.0, 0.0], DT));
        }
        let e = last.unwrap();
        assert_eq!(e.direction, LinearDirection::East);
        assert!(e.is_moving);
        assert_relative_eq!(e.velocity[0], 0.2 * GRAVITY * DT * 5.0, epsilon = 1e-9);
    }

    #[test]
    fn backward_acceleration_points_west() {
        let mut c = calculator();
        let mut last = None;
        for _ in 0..5 {
            last = Some(c.estimate_with_dt([-0.2, 0.0, -1.0], [0.0, 0.0, 0.0], DT));
        }
        assert_eq!(last.unwrap().direction, LinearDirection::West);
    }

    #[test]
    fn lateral_acceleration_points_north_or_south() {
        let mut c = calculator();
        let mut last = None;
        for _ in 0..5 {
            last = Some(c.estimate_with_dt([0.0, 0.1, -1.0], [0.0, 0.0, 0.0], DT));
        }
        assert_eq!(last.unwrap().direction, LinearDirection::North);

        c.reset();
        for _ in 0..5 {
            last = Some(c.estimate_with_dt([0.0, -0.1, -1.0], [0.0, 0.0, 0.0], DT));
        }
        assert_eq!(last.unwrap().direction, LinearDirection::South);
    }

    #[test]
    fn z_rotation_sense_follows_gyro_sign() {
        let mut c = calculator();
        let e = c.estimate_with_dt([0.0, 0.0, -1.0], [0.0, 0.0, 20.0], DT);
        assert_eq!(e.rotation, RotationSense::ClockwiseZ);
        assert_eq!(e.angular_intensity, 20.0);

        let e = c.estimate_with_dt([0.0, 0.0, -1.0], [0.0, 0.0, -20.0], DT);
        assert_eq!(e.rotation, RotationSense::CounterClockwiseZ);
    }

    #[test]
    fn slow_rotation_emits_no_descriptor() {
        let mut c = calculator();
        let e = c.estimate_with_dt([0.0, 0.0, -1.0], [0.0, 0.0, 3.0], DT);
        assert_eq!(e.rotation, RotationSense::None);
        // above angular_threshold the device still counts as moving
        assert!(e.is_moving);
    }

    #[test]
    fn motion_start_fires_once_per_episode() {
        let mut c = calculator();
        c.estimate_with_dt([0.0, 0.0, -1.0], [0.0, 0.0, 0.0], DT);

        let first = c.estimate_with_dt([0.2, 0.0, -1.0], [0.0, 0.0, 0.0], DT);
        assert!(first.motion_start);
        let second = c.estimate_with_dt([0.2, 0.0, -1.0], [0.0, 0.0, 0.0], DT);
        assert!(!second.motion_start);
    }

    #[test]
    fn velocity_decays_back_to_stationary() {
        let mut c = calculator();
        for _ in 0..5 {
            c.estimate_with_dt([0.2, 0.0, -1.0], [0.0, 0.0, 0.0], DT);
        }
        let mut last = None;
        for _ in 0..200 {
            last = Some(c.estimate_with_dt([0.0, 0.0, -1.0], [0.0, 0.0, 0.0], DT));
        }
        assert_eq!(last.unwrap().direction, LinearDirection::Stationary);
        assert_eq!(last.unwrap().velocity, [0.0, 0.0]);
    }

    #[test]
    fn faint_acceleration_reports_faint_motion() {
        let mut c = calculator();
        let e = c.estimate_with_dt([0.003, 0.0, -1.0], [0.0, 0.0, 0.0], DT);
        // Below motion_threshold (no integration), above direction_threshold
        assert_eq!(e.direction, LinearDirection::Faint);
        assert!(!e.is_moving);
    }

    #[test]
    fn reset_clears_integrated_state() {
        let mut c = calculator();
        for _ in 0..5 {
            c.estimate_with_dt([0.2, 0.0, -1.0], [0.0, 0.0, 0.0], DT);
        }
        c.reset();
        let e = c.estimate_with_dt([0.0, 0.0, -1.0], [0.0, 0.0, 0.0], DT);
        assert_eq!(e.velocity, [0.0, 0.0]);
        assert_eq!(e.direction, LinearDirection::Stationary);
    }
}
