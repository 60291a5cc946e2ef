use std::time::Duration;

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::Deserialize;
use tracing::{debug, info};

use crate::{fields, SampleSource, SampleSourceError, SensorSample};

/// Motion profile of the simulated device. The five basic patterns hold
/// steady; `sequence` walks a fixed route (~3 s per step) and `random`
/// picks a basic pattern every ~5 s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionPattern {
    Stationary,
    Forward,
    Backward,
    TurnLeft,
    TurnRight,
    Sequence,
    Random,
}

const SEQUENCE_STEPS: [MotionPattern; 7] = [
    MotionPattern::Stationary,
    MotionPattern::Forward,
    MotionPattern::TurnRight,
    MotionPattern::Forward,
    MotionPattern::TurnLeft,
    MotionPattern::Backward,
    MotionPattern::Stationary,
];
const BASIC_PATTERNS: [MotionPattern; 5] = [
    MotionPattern::Stationary,
    MotionPattern::Forward,
    MotionPattern::Backward,
    MotionPattern::TurnLeft,
    MotionPattern::TurnRight,
];

/// Ticks per step at the default 0.1 s interval: ~3 s per sequence step,
/// ~5 s per random hold.
const SEQUENCE_TICKS: u32 = 30;
const RANDOM_TICKS: u32 = 50;

/// Generates JY901-shaped samples without hardware. The turn patterns
/// integrate the Z angle by ±2° per tick and wrap at ±180°, matching the
/// physical sensor's angle output.
pub struct SimulatedSampleSource {
    pattern: MotionPattern,
    interval: Duration,
    noise_level: f64,
    angle_z: f64,
    sequence_index: usize,
    step_counter: u32,
    random_pattern: MotionPattern,
    rng: SmallRng,
}

impl SimulatedSampleSource {
    pub fn new(pattern: MotionPattern, interval: Duration, noise_level: f64) -> Self {
        Self {
            pattern,
            interval,
            noise_level,
            angle_z: 0.0,
            sequence_index: 0,
            step_counter: 0,
            random_pattern: MotionPattern::Stationary,
            rng: SmallRng::from_entropy(),
        }
    }

    #[cfg(test)]
    fn seeded(pattern: MotionPattern, seed: u64) -> Self {
        let mut source = Self::new(pattern, Duration::from_millis(100), 0.0);
        source.rng = SmallRng::seed_from_u64(seed);
        source
    }

    fn noise(&mut self, scale: f64) -> f64 {
        if self.noise_level == 0.0 {
            return 0.0;
        }
        self.rng.gen_range(-1.0..1.0) * self.noise_level * scale
    }

    fn current_pattern(&mut self) -> MotionPattern {
        match self.pattern {
            MotionPattern::Sequence => {
                self.step_counter += 1;
                if self.step_counter >= SEQUENCE_TICKS {
                    self.step_counter = 0;
                    self.sequence_index = (self.sequence_index + 1) % SEQUENCE_STEPS.len();
                    debug!("Sequence advanced to {:?}", SEQUENCE_STEPS[self.sequence_index]);
                }
                SEQUENCE_STEPS[self.sequence_index]
            }
            MotionPattern::Random => {
                self.step_counter += 1;
                if self.step_counter >= RANDOM_TICKS {
                    self.step_counter = 0;
                    self.random_pattern = BASIC_PATTERNS[self.rng.gen_range(0..BASIC_PATTERNS.len())];
                    debug!("Random pattern switched to {:?}", self.random_pattern);
                }
                self.random_pattern
            }
            basic => basic,
        }
    }

    pub fn next_sample(&mut self) -> SensorSample {
        let pattern = self.current_pattern();
        let (acc, gyro) = match pattern {
            MotionPattern::Forward => (
                [0.2 + self.noise(0.1), self.noise(0.02), -1.0 + self.noise(0.02)],
                [self.noise(0.5), self.noise(0.5), self.noise(0.5)],
            ),
            MotionPattern::Backward => (
                [-0.2 + self.noise(0.1), self.noise(0.02), -1.0 + self.noise(0.02)],
                [self.noise(0.5), self.noise(0.5), self.noise(0.5)],
            ),
            MotionPattern::TurnLeft => {
                self.angle_z -= 2.0;
                if self.angle_z < -180.0 {
                    self.angle_z += 360.0;
                }
                (
                    [self.noise(0.05), self.noise(0.05), -1.0 + self.noise(0.02)],
                    [self.noise(1.0), self.noise(1.0), -20.0 + self.noise(10.0)],
                )
            }
            MotionPattern::TurnRight => {
                self.angle_z += 2.0;
                if self.angle_z > 180.0 {
                    self.angle_z -= 360.0;
                }
                (
                    [self.noise(0.05), self.noise(0.05), -1.0 + self.noise(0.02)],
                    [self.noise(1.0), self.noise(1.0), 20.0 + self.noise(10.0)],
                )
            }
            _ => (
                [self.noise(0.01), self.noise(0.01), -1.0 + self.noise(0.01)],
                [self.noise(0.1), self.noise(0.1), self.noise(0.1)],
            ),
        };

        let angle = [
            self.noise(1.0),
            self.noise(1.0),
            self.angle_z + self.noise(0.5),
        ];

        let mut sample = SensorSample::new();
        for (key, value) in [
            (fields::ACC_X_G, acc[0]),
            (fields::ACC_Y_G, acc[1]),
            (fields::ACC_Z_G, acc[2]),
            (fields::GYRO_X_DPS, gyro[0]),
            (fields::GYRO_Y_DPS, gyro[1]),
            (fields::GYRO_Z_DPS, gyro[2]),
            (fields::ANGLE_X_DEG, angle[0]),
            (fields::ANGLE_Y_DEG, angle[1]),
            (fields::ANGLE_Z_DEG, angle[2]),
        ] {
            sample.insert(key.to_owned(), rigi::finite_number(value));
        }
        sample
    }
}

#[async_trait]
impl SampleSource for SimulatedSampleSource {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn connect(&mut self) -> Result<(), SampleSourceError> {
        info!("Simulated sensor connected, pattern: {:?}", self.pattern);
        Ok(())
    }

    fn samples(self: Box<Self>) -> BoxStream<'static, Result<SensorSample, SampleSourceError>> {
        let interval = self.interval;
        futures::stream::unfold(
            (*self, tokio::time::interval(interval)),
            |(mut source, mut ticker)| async move {
                ticker.tick().await;
                let sample = source.next_sample();
                Some((Ok(sample), (source, ticker)))
            },
        )
        .boxed()
    }
}
