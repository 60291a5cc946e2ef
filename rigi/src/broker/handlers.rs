use chrono::Utc;
use serde_json::Value;

use super::ValidationOutcome;
use crate::value::{finite_number, get_f64, get_str, Payload};

/// Capability set bound to a channel: validation and normalisation of
/// payloads published under its name. One instance per channel; the name
/// must stay stable for the handler's lifetime.
pub trait ChannelHandler: Send + Sync {
    fn validate(&self, payload: &Payload) -> ValidationOutcome;

    /// Normalises the payload (fills defaults). Only called after a
    /// successful `validate`.
    fn process(&self, payload: Payload) -> Payload;

    fn type_name(&self) -> &str;
}

pub const DIRECTION_CHANNEL: &str = "direction_result";
pub const ANGLE_CHANNEL: &str = "angle_value";
pub const AI_ALERT_CHANNEL: &str = "ai_alert";

pub const VALID_COMMANDS: [&str; 5] = [
    "forward",
    "backward",
    "turn_left",
    "turn_right",
    "stationary",
];

fn now_iso() -> Value {
    Value::String(Utc::now().to_rfc3339())
}

/// Motion commands produced by the motion processor.
#[derive(Debug, Default)]
pub struct DirectionHandler;

impl ChannelHandler for DirectionHandler {
    fn validate(&self, payload: &Payload) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::default();

        match get_str(payload, "command") {
            None => outcome.error("Missing required field: 'command'"),
            Some(command) if !VALID_COMMANDS.contains(&command) => outcome.error(format!(
                "Invalid command '{command}'. Must be one of: {}",
                VALID_COMMANDS.join(", ")
            )),
            Some(_) => {}
        }

        if !payload.contains_key("timestamp") {
            outcome.warn("Missing 'timestamp' field, will use current time");
        }

        if let Some(value) = payload.get("intensity") {
            match value.as_f64() {
                Some(intensity) if intensity < 0.0 => {
                    outcome.warn("Intensity should be non-negative")
                }
                Some(_) => {}
                None => outcome.warn("Invalid intensity value, should be a number"),
            }
        }

        outcome
    }

    fn process(&self, payload: Payload) -> Payload {
        let mut processed = Payload::new();
        if let Some(command) = payload.get("command") {
            processed.insert("command".into(), command.clone());
        }
        processed.insert(
            "timestamp".into(),
            payload.get("timestamp").cloned().unwrap_or_else(now_iso),
        );
        processed.insert(
            "intensity".into(),
            finite_number(get_f64(&payload, "intensity").unwrap_or(0.0)),
        );
        processed.insert(
            "angular_intensity".into(),
            finite_number(get_f64(&payload, "angular_intensity").unwrap_or(0.0)),
        );
        processed
    }

    fn type_name(&self) -> &str {
        DIRECTION_CHANNEL
    }
}

/// Heading readings from the IMU's Z axis.
#[derive(Debug, Default)]
pub struct AngleHandler;

impl AngleHandler {
    pub const MIN_ANGLE: f64 = -180.0;
    pub const MAX_ANGLE: f64 = 360.0;
}

impl ChannelHandler for AngleHandler {
    fn validate(&self, payload: &Payload) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::default();

        match payload.get("angle") {
            None => outcome.error("Missing required field: 'angle'"),
            Some(value) => match value.as_f64() {
                None => outcome.error("Invalid angle value, should be a number"),
                Some(angle) if !(Self::MIN_ANGLE..=Self::MAX_ANGLE).contains(&angle) => outcome
                    .error(format!(
                        "Angle {angle} is out of valid range [{}, {}]",
                        Self::MIN_ANGLE,
                        Self::MAX_ANGLE
                    )),
                Some(_) => {}
            },
        }

        if !payload.contains_key("timestamp") {
            outcome.warn("Missing 'timestamp' field, will use current time");
        }

        outcome
    }

    fn process(&self, payload: Payload) -> Payload {
        let mut processed = Payload::new();
        processed.insert(
            "angle".into(),
            finite_number(get_f64(&payload, "angle").unwrap_or(0.0)),
        );
        processed.insert(
            "timestamp".into(),
            payload.get("timestamp").cloned().unwrap_or_else(now_iso),
        );
        processed
    }

    fn type_name(&self) -> &str {
        ANGLE_CHANNEL
    }
}

pub const VALID_SEVERITIES: [&str; 4] = ["low", "medium", "high", "critical"];

/// Alerts raised by the detection monitor.
#[derive(Debug, Default)]
pub struct AiAlertHandler;

impl ChannelHandler for AiAlertHandler {
    fn validate(&self, payload: &Payload) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::default();

        if !payload.contains_key("alert_type") {
            outcome.error("Missing required field: 'alert_type'");
        }

        match get_str(payload, "severity") {
            None => outcome.error("Missing required field: 'severity'"),
            Some(severity) if !VALID_SEVERITIES.contains(&severity) => outcome.error(format!(
                "Invalid severity '{severity}'. Must be one of: {}",
                VALID_SEVERITIES.join(", ")
            )),
            Some(_) => {}
        }

        if !payload.contains_key("timestamp") {
            outcome.warn("Missing 'timestamp' field, will use current time");
        }

        outcome
    }

    fn process(&self, mut payload: Payload) -> Payload {
        let mut processed = Payload::new();
        for key in ["alert_type", "severity"] {
            if let Some(v) = payload.remove(key) {
                processed.insert(key.into(), v);
            }
        }
        processed.insert(
            "timestamp".into(),
            payload.remove("timestamp").unwrap_or_else(now_iso),
        );
        processed.insert(
            "metadata".into(),
            payload
                .remove("metadata")
                .unwrap_or_else(|| Value::Object(Default::default())),
        );
        // Remaining keys (camera context, detections, ...) travel through
        for (key, value) in payload {
            processed.entry(key).or_insert(value);
        }
        processed
    }

    fn type_name(&self) -> &str {
        AI_ALERT_CHANNEL
    }
}

/// Accepts any map unchanged. Used for introspection channels like
/// `data_manager` and for application-defined channels that need no
/// dedicated validation.
#[derive(Debug)]
pub struct PassthroughHandler {
    channel: String,
}

impl PassthroughHandler {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }
}

impl ChannelHandler for PassthroughHandler {
    fn validate(&self, _payload: &Payload) -> ValidationOutcome {
        ValidationOutcome::default()
    }

    fn process(&self, payload: Payload) -> Payload {
        payload
    }

    fn type_name(&self) -> &str {
        &self.channel
    }
}
