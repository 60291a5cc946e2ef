use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use crate::{
    broker::EventId,
    manager::{DataManager, EventPriority, ManagedEvent},
    mapper::{CameraDescriptor, CameraMapper},
    value::sanitize,
};

/// JSON shape handed to transport adapters (WebSocket et al.). Timestamps
/// are ISO-8601 strings; payload numbers are guaranteed finite.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<EventId>,
    pub timestamp: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cameras: Option<Vec<CameraDescriptor>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<EventPriority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_time: Option<f64>,
}

impl OutboundFrame {
    /// Frame for an admitted event, as sent from a data-manager callback.
    pub fn event(event: &ManagedEvent) -> Self {
        Self {
            frame_type: event.channel.clone(),
            message_id: Some(event.event_id),
            timestamp: event.received_at.to_rfc3339(),
            data: sanitize(Value::Object(event.payload.clone())),
            cameras: Some(event.camera_details.clone()),
            priority: Some(event.priority),
            remaining_time: Some(event.remaining().as_secs_f64()),
        }
    }

    pub fn current_state(data: Value) -> Self {
        Self::bare("current_state", sanitize(data))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::bare("error", json!({ "message": message.into() }))
    }

    pub fn stats(data: impl Serialize) -> Self {
        Self::bare(
            "stats",
            sanitize(serde_json::to_value(data).unwrap_or(Value::Null)),
        )
    }

    fn bare(frame_type: &str, data: Value) -> Self {
        Self {
            frame_type: frame_type.to_owned(),
            message_id: None,
            timestamp: Utc::now().to_rfc3339(),
            data,
            cameras: None,
            priority: None,
            remaining_time: None,
        }
    }
}

/// State snapshot for a freshly connected consumer: the active event if one
/// exists, otherwise the configured direction/angle mappings.
pub async fn current_state_frame(manager: &DataManager, mapper: &CameraMapper) -> OutboundFrame {
    match manager.current_event() {
        Some(event) => {
            let mut frame = OutboundFrame::event(&event);
            frame.frame_type = "current_state".to_owned();
            frame
        }
        None => OutboundFrame::current_state(json!({
            "message": "No active events",
            "directions": mapper.all_direction_mappings().await,
            "angle_ranges": mapper.all_angle_ranges().await,
        })),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::{
        broker::{Broker, ANGLE_CHANNEL},
        mapper::{AngleRangeRecord, CameraRecord, CameraStatus, Catalog, MemoryStore, StoreAccess},
        recovery::Recovery,
        value::Payload,
    };

    fn mapper() -> CameraMapper {
        let catalog = Catalog {
            cameras: vec![CameraRecord {
                id: "a".into(),
                name: "Camera a".into(),
                url: "rtsp://cams/a".into(),
                enabled: true,
                status: CameraStatus::Online,
                directions: vec!["forward".into()],
            }],
            angle_ranges: vec![AngleRangeRecord {
                id: "r".into(),
                name: "North".into(),
                min_angle: 0.0,
                max_angle: 180.0,
                enabled: true,
                camera_ids: vec!["a".into()],
            }],
            ai_settings: None,
        };
        CameraMapper::new(
            StoreAccess::new(Arc::new(MemoryStore::new(catalog))),
            Arc::new(Recovery::new()),
        )
    }

    #[tokio::test]
    async fn angle_survives_the_wire_bit_exact() {
        let angle = 123.456_789_012_345_f64;
        let broker = Broker::with_default_channels(Arc::new(Recovery::new()));
        let seen: Arc<std::sync::Mutex<Option<Payload>>> = Default::default();
        let seen_clone = seen.clone();
        broker
            .subscribe(ANGLE_CHANNEL, move |e| {
                *seen_clone.lock().unwrap() = Some(e.payload.clone());
            })
            .unwrap();
        broker
            .publish(
                ANGLE_CHANNEL,
                serde_json::from_value(json!({ "angle": angle })).unwrap(),
            )
            .unwrap();

        let payload = seen.lock().unwrap().clone().unwrap();
        let frame = OutboundFrame::current_state(Value::Object(payload));
        let wire = serde_json::to_string(&frame).unwrap();
        let parsed: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(parsed["data"]["angle"].as_f64(), Some(angle));
    }

    #[tokio::test]
    async fn non_finite_payload_numbers_become_null() {
        let frame = OutboundFrame::stats(json!({ "ratio": 0.5 }));
        assert_eq!(frame.data["ratio"], json!(0.5));

        let frame = OutboundFrame::current_state(json!({
            "nested": { "values": [1.0] }
        }));
        let wire = serde_json::to_string(&frame).unwrap();
        assert!(wire.contains("\"current_state\""));
    }

    #[tokio::test]
    async fn error_frame_shape() {
        let frame = OutboundFrame::error("cannot serialize");
        let wire = serde_json::to_value(&frame).unwrap();
        assert_eq!(wire["type"], json!("error"));
        assert_eq!(wire["data"]["message"], json!("cannot serialize"));
        assert!(wire.get("cameras").is_none());
        assert!(wire.get("message_id").is_none());
    }

    #[tokio::test]
    async fn idle_state_lists_configured_mappings() {
        let manager = DataManager::new();
        let frame = current_state_frame(&manager, &mapper()).await;
        assert_eq!(frame.frame_type, "current_state");
        assert_eq!(frame.data["message"], json!("No active events"));
        assert_eq!(frame.data["directions"]["forward"][0]["id"], json!("a"));
        assert_eq!(frame.data["angle_ranges"][0]["id"], json!("r"));
    }
}
