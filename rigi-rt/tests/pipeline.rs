use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use minfac::Registered;
use rigi::{
    broker::{Broker, AI_ALERT_CHANNEL, DIRECTION_CHANNEL},
    current_state_frame,
    manager::{DataManager, EventPriority, ManagedEvent},
    mapper::CameraMapper,
};
use rigi_rt::TempRuntime;
use serde_json::json;
use testresult::TestResult;

fn base_config() -> serde_json::Value {
    json!({
        "log": { "level": "error" },
        "cameras": { "enabled": false },
        "detection": { "auto_monitor": false },
        "sensor": {
            "mode": "simulated",
            "pattern": "stationary",
            "interval_s": 0.005,
            "noise_level": 0.0
        }
    })
}

fn catalog() -> serde_json::Value {
    json!({
        "cameras": [{
            "id": "front",
            "name": "Front camera",
            "url": "rtsp://cams/front",
            "enabled": true,
            "status": "online",
            "directions": ["forward"]
        }],
        "angle_ranges": [{
            "id": "east",
            "name": "East sector",
            "min_angle": 90.0,
            "max_angle": 180.0,
            "enabled": true,
            "camera_ids": ["front"]
        }]
    })
}

#[test]
fn forward_motion_reaches_connection_callbacks() -> TestResult {
    let mut config = base_config();
    config["sensor"]["pattern"] = json!("forward");

    let (admitted, stats) = TempRuntime::new()?
        .config_json(serde_json::to_vec(&config)?)?
        .catalog_json(serde_json::to_vec(&catalog())?)?
        .run_until(
            |(Registered(broker), Registered(manager)): (
                Registered<Arc<Broker>>,
                Registered<Arc<DataManager>>,
            )| async move {
                let admitted: Arc<Mutex<Vec<ManagedEvent>>> = Default::default();
                let admitted_clone = admitted.clone();
                manager.register_callback(move |e| {
                    admitted_clone.lock().unwrap().push(e.clone());
                });

                tokio::time::sleep(Duration::from_millis(400)).await;
                assert!(broker.stats().messages_published > 0);
                let events = admitted.lock().unwrap().clone();
                (events, manager.stats())
            },
        );

    assert!(!admitted.is_empty(), "No events were admitted");
    let first = &admitted[0];
    assert_eq!(first.channel, DIRECTION_CHANNEL);
    assert_eq!(first.priority, EventPriority::Direction);
    assert_eq!(first.cameras, ["front"]);
    assert_eq!(first.payload["command"], json!("forward"));

    // The repeated forward commands within the slot lifetime are dropped as
    // duplicates, and the angle readings around 0° resolve no cameras
    assert!(stats.duplicated >= 1);
    assert!(stats.no_cameras >= 1);
    Ok(())
}

#[test]
fn alert_without_cameras_preempts_and_reaches_callbacks() -> TestResult {
    let admitted = TempRuntime::new()?
        .config_json(serde_json::to_vec(&base_config())?)?
        .catalog_json(serde_json::to_vec(&catalog())?)?
        .run_until(
            |(Registered(broker), Registered(manager)): (
                Registered<Arc<Broker>>,
                Registered<Arc<DataManager>>,
            )| async move {
                let admitted: Arc<Mutex<Vec<ManagedEvent>>> = Default::default();
                let admitted_clone = admitted.clone();
                manager.register_callback(move |e| {
                    admitted_clone.lock().unwrap().push(e.clone());
                });

                let result = broker
                    .publish(
                        AI_ALERT_CHANNEL,
                        serde_json::from_value(json!({
                            "alert_type": "person_detected",
                            "severity": "high"
                        }))?,
                    )?;
                assert!(result.success);

                tokio::time::sleep(Duration::from_millis(100)).await;
                let admitted = admitted.lock().unwrap().clone();
                anyhow::Ok(admitted)
            },
        )?;

    assert_eq!(admitted.len(), 1);
    assert_eq!(admitted[0].priority, EventPriority::Alert);
    assert!(admitted[0].cameras.is_empty());
    assert_eq!(admitted[0].payload["severity"], json!("high"));
    Ok(())
}

#[test]
fn idle_state_snapshot_lists_configured_mappings() -> TestResult {
    let frame = TempRuntime::new()?
        .config_json(serde_json::to_vec(&base_config())?)?
        .catalog_json(serde_json::to_vec(&catalog())?)?
        .run_until(
            |(Registered(manager), Registered(mapper)): (
                Registered<Arc<DataManager>>,
                Registered<CameraMapper>,
            )| async move { current_state_frame(&manager, &mapper).await },
        );

    assert_eq!(frame.frame_type, "current_state");
    assert_eq!(frame.data["directions"]["forward"][0]["id"], json!("front"));
    assert_eq!(frame.data["angle_ranges"][0]["id"], json!("east"));
    Ok(())
}
