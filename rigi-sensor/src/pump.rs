use std::sync::Arc;

use futures::StreamExt;
use rigi::{
    broker::{Broker, ANGLE_CHANNEL, DIRECTION_CHANNEL},
    Payload, SystemShutdown,
};
use serde_json::json;
use tracing::{error, info, warn};

use crate::{
    fields,
    motion::{MotionKind, MotionProcessor},
    SampleSource, SensorConfig, SensorSample,
};

pub(crate) async fn hosted_sample_pump(
    (config, broker, shutdown): (SensorConfig, Arc<Broker>, SystemShutdown),
) -> anyhow::Result<()> {
    run_sample_pump(config.build_source(), broker, shutdown).await
}

/// Drains the sample source into the broker until shutdown: every sample
/// publishes its Z angle, and non-stationary motion additionally publishes
/// a direction command. A source that cannot connect leaves the pump idle
/// rather than failing the runtime.
pub async fn run_sample_pump(
    mut source: Box<dyn SampleSource>,
    broker: Arc<Broker>,
    shutdown: SystemShutdown,
) -> anyhow::Result<()> {
    if let Err(e) = source.connect().await {
        error!(
            "Sensor source '{}' failed to connect, staying idle: {e}",
            source.name()
        );
        return Ok(());
    }
    info!("Sensor pump started with source '{}'", source.name());

    let mut processor = MotionProcessor::default();
    let mut samples = source.samples();

    while let Some(Some(next)) = shutdown.wrap(samples.next()).await {
        match next {
            Ok(sample) => publish_sample(&broker, &mut processor, &sample),
            Err(e) => warn!("Sample source fault: {e}"),
        }
    }

    info!("Sensor pump stopped");
    Ok(())
}

/// One sample through the publishing pipeline. Publish rejections are log
/// lines, not faults: the stream must keep flowing.
pub fn publish_sample(broker: &Broker, processor: &mut MotionProcessor, sample: &SensorSample) {
    let angle_z = rigi::get_f64(sample, fields::ANGLE_Z_DEG).unwrap_or(0.0);
    let payload: Payload = serde_json::from_value(json!({
        "angle": angle_z,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
    .expect("Literal is an object");
    log_rejection(ANGLE_CHANNEL, broker.publish(ANGLE_CHANNEL, payload));

    let command = processor.process(sample);
    if command.command != MotionKind::Stationary {
        let payload: Payload = serde_json::from_value(json!({
            "command": command.command.as_str(),
            "intensity": command.intensity,
            "timestamp": command.timestamp.to_rfc3339(),
        }))
        .expect("Literal is an object");
        log_rejection(DIRECTION_CHANNEL, broker.publish(DIRECTION_CHANNEL, payload));
    }
}

fn log_rejection(
    channel: &str,
    result: Result<rigi::broker::PublishResult, rigi::broker::PublishError>,
) {
    match result {
        Ok(r) if !r.success => warn!("Publish on '{channel}' rejected: {:?}", r.errors),
        Ok(_) => {}
        Err(e) => warn!("Publish on '{channel}' failed: {e}"),
    }
}
