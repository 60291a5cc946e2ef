use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_serial::SerialPortBuilderExt;
use tracing::{info, warn};

use crate::{
    wit::{SampleAccumulator, WitFrameParser},
    SampleSource, SampleSourceError, SensorSample,
};

/// Reads WIT frames from a serial port and assembles them into samples.
/// The port is opened on `connect`; decoding runs incrementally on
/// whatever chunk sizes the driver delivers.
pub struct SerialSampleSource {
    port_path: String,
    baud_rate: u32,
    port: Option<tokio_serial::SerialStream>,
}

impl SerialSampleSource {
    pub fn new(port_path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_path: port_path.into(),
            baud_rate,
            port: None,
        }
    }

    /// Decoding pipeline over any byte reader; the serial port is just the
    /// production instance.
    pub fn stream_from_reader(
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> BoxStream<'static, Result<SensorSample, SampleSourceError>> {
        struct ReaderState<R> {
            reader: R,
            parser: WitFrameParser,
            accumulator: SampleAccumulator,
            pending: VecDeque<SensorSample>,
        }

        let state = ReaderState {
            reader,
            parser: WitFrameParser::new(),
            accumulator: SampleAccumulator::new(),
            pending: VecDeque::new(),
        };

        futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(sample) = state.pending.pop_front() {
                    return Some((Ok(sample), state));
                }

                let mut buf = [0u8; 256];
                match state.reader.read(&mut buf).await {
                    Ok(0) => {
                        info!("Sensor byte stream ended");
                        return None;
                    }
                    Ok(n) => {
                        for reading in state.parser.push(&buf[..n]) {
                            if let Some(sample) = state.accumulator.absorb(reading) {
                                state.pending.push_back(sample);
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Serial read failed: {e}");
                        return Some((Err(e.into()), state));
                    }
                }
            }
        })
        .boxed()
    }
}

#[async_trait]
impl SampleSource for SerialSampleSource {
    fn name(&self) -> &str {
        "serial"
    }

    async fn connect(&mut self) -> Result<(), SampleSourceError> {
        let port = tokio_serial::new(&self.port_path, self.baud_rate).open_native_async()?;
        info!(
            "Serial sensor connected on {} at {} baud",
            self.port_path, self.baud_rate
        );
        self.port = Some(port);
        Ok(())
    }

    fn samples(self: Box<Self>) -> BoxStream<'static, Result<SensorSample, SampleSourceError>> {
        match self.port {
            Some(port) => Self::stream_from_reader(port),
            None => futures::stream::once(async {
                Err(SampleSourceError::Config(
                    "Serial port was not opened before streaming".into(),
                ))
            })
            .boxed(),
        }
    }
}
